// weatherlink_bridge - WeatherLink v2 API to time-series archive bridge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use clap::Parser;
use reqwest::Client;
use std::error::Error;
use std::io;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tokio::signal::unix::{self, SignalKind};
use tracing::{Instrument, Level};
use weatherlink_bridge::classify::StationIdentity;
use weatherlink_bridge::client::WeatherLinkClient;
use weatherlink_bridge::decode::{decode_current, merge_poll, FieldMap, SessionState};
use weatherlink_bridge::record::{ArchiveRecord, JsonLinesSink, RecordSink};
use weatherlink_bridge::sunshine::{DurationConfig, DurationService};

const DEFAULT_LOG_LEVEL: Level = Level::INFO;
const DEFAULT_API_URL: &str = "https://api.weatherlink.com/";
const DEFAULT_POLLING_SECS: u64 = 300;
const DEFAULT_ARCHIVE_SECS: u64 = 300;
const DEFAULT_TIMEOUT_MILLIS: u64 = 10000;
const DEFAULT_SUNSHINE_COEFF: f64 = 0.8;

// The API serves at most one current-conditions request per station per
// minute.
const MIN_POLLING_SECS: u64 = 60;

#[derive(Debug, Parser)]
#[clap(name = "weatherlink_bridge", version = clap::crate_version!())]
struct WeatherlinkBridgeApplication {
    /// WeatherLink v2 API key
    #[clap(long)]
    api_key: String,

    /// WeatherLink v2 API secret, used to sign every request
    #[clap(long)]
    api_secret: String,

    /// Numeric WeatherLink station ID to poll
    #[clap(long)]
    station_id: u64,

    /// Base URL for the WeatherLink API
    #[clap(long, default_value_t = DEFAULT_API_URL.into())]
    api_url: String,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[clap(long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,

    /// Poll current conditions at this interval, in seconds. Values below
    /// 60 are raised to 60 to respect the API rate limit.
    #[clap(long, default_value_t = DEFAULT_POLLING_SECS)]
    polling_secs: u64,

    /// Length of one archive interval, in seconds
    #[clap(long, default_value_t = DEFAULT_ARCHIVE_SECS)]
    archive_secs: u64,

    /// Timeout for API requests, in milliseconds
    #[clap(long, default_value_t = DEFAULT_TIMEOUT_MILLIS)]
    timeout_millis: u64,

    /// Transmitter ID of the primary ISS/VUE
    #[clap(long, default_value_t = 1)]
    txid_iss: i64,

    /// Transmitter ID of a secondary ISS/VUE
    #[clap(long)]
    txid_iss2: Option<i64>,

    /// Transmitter ID of extra temperature/humidity channel 1
    #[clap(long)]
    txid_extra1: Option<i64>,

    /// Transmitter ID of extra temperature/humidity channel 2
    #[clap(long)]
    txid_extra2: Option<i64>,

    /// Transmitter ID of extra temperature/humidity channel 3
    #[clap(long)]
    txid_extra3: Option<i64>,

    /// Transmitter ID of extra temperature/humidity channel 4
    #[clap(long)]
    txid_extra4: Option<i64>,

    /// Transmitter ID of a leaf-wetness station
    #[clap(long)]
    txid_leaf: Option<i64>,

    /// Transmitter ID of a soil-moisture station
    #[clap(long)]
    txid_soil: Option<i64>,

    /// Transmitter ID of a combined leaf/soil station
    #[clap(long)]
    txid_leaf_soil: Option<i64>,

    /// Transmitter ID of a wind-only station
    #[clap(long)]
    txid_wind: Option<i64>,

    /// Transmitter ID of a rain-only station
    #[clap(long)]
    txid_rain: Option<i64>,

    /// Station latitude in decimal degrees, for the sunshine model
    #[clap(long, allow_hyphen_values = true)]
    latitude: f64,

    /// Station longitude in decimal degrees, for the sunshine model
    #[clap(long, allow_hyphen_values = true)]
    longitude: f64,

    /// Calibration factor for the sunshine threshold; higher values count
    /// sunshine later in the day
    #[clap(long, default_value_t = DEFAULT_SUNSHINE_COEFF)]
    sunshine_coeff: f64,

    /// Radiation below this value (W/m²) is never counted as sunshine
    #[clap(long, default_value_t = 0.0)]
    sunshine_min: f64,

    /// Integrate sunshine duration from poll samples instead of marking
    /// whole intervals
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    sunshine_loop: bool,

    /// Integrate rain duration from poll samples instead of marking whole
    /// intervals
    #[clap(long, default_value_t = false, action = clap::ArgAction::Set)]
    rain_dur_loop: bool,

    /// Integrate hail duration from poll samples instead of marking whole
    /// intervals
    #[clap(long, default_value_t = false, action = clap::ArgAction::Set)]
    hail_dur_loop: bool,

    /// Track sunshine duration for the secondary station's radiation
    #[clap(long)]
    sunshine2: bool,

    /// Track rain duration for the secondary station's rain
    #[clap(long)]
    rain2: bool,

    /// Log every sunshine sample at info level
    #[clap(long)]
    sunshine_log: bool,

    /// Log every rain sample at info level
    #[clap(long)]
    rain_dur_log: bool,

    /// Log every hail sample at info level
    #[clap(long)]
    hail_dur_log: bool,

    /// File the archive records are appended to, one JSON object per line
    #[clap(long)]
    output: PathBuf,
}

impl WeatherlinkBridgeApplication {
    fn identity(&self) -> StationIdentity {
        StationIdentity {
            txid_iss: Some(self.txid_iss),
            txid_iss2: self.txid_iss2,
            txid_extra1: self.txid_extra1,
            txid_extra2: self.txid_extra2,
            txid_extra3: self.txid_extra3,
            txid_extra4: self.txid_extra4,
            txid_leaf: self.txid_leaf,
            txid_soil: self.txid_soil,
            txid_leaf_soil: self.txid_leaf_soil,
            txid_wind: self.txid_wind,
            txid_rain: self.txid_rain,
        }
    }

    fn duration_config(&self) -> DurationConfig {
        DurationConfig {
            latitude: self.latitude,
            longitude: self.longitude,
            coefficient: self.sunshine_coeff,
            min_radiation: self.sunshine_min,
            sunshine_loop: self.sunshine_loop,
            rain_loop: self.rain_dur_loop,
            hail_loop: self.hail_dur_loop,
            secondary_sunshine: self.sunshine2,
            secondary_rain: self.rain2,
            secondary_sunshine_loop: self.sunshine_loop,
            secondary_rain_loop: self.rain_dur_loop,
            sunshine_log: self.sunshine_log,
            rain_log: self.rain_dur_log,
            hail_log: self.hail_dur_log,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let opts = WeatherlinkBridgeApplication::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opts.log_level)
            .finish(),
    )
    .expect("failed to set tracing subscriber");

    let polling_secs = if opts.polling_secs < MIN_POLLING_SECS {
        tracing::warn!(
            message = "polling interval below the API rate limit, raising it",
            requested = opts.polling_secs,
            used = MIN_POLLING_SECS,
        );
        MIN_POLLING_SECS
    } else {
        opts.polling_secs
    };

    let timeout = Duration::from_millis(opts.timeout_millis);
    let http_client = Client::builder().timeout(timeout).build().unwrap_or_else(|e| {
        tracing::error!(message = "unable to initialize HTTP client", error = %e);
        process::exit(1)
    });

    let client = WeatherLinkClient::new(http_client, &opts.api_url, &opts.api_key, &opts.api_secret)
        .unwrap_or_else(|e| {
            tracing::error!(message = "unable to initialize API client", error = %e);
            process::exit(1)
        });

    // Make an initial request so bad credentials or an unreachable API
    // surface immediately instead of on the first scheduled poll.
    match client.current(opts.station_id, unix_now()).await {
        Err(e) => {
            tracing::warn!(message = "failed to fetch initial station data", error = %e);
        }
        Ok(doc) => {
            tracing::debug!(
                message = "verified station data",
                station_id = ?doc.station_id,
                sensors = doc.sensors.len(),
            );
        }
    }

    let mut sink = JsonLinesSink::create(&opts.output).unwrap_or_else(|e| {
        tracing::error!(message = "unable to open output file", path = %opts.output.display(), error = %e);
        process::exit(1)
    });

    let identity = opts.identity();
    let mut session = SessionState::new();
    let mut durations = DurationService::new(opts.duration_config());

    tracing::info!(
        message = "station polling started",
        api_url = %opts.api_url,
        station_id = opts.station_id,
        polling_secs,
        archive_secs = opts.archive_secs,
    );

    let poll_loop = async {
        let mut interval = tokio::time::interval(Duration::from_secs(polling_secs));
        let mut last_archive = unix_now();
        let mut interval_fields = FieldMap::new();

        loop {
            let _ = interval.tick().await;
            let now = unix_now();
            let fields = match client
                .current(opts.station_id, now)
                .instrument(tracing::span!(Level::DEBUG, "weatherlink_current"))
                .await
            {
                Ok(doc) => decode_current(&doc, &identity, &mut session),
                Err(e) => {
                    // State stays untouched; the next poll starts clean.
                    tracing::error!(message = "failed to fetch current conditions", error = %e);
                    continue;
                }
            };

            durations.observe(&fields, now);
            merge_poll(&mut interval_fields, fields);

            if now - last_archive >= opts.archive_secs as i64 {
                let mut record_fields = std::mem::take(&mut interval_fields);
                durations.close_interval(&mut record_fields, now, opts.archive_secs as f64);

                let record =
                    ArchiveRecord::new(now, (opts.archive_secs / 60) as u32, record_fields);
                match sink.append(&record) {
                    Ok(()) => {
                        tracing::info!(
                            message = "archive record appended",
                            date_time = record.date_time,
                            fields = record.fields.len(),
                        );
                    }
                    Err(e) => {
                        tracing::error!(message = "failed to append archive record", error = %e);
                    }
                }
                last_archive = now;
            }
        }
    };

    // Poll until either SIGTERM or SIGINT
    tokio::select! {
        _ = poll_loop => {}
        _ = sigterm() => {}
        _ = sigint() => {}
    }

    tracing::info!("bridge shutdown");
    Ok(())
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Return after the first SIGTERM signal received by this process
async fn sigterm() -> io::Result<()> {
    unix::signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

/// Return after the first SIGINT signal received by this process
async fn sigint() -> io::Result<()> {
    unix::signal(SignalKind::interrupt())?.recv().await;
    Ok(())
}
