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

use crate::decode::FieldMap;
use chrono::{DateTime, Datelike, Timelike};
use serde_json::Value;

/// Clear-sky radiation threshold in W/m² above which the sun counts as
/// shining, from an empirical solar-elevation model.
///
/// Pure function of the UTC timestamp, station coordinates and a
/// calibration coefficient. Returns 0 when the sun is at or below the
/// horizon.
pub fn sunshine_threshold(timestamp: i64, latitude: f64, longitude: f64, coefficient: f64) -> f64 {
    let utc = match DateTime::from_timestamp(timestamp, 0) {
        Some(utc) => utc,
        None => return 0.0,
    };
    let day_of_year = utc.ordinal() as f64;
    let theta = 360.0 * day_of_year / 365.0;

    let equation_of_time = 0.0172 + 0.4281 * theta.to_radians().cos()
        - 7.3515 * theta.to_radians().sin()
        - 3.3495 * (2.0 * theta.to_radians()).cos()
        - 9.3619 * (2.0 * theta.to_radians()).sin();

    let declination = (0.006918 - 0.399912 * theta.to_radians().cos()
        + 0.070257 * theta.to_radians().sin()
        - 0.006758 * (2.0 * theta.to_radians()).cos()
        + 0.000908 * (2.0 * theta.to_radians()).sin())
    .asin()
    .to_degrees();

    let minutes_of_day = (utc.hour() * 60 + utc.minute()) as f64;
    let solar_time = (minutes_of_day + longitude * 4.0 + equation_of_time) / 60.0;
    let hour_angle = (solar_time - 12.0) * 15.0;

    let elevation = (latitude.to_radians().sin() * declination.to_radians().sin()
        + latitude.to_radians().cos()
            * declination.to_radians().cos()
            * hour_angle.to_radians().cos())
    .asin()
    .to_degrees();

    if elevation > 0.0 {
        (0.73 + 0.06 * theta.to_radians().cos())
            * 1080.0
            * elevation.to_radians().sin().powf(1.25)
            * coefficient
    } else {
        0.0
    }
}

/// Whether a radiation reading counts as sunshine against a threshold.
pub fn sunshine_active(radiation: f64, threshold: f64, min_radiation: f64) -> bool {
    radiation > threshold && radiation > min_radiation && threshold > 0.0
}

/// Integrates instantaneous activity samples into per-archive-interval
/// duration totals, one tracker per observed series.
#[derive(Debug)]
pub struct DurationTracker {
    loop_mode: bool,
    last_sample: Option<i64>,
    accumulated: f64,
    first_interval: bool,
}

impl DurationTracker {
    /// In loop mode the interval total is the sum of active sample spans;
    /// otherwise any activity marks the whole interval.
    pub fn new(loop_mode: bool) -> Self {
        DurationTracker {
            loop_mode,
            last_sample: None,
            accumulated: 0.0,
            first_interval: true,
        }
    }

    /// Record one instantaneous sample. The first sample only establishes
    /// the reference time; afterwards each span ending in an active sample
    /// is added to the running total.
    pub fn sample(&mut self, timestamp: i64, active: bool) {
        match self.last_sample {
            None => self.last_sample = Some(timestamp),
            Some(last) => {
                let span = (timestamp - last) as f64;
                self.last_sample = Some(timestamp);
                if active {
                    self.accumulated += span;
                }
            }
        }
    }

    /// Close the archive interval and return its duration total in
    /// seconds. `record_active` is the activity of the interval's own
    /// record value (None when it was not reported), used as a fallback
    /// while no sample history exists yet.
    pub fn close_interval(&mut self, interval_secs: f64, record_active: Option<bool>) -> f64 {
        let duration = if self.last_sample.is_none() || self.first_interval {
            // No usable sample history: judge the whole interval by the
            // record's own instantaneous value.
            let mut duration = 0.0;
            if let Some(active) = record_active {
                if active {
                    duration = interval_secs;
                }
                // Sampling has started, so the next interval has real
                // coverage.
                if self.last_sample.is_some() {
                    self.first_interval = false;
                }
            }
            duration
        } else if self.accumulated > interval_secs * 2.0 {
            // More accumulation than the interval can hold means the
            // sample clock jumped; cap at the interval.
            interval_secs
        } else if !self.loop_mode {
            if self.accumulated > 0.0 {
                interval_secs
            } else {
                0.0
            }
        } else {
            self.accumulated
        };

        self.accumulated = 0.0;
        duration
    }
}

/// Configuration for the duration series.
#[derive(Debug, Clone)]
pub struct DurationConfig {
    pub latitude: f64,
    pub longitude: f64,
    /// Sunshine threshold calibration factor.
    pub coefficient: f64,
    /// Radiation floor below which sunshine is never counted, in W/m².
    pub min_radiation: f64,
    pub sunshine_loop: bool,
    pub rain_loop: bool,
    pub hail_loop: bool,
    /// Track the secondary station's radiation/rain series.
    pub secondary_sunshine: bool,
    pub secondary_rain: bool,
    pub secondary_sunshine_loop: bool,
    pub secondary_rain_loop: bool,
    pub sunshine_log: bool,
    pub rain_log: bool,
    pub hail_log: bool,
}

impl Default for DurationConfig {
    fn default() -> Self {
        DurationConfig {
            latitude: 0.0,
            longitude: 0.0,
            coefficient: 0.8,
            min_radiation: 0.0,
            sunshine_loop: true,
            rain_loop: false,
            hail_loop: false,
            secondary_sunshine: false,
            secondary_rain: false,
            secondary_sunshine_loop: true,
            secondary_rain_loop: false,
            sunshine_log: false,
            rain_log: false,
            hail_log: false,
        }
    }
}

/// All duration series for one station: sunshine and rain for both
/// transmitters, plus hail for stations that report it.
#[derive(Debug)]
pub struct DurationService {
    config: DurationConfig,
    sunshine: DurationTracker,
    sunshine2: DurationTracker,
    rain: DurationTracker,
    rain2: DurationTracker,
    hail: DurationTracker,
    last_threshold: f64,
    last_threshold2: f64,
}

impl DurationService {
    pub fn new(config: DurationConfig) -> Self {
        DurationService {
            sunshine: DurationTracker::new(config.sunshine_loop),
            sunshine2: DurationTracker::new(config.secondary_sunshine_loop),
            rain: DurationTracker::new(config.rain_loop),
            rain2: DurationTracker::new(config.secondary_rain_loop),
            hail: DurationTracker::new(config.hail_loop),
            last_threshold: 0.0,
            last_threshold2: 0.0,
            config,
        }
    }

    fn threshold_at(&self, timestamp: i64) -> f64 {
        sunshine_threshold(
            timestamp,
            self.config.latitude,
            self.config.longitude,
            self.config.coefficient,
        )
    }

    /// Feed one decoded poll into the trackers.
    pub fn observe(&mut self, fields: &FieldMap, timestamp: i64) {
        if let Some(radiation) = number(fields, "radiation") {
            let threshold = self.threshold_at(timestamp);
            let active = sunshine_active(radiation, threshold, self.config.min_radiation);
            self.sunshine.sample(timestamp, active);
            self.last_threshold = threshold;
            if radiation > 0.0 && self.config.sunshine_log {
                tracing::info!(
                    message = "sunshine sample",
                    radiation,
                    threshold,
                    accumulated = self.sunshine.accumulated,
                );
            }
        }

        if self.config.secondary_sunshine {
            if let Some(radiation) = number(fields, "radiation_2") {
                let threshold = self.threshold_at(timestamp);
                let active = sunshine_active(radiation, threshold, self.config.min_radiation);
                self.sunshine2.sample(timestamp, active);
                self.last_threshold2 = threshold;
            }
        }

        if let Some(rain) = number(fields, "rain") {
            self.rain.sample(timestamp, rain > 0.0);
            if rain > 0.0 && self.config.rain_log {
                tracing::info!(message = "rain sample", rain, accumulated = self.rain.accumulated);
            }
        }

        if self.config.secondary_rain {
            if let Some(rain) = number(fields, "rain_2") {
                self.rain2.sample(timestamp, rain > 0.0);
            }
        }

        if let Some(hail) = number(fields, "hail") {
            self.hail.sample(timestamp, hail > 0.0);
            if hail > 0.0 && self.config.hail_log {
                tracing::info!(message = "hail sample", hail, accumulated = self.hail.accumulated);
            }
        }
    }

    /// Close the archive interval ending at `timestamp` and write the
    /// duration fields into the record.
    pub fn close_interval(&mut self, record: &mut FieldMap, timestamp: i64, interval_secs: f64) {
        let radiation = number(record, "radiation");
        if self.sunshine.last_sample.is_none() || self.sunshine.first_interval {
            // The fallback judgement needs a threshold for the record's
            // own timestamp.
            if radiation.is_some() {
                self.last_threshold = self.threshold_at(timestamp);
            }
        }
        let active = radiation
            .map(|r| sunshine_active(r, self.last_threshold, self.config.min_radiation));
        let duration = self.sunshine.close_interval(interval_secs, active);
        record.insert("sunshineDur".to_string(), Value::from(duration));
        record.insert("sunshineThreshold".to_string(), Value::from(self.last_threshold));
        record.insert("sunshine_time".to_string(), Value::from(self.last_threshold));

        if self.config.secondary_sunshine {
            let radiation = number(record, "radiation_2");
            if self.sunshine2.last_sample.is_none() || self.sunshine2.first_interval {
                if radiation.is_some() {
                    self.last_threshold2 = self.threshold_at(timestamp);
                }
            }
            let active = radiation
                .map(|r| sunshine_active(r, self.last_threshold2, self.config.min_radiation));
            let duration = self.sunshine2.close_interval(interval_secs, active);
            record.insert("sunshineDur_2".to_string(), Value::from(duration));
            record.insert("sunshineThreshold2".to_string(), Value::from(self.last_threshold2));
        }

        let active = number(record, "rain").map(|r| r > 0.0);
        let duration = self.rain.close_interval(interval_secs, active);
        record.insert("rainDur".to_string(), Value::from(duration));

        if self.config.secondary_rain {
            let active = number(record, "rain_2").map(|r| r > 0.0);
            let duration = self.rain2.close_interval(interval_secs, active);
            record.insert("rainDur_2".to_string(), Value::from(duration));
        }

        let active = number(record, "hail").map(|h| h > 0.0);
        let duration = self.hail.close_interval(interval_secs, active);
        record.insert("hailDur".to_string(), Value::from(duration));
    }
}

fn number(fields: &FieldMap, key: &str) -> Option<f64> {
    fields.get(key).and_then(Value::as_f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn timestamp(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> i64 {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap().timestamp()
    }

    #[test]
    fn threshold_is_zero_with_sun_below_horizon() {
        // Midnight UTC on the equator at the prime meridian.
        let ts = timestamp(2023, 3, 21, 0, 0);
        assert_eq!(0.0, sunshine_threshold(ts, 0.0, 0.0, 0.8));
    }

    #[test]
    fn threshold_near_equinox_noon_on_equator() {
        // Sun almost overhead; threshold lands a bit under the model's
        // 1080 W/m² ceiling times the coefficient.
        let ts = timestamp(2023, 3, 21, 12, 0);
        let threshold = sunshine_threshold(ts, 0.0, 0.0, 0.8);
        assert!(threshold > 600.0 && threshold < 700.0, "threshold = {}", threshold);
    }

    #[test]
    fn threshold_scales_linearly_with_coefficient() {
        let ts = timestamp(2023, 6, 1, 11, 30);
        let half = sunshine_threshold(ts, 48.0, 11.0, 0.4);
        let full = sunshine_threshold(ts, 48.0, 11.0, 0.8);
        assert!(half > 0.0);
        assert!((full - 2.0 * half).abs() < 1e-9);
    }

    #[test]
    fn activity_predicate_needs_positive_threshold() {
        assert!(sunshine_active(500.0, 400.0, 18.0));
        assert!(!sunshine_active(500.0, 0.0, 18.0));
        assert!(!sunshine_active(10.0, 5.0, 18.0));
        assert!(!sunshine_active(300.0, 400.0, 18.0));
    }

    #[test]
    fn loop_mode_sums_active_spans() {
        let mut tracker = DurationTracker::new(true);
        tracker.first_interval = false;
        tracker.sample(0, true); // reference only
        tracker.sample(60, true); // +60
        tracker.sample(120, true); // +60
        tracker.sample(180, false);
        tracker.sample(240, true); // +60

        let duration = tracker.close_interval(300.0, Some(true));
        assert_eq!(180.0, duration);

        // Interval total resets after close.
        tracker.sample(300, false);
        assert_eq!(0.0, tracker.close_interval(300.0, Some(true)));
    }

    #[test]
    fn runaway_accumulation_clamps_to_interval() {
        let mut tracker = DurationTracker::new(true);
        tracker.first_interval = false;
        tracker.sample(0, true);
        tracker.sample(700, true); // clock jump: 700 s in one span

        assert_eq!(300.0, tracker.close_interval(300.0, Some(true)));
    }

    #[test]
    fn non_loop_mode_marks_whole_interval() {
        let mut tracker = DurationTracker::new(false);
        tracker.first_interval = false;
        tracker.sample(0, true);
        tracker.sample(30, true); // any accumulation at all

        assert_eq!(300.0, tracker.close_interval(300.0, Some(false)));

        tracker.sample(330, false);
        assert_eq!(0.0, tracker.close_interval(300.0, Some(false)));
    }

    #[test]
    fn first_interval_falls_back_to_record_value() {
        let mut tracker = DurationTracker::new(true);
        tracker.sample(0, true);
        tracker.sample(120, true);

        // First close ignores the accumulation and judges the record.
        assert_eq!(300.0, tracker.close_interval(300.0, Some(true)));

        // Second close uses real sample history.
        tracker.sample(300, true);
        tracker.sample(360, true);
        assert_eq!(60.0, tracker.close_interval(300.0, Some(false)));
    }

    #[test]
    fn fallback_without_record_value_stays_in_first_interval() {
        let mut tracker = DurationTracker::new(true);
        tracker.sample(0, true);
        tracker.sample(120, true);

        // Record carried no value; flag must persist.
        assert_eq!(0.0, tracker.close_interval(300.0, None));
        assert!(tracker.first_interval);
    }

    #[test]
    fn never_sampled_tracker_emits_zero_without_record_value() {
        let mut tracker = DurationTracker::new(false);
        assert_eq!(0.0, tracker.close_interval(300.0, None));
        assert_eq!(0.0, tracker.close_interval(300.0, Some(false)));
        assert_eq!(300.0, tracker.close_interval(300.0, Some(true)));
    }

    #[test]
    fn service_writes_duration_and_threshold_fields() {
        let mut service = DurationService::new(DurationConfig {
            rain_loop: true,
            ..DurationConfig::default()
        });

        let noon = timestamp(2023, 3, 21, 12, 0);
        let mut fields = FieldMap::new();
        fields.insert("radiation".to_string(), json!(800.0));
        fields.insert("rain".to_string(), json!(0.01));

        for i in 0..5 {
            service.observe(&fields, noon + i * 60);
        }

        let mut record = fields.clone();
        service.close_interval(&mut record, noon + 300, 300.0);

        // First archive interval: fallback from the record values.
        assert_eq!(json!(300.0), record["sunshineDur"]);
        assert_eq!(json!(300.0), record["rainDur"]);
        assert_eq!(json!(0.0), record["hailDur"]);
        assert!(record["sunshineThreshold"].as_f64().unwrap() > 0.0);
        assert_eq!(record["sunshineThreshold"], record["sunshine_time"]);

        // Second interval integrates the loop samples.
        for i in 5..10 {
            service.observe(&fields, noon + i * 60);
        }
        let mut record = fields.clone();
        service.close_interval(&mut record, noon + 600, 300.0);
        assert_eq!(json!(300.0), record["sunshineDur"]);
        assert_eq!(json!(300.0), record["rainDur"]);
    }

    #[test]
    fn secondary_series_only_tracked_when_enabled() {
        let mut service = DurationService::new(DurationConfig::default());
        let mut record = FieldMap::new();
        record.insert("radiation_2".to_string(), json!(700.0));
        service.close_interval(&mut record, timestamp(2023, 3, 21, 12, 0), 300.0);

        assert!(!record.contains_key("sunshineDur_2"));
        assert!(!record.contains_key("rainDur_2"));
        assert!(record.contains_key("sunshineDur"));
    }
}
