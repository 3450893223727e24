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

use crate::classify::{classify, RoleTracker, SensorRole, StationIdentity};
use crate::client::{ApiDocument, SensorSample};
use crate::derive::{cooling_degree_c, heating_degree_c, Counter, DeltaTrackers};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("{role} payload carried no samples")]
    EmptyPayload { role: &'static str },
    #[error("{role} payload is missing vendor field `{field}`")]
    MissingField {
        role: &'static str,
        field: &'static str,
    },
}

/// Output field map for one poll. Absent means "not reported"; explicit
/// JSON nulls from the API never appear here.
pub type FieldMap = BTreeMap<String, Value>;

/// Decode state that lives for the whole process: which roles have been
/// seen, and the previous values of the daily counters.
#[derive(Debug, Default)]
pub struct SessionState {
    pub roles: RoleTracker,
    pub counters: DeltaTrackers,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }
}

type FieldTable = [(&'static str, &'static str)];

// Primary ISS/VUE transmitter, vendor field -> output field. The battery
// flag intentionally lands under two output names.
const ISS_FIELDS: &FieldTable = &[
    ("wind_speed_last", "windSpeed"),
    ("wind_dir_last", "windDir"),
    ("wind_speed_hi_last_2_min", "windGust"),
    ("wind_dir_at_hi_speed_last_2_min", "windGustDir"),
    ("wind_speed_avg_last_1_min", "windSpeed1"),
    ("wind_dir_scalar_avg_last_1_min", "windDir1"),
    ("wind_speed_avg_last_10_min", "windSpeed10"),
    ("wind_dir_scalar_avg_last_10_min", "windDir10"),
    ("wind_speed_hi_last_10_min", "windGustSpeed10"),
    ("wind_dir_at_hi_speed_last_10_min", "windGustDir10"),
    ("temp", "outTemp"),
    ("hum", "outHumidity"),
    ("dew_point", "dewpoint"),
    ("heat_index", "heatindex"),
    ("wind_chill", "windchill"),
    ("thsw_index", "THSW"),
    ("thw_index", "THW"),
    ("wet_bulb", "outWetbulb"),
    ("solar_rad", "radiation"),
    ("uv_index", "UV"),
    ("trans_battery_flag", "txBatteryStatus"),
    ("trans_battery_flag", "batteryStatus"),
    ("rx_state", "signal1"),
    ("rssi_last", "rssi"),
    ("reception_day", "rxCheckPercent"),
    ("packets_received_day", "packets_received"),
    ("packets_missed_day", "packets_missed"),
    ("crc_errors_day", "crc_error"),
    ("resyncs_day", "resyncs"),
    ("supercap_volt", "supercapVolt"),
    ("solar_panel_volt", "solarVolt"),
    ("trans_battery_volt", "txBatteryVolt"),
    ("tx_id", "txID"),
    ("freq_index", "afc"),
];

const ISS_RAIN_FIELDS: &FieldTable = &[
    ("rain_storm_current_in", "stormRain"),
    ("rain_storm_last_in", "stormRainlast"),
    ("rainfall_last_15_min_in", "rain15"),
    ("rainfall_last_60_min_in", "rain60"),
    ("rainfall_last_24_hr_in", "rain24"),
    ("rain_rate_hi_last_15_min_in", "rain_rate_hi_last_15_min"),
    ("rain_storm_current_start_at", "rain_storm_start_at"),
    ("rain_storm_last_start_at", "rain_storm_last_start_at"),
    ("rain_storm_last_end_at", "rain_storm_last_end_at"),
    ("rainfall_month_in", "monthRain"),
    ("rainfall_year_in", "yearRain"),
    ("rain_rate_last_in", "rainRate"),
];

const ISS_ET_FIELDS: &FieldTable = &[("et_month", "monthET"), ("et_year", "yearET")];

// Secondary transmitter. Mostly `_2`-suffixed, with a handful of
// irregular names the archive schema grew historically.
const ISS2_FIELDS: &FieldTable = &[
    ("wind_speed_last", "windSpeed_2"),
    ("wind_dir_last", "windDir_2"),
    ("wind_speed_hi_last_2_min", "windGust_2"),
    ("wind_dir_at_hi_speed_last_2_min", "windGustDir_2"),
    ("wind_speed_avg_last_1_min", "windSpeed1_2"),
    ("wind_dir_scalar_avg_last_1_min", "windDir1_2"),
    ("wind_speed_avg_last_10_min", "windSpeed10_2"),
    ("wind_dir_scalar_avg_last_10_min", "windDir10_2"),
    ("wind_speed_hi_last_10_min", "windGustSpeed10_2"),
    ("wind_dir_at_hi_speed_last_10_min", "windGustDir10_2"),
    ("temp", "outTemp_2"),
    ("hum", "outHumidity_2"),
    ("dew_point", "dewpoint2"),
    ("heat_index", "heatindex2"),
    ("wind_chill", "windchill2"),
    ("thsw_index", "THSW_2"),
    ("thw_index", "THW_2"),
    ("wet_bulb", "outWetbulb_2"),
    ("solar_rad", "radiation_2"),
    ("uv_index", "UV_2"),
    ("trans_battery_flag", "txBatteryStatus_2"),
    ("rx_state", "signal_2"),
    ("rssi_last", "rssi_2"),
    ("reception_day", "rxCheckPercent_2"),
    ("packets_received_day", "packets_received_2"),
    ("packets_missed_day", "packets_missed_2"),
    ("crc_errors_day", "crc_error_2"),
    ("resyncs_day", "resyncs_2"),
    ("supercap_volt", "supercapVolt_2"),
    ("solar_panel_volt", "solarVolt_2"),
    ("trans_battery_volt", "txBatteryVolt_2"),
    ("tx_id", "txID_2"),
    ("freq_index", "afc_2"),
];

const ISS2_RAIN_FIELDS: &FieldTable = &[
    ("rain_storm_current_in", "stormRain_2"),
    ("rain_storm_last_in", "stormRainlast_2"),
    ("rainfall_last_15_min_in", "rain15_2"),
    ("rainfall_last_60_min_in", "rain60_2"),
    ("rainfall_last_24_hr_in", "rain24_2"),
    ("rain_rate_hi_last_15_min_in", "rain_rate_hi_last_15_min_2"),
    ("rain_storm_current_start_at", "rain_storm_start_at_2"),
    ("rain_storm_last_start_at", "rain_storm_last_start_at_2"),
    ("rain_storm_last_end_at", "rain_storm_last_end_at_2"),
    ("rainfall_month_in", "monthRain_2"),
    ("rainfall_year_in", "yearRain_2"),
    ("rain_rate_last_in", "rainRate_2"),
];

const ISS2_ET_FIELDS: &FieldTable = &[("et_month", "monthET_2"), ("et_year", "yearET_2")];

const BAROMETER_FIELDS: &FieldTable = &[
    ("bar_absolute", "pressure"),
    ("bar_sea_level", "barometer"),
];

const INSIDE_FIELDS: &FieldTable = &[
    ("temp_in", "inTemp"),
    ("hum_in", "inHumidity"),
    ("dew_point_in", "inDewpoint"),
];

const LEAF_FIELDS: &FieldTable = &[
    ("temp_1", "leafTemp1"),
    ("temp_2", "leafTemp2"),
    ("wet_leaf_1", "leafWet1"),
    ("wet_leaf_2", "leafWet2"),
    ("rx_state", "signal7"),
    ("trans_battery_flag", "batteryStatus7"),
    ("rssi_last", "rssi7"),
    ("tx_id", "txID7"),
    ("reception_day", "rxCheckPercent7"),
    ("packets_received_day", "packets_received7"),
    ("packets_missed_day", "packets_missed7"),
    ("crc_errors_day", "crc_error7"),
    ("resyncs_day", "resyncs7"),
    ("freq_index", "afc7"),
];

const SOIL_FIELDS: &FieldTable = &[
    ("temp_1", "soilTemp1"),
    ("temp_2", "soilTemp2"),
    ("temp_3", "soilTemp3"),
    ("temp_4", "soilTemp4"),
    ("moist_soil_1", "soilMoist1"),
    ("moist_soil_2", "soilMoist2"),
    ("moist_soil_3", "soilMoist3"),
    ("moist_soil_4", "soilMoist4"),
    ("rx_state", "signal8"),
    ("trans_battery_flag", "batteryStatus8"),
    ("rssi_last", "rssi8"),
    ("tx_id", "txID8"),
    ("reception_day", "rxCheckPercent8"),
    ("packets_received_day", "packets_received8"),
    ("packets_missed_day", "packets_missed8"),
    ("crc_errors_day", "crc_error8"),
    ("resyncs_day", "resyncs8"),
    ("freq_index", "afc8"),
];

const LEAF_SOIL_FIELDS: &FieldTable = &[
    ("temp_1", "soilTemp1"),
    ("temp_2", "soilTemp2"),
    ("temp_3", "soilTemp3"),
    ("temp_4", "soilTemp4"),
    ("moist_soil_1", "soilMoist1"),
    ("moist_soil_2", "soilMoist2"),
    ("moist_soil_3", "soilMoist3"),
    ("moist_soil_4", "soilMoist4"),
    ("wet_leaf_1", "leafWet1"),
    ("wet_leaf_2", "leafWet2"),
    ("rx_state", "signal6"),
    ("trans_battery_flag", "batteryStatus6"),
    ("rssi_last", "rssi6"),
    ("tx_id", "txID6"),
    ("reception_day", "rxCheckPercent6"),
    ("packets_received_day", "packets_received6"),
    ("packets_missed_day", "packets_missed6"),
    ("crc_errors_day", "crc_error6"),
    ("resyncs_day", "resyncs6"),
    ("freq_index", "afc6"),
];

const EXTRA1_FIELDS: &FieldTable = &[
    ("temp", "extraTemp1"),
    ("hum", "extraHumid1"),
    ("dew_point", "dewpoint_1"),
    ("wet_bulb", "wetbulb_1"),
    ("heat_index", "heatindex_1"),
    ("rx_state", "signal2"),
    ("trans_battery_flag", "batteryStatus2"),
    ("rssi_last", "rssi2"),
    ("tx_id", "txID2"),
    ("reception_day", "rxCheckPercent2"),
    ("packets_received_day", "packets_received2"),
    ("packets_missed_day", "packets_missed2"),
    ("crc_errors_day", "crc_error2"),
    ("resyncs_day", "resyncs2"),
    ("freq_index", "afc2"),
];

const EXTRA2_FIELDS: &FieldTable = &[
    ("temp", "extraTemp2"),
    ("hum", "extraHumid2"),
    ("dew_point", "dewpoint_2"),
    ("wet_bulb", "wetbulb_2"),
    ("heat_index", "heatindex_2"),
    ("rx_state", "signal3"),
    ("trans_battery_flag", "batteryStatus3"),
    ("rssi_last", "rssi3"),
    ("tx_id", "txID3"),
    ("reception_day", "rxCheckPercent3"),
    ("packets_received_day", "packets_received3"),
    ("packets_missed_day", "packets_missed3"),
    ("crc_errors_day", "crc_error3"),
    ("resyncs_day", "resyncs3"),
    ("freq_index", "afc3"),
];

const EXTRA3_FIELDS: &FieldTable = &[
    ("temp", "extraTemp3"),
    ("hum", "extraHumid3"),
    ("dew_point", "dewpoint_3"),
    ("wet_bulb", "wetbulb_3"),
    ("heat_index", "heatindex_3"),
    ("rx_state", "signal4"),
    ("trans_battery_flag", "batteryStatus4"),
    ("rssi_last", "rssi4"),
    ("tx_id", "txID4"),
    ("reception_day", "rxCheckPercent4"),
    ("packets_received_day", "packets_received4"),
    ("packets_missed_day", "packets_missed4"),
    ("crc_errors_day", "crc_error4"),
    ("resyncs_day", "resyncs4"),
    ("freq_index", "afc4"),
];

const EXTRA4_FIELDS: &FieldTable = &[
    ("temp", "extraTemp4"),
    ("hum", "extraHumid4"),
    ("dew_point", "dewpoint_4"),
    ("wet_bulb", "wetbulb_4"),
    ("heat_index", "heatindex_4"),
    ("rx_state", "signal5"),
    ("trans_battery_flag", "batteryStatus5"),
    ("rssi_last", "rssi5"),
    ("tx_id", "txID5"),
    ("reception_day", "rxCheckPercent5"),
    ("packets_received_day", "packets_received5"),
    ("packets_missed_day", "packets_missed5"),
    ("crc_errors_day", "crc_error5"),
    ("resyncs_day", "resyncs5"),
    ("freq_index", "afc5"),
];

const WIND_FIELDS: &FieldTable = &[
    ("wind_speed_last", "windSpeed"),
    ("wind_dir_last", "windDir"),
    ("wind_speed_hi_last_2_min", "windGust"),
    ("wind_dir_at_hi_speed_last_2_min", "windGustDir"),
    ("wind_speed_avg_last_1_min", "windSpeed1"),
    ("wind_dir_scalar_avg_last_1_min", "windDir1"),
    ("wind_speed_avg_last_10_min", "windSpeed10"),
    ("wind_dir_scalar_avg_last_10_min", "windDir10"),
    ("wind_speed_hi_last_10_min", "windGustSpeed10"),
    ("wind_dir_at_hi_speed_last_10_min", "windGustDir10"),
    ("rx_state", "signalw"),
    ("trans_battery_flag", "windBatteryStatus"),
    ("rssi_last", "rssiw"),
    ("tx_id", "txIDw"),
    ("reception_day", "rxCheckPercentw"),
    ("packets_received_day", "packets_receivedw"),
    ("packets_missed_day", "packets_missedw"),
    ("crc_errors_day", "crc_errorw"),
    ("resyncs_day", "resyncsw"),
    ("freq_index", "afcw"),
];

const RAIN_STATION_RAIN_FIELDS: &FieldTable = &[
    ("rain_storm_current_in", "stormRain"),
    ("rain_storm_last_in", "stormRainlast"),
    ("rainfall_last_15_min_in", "rain15"),
    ("rainfall_last_60_min_in", "rain60"),
    ("rainfall_last_24_hr_in", "rain24"),
    ("rain_rate_hi_last_15_min_in", "rain_rate_hi_last_15_min"),
    ("rain_storm_current_start_at", "rain_storm_start_at"),
    ("rain_storm_last_start_at", "rain_storm_last_start_at"),
    ("rain_storm_last_end_at", "rain_storm_last_end_at"),
    ("rainfall_month_in", "monthRain"),
    ("rainfall_year_in", "yearRain"),
    ("rain_rate_last_in", "rainRate"),
];

const RAIN_STATION_STATUS_FIELDS: &FieldTable = &[
    ("rx_state", "signalr"),
    ("trans_battery_flag", "rainBatteryStatus"),
    ("rssi_last", "rssir"),
    ("tx_id", "txIDr"),
    ("reception_day", "rxCheckPercentr"),
    ("packets_received_day", "packets_receivedr"),
    ("packets_missed_day", "packets_missedr"),
    ("crc_errors_day", "crc_errorr"),
    ("resyncs_day", "resyncsr"),
    ("freq_index", "afcr"),
];

const HEALTH_FIELDS: &FieldTable = &[
    ("battery_voltage", "consoleBatteryC"),
    ("wifi_rssi", "rssiC"),
    ("console_api_level", "consoleApiLevelC"),
    ("queue_kilobytes", "queueKilobytesC"),
    ("free_mem", "freeMemC"),
    ("system_free_space", "systemFreeSpaceC"),
    ("charger_plugged", "chargerPluggedC"),
    ("battery_percent", "batteryPercentC"),
    ("local_api_queries", "localAPIQueriesC"),
    ("health_version", "healthVersionC"),
    ("link_uptime", "linkUptimeC"),
    ("rx_kilobytes", "rxKilobytesC"),
    ("connection_uptime", "connectionUptimeC"),
    ("os_uptime", "osUptimeC"),
    ("battery_condition", "batteryConditionC"),
    ("internal_free_space", "iFreeSpaceC"),
    ("battery_current", "batteryCurrentC"),
    ("battery_status", "batteryStatusC"),
    ("database_kilobytes", "databaseKilobytesC"),
    ("battery_cycle_count", "batteryCycleCountC"),
    ("bootloader_version", "bootloaderVersionC"),
    ("clock_source", "clockSourceC"),
    ("app_uptime", "appUptimeC"),
    ("battery_temp", "batteryTempC"),
    ("tx_kilobytes", "txKilobytesC"),
    ("console_radio_version", "consoleRadioVersionC"),
    ("console_sw_version", "consoleSwVersionC"),
    ("console_os_version", "consoleOsVersionC"),
];

const AIR_QUALITY_FIELDS: &FieldTable = &[
    ("temp", "co2_Temp"),
    ("hum", "co2_Hum"),
    ("dew_point", "dewpoint1"),
    ("wet_bulb", "wetbulb1"),
    ("heat_index", "heatindex1"),
    ("pct_pm_data_1_hour", "pct_pm_data_last_1_hour"),
    ("pct_pm_data_3_hour", "pct_pm_data_last_3_hours"),
    ("pct_pm_data_nowcast", "pct_pm_data_nowcast"),
    ("pct_pm_data_24_hour", "pct_pm_data_last_24_hours"),
    ("pm_2p5_1_hour", "pm_2p5_last_1_hour"),
    ("pm_2p5_3_hour", "pm_2p5_last_3_hours"),
    ("pm_2p5_24_hour", "pm_2p5_last_24_hours"),
    ("pm_10_1_hour", "pm_10_last_1_hour"),
    ("pm_10_3_hour", "pm_10_last_3_hours"),
    ("pm_10_24_hour", "pm_10_last_24_hours"),
    ("pm_2p5_nowcast", "pm2_5_nowcast"),
    ("pm_10_nowcast", "pm10_0_nowcast"),
];

// Instantaneous particulate concentrations get the sensor-saturation clamp.
const AIR_QUALITY_PM_FIELDS: &FieldTable = &[
    ("pm_1", "pm1_0"),
    ("pm_2p5", "pm2_5"),
    ("pm_10", "pm10_0"),
];

const AIR_QUALITY_HEALTH_FIELDS: &FieldTable = &[
    ("wifi_rssi", "rssiA"),
    ("firmware_version", "firmwareVersionA"),
    ("bootloader_version", "bootloaderVersionA"),
    ("internal_free_mem_chunk_size", "iFreeMemChunkA"),
    ("internal_used_mem", "iUsedMemA"),
    ("internal_free_mem", "iFreeMemA"),
    ("total_used_mem", "tUsedMemA"),
    ("total_free_mem", "tFreeMemA"),
    ("internal_free_mem_watermark", "iFreeMemWatermA"),
    ("packet_errors", "errorPacketsA"),
    ("dropped_packets", "droppedPacketsA"),
    ("rx_packets", "rxPacketsA"),
    ("tx_packets", "txPacketsA"),
    ("record_write_count", "recordWriteCountA"),
    ("local_api_queries", "localAPIQueriesA"),
    ("uptime", "uptimeA"),
    ("link_uptime", "linkUptimeA"),
    ("health_version", "healthVersionA"),
];

const PM_SATURATION_LIMIT: f64 = 1000.0;
const PM_SATURATION_SENTINEL: i64 = 999;

/// Everything that differs between the primary and secondary transmitter
/// decodes: output names, counter ids, and the secondary's wind-run field.
struct TransmitterTables {
    fields: &'static FieldTable,
    rain_fields: &'static FieldTable,
    et_fields: &'static FieldTable,
    day_rain_out: &'static str,
    rain_out: &'static str,
    rain_counter: Counter,
    day_et_out: &'static str,
    et_out: &'static str,
    et_counter: Counter,
    hdd_out: &'static str,
    hddc_out: &'static str,
    cdd_out: &'static str,
    cddc_out: &'static str,
    wind_run: Option<(&'static str, &'static str)>,
}

const ISS_TABLES: TransmitterTables = TransmitterTables {
    fields: ISS_FIELDS,
    rain_fields: ISS_RAIN_FIELDS,
    et_fields: ISS_ET_FIELDS,
    day_rain_out: "dayRain",
    rain_out: "rain",
    rain_counter: Counter::RainPrimary,
    day_et_out: "dayET",
    et_out: "ET",
    et_counter: Counter::EtPrimary,
    hdd_out: "hdd_day",
    hddc_out: "hddc_day",
    cdd_out: "cdd_day",
    cddc_out: "cddc_day",
    wind_run: None,
};

const ISS2_TABLES: TransmitterTables = TransmitterTables {
    fields: ISS2_FIELDS,
    rain_fields: ISS2_RAIN_FIELDS,
    et_fields: ISS2_ET_FIELDS,
    day_rain_out: "dayRain_2",
    rain_out: "rain_2",
    rain_counter: Counter::RainSecondary,
    day_et_out: "dayET_2",
    et_out: "ET_2",
    et_counter: Counter::EtSecondary,
    hdd_out: "hdd_day_2",
    hddc_out: "hddc_day_2",
    cdd_out: "cdd_day_2",
    cddc_out: "cddc_day_2",
    wind_run: Some(("windSpeed_2", "windrun_2")),
};

fn required<'a>(
    role: SensorRole,
    sample: &'a SensorSample,
    field: &'static str,
) -> Result<&'a Value, DecodeError> {
    sample.get(field).ok_or(DecodeError::MissingField {
        role: role.name(),
        field,
    })
}

/// Strict lookup of a numeric vendor field. Absent key is an error;
/// explicit null is "not reported".
fn required_f64(
    role: SensorRole,
    sample: &SensorSample,
    field: &'static str,
) -> Result<Option<f64>, DecodeError> {
    Ok(required(role, sample, field)?.as_f64())
}

/// Copy a table of vendor fields into the output map. Null values are
/// skipped; a missing key fails the whole role.
fn copy_fields(
    role: SensorRole,
    sample: &SensorSample,
    table: &FieldTable,
    out: &mut FieldMap,
) -> Result<(), DecodeError> {
    for (vendor, output) in table {
        let value = required(role, sample, vendor)?;
        if !value.is_null() {
            out.insert((*output).to_string(), value.clone());
        }
    }
    Ok(())
}

fn clamp_particulate(value: &Value) -> Value {
    match value.as_f64() {
        Some(v) if v > PM_SATURATION_LIMIT => Value::from(PM_SATURATION_SENTINEL),
        _ => value.clone(),
    }
}

/// Decode an ISS/VUE transmitter sample: the plain field table, degree-day
/// conversion, and the rain/ET daily-counter deltas. Counter state is only
/// touched once every strict lookup has succeeded.
fn extract_transmitter(
    role: SensorRole,
    sample: &SensorSample,
    tables: &TransmitterTables,
    counters: &mut DeltaTrackers,
) -> Result<FieldMap, DecodeError> {
    let mut out = FieldMap::new();

    // A transmitter that reports no temperature is offline or starting up;
    // its sample contributes nothing this poll.
    if required(role, sample, "temp")?.is_null() {
        return Ok(out);
    }

    copy_fields(role, sample, tables.fields, &mut out)?;

    if let Some(hdd) = required_f64(role, sample, "hdd_day")? {
        out.insert(tables.hdd_out.to_string(), Value::from(hdd));
        out.insert(tables.hddc_out.to_string(), Value::from(heating_degree_c(hdd)));
    }
    if let Some(cdd) = required_f64(role, sample, "cdd_day")? {
        out.insert(tables.cdd_out.to_string(), Value::from(cdd));
        out.insert(tables.cddc_out.to_string(), Value::from(cooling_degree_c(cdd)));
    }

    let day_rain = required_f64(role, sample, "rainfall_day_in")?;
    if day_rain.is_some() {
        copy_fields(role, sample, tables.rain_fields, &mut out)?;
    }

    let day_et = required_f64(role, sample, "et_day")?;
    copy_fields(role, sample, tables.et_fields, &mut out)?;

    if let Some((speed_out, run_out)) = tables.wind_run {
        // Distance covered at the current speed over one archive interval,
        // in miles.
        if let Some(speed) = out.get(speed_out).and_then(Value::as_f64) {
            out.insert(run_out.to_string(), Value::from(speed * 2.5 / 60.0));
        }
    }

    // All strict lookups are done; session counters may advance now.
    if let Some(day_rain) = day_rain {
        out.insert(tables.day_rain_out.to_string(), Value::from(day_rain));
        let delta = counters.rain_delta(tables.rain_counter, day_rain);
        out.insert(tables.rain_out.to_string(), Value::from(delta));
    }
    match day_et {
        Some(day_et) => {
            out.insert(tables.day_et_out.to_string(), Value::from(day_et));
            let delta = counters.et_delta(tables.et_counter, day_et);
            out.insert(tables.et_out.to_string(), Value::from(delta));
        }
        None => {
            out.insert(tables.et_out.to_string(), Value::from(0.0));
        }
    }

    Ok(out)
}

/// Decode a rain-only collector. It shares the primary rain counter with
/// the primary transmitter; stations carry one or the other.
fn extract_rain_station(
    role: SensorRole,
    sample: &SensorSample,
    counters: &mut DeltaTrackers,
) -> Result<FieldMap, DecodeError> {
    let mut out = FieldMap::new();

    let day_rain = required_f64(role, sample, "rainfall_day_in")?;
    if day_rain.is_some() {
        copy_fields(role, sample, RAIN_STATION_RAIN_FIELDS, &mut out)?;
    }
    copy_fields(role, sample, RAIN_STATION_STATUS_FIELDS, &mut out)?;

    if let Some(day_rain) = day_rain {
        out.insert("dayRain".to_string(), Value::from(day_rain));
        let delta = counters.rain_delta(Counter::RainPrimary, day_rain);
        out.insert("rain".to_string(), Value::from(delta));
    }

    Ok(out)
}

fn extract_air_quality(role: SensorRole, sample: &SensorSample) -> Result<FieldMap, DecodeError> {
    let mut out = FieldMap::new();
    copy_fields(role, sample, AIR_QUALITY_FIELDS, &mut out)?;

    for (vendor, output) in AIR_QUALITY_PM_FIELDS {
        let value = required(role, sample, vendor)?;
        if !value.is_null() {
            out.insert((*output).to_string(), clamp_particulate(value));
        }
    }

    Ok(out)
}

/// Decode the fields one role contributes to the poll's record.
fn extract_role(
    role: SensorRole,
    sample: &SensorSample,
    counters: &mut DeltaTrackers,
) -> Result<FieldMap, DecodeError> {
    match role {
        SensorRole::Iss => extract_transmitter(role, sample, &ISS_TABLES, counters),
        SensorRole::Iss2 => extract_transmitter(role, sample, &ISS2_TABLES, counters),
        SensorRole::Rain => extract_rain_station(role, sample, counters),
        SensorRole::AirQuality => extract_air_quality(role, sample),
        _ => {
            let table = match role {
                SensorRole::Extra1 => EXTRA1_FIELDS,
                SensorRole::Extra2 => EXTRA2_FIELDS,
                SensorRole::Extra3 => EXTRA3_FIELDS,
                SensorRole::Extra4 => EXTRA4_FIELDS,
                SensorRole::Leaf => LEAF_FIELDS,
                SensorRole::Soil => SOIL_FIELDS,
                SensorRole::LeafSoil => LEAF_SOIL_FIELDS,
                SensorRole::Wind => WIND_FIELDS,
                SensorRole::ConsoleBarometer => BAROMETER_FIELDS,
                SensorRole::ConsoleInside => INSIDE_FIELDS,
                SensorRole::ConsoleHealth => HEALTH_FIELDS,
                SensorRole::AirQualityHealth => AIR_QUALITY_HEALTH_FIELDS,
                // Handled above.
                SensorRole::Iss
                | SensorRole::Iss2
                | SensorRole::Rain
                | SensorRole::AirQuality => unreachable!(),
            };
            let mut out = FieldMap::new();
            copy_fields(role, sample, table, &mut out)?;
            Ok(out)
        }
    }
}

/// Decode a current-conditions document into one flat field map.
///
/// Classification and extraction run per role; a role whose payload is
/// malformed is logged and dropped without affecting the others or the
/// session counters.
pub fn decode_current(
    document: &ApiDocument,
    identity: &StationIdentity,
    session: &mut SessionState,
) -> FieldMap {
    let classification = classify(&document.sensors, identity, &mut session.roles);

    let mut fields = FieldMap::new();
    for (role, payload) in classification.iter() {
        let sample = match payload.first_sample() {
            Some(sample) => sample,
            None => {
                tracing::error!(
                    message = "sensor payload decode failed",
                    error = %DecodeError::EmptyPayload { role: role.name() },
                    payload = ?payload,
                );
                continue;
            }
        };

        match extract_role(role, sample, &mut session.counters) {
            Ok(contribution) => fields.extend(contribution),
            Err(e) => {
                tracing::error!(
                    message = "sensor payload decode failed",
                    error = %e,
                    payload = ?sample,
                );
            }
        }
    }

    fields
}

// Per-poll amounts rather than instantaneous readings; they sum across
// the polls of one archive interval instead of replacing.
const INCREMENTAL_FIELDS: &[&str] = &["rain", "rain_2", "ET", "ET_2"];

/// Merge one poll's decoded fields into the running archive-interval map.
///
/// Instantaneous fields take the newest value; incremental fields (the
/// rain/ET deltas) add up so amounts from earlier polls in the interval
/// are not lost when the record is built.
pub fn merge_poll(interval: &mut FieldMap, poll: FieldMap) {
    for (key, value) in poll {
        if INCREMENTAL_FIELDS.contains(&key.as_str()) {
            let prior = interval.get(&key).and_then(Value::as_f64).unwrap_or(0.0);
            let amount = value.as_f64().unwrap_or(0.0);
            interval.insert(key, Value::from(prior + amount));
        } else {
            interval.insert(key, value);
        }
    }
}
