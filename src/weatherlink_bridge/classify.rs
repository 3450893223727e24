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

use crate::client::{SensorPayload, SensorSample};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

// Data structure types used by the current-conditions endpoint. The
// historic endpoint uses 20/22/24/26 for the same sensors; those payloads
// are valid but not classified here.
const STRUCTURE_BAROMETER: i64 = 19;
const STRUCTURE_INSIDE: i64 = 21;
const STRUCTURE_TRANSMITTER: i64 = 23;
const STRUCTURE_LEAF_SOIL: i64 = 25;
const STRUCTURE_HEALTH: i64 = 27;
const STRUCTURE_AIR_QUALITY: i64 = 16;
const STRUCTURE_AIR_QUALITY_HEALTH: i64 = 18;

// Sensor type shared by wind-only stations, rain-only stations, and the
// extra temperature/humidity channels.
const SENSOR_TYPE_AUX: i64 = 55;

/// The logical sensor roles a payload can fill. Closed set; classification
/// is a pure function of payload shape and the configured transmitter ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorRole {
    /// Primary ISS/VUE transmitter.
    Iss,
    /// Secondary ISS/VUE transmitter.
    Iss2,
    Extra1,
    Extra2,
    Extra3,
    Extra4,
    Leaf,
    Soil,
    LeafSoil,
    /// Wind-only anemometer transmitter.
    Wind,
    /// Rain-only collector transmitter.
    Rain,
    ConsoleBarometer,
    ConsoleInside,
    ConsoleHealth,
    AirQuality,
    AirQualityHealth,
}

impl SensorRole {
    /// All roles, in the order record decoding walks them.
    pub const ALL: [SensorRole; 16] = [
        SensorRole::Iss,
        SensorRole::Iss2,
        SensorRole::Extra1,
        SensorRole::Extra2,
        SensorRole::Extra3,
        SensorRole::Extra4,
        SensorRole::Leaf,
        SensorRole::Soil,
        SensorRole::LeafSoil,
        SensorRole::Wind,
        SensorRole::Rain,
        SensorRole::ConsoleBarometer,
        SensorRole::ConsoleInside,
        SensorRole::ConsoleHealth,
        SensorRole::AirQuality,
        SensorRole::AirQualityHealth,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SensorRole::Iss => "iss",
            SensorRole::Iss2 => "iss2",
            SensorRole::Extra1 => "extra1",
            SensorRole::Extra2 => "extra2",
            SensorRole::Extra3 => "extra3",
            SensorRole::Extra4 => "extra4",
            SensorRole::Leaf => "leaf",
            SensorRole::Soil => "soil",
            SensorRole::LeafSoil => "leaf_soil",
            SensorRole::Wind => "wind",
            SensorRole::Rain => "rain",
            SensorRole::ConsoleBarometer => "console_barometer",
            SensorRole::ConsoleInside => "console_inside",
            SensorRole::ConsoleHealth => "console_health",
            SensorRole::AirQuality => "air_quality",
            SensorRole::AirQualityHealth => "air_quality_health",
        }
    }
}

/// Transmitter ids configured per logical role. A role with no id never
/// matches a transmitter-keyed payload.
#[derive(Debug, Clone, Default)]
pub struct StationIdentity {
    pub txid_iss: Option<i64>,
    pub txid_iss2: Option<i64>,
    pub txid_extra1: Option<i64>,
    pub txid_extra2: Option<i64>,
    pub txid_extra3: Option<i64>,
    pub txid_extra4: Option<i64>,
    pub txid_leaf: Option<i64>,
    pub txid_soil: Option<i64>,
    pub txid_leaf_soil: Option<i64>,
    pub txid_wind: Option<i64>,
    pub txid_rain: Option<i64>,
}

/// Tracks which roles have ever matched, so the "found sensor" notice is
/// emitted exactly once per role per process lifetime.
#[derive(Debug, Default)]
pub struct RoleTracker {
    seen: HashSet<SensorRole>,
}

impl RoleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a role matched this poll. Returns true the first time.
    pub fn observe(&mut self, role: SensorRole) -> bool {
        self.seen.insert(role)
    }

    pub fn has_seen(&self, role: SensorRole) -> bool {
        self.seen.contains(&role)
    }
}

/// Result of classifying one poll's sensor list: at most one payload per
/// role, plus the roles seen for the first time this process lifetime.
pub struct Classification<'a> {
    roles: HashMap<SensorRole, &'a SensorPayload>,
    newly_seen: Vec<SensorRole>,
}

impl<'a> Classification<'a> {
    pub fn get(&self, role: SensorRole) -> Option<&'a SensorPayload> {
        self.roles.get(&role).copied()
    }

    /// Roles that transitioned from never-matched to matched in this poll.
    pub fn newly_seen(&self) -> &[SensorRole] {
        &self.newly_seen
    }

    /// Matched (role, payload) pairs in `SensorRole::ALL` order.
    pub fn iter(&self) -> impl Iterator<Item = (SensorRole, &'a SensorPayload)> + '_ {
        SensorRole::ALL
            .iter()
            .filter_map(|role| self.roles.get(role).map(|payload| (*role, *payload)))
    }
}

fn sample_has(sample: &SensorSample, key: &str) -> bool {
    matches!(sample.get(key), Some(v) if !matches!(v, Value::Null))
}

/// Roles a single payload qualifies for, in priority order.
fn candidate_roles(payload: &SensorPayload, identity: &StationIdentity) -> Vec<SensorRole> {
    let mut candidates = Vec::new();
    let sample = match payload.first_sample() {
        Some(s) => s,
        None => return candidates,
    };

    match payload.structure_type {
        STRUCTURE_BAROMETER => candidates.push(SensorRole::ConsoleBarometer),
        STRUCTURE_INSIDE => candidates.push(SensorRole::ConsoleInside),
        STRUCTURE_HEALTH => candidates.push(SensorRole::ConsoleHealth),
        STRUCTURE_AIR_QUALITY => candidates.push(SensorRole::AirQuality),
        STRUCTURE_AIR_QUALITY_HEALTH => candidates.push(SensorRole::AirQualityHealth),
        STRUCTURE_LEAF_SOIL => {
            let tx = payload.tx_id();
            if tx.is_some() && tx == identity.txid_leaf {
                candidates.push(SensorRole::Leaf);
            }
            if tx.is_some() && tx == identity.txid_soil {
                candidates.push(SensorRole::Soil);
            }
            if tx.is_some() && tx == identity.txid_leaf_soil {
                candidates.push(SensorRole::LeafSoil);
            }
        }
        STRUCTURE_TRANSMITTER => {
            let tx = payload.tx_id();
            if tx.is_some() && tx == identity.txid_iss {
                candidates.push(SensorRole::Iss);
            }
            if tx.is_some() && tx == identity.txid_iss2 {
                candidates.push(SensorRole::Iss2);
            }
            // Sensor type 55 is shared by wind-only and rain-only stations
            // and by the extra temp/hum channels; the role-specific field
            // must be reported before the match is accepted.
            if payload.sensor_type == SENSOR_TYPE_AUX {
                if tx.is_some()
                    && tx == identity.txid_wind
                    && sample_has(sample, "wind_speed_avg_last_10_min")
                {
                    candidates.push(SensorRole::Wind);
                }
                if tx.is_some() && tx == identity.txid_rain && sample_has(sample, "rainfall_last_15_min") {
                    candidates.push(SensorRole::Rain);
                }
                let temp_or_rssi = sample_has(sample, "temp") || sample_has(sample, "rssi_last");
                if tx.is_some() && tx == identity.txid_extra1 && temp_or_rssi {
                    candidates.push(SensorRole::Extra1);
                }
                if tx.is_some() && tx == identity.txid_extra2 && temp_or_rssi {
                    candidates.push(SensorRole::Extra2);
                }
                if tx.is_some() && tx == identity.txid_extra3 && sample_has(sample, "temp") {
                    candidates.push(SensorRole::Extra3);
                }
                if tx.is_some() && tx == identity.txid_extra4 && sample_has(sample, "temp") {
                    candidates.push(SensorRole::Extra4);
                }
            }
        }
        _ => {
            tracing::debug!(
                message = "unclassified data structure type",
                structure_type = payload.structure_type,
                sensor_type = payload.sensor_type,
            );
        }
    }

    candidates
}

/// Classify one poll's sensor list against the configured station identity.
///
/// Single pass; the first qualifying payload per role wins and later
/// duplicates are logged but never overwrite the match.
pub fn classify<'a>(
    sensors: &'a [SensorPayload],
    identity: &StationIdentity,
    tracker: &mut RoleTracker,
) -> Classification<'a> {
    let mut roles: HashMap<SensorRole, &'a SensorPayload> = HashMap::new();
    let mut newly_seen = Vec::new();

    for payload in sensors {
        for role in candidate_roles(payload, identity) {
            if roles.contains_key(&role) {
                tracing::debug!(
                    message = "role already filled this poll, keeping first match",
                    role = role.name(),
                    tx_id = ?payload.tx_id(),
                );
                continue;
            }

            roles.insert(role, payload);
            if tracker.observe(role) {
                tracing::info!(
                    message = "found current sensor data",
                    role = role.name(),
                    structure_type = payload.structure_type,
                    sensor_type = payload.sensor_type,
                    tx_id = ?payload.tx_id(),
                );
                newly_seen.push(role);
            } else {
                tracing::debug!(
                    message = "matched current sensor data",
                    role = role.name(),
                    tx_id = ?payload.tx_id(),
                );
            }
        }
    }

    Classification { roles, newly_seen }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(structure_type: i64, sensor_type: i64, sample: serde_json::Value) -> SensorPayload {
        serde_json::from_value(json!({
            "data_structure_type": structure_type,
            "sensor_type": sensor_type,
            "data": [sample],
        }))
        .unwrap()
    }

    fn identity() -> StationIdentity {
        StationIdentity {
            txid_iss: Some(1),
            ..StationIdentity::default()
        }
    }

    #[test]
    fn classifies_primary_transmitter_by_tx_id() {
        let sensors = vec![
            payload(23, 43, json!({"tx_id": 2, "temp": 55.0})),
            payload(23, 43, json!({"tx_id": 1, "temp": 61.2})),
        ];
        let mut tracker = RoleTracker::new();
        let classified = classify(&sensors, &identity(), &mut tracker);

        let iss = classified.get(SensorRole::Iss).unwrap();
        assert_eq!(Some(1), iss.tx_id());
        assert!(classified.get(SensorRole::Iss2).is_none());
    }

    #[test]
    fn wind_and_rain_disambiguated_by_reported_field() {
        // Both share structure type 23 / sensor type 55; array order must
        // not matter, only which role-specific field is non-null.
        let mut ident = identity();
        ident.txid_wind = Some(3);
        ident.txid_rain = Some(4);

        let sensors = vec![
            payload(
                23,
                55,
                json!({"tx_id": 4, "wind_speed_avg_last_10_min": null, "rainfall_last_15_min": 0.04}),
            ),
            payload(
                23,
                55,
                json!({"tx_id": 3, "wind_speed_avg_last_10_min": 4.2, "rainfall_last_15_min": null}),
            ),
        ];
        let mut tracker = RoleTracker::new();
        let classified = classify(&sensors, &ident, &mut tracker);

        assert_eq!(Some(3), classified.get(SensorRole::Wind).unwrap().tx_id());
        assert_eq!(Some(4), classified.get(SensorRole::Rain).unwrap().tx_id());
    }

    #[test]
    fn wind_role_rejects_payload_without_wind_field() {
        let mut ident = identity();
        ident.txid_wind = Some(3);

        let sensors = vec![payload(
            23,
            55,
            json!({"tx_id": 3, "wind_speed_avg_last_10_min": null, "rainfall_last_15_min": 0.01}),
        )];
        let mut tracker = RoleTracker::new();
        let classified = classify(&sensors, &ident, &mut tracker);
        assert!(classified.get(SensorRole::Wind).is_none());
    }

    #[test]
    fn first_match_wins_for_duplicate_roles() {
        let sensors = vec![
            payload(23, 43, json!({"tx_id": 1, "temp": 61.2})),
            payload(23, 43, json!({"tx_id": 1, "temp": 99.9})),
        ];
        let mut tracker = RoleTracker::new();
        let classified = classify(&sensors, &identity(), &mut tracker);

        let sample = classified.get(SensorRole::Iss).unwrap().first_sample().unwrap();
        assert_eq!(61.2, sample.get("temp").unwrap().as_f64().unwrap());
    }

    #[test]
    fn first_seen_notice_fires_exactly_once_per_role() {
        let sensors = vec![payload(23, 43, json!({"tx_id": 1, "temp": 61.2}))];
        let ident = identity();
        let mut tracker = RoleTracker::new();

        let first = classify(&sensors, &ident, &mut tracker);
        assert_eq!(&[SensorRole::Iss], first.newly_seen());

        for _ in 0..3 {
            let again = classify(&sensors, &ident, &mut tracker);
            assert!(again.newly_seen().is_empty());
            assert!(again.get(SensorRole::Iss).is_some());
        }
    }

    #[test]
    fn console_roles_need_no_tx_id() {
        let sensors = vec![
            payload(19, 242, json!({"bar_absolute": 29.1, "bar_sea_level": 29.9})),
            payload(21, 365, json!({"temp_in": 71.0, "hum_in": 40.0})),
            payload(27, 509, json!({"battery_voltage": 4100})),
        ];
        let mut tracker = RoleTracker::new();
        let classified = classify(&sensors, &StationIdentity::default(), &mut tracker);

        assert!(classified.get(SensorRole::ConsoleBarometer).is_some());
        assert!(classified.get(SensorRole::ConsoleInside).is_some());
        assert!(classified.get(SensorRole::ConsoleHealth).is_some());
    }

    #[test]
    fn unconfigured_roles_never_match() {
        let sensors = vec![payload(25, 56, json!({"tx_id": 5, "temp_1": 50.0}))];
        let mut tracker = RoleTracker::new();
        let classified = classify(&sensors, &StationIdentity::default(), &mut tracker);

        assert!(classified.get(SensorRole::Leaf).is_none());
        assert!(classified.get(SensorRole::Soil).is_none());
        assert!(classified.get(SensorRole::LeafSoil).is_none());
    }

    #[test]
    fn historic_structure_types_are_ignored() {
        let sensors = vec![payload(24, 43, json!({"tx_id": 1, "temp_avg": 60.0}))];
        let mut tracker = RoleTracker::new();
        let classified = classify(&sensors, &identity(), &mut tracker);
        assert!(classified.iter().next().is_none());
    }
}
