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

use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::{Map, Value};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::error;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug)]
pub enum ClientError {
    Internal(reqwest::Error),
    InvalidBaseUrl(String),
    RateLimited,
    Unexpected(StatusCode, Url),
    Malformed(serde_json::Error),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal(e) => write!(f, "{}", e),
            Self::InvalidBaseUrl(u) => write!(f, "invalid base URL {}", u),
            Self::RateLimited => write!(f, "API rate limit exceeded"),
            Self::Unexpected(status, url) => write!(f, "unexpected status {} for {}", status, url),
            Self::Malformed(e) => write!(f, "malformed API response: {}", e),
        }
    }
}

impl error::Error for ClientError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Internal(e) => Some(e),
            Self::Malformed(e) => Some(e),
            _ => None,
        }
    }
}

/// Compute the WeatherLink v2 request signature.
///
/// The API expects `HMAC-SHA256(secret, k1 + v1 + k2 + v2 + ...)` as a hex
/// digest, where the key/value pairs are concatenated in ASCII key order.
pub fn api_signature(secret: &str, parameters: &BTreeMap<&str, String>) -> String {
    let mut payload = String::new();
    for (key, value) in parameters {
        payload.push_str(key);
        payload.push_str(value);
    }

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Client for the `/v2/current` and `/v2/historic` endpoints of the
/// WeatherLink cloud API. Every request is signed with the shared API secret.
#[derive(Debug)]
pub struct WeatherLinkClient {
    client: Client,
    base_url: Url,
    api_key: String,
    api_secret: String,
}

impl WeatherLinkClient {
    const RATE_LIMIT_MARKER: &'static str = "API rate limit exceeded";

    pub fn new(client: Client, base_url: &str, api_key: &str, api_secret: &str) -> Result<Self, ClientError> {
        let base_url = Url::parse(base_url).map_err(|_| ClientError::InvalidBaseUrl(base_url.into()))?;
        Ok(WeatherLinkClient {
            client,
            base_url,
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        })
    }

    /// Fetch the current-conditions document for a station.
    pub async fn current(&self, station_id: u64, now: i64) -> Result<ApiDocument, ClientError> {
        let url = self.current_url(station_id, now);
        tracing::debug!(message = "making current conditions request", url = %url);
        self.fetch(url).await
    }

    /// Fetch a historic document for a station covering `[start, end]`.
    pub async fn historic(
        &self,
        station_id: u64,
        start: i64,
        end: i64,
        now: i64,
    ) -> Result<ApiDocument, ClientError> {
        let url = self.historic_url(station_id, start, end, now);
        tracing::debug!(message = "making historic data request", url = %url);
        self.fetch(url).await
    }

    async fn fetch(&self, url: Url) -> Result<ApiDocument, ClientError> {
        let res = self.client.get(url.clone()).send().await.map_err(ClientError::Internal)?;

        let status = res.status();
        if status != StatusCode::OK {
            return Err(ClientError::Unexpected(status, url));
        }

        // The vendor occasionally embeds the rate-limit notice in an OK
        // body instead of returning 429.
        let body = res.text().await.map_err(ClientError::Internal)?;
        if body.contains(Self::RATE_LIMIT_MARKER) {
            return Err(ClientError::RateLimited);
        }

        serde_json::from_str(&body).map_err(ClientError::Malformed)
    }

    pub fn current_url(&self, station_id: u64, now: i64) -> Url {
        let mut parameters = BTreeMap::new();
        parameters.insert("api-key", self.api_key.clone());
        parameters.insert("station-id", station_id.to_string());
        parameters.insert("t", now.to_string());
        let signature = api_signature(&self.api_secret, &parameters);

        let mut url = self.endpoint_url("current", station_id);
        url.query_pairs_mut()
            .append_pair("api-key", &self.api_key)
            .append_pair("api-signature", &signature)
            .append_pair("t", &now.to_string());
        url
    }

    pub fn historic_url(&self, station_id: u64, start: i64, end: i64, now: i64) -> Url {
        let mut parameters = BTreeMap::new();
        parameters.insert("api-key", self.api_key.clone());
        parameters.insert("end-timestamp", end.to_string());
        parameters.insert("start-timestamp", start.to_string());
        parameters.insert("station-id", station_id.to_string());
        parameters.insert("t", now.to_string());
        let signature = api_signature(&self.api_secret, &parameters);

        let mut url = self.endpoint_url("historic", station_id);
        url.query_pairs_mut()
            .append_pair("api-key", &self.api_key)
            .append_pair("start-timestamp", &start.to_string())
            .append_pair("end-timestamp", &end.to_string())
            .append_pair("api-signature", &signature)
            .append_pair("t", &now.to_string());
        url
    }

    fn endpoint_url(&self, endpoint: &str, station_id: u64) -> Url {
        let mut url = self.base_url.clone();
        {
            url.path_segments_mut()
                .map(|mut p| {
                    p.clear().push("v2").push(endpoint).push(&station_id.to_string());
                })
                .expect("unable to modify API URL path segments");
        }
        url
    }
}

/// One sample reported by a sensor: a sparse mapping of vendor field name to
/// value. Absent keys and explicit nulls both mean "not reported".
pub type SensorSample = Map<String, Value>;

/// Top-level document returned by both the current and historic endpoints.
#[derive(Deserialize, Debug)]
pub struct ApiDocument {
    #[serde(alias = "station_id")]
    pub station_id: Option<u64>,
    #[serde(alias = "sensors", default)]
    pub sensors: Vec<SensorPayload>,
}

/// One element of the document's `sensors` array.
#[derive(Deserialize, Debug)]
pub struct SensorPayload {
    #[serde(alias = "data_structure_type")]
    pub structure_type: i64,
    #[serde(alias = "sensor_type")]
    pub sensor_type: i64,
    #[serde(alias = "data", default)]
    pub data: Vec<SensorSample>,
}

impl SensorPayload {
    /// Current-conditions documents carry exactly one sample per sensor.
    pub fn first_sample(&self) -> Option<&SensorSample> {
        self.data.first()
    }

    /// Transmitter id from the first sample, for transmitter-keyed
    /// structure types.
    pub fn tx_id(&self) -> Option<i64> {
        self.first_sample().and_then(|s| s.get("tx_id")).and_then(Value::as_i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Client;

    fn client() -> WeatherLinkClient {
        WeatherLinkClient::new(
            Client::new(),
            "https://api.weatherlink.com/",
            "test-key",
            "test-secret",
        )
        .unwrap()
    }

    #[test]
    fn signature_concatenates_in_ascii_key_order() {
        let mut parameters = BTreeMap::new();
        // Inserted out of order on purpose; BTreeMap iteration sorts them.
        parameters.insert("t", "1".to_string());
        parameters.insert("api-key", "k".to_string());
        parameters.insert("station-id", "42".to_string());

        let signature = api_signature("secret", &parameters);

        // HMAC-SHA256("secret", "api-keykstation-id42t1")
        let mut mac = HmacSha256::new_from_slice(b"secret").unwrap();
        mac.update(b"api-keykstation-id42t1");
        let expected = hex::encode(mac.finalize().into_bytes());
        assert_eq!(expected, signature);
    }

    #[test]
    fn signature_is_stable() {
        let mut parameters = BTreeMap::new();
        parameters.insert("api-key", "abc".to_string());
        parameters.insert("station-id", "123456".to_string());
        parameters.insert("t", "1700000000".to_string());

        // Same inputs, same digest; different secret, different digest.
        let first = api_signature("s1", &parameters);
        let second = api_signature("s1", &parameters);
        let other = api_signature("s2", &parameters);
        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(64, first.len());
    }

    #[test]
    fn current_url_shape() {
        let url = client().current_url(123456, 1700000000);
        assert_eq!("/v2/current/123456", url.path());

        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!("api-key", pairs[0].0);
        assert_eq!("test-key", pairs[0].1);
        assert_eq!("api-signature", pairs[1].0);
        assert_eq!("t", pairs[2].0);
        assert_eq!("1700000000", pairs[2].1);
    }

    #[test]
    fn historic_url_carries_time_window() {
        let url = client().historic_url(123456, 1699999700, 1700000000, 1700000000);
        assert_eq!("/v2/historic/123456", url.path());

        let query = url.query().unwrap();
        assert!(query.contains("start-timestamp=1699999700"));
        assert!(query.contains("end-timestamp=1700000000"));
        assert!(query.contains("api-signature="));
    }

    #[test]
    fn payload_tx_id_comes_from_first_sample() {
        let payload: SensorPayload = serde_json::from_value(serde_json::json!({
            "data_structure_type": 23,
            "sensor_type": 43,
            "data": [{"tx_id": 3, "temp": 61.2}]
        }))
        .unwrap();
        assert_eq!(Some(3), payload.tx_id());
    }

    #[test]
    fn payload_without_samples_has_no_tx_id() {
        let payload: SensorPayload = serde_json::from_value(serde_json::json!({
            "data_structure_type": 23,
            "sensor_type": 43,
            "data": []
        }))
        .unwrap();
        assert!(payload.first_sample().is_none());
        assert!(payload.tx_id().is_none());
    }
}
