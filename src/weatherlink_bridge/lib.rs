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

//! Polling bridge between the WeatherLink v2 cloud API and a time-series archive
//!
//! ## Features
//!
//! `weatherlink_bridge` polls the current conditions of a Davis station through
//! the [WeatherLink v2 API] and appends one flat record per archive interval to
//! a local store. Each poll is signed with the account's API secret, the
//! heterogeneous `sensors` array is classified into logical roles (primary and
//! secondary ISS/VUE, wind-only and rain-only stations, extra temperature
//! channels, leaf/soil stations, console sensors, AirLink), and each role's
//! vendor fields are copied into the archive's field names without unit
//! conversion.
//!
//! On top of the raw copies the bridge derives:
//!
//! * per-poll rain and evapotranspiration amounts from the API's
//!   since-midnight counters, with midnight-reset detection
//! * Celsius heating/cooling degree-day values from the daily Fahrenheit ones
//! * a clear-sky sunshine threshold from a solar-elevation model, and
//!   per-interval sunshine/rain/hail durations integrated from the polls
//!
//! [WeatherLink v2 API]: https://weatherlink.github.io/v2-api/
//!
//! ## Usage
//!
//! API key, secret, and the numeric station id come from the WeatherLink
//! account page. The station id for an account can also be listed through the
//! API itself:
//!
//! ```text
//! ./weatherlink_bridge --api-key KEY --api-secret SECRET --station-id 123456 \
//!     --latitude 48.1 --longitude 11.5 --output archive.jsonl
//! ```
//!
//! Transmitter-keyed sensors are only decoded for transmitter ids named on the
//! command line (`--txid-iss` defaults to 1; the rest are off until
//! configured), for example `--txid-wind 3 --txid-rain 4` for dedicated wind
//! and rain stations.
//!
//! The API allows at most one current-conditions request per station per
//! minute; `--polling-secs` is floored to 60 accordingly.

pub mod classify;
pub mod client;
pub mod decode;
pub mod derive;
pub mod record;
pub mod sunshine;
