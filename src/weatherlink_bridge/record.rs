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
use serde::Serialize;
use std::error;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

/// Unit-system tag for records whose values are in US customary units,
/// as the API reports them.
pub const UNITS_US: u8 = 1;

/// One flat archive record: the decoded sensor fields for a single
/// archive interval plus its bookkeeping columns.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveRecord {
    #[serde(rename = "dateTime")]
    pub date_time: i64,
    /// Archive interval length in minutes.
    pub interval: u32,
    #[serde(rename = "usUnits")]
    pub us_units: u8,
    #[serde(flatten)]
    pub fields: FieldMap,
}

impl ArchiveRecord {
    pub fn new(date_time: i64, interval: u32, fields: FieldMap) -> Self {
        ArchiveRecord {
            date_time,
            interval,
            us_units: UNITS_US,
            fields,
        }
    }
}

#[derive(Debug)]
pub enum SinkError {
    Io(std::io::Error),
    Serialize(serde_json::Error),
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "unable to write archive record: {}", e),
            Self::Serialize(e) => write!(f, "unable to serialize archive record: {}", e),
        }
    }
}

impl error::Error for SinkError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Serialize(e) => Some(e),
        }
    }
}

/// Boundary to the archive store. The bridge only ever appends.
pub trait RecordSink {
    fn append(&mut self, record: &ArchiveRecord) -> Result<(), SinkError>;
}

/// Appends each record as one JSON object per line.
#[derive(Debug)]
pub struct JsonLinesSink {
    writer: BufWriter<File>,
}

impl JsonLinesSink {
    pub fn create(path: &Path) -> Result<Self, SinkError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(SinkError::Io)?;
        Ok(JsonLinesSink {
            writer: BufWriter::new(file),
        })
    }
}

impl RecordSink for JsonLinesSink {
    fn append(&mut self, record: &ArchiveRecord) -> Result<(), SinkError> {
        let line = serde_json::to_string(record).map_err(SinkError::Serialize)?;
        self.writer.write_all(line.as_bytes()).map_err(SinkError::Io)?;
        self.writer.write_all(b"\n").map_err(SinkError::Io)?;
        self.writer.flush().map_err(SinkError::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn record_serializes_flat() {
        let mut fields = FieldMap::new();
        fields.insert("outTemp".to_string(), json!(61.2));
        fields.insert("rain".to_string(), json!(0.03));

        let record = ArchiveRecord::new(1700000000, 5, fields);
        let value: Value = serde_json::to_value(&record).unwrap();

        assert_eq!(json!(1700000000), value["dateTime"]);
        assert_eq!(json!(5), value["interval"]);
        assert_eq!(json!(1), value["usUnits"]);
        // Decoded fields sit at the top level, not nested.
        assert_eq!(json!(61.2), value["outTemp"]);
        assert_eq!(json!(0.03), value["rain"]);
    }

    #[test]
    fn absent_fields_stay_absent() {
        let record = ArchiveRecord::new(1700000000, 5, FieldMap::new());
        let value: Value = serde_json::to_value(&record).unwrap();
        assert!(value.get("outTemp").is_none());
    }
}
