//! The normalized outbound record consumed by the downstream pipe.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Timestamp format of observer records (UTC, microsecond precision).
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

pub fn format_time(time: DateTime<Utc>) -> String {
    time.format(TIME_FORMAT).to_string()
}

/// UTC timestamp from epoch seconds, clamped parse errors to the epoch.
pub fn time_from_epoch(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub mime: String,
    /// Base64-encoded image bytes.
    pub content: String,
}

/// One normalized record: device identity, fix time, geo fields and an
/// open-ended sensor mapping. Serialized to JSON for AMQP and the pipe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObserverPacket {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid2: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub azimuth: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hdop: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub satellitescount: Option<u32>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub sensors: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<ImageRecord>>,
}

impl ObserverPacket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches the sensor mapping, moving the well-known geo keys out of
    /// the map and into the top-level fields. Only `sat_count` stays
    /// duplicated inside the sensor sub-object; geo values live at the top
    /// level exclusively. Out-of-range WGS-84 coordinates are flagged.
    pub fn apply_sensors(&mut self, mut sensors: BTreeMap<String, Value>) {
        if let Some(v) = sensors.remove("latitude").as_ref().and_then(Value::as_f64) {
            self.latitude = Some(v);
        }
        if let Some(v) = sensors.remove("longitude").as_ref().and_then(Value::as_f64) {
            self.longitude = Some(v);
        }
        if let Some(v) = sensors.remove("speed").as_ref().and_then(Value::as_f64) {
            self.speed = Some(v);
        }
        if let Some(v) = sensors.remove("altitude").as_ref().and_then(Value::as_i64) {
            self.altitude = Some(v as i32);
        }
        if let Some(v) = sensors.remove("azimuth").as_ref().and_then(Value::as_i64) {
            self.azimuth = Some(v as i32);
        }
        if let Some(v) = sensors.get("sat_count").and_then(Value::as_u64) {
            self.satellitescount = Some(v as u32);
        }
        self.sensors = sensors;
        self.flag_invalid_coordinates();
    }

    /// Coordinates outside the WGS-84 valid ranges mark the record instead
    /// of silently passing bad fixes downstream.
    pub fn flag_invalid_coordinates(&mut self) {
        let lat_bad = self.latitude.map(|v| !(-90.0..=90.0).contains(&v));
        let lon_bad = self.longitude.map(|v| !(-180.0..=180.0).contains(&v));
        if lat_bad == Some(true) || lon_bad == Some(true) {
            self.sensors
                .insert("coord_invalid".into(), Value::from(1));
        }
    }

    /// Copies the identity fields retained from the connection's head frame.
    pub fn merge_head(&mut self, head: &ObserverPacket) {
        if head.uid.is_some() {
            self.uid = head.uid.clone();
        }
        if head.uid2.is_some() {
            self.uid2 = head.uid2.clone();
        }
    }

    /// True when the record carries something worth forwarding beyond the
    /// identity itself.
    pub fn has_payload(&self) -> bool {
        self.time.is_some()
            || self.latitude.is_some()
            || self.images.is_some()
            || !self.sensors.is_empty()
    }
}
