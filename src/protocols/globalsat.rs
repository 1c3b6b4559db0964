//! Globalsat TR-151 text protocol.
//!
//! Line-oriented: every record is `$<uid>,<fields…>!` where the field order
//! is configured on the device as a "report format" string. Each format
//! character names one field; the matching regex is compiled from the
//! format at construction time, exactly like the firmware documentation
//! describes the format string.

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::observer::{self, ObserverPacket};
use crate::protocols::SessionProtocol;

pub const DEFAULT_REPORT_FORMAT: &str = "RAB27GHKLM";

pub const ACK: &[u8] = b"$OK!";

/// Field patterns per report-format character. Characters without an entry
/// match the unknown-field pattern.
fn field_pattern(c: char) -> Option<&'static str> {
    Some(match c {
        'A' => r"\d+",
        'B' => r"\d{6},\d{6}",
        '2' => r"[EW]\d+(\.\d+)?",
        '7' => r"[NS]\d+(\.\d+)?",
        'G' | 'H' | 'K' | 'M' => r"\d+(\.\d+)?",
        'L' | 'N' | 'R' => r"\d+",
        _ => return None,
    })
}

const UNKNOWN_FIELD: &str = r"[\w\.]+";

/// Compiles the record regex for a report format. Digit characters cannot
/// name a capture group, so they are prefixed with `d`.
fn compile_report(format: &str, anchored_dollar: bool) -> Regex {
    let mut fields = String::new();
    for c in format.chars() {
        let pattern = field_pattern(c).unwrap_or(UNKNOWN_FIELD);
        let name = if c.is_ascii_digit() {
            format!("d{c}")
        } else {
            c.to_string()
        };
        fields.push_str(&format!(",(?P<{name}>{pattern})"));
    }
    let line = if anchored_dollar {
        format!(r"(?i)\$(?P<S>\w+){fields}!")
    } else {
        format!(r"(?i)(?P<S>\w+){fields}!")
    };
    Regex::new(&line).expect("report format compiles to a valid regex")
}

/// One matched report line.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    raw: Bytes,
    pub fields: BTreeMap<String, String>,
}

pub struct Tr151 {
    report: Regex,
    sms: Regex,
}

impl Tr151 {
    pub fn new(report_format: &str) -> Self {
        Self {
            report: compile_report(report_format, true),
            sms: compile_report(report_format, false),
        }
    }

    fn records(regex: &Regex, buf: &[u8]) -> Result<Vec<Record>> {
        let data = String::from_utf8_lossy(buf);
        let mut records = Vec::new();
        for capture in regex.captures_iter(&data) {
            let whole = capture.get(0).unwrap();
            let mut fields = BTreeMap::new();
            for name in regex.capture_names().flatten() {
                if let Some(m) = capture.name(name) {
                    fields.insert(name.to_string(), m.as_str().to_string());
                }
            }
            records.push(Record {
                raw: Bytes::copy_from_slice(whole.as_str().as_bytes()),
                fields,
            });
        }
        if records.is_empty() && !buf.is_empty() {
            return Err(Error::malformed("no report matched the buffer", 0));
        }
        Ok(records)
    }

    /// Records arriving over the SMS transport (no `$` line prefix).
    pub fn records_from_sms(&self, buf: &[u8]) -> Result<Vec<Record>> {
        Self::records(&self.sms, buf)
    }
}

impl Default for Tr151 {
    fn default() -> Self {
        Self::new(DEFAULT_REPORT_FORMAT)
    }
}

/// `E05010.1943` → 50.169905; west/south are negative.
fn nmea_coordinate(value: &str, negative_hemisphere: char) -> Option<f64> {
    let (hemisphere, digits) = value.split_at(1);
    let raw: f64 = digits.parse().ok()?;
    let degrees = (raw / 100.0).trunc();
    let minutes = raw - degrees * 100.0;
    let mut coordinate = degrees + minutes / 60.0;
    if hemisphere
        .chars()
        .next()?
        .eq_ignore_ascii_case(&negative_hemisphere)
    {
        coordinate = -coordinate;
    }
    Some(coordinate)
}

pub fn nmea_longitude(value: &str) -> Option<f64> {
    nmea_coordinate(value, 'W')
}

pub fn nmea_latitude(value: &str) -> Option<f64> {
    nmea_coordinate(value, 'S')
}

fn parse_report_time(value: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(value, "%d%m%y,%H%M%S").unwrap_or_else(|_| {
        NaiveDate::from_ymd_opt(2000, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    })
}

impl SessionProtocol for Tr151 {
    type Frame = Record;

    fn alias(&self) -> &'static str {
        "globalsat.tr151"
    }

    fn frames(&self, buf: &[u8]) -> Result<Vec<Record>> {
        Self::records(&self.report, buf)
    }

    fn raw(&self, frame: &Record) -> Bytes {
        frame.raw.clone()
    }

    fn uid_of(&self, frame: &Record) -> Option<String> {
        frame.fields.get("S").cloned()
    }

    /// Every report line also carries telemetry; identification never
    /// swallows the frame.
    fn header_only(&self, _frame: &Record) -> bool {
        false
    }

    fn ack_for(&self, _frame: &Record) -> Option<Vec<u8>> {
        Some(ACK.to_vec())
    }

    fn translate(&self, frame: &Record) -> Vec<ObserverPacket> {
        let mut packet = ObserverPacket::new();
        let mut sensors: BTreeMap<String, Value> = BTreeMap::new();
        for (name, value) in &frame.fields {
            match name.as_str() {
                "S" => packet.uid = Some(value.clone()),
                "B" => {
                    let time = parse_report_time(value).and_utc();
                    packet.time = Some(observer::format_time(time));
                }
                "d1" | "d2" | "d3" => {
                    packet.longitude = nmea_longitude(value);
                }
                "d6" | "d7" | "d8" => {
                    packet.latitude = nmea_latitude(value);
                }
                "G" => {
                    packet.altitude = value.parse::<f64>().ok().map(|v| v.round() as i32);
                }
                "H" => {
                    packet.speed = value.parse::<f64>().ok().map(|v| v * 1.852);
                }
                "I" => {
                    packet.speed = value.parse::<f64>().ok();
                }
                "J" => {
                    packet.speed = value.parse::<f64>().ok().map(|v| v * 1.609344);
                }
                "K" => {
                    packet.azimuth = value.parse::<f64>().ok().map(|v| v.round() as i32);
                }
                "L" => {
                    if let Ok(count) = value.parse::<u32>() {
                        packet.satellitescount = Some(count);
                        sensors.insert("sat_count".into(), Value::from(count));
                    }
                }
                "M" => {
                    packet.hdop = value.parse().ok();
                }
                "A" => {
                    if value.parse::<u32>() == Ok(5) {
                        sensors.insert("sos".into(), Value::from(1));
                    }
                }
                _ => {}
            }
        }
        packet.sensors = sensors;
        packet.flag_invalid_coordinates();
        vec![packet]
    }
}
