//! Autolink wire protocol.
//!
//! Little-endian. Two top-level frames: a fixed 10-byte header carrying the
//! IMEI (`0xFF` prefix) and a package (`0x5B` prefix) — a sequence byte
//! followed by sub-packets up to the `0x5D` terminator. The package itself
//! declares no length; it is self-delimited by parsing sub-packets.

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::bits::{bit_range_value, bit_value};
use crate::checksum::sum8;
use crate::error::{Error, Result};
use crate::frame::FrameBuf;
use crate::observer::{self, ObserverPacket};
use crate::protocols::SessionProtocol;

pub const PREFIX_HEADER: u8 = 0xFF;
pub const PREFIX_PACKAGE: u8 = 0x5B;
pub const PACKAGE_TERMINATOR: u8 = 0x5D;

pub const PACKET_TYPE_PING: u8 = 0;
pub const PACKET_TYPE_DATA: u8 = 1;
pub const PACKET_TYPE_TEXT: u8 = 3;
pub const PACKET_TYPE_PHOTO: u8 = 4;

/// Head frame: `FF <version> <imei u64>`.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    raw: Bytes,
    pub protocol_version: u8,
    pub device_imei: String,
}

impl Header {
    pub const WIRE_LEN: usize = 10;

    fn parse(buf: &mut FrameBuf<'_>) -> Result<Self> {
        let start = buf.offset();
        let frame = buf.take(Self::WIRE_LEN).map_err(|_| {
            Error::malformed("header frame shorter than 10 bytes", start)
        })?;
        let mut cursor = FrameBuf::with_base(frame, start);
        cursor.u8()?; // prefix, checked by the factory
        let protocol_version = cursor.u8()?;
        let device_imei = cursor.u64_le()?.to_string();
        Ok(Self {
            raw: Bytes::copy_from_slice(frame),
            protocol_version,
            device_imei,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let imei: u64 = self.device_imei.parse().unwrap_or(0);
        let mut out = Vec::with_capacity(Self::WIRE_LEN);
        out.push(PREFIX_HEADER);
        out.push(self.protocol_version);
        out.extend_from_slice(&imei.to_le_bytes());
        out
    }
}

/// One sub-packet inside a package: type, declared length (timestamp +
/// records), UNIX timestamp, TLV-5 records, one-byte sum checksum.
#[derive(Debug, Clone, PartialEq)]
pub struct SubPacket {
    raw: Bytes,
    pub packet_type: u8,
    pub timestamp: DateTime<Utc>,
    body: Bytes,
    pub checksum: u8,
    pub sensors: BTreeMap<String, Value>,
}

impl SubPacket {
    fn parse(buf: &mut FrameBuf<'_>) -> Result<Self> {
        let start = buf.offset();
        let packet_type = buf.u8()?;
        let length = buf.u16_le()? as usize;
        if length < 4 {
            return Err(Error::malformed("sub-packet length below 4", start + 1));
        }
        let ts_secs = buf.u32_le()?;
        let body = buf.take(length - 4)?;
        let checksum = buf.u8()?;

        let mut summed = Vec::with_capacity(4 + body.len());
        summed.extend_from_slice(&ts_secs.to_le_bytes());
        summed.extend_from_slice(body);
        let expected = sum8(&summed);
        if expected != checksum {
            return Err(Error::malformed(
                format!("sub-packet checksum {} != {}", checksum, expected),
                start,
            ));
        }

        let sensors = if packet_type == PACKET_TYPE_DATA {
            parse_records(&mut FrameBuf::with_base(body, start + 7))?
        } else {
            BTreeMap::new()
        };

        let mut raw = Vec::with_capacity(3 + length + 1);
        raw.push(packet_type);
        raw.extend_from_slice(&(length as u16).to_le_bytes());
        raw.extend_from_slice(&summed);
        raw.push(checksum);

        Ok(Self {
            raw: Bytes::from(raw),
            packet_type,
            timestamp: observer::time_from_epoch(ts_secs as i64),
            body: Bytes::copy_from_slice(body),
            checksum,
            sensors,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let ts = self.timestamp.timestamp() as u32;
        let length = (4 + self.body.len()) as u16;
        let mut out = Vec::with_capacity(4 + length as usize);
        out.push(self.packet_type);
        out.extend_from_slice(&length.to_le_bytes());
        out.extend_from_slice(&ts.to_le_bytes());
        out.extend_from_slice(&self.body);
        let mut summed = ts.to_le_bytes().to_vec();
        summed.extend_from_slice(&self.body);
        out.push(sum8(&summed));
        out
    }
}

/// TLV-5 record stream: one tag byte, four value bytes each.
fn parse_records(buf: &mut FrameBuf<'_>) -> Result<BTreeMap<String, Value>> {
    let mut sensors = BTreeMap::new();
    while !buf.is_empty() {
        let tag = buf.u8()?;
        let mut val = buf.slice(4)?;
        match tag {
            1 => {
                sensors.insert("ext_battery_voltage".into(), Value::from(val.u16_le()?));
                sensors.insert("int_battery_voltage".into(), Value::from(val.u16_le()?));
            }
            2 => {
                sensors.insert("ibutton".into(), Value::from(val.u32_le()?));
            }
            3 => {
                sensors.insert("latitude".into(), Value::from(val.f32_le()? as f64));
            }
            4 => {
                sensors.insert("longitude".into(), Value::from(val.f32_le()? as f64));
            }
            5 => {
                let azimuth = val.u8()? as u32 * 2;
                let altitude = val.u8()? as u32 * 10;
                let sat = val.u8()? as u32;
                let speed = val.u8()? as f64 * 1.852;
                let sat_gps = bit_range_value(sat, 0, 4);
                let sat_glonass = bit_range_value(sat, 4, 8);
                sensors.insert("sat_count".into(), Value::from(sat_gps + sat_glonass));
                sensors.insert("sat_count_gps".into(), Value::from(sat_gps));
                sensors.insert("sat_count_glonass".into(), Value::from(sat_glonass));
                sensors.insert("speed".into(), Value::from(speed));
                sensors.insert("altitude".into(), Value::from(altitude));
                sensors.insert("azimuth".into(), Value::from(azimuth));
            }
            9 => {
                let status = val.u32_le()?;
                for i in 0..8 {
                    sensors.insert(format!("din{}", i), Value::from(bit_value(status, i)));
                }
                for j in 0..5 {
                    sensors.insert(format!("ain{}", j), Value::from(bit_value(status, 8 + j)));
                }
                sensors.insert(
                    "gsm_modem_status".into(),
                    Value::from(bit_range_value(status, 12, 14)),
                );
                sensors.insert(
                    "gps_module_status".into(),
                    Value::from(bit_range_value(status, 14, 16)),
                );
                sensors.insert("moving".into(), Value::from(bit_value(status, 16)));
                sensors.insert("armed".into(), Value::from(bit_value(status, 20)));
                sensors.insert("acc".into(), Value::from(bit_value(status, 21)));
                sensors.insert(
                    "ext_battery_voltage".into(),
                    Value::from(bit_range_value(status, 24, 32) * 150),
                );
            }
            // tags 6..8 are reserved by the vendor (LAC/CID, GSM signal);
            // the value bytes are consumed and dropped
            _ => {}
        }
    }
    Ok(sensors)
}

/// Package frame: `5B <seq> <sub-packets…> 5D`.
#[derive(Debug, Clone, PartialEq)]
pub struct Package {
    raw: Bytes,
    pub sequence_num: u8,
    pub packets: Vec<SubPacket>,
}

impl Package {
    fn parse(buf: &mut FrameBuf<'_>) -> Result<Self> {
        let start = buf.offset();
        buf.u8()?; // prefix
        let sequence_num = buf.u8()?;
        let mut packets = Vec::new();
        let mut terminated = false;
        while !buf.is_empty() {
            if buf.peek_u8() == Some(PACKAGE_TERMINATOR) {
                buf.u8()?;
                terminated = true;
                break;
            }
            packets.push(SubPacket::parse(buf)?);
        }
        if packets.is_empty() {
            return Err(Error::malformed("package without sub-packets", start));
        }
        let mut raw = vec![PREFIX_PACKAGE, sequence_num];
        for packet in &packets {
            raw.extend_from_slice(&packet.raw);
        }
        if terminated {
            raw.push(PACKAGE_TERMINATOR);
        }
        Ok(Self { raw: Bytes::from(raw), sequence_num, packets })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![PREFIX_PACKAGE, self.sequence_num];
        for packet in &self.packets {
            out.extend_from_slice(&packet.to_bytes());
        }
        out.push(PACKAGE_TERMINATOR);
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Header(Header),
    Package(Package),
}

impl Frame {
    pub fn raw(&self) -> Bytes {
        match self {
            Frame::Header(h) => h.raw.clone(),
            Frame::Package(p) => p.raw.clone(),
        }
    }
}

/// Splits a receive burst into Autolink frames, dispatching on the first
/// byte of each.
pub fn frames_from_buffer(buf: &[u8]) -> Result<Vec<Frame>> {
    let mut cursor = FrameBuf::new(buf);
    let mut frames = Vec::new();
    while !cursor.is_empty() {
        match cursor.peek_u8().unwrap() {
            PREFIX_HEADER => frames.push(Frame::Header(Header::parse(&mut cursor)?)),
            PREFIX_PACKAGE => frames.push(Frame::Package(Package::parse(&mut cursor)?)),
            other => return Err(Error::UnknownPrefix(other)),
        }
    }
    Ok(frames)
}

#[derive(Debug, Default)]
pub struct Autolink;

impl SessionProtocol for Autolink {
    type Frame = Frame;

    fn alias(&self) -> &'static str {
        "autolink"
    }

    fn frames(&self, buf: &[u8]) -> Result<Vec<Frame>> {
        frames_from_buffer(buf)
    }

    fn raw(&self, frame: &Frame) -> Bytes {
        frame.raw()
    }

    fn uid_of(&self, frame: &Frame) -> Option<String> {
        match frame {
            Frame::Header(h) => Some(h.device_imei.clone()),
            Frame::Package(_) => None,
        }
    }

    /// No acknowledgement on the header; per sub-packet `02` + checksum as
    /// a little-endian word.
    fn ack_for(&self, frame: &Frame) -> Option<Vec<u8>> {
        match frame {
            Frame::Header(_) => None,
            Frame::Package(p) => {
                let mut ack = Vec::with_capacity(p.packets.len() * 3);
                for packet in &p.packets {
                    ack.push(0x02);
                    ack.extend_from_slice(&(packet.checksum as u16).to_le_bytes());
                }
                Some(ack)
            }
        }
    }

    fn translate(&self, frame: &Frame) -> Vec<ObserverPacket> {
        let Frame::Package(package) = frame else {
            return Vec::new();
        };
        package
            .packets
            .iter()
            .filter(|p| p.packet_type == PACKET_TYPE_DATA)
            .map(|p| {
                let mut packet = ObserverPacket::new();
                packet.time = Some(observer::format_time(p.timestamp));
                packet.apply_sensors(p.sensors.clone());
                // the device reports no dilution; keep the upstream filler
                packet.hdop = Some(1.0);
                packet
            })
            .collect()
    }
}

#[cfg(test)]
#[path = "tests/autolink.rs"]
mod vector_tests;
