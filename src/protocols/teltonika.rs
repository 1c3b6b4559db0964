//! Teltonika FMXXXX wire protocol (codec 8).
//!
//! Big-endian. A connection opens with an identification frame (IMEI length
//! word + ASCII IMEI); every subsequent frame is an AVL data packet: four
//! zero preamble bytes, payload length, codec id, record count, records,
//! trailing record count and a CRC-32.

use std::collections::BTreeMap;
use std::io::Cursor;

use binrw::{BinRead, BinWrite};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::checksum::crc32;
use crate::error::{Error, Result};
use crate::frame::FrameBuf;
use crate::observer::{self, ObserverPacket};
use crate::protocols::{InitiationConfig, SessionProtocol, SmsMessage};

pub const CODEC_8: u8 = 0x08;

/// FM11XX GPRS / server / SMS configuration parameter identifiers.
pub const CFG_GPRS_CONTENT_ACTIVATION: u16 = 240;
pub const CFG_APN_NAME: u16 = 242;
pub const CFG_APN_USERNAME: u16 = 243;
pub const CFG_APN_PASSWORD: u16 = 244;
pub const CFG_TARGET_SERVER_IP_ADDRESS: u16 = 245;
pub const CFG_TARGET_SERVER_PORT: u16 = 246;
pub const CFG_SMS_LOGIN: u16 = 252;
pub const CFG_SMS_PASSWORD: u16 = 253;
pub const CFG_OPERATOR_LIST: u16 = 261;
pub const CFG_VEHICLE_ON_STOP_MIN_PERIOD: u16 = 270;
pub const CFG_VEHICLE_ON_STOP_MIN_SAVED_RECORDS: u16 = 271;
pub const CFG_VEHICLE_ON_STOP_SEND_PERIOD: u16 = 272;
pub const CFG_VEHICLE_MOVING_MIN_PERIOD: u16 = 273;
pub const CFG_VEHICLE_MOVING_MIN_SAVED_RECORDS: u16 = 274;
pub const CFG_VEHICLE_MOVING_SEND_PERIOD: u16 = 275;

/// WDP port devices listen on for configuration push SMS.
const PUSH_SMS_PORT: u16 = 0x07D1;

/// Fixed GPS element of one AVL record.
#[derive(Debug, Clone, PartialEq, BinRead, BinWrite)]
#[brw(big)]
pub struct GpsElement {
    pub longitude: i32,
    pub latitude: i32,
    pub altitude: u16,
    pub course: u16,
    pub satellites: u8,
    pub speed: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AvlData {
    pub timestamp: DateTime<Utc>,
    pub priority: u8,
    pub gps: GpsElement,
    pub event_io_id: u8,
    /// IO values keyed by element id, widths collapsed to u64.
    pub io: BTreeMap<u8, u64>,
}

impl AvlData {
    fn parse(cursor: &mut FrameBuf<'_>) -> Result<Self> {
        let start = cursor.offset();
        let millis = cursor.u64_be()?;
        let priority = cursor.u8()?;
        let gps_bytes = cursor.take(15)?;
        let gps = GpsElement::read(&mut Cursor::new(gps_bytes))
            .map_err(|e| Error::malformed(format!("gps element: {e}"), start + 9))?;
        let event_io_id = cursor.u8()?;
        let total_io = cursor.u8()?;
        let mut io = BTreeMap::new();
        for width in [1usize, 2, 4, 8] {
            let count = cursor.u8()? as usize;
            for _ in 0..count {
                let id = cursor.u8()?;
                let value = match width {
                    1 => cursor.u8()? as u64,
                    2 => cursor.u16_be()? as u64,
                    4 => cursor.u32_be()? as u64,
                    _ => cursor.u64_be()?,
                };
                io.insert(id, value);
            }
        }
        if io.len() != total_io as usize {
            return Err(Error::malformed(
                format!("IO count {} != declared {}", io.len(), total_io),
                start,
            ));
        }
        let secs = (millis / 1000) as i64;
        let nanos = ((millis % 1000) * 1_000_000) as u32;
        let timestamp = chrono::TimeZone::timestamp_opt(&Utc, secs, nanos)
            .single()
            .ok_or_else(|| Error::malformed("timestamp out of range", start))?;
        Ok(Self { timestamp, priority, gps, event_io_id, io })
    }
}

/// Identification frame opening each connection.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketHead {
    raw: Bytes,
    pub device_imei: String,
}

/// AVL data frame.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketData {
    raw: Bytes,
    pub codec_id: u8,
    pub records: Vec<AvlData>,
    pub checksum: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Head(PacketHead),
    Data(PacketData),
}

impl Frame {
    pub fn raw(&self) -> Bytes {
        match self {
            Frame::Head(p) => p.raw.clone(),
            Frame::Data(p) => p.raw.clone(),
        }
    }
}

pub fn frames_from_buffer(buf: &[u8]) -> Result<Vec<Frame>> {
    let mut cursor = FrameBuf::new(buf);
    let mut frames = Vec::new();
    while !cursor.is_empty() {
        let start = cursor.offset();
        if cursor.remaining() >= 4 && cursor.rest()[..4] == [0, 0, 0, 0] {
            frames.push(Frame::Data(parse_data(&mut cursor, buf, start)?));
        } else {
            frames.push(Frame::Head(parse_head(&mut cursor, buf, start)?));
        }
    }
    Ok(frames)
}

fn parse_head(cursor: &mut FrameBuf<'_>, buf: &[u8], start: usize) -> Result<PacketHead> {
    let len = cursor.u16_be()? as usize;
    if len == 0 {
        return Err(Error::malformed("empty IMEI frame", start));
    }
    let imei = cursor.take(len)?;
    let device_imei = std::str::from_utf8(imei)
        .map_err(|_| Error::malformed("IMEI is not ASCII", start + 2))?
        .to_string();
    Ok(PacketHead {
        raw: Bytes::copy_from_slice(&buf[start..cursor.offset()]),
        device_imei,
    })
}

fn parse_data(cursor: &mut FrameBuf<'_>, buf: &[u8], start: usize) -> Result<PacketData> {
    cursor.take(4)?; // zero preamble
    let length = cursor.u32_be()? as usize;
    let payload = cursor.take(length)?;
    let checksum = cursor.u32_be()?;
    let expected = crc32(payload);
    if expected != checksum {
        return Err(Error::malformed(
            format!("frame checksum {} != {}", checksum, expected),
            start,
        ));
    }

    let mut body = FrameBuf::with_base(payload, start + 8);
    let codec_id = body.u8()?;
    let count = body.u8()? as usize;
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        records.push(AvlData::parse(&mut body)?);
    }
    let trailing = body.u8()? as usize;
    if trailing != count {
        return Err(Error::malformed(
            format!("record counts disagree: {} != {}", count, trailing),
            start,
        ));
    }
    if !body.is_empty() {
        return Err(Error::malformed("trailing bytes after records", body.offset()));
    }
    Ok(PacketData {
        raw: Bytes::copy_from_slice(&buf[start..cursor.offset()]),
        codec_id,
        records,
        checksum,
    })
}

// ---------------------------------------------------------------------------
// Configuration push
// ---------------------------------------------------------------------------

fn pack_string(value: &str) -> Vec<u8> {
    let mut out = vec![value.len() as u8];
    out.extend_from_slice(value.as_bytes());
    out
}

/// Parameter list pushed to the device over the live connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Configuration {
    pub packet_id: u8,
    params: Vec<(u16, String)>,
}

impl Configuration {
    pub fn new(packet_id: u8) -> Self {
        Self { packet_id, params: Vec::new() }
    }

    pub fn add_param(&mut self, id: u16, value: impl ToString) -> &mut Self {
        self.params.push((id, value.to_string()));
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![self.packet_id];
        out.extend_from_slice(&(self.params.len() as u16).to_be_bytes());
        for (id, value) in &self.params {
            out.extend_from_slice(&id.to_be_bytes());
            out.extend_from_slice(&(value.len() as u16).to_be_bytes());
            out.extend_from_slice(value.as_bytes());
        }
        out
    }

    /// The device accepts a configuration by echoing the packet id followed
    /// by `0x01`.
    pub fn is_correct_answer(sent: &[u8], reply: &[u8]) -> bool {
        !sent.is_empty() && reply.len() >= 2 && reply[0] == sent[0] && reply[1] == 0x01
    }
}

/// Binary push-SMS waking the device up for reconfiguration: a WDP user
/// data header followed by credentials, endpoint and APN.
pub fn initiation_sms_buffer(config: &InitiationConfig) -> Vec<u8> {
    let mut out = vec![0x06, 0x05, 0x04];
    out.extend_from_slice(&PUSH_SMS_PORT.to_be_bytes());
    out.extend_from_slice(&[0x00, 0x00]);
    out.extend(pack_string(&config.device_login));
    out.extend(pack_string(&config.device_password));
    out.extend(pack_string(&config.host));
    out.extend_from_slice(&config.port.to_be_bytes());
    out.extend(pack_string(&config.gprs_apn));
    out.extend(pack_string(&config.gprs_username));
    out.extend(pack_string(&config.gprs_password));
    out
}

fn hex_encode(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn configuration_packet(config: &InitiationConfig) -> Configuration {
    let mut packet = Configuration::new(1);
    packet
        .add_param(CFG_TARGET_SERVER_IP_ADDRESS, &config.host)
        .add_param(CFG_TARGET_SERVER_PORT, config.port)
        .add_param(CFG_APN_NAME, &config.gprs_apn)
        .add_param(CFG_APN_USERNAME, &config.gprs_username)
        .add_param(CFG_APN_PASSWORD, &config.gprs_password)
        .add_param(CFG_SMS_LOGIN, &config.device_login)
        .add_param(CFG_SMS_PASSWORD, &config.device_password)
        .add_param(CFG_GPRS_CONTENT_ACTIVATION, 1u8)
        .add_param(CFG_OPERATOR_LIST, "25002")
        .add_param(CFG_VEHICLE_ON_STOP_MIN_PERIOD, 60u16)
        .add_param(CFG_VEHICLE_ON_STOP_MIN_SAVED_RECORDS, 1u8)
        .add_param(CFG_VEHICLE_ON_STOP_SEND_PERIOD, 180u16)
        .add_param(CFG_VEHICLE_MOVING_MIN_PERIOD, 20u16)
        .add_param(CFG_VEHICLE_MOVING_MIN_SAVED_RECORDS, 1u8)
        .add_param(CFG_VEHICLE_MOVING_SEND_PERIOD, 60u16);
    packet
}

// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Teltonika;

impl SessionProtocol for Teltonika {
    type Frame = Frame;

    fn alias(&self) -> &'static str {
        "teltonika"
    }

    fn frames(&self, buf: &[u8]) -> Result<Vec<Frame>> {
        frames_from_buffer(buf)
    }

    fn raw(&self, frame: &Frame) -> Bytes {
        frame.raw()
    }

    fn uid_of(&self, frame: &Frame) -> Option<String> {
        match frame {
            Frame::Head(head) => Some(head.device_imei.clone()),
            Frame::Data(_) => None,
        }
    }

    fn ack_for(&self, frame: &Frame) -> Option<Vec<u8>> {
        match frame {
            Frame::Head(_) => Some(vec![0x01]),
            Frame::Data(data) => Some((data.records.len() as u32).to_be_bytes().to_vec()),
        }
    }

    fn translate(&self, frame: &Frame) -> Vec<ObserverPacket> {
        let Frame::Data(data) = frame else {
            return Vec::new();
        };
        data.records
            .iter()
            .map(|record| {
                let mut packet = ObserverPacket::new();
                packet.time = Some(observer::format_time(record.timestamp));
                packet.latitude = Some(record.gps.latitude as f64 / 1e7);
                packet.longitude = Some(record.gps.longitude as f64 / 1e7);
                packet.altitude = Some(record.gps.altitude as i32);
                packet.azimuth = Some((record.gps.course as f64 / 10.0).round() as i32);
                packet.speed = Some(record.gps.speed as f64);
                packet.satellitescount = Some(record.gps.satellites as u32);
                // no dilution on the wire
                packet.hdop = Some(1.0);
                let mut sensors = BTreeMap::new();
                sensors.insert("sat_count".to_string(), Value::from(record.gps.satellites));
                if record.event_io_id != 0 {
                    sensors.insert("event_io_id".to_string(), Value::from(record.event_io_id));
                }
                for (id, value) in &record.io {
                    sensors.insert(format!("io{}", id), Value::from(*value));
                }
                packet.sensors = sensors;
                packet.flag_invalid_coordinates();
                packet
            })
            .collect()
    }

    fn config_answer_ok(&self, sent: &[u8], reply: &[u8]) -> bool {
        Configuration::is_correct_answer(sent, reply)
    }

    fn initiation_messages(&self, config: &InitiationConfig) -> Option<Vec<SmsMessage>> {
        Some(vec![SmsMessage {
            message: hex_encode(&initiation_sms_buffer(config)),
            bin: true,
            push: true,
        }])
    }

    fn configuration_blob(&self, config: &InitiationConfig) -> Option<Bytes> {
        Some(Bytes::from(configuration_packet(config).to_bytes()))
    }
}

#[cfg(test)]
#[path = "tests/teltonika.rs"]
mod vector_tests;
