//! Naviset wire protocol and its outbound command set.
//!
//! Little-endian. Every frame opens with a 16-bit word whose low 14 bits are
//! the body length and whose high 2 bits select the packet kind (0 head,
//! 1 data, 2 command answer). A CRC-16/Modbus over the header word and body
//! trails each frame.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::bits::bit_value;
use crate::checksum::crc16_modbus;
use crate::error::{Error, Result};
use crate::frame::FrameBuf;
use crate::observer::{self, ObserverPacket};
use crate::protocols::{CommandIssue, SessionProtocol};

pub const KIND_HEAD: u8 = 0;
pub const KIND_DATA: u8 = 1;
pub const KIND_ANSWER: u8 = 2;

const IMEI_LEN: usize = 15;

fn header_word(kind: u8, body_len: usize) -> u16 {
    (body_len as u16 & 0x3FFF) | ((kind as u16) << 14)
}

fn seal(kind: u8, body: &[u8]) -> Vec<u8> {
    let word = header_word(kind, body.len());
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&word.to_le_bytes());
    out.extend_from_slice(body);
    let crc = crc16_modbus(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

/// Head frame body: device number, 15-char IMEI, protocol version.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketHead {
    raw: Bytes,
    pub device_number: u16,
    pub device_imei: String,
    pub protocol_version: u8,
    pub checksum: u16,
}

impl PacketHead {
    fn parse(raw: &[u8], body: &[u8], checksum: u16, offset: usize) -> Result<Self> {
        let mut cursor = FrameBuf::with_base(body, offset);
        let device_number = cursor.u16_le()?;
        let imei = cursor.take(IMEI_LEN)?;
        let device_imei = std::str::from_utf8(imei)
            .map_err(|_| Error::malformed("IMEI is not ASCII", offset + 2))?
            .to_string();
        let protocol_version = cursor.u8()?;
        Ok(Self {
            raw: Bytes::copy_from_slice(raw),
            device_number,
            device_imei,
            protocol_version,
            checksum,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(2 + IMEI_LEN + 1);
        body.extend_from_slice(&self.device_number.to_le_bytes());
        body.extend_from_slice(self.device_imei.as_bytes());
        body.push(self.protocol_version);
        seal(KIND_HEAD, &body)
    }
}

/// Byte widths of the optional per-item fields, indexed by the bit number
/// of the 16-bit data-structure word.
const ADDITIONAL_SIZES: [usize; 16] = [1, 4, 1, 2, 4, 4, 4, 4, 4, 4, 6, 4, 4, 2, 4, 8];

pub fn additional_data_length(data_structure: u16) -> usize {
    ADDITIONAL_SIZES
        .iter()
        .enumerate()
        .filter(|(bit, _)| bit_value(data_structure as u32, *bit as u32) == 1)
        .map(|(_, size)| *size)
        .sum()
}

/// Stored coordinates put the decimal point after the second digit:
/// `55731708` reads as `55.731708`.
fn convert_coordinate(coord: u32) -> f64 {
    let digits = coord.to_string();
    if digits.len() <= 2 {
        return coord as f64;
    }
    let (head, tail) = digits.split_at(2);
    format!("{head}.{tail}").parse().unwrap_or(0.0)
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataItem {
    pub number: u16,
    pub time: DateTime<Utc>,
    pub satellites: u8,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: f64,
    pub azimuth: i32,
    pub altitude: i32,
    pub hdop: f64,
    /// Optional trailing fields selected by the data-structure word, kept
    /// raw until a consumer asks for them.
    pub additional: Bytes,
}

impl DataItem {
    pub const BASE_LEN: usize = 22;

    fn parse(cursor: &mut FrameBuf<'_>, data_structure: u16) -> Result<Self> {
        let number = cursor.u16_le()?;
        let time = observer::time_from_epoch(cursor.u32_le()? as i64);
        let satellites = cursor.u8()?;
        let latitude = convert_coordinate(cursor.u32_le()?);
        let longitude = convert_coordinate(cursor.u32_le()?);
        let speed = cursor.u16_le()? as f64 / 10.0;
        let azimuth = (cursor.u16_le()? as f64 / 10.0).round() as i32;
        let altitude = cursor.u16_le()? as i32;
        let hdop = cursor.u8()? as f64 / 10.0;
        let additional = Bytes::copy_from_slice(
            cursor.take(additional_data_length(data_structure))?,
        );
        Ok(Self {
            number,
            time,
            satellites,
            latitude,
            longitude,
            speed,
            azimuth,
            altitude,
            hdop,
            additional,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PacketData {
    raw: Bytes,
    pub device_number: u16,
    pub data_structure: u16,
    pub items: Vec<DataItem>,
    pub checksum: u16,
}

impl PacketData {
    fn parse(raw: &[u8], body: &[u8], checksum: u16, offset: usize) -> Result<Self> {
        let mut cursor = FrameBuf::with_base(body, offset);
        let device_number = cursor.u16_le()?;
        let data_structure = cursor.u16_le()?;
        let mut items = Vec::new();
        while !cursor.is_empty() {
            items.push(DataItem::parse(&mut cursor, data_structure)?);
        }
        Ok(Self {
            raw: Bytes::copy_from_slice(raw),
            device_number,
            data_structure,
            items,
            checksum,
        })
    }
}

/// Reply envelope for an outbound command: the echoed command number plus
/// its protocol-specific payload.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketAnswer {
    raw: Bytes,
    pub command: u8,
    pub body: Bytes,
    pub checksum: u16,
}

impl PacketAnswer {
    fn parse(raw: &[u8], body: &[u8], checksum: u16, offset: usize) -> Result<Self> {
        let mut cursor = FrameBuf::with_base(body, offset);
        let command = cursor.u8()?;
        Ok(Self {
            raw: Bytes::copy_from_slice(raw),
            command,
            body: Bytes::copy_from_slice(cursor.rest()),
            checksum,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Head(PacketHead),
    Data(PacketData),
    Answer(PacketAnswer),
}

impl Frame {
    pub fn raw(&self) -> Bytes {
        match self {
            Frame::Head(p) => p.raw.clone(),
            Frame::Data(p) => p.raw.clone(),
            Frame::Answer(p) => p.raw.clone(),
        }
    }

    pub fn checksum(&self) -> u16 {
        match self {
            Frame::Head(p) => p.checksum,
            Frame::Data(p) => p.checksum,
            Frame::Answer(p) => p.checksum,
        }
    }
}

pub fn frames_from_buffer(buf: &[u8]) -> Result<Vec<Frame>> {
    let mut cursor = FrameBuf::new(buf);
    let mut frames = Vec::new();
    while !cursor.is_empty() {
        let start = cursor.offset();
        let word = cursor.u16_le()?;
        let length = (word & 0x3FFF) as usize;
        let kind = (word >> 14) as u8;
        let body = cursor.take(length)?;
        let checksum = cursor.u16_le()?;

        let mut checked = word.to_le_bytes().to_vec();
        checked.extend_from_slice(body);
        let expected = crc16_modbus(&checked);
        if expected != checksum {
            return Err(Error::malformed(
                format!("frame checksum {} != {}", checksum, expected),
                start,
            ));
        }

        let raw = &buf[start..cursor.offset()];
        let frame = match kind {
            KIND_HEAD => Frame::Head(PacketHead::parse(raw, body, checksum, start + 2)?),
            KIND_DATA => Frame::Data(PacketData::parse(raw, body, checksum, start + 2)?),
            KIND_ANSWER => Frame::Answer(PacketAnswer::parse(raw, body, checksum, start + 2)?),
            other => return Err(Error::UnknownPrefix(other)),
        };
        frames.push(frame);
    }
    Ok(frames)
}

// ---------------------------------------------------------------------------
// Outbound commands
// ---------------------------------------------------------------------------

pub const COMMAND_HEADER: u8 = 0x02;

fn build_command(number: u8, params: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + params.len() + 2);
    out.push(COMMAND_HEADER);
    out.push(number);
    out.extend_from_slice(params);
    let crc = crc16_modbus(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

/// Parameterless commands, one line each.
macro_rules! simple_command {
    ($($name:ident = $number:expr),* $(,)?) => {
        $(
            paste::paste! {
                #[derive(Debug, Clone, Copy, Default, PartialEq)]
                pub struct [<Command $name>];

                impl [<Command $name>] {
                    pub const NUMBER: u8 = $number;

                    pub fn to_bytes(&self) -> Vec<u8> {
                        build_command(Self::NUMBER, &[])
                    }
                }
            }
        )*
    };
}

simple_command! {
    GetStatus = 0,
    GetImei = 1,
    GetRegisteredIButtons = 5,
    GetPhones = 7,
    GetTrackParams = 10,
    RemoveTrackFromBuffer = 16,
    Restart = 18,
}

/// Points the device at a new ingestion endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSetGprsParams {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl CommandSetGprsParams {
    pub const NUMBER: u8 = 4;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut params = self.ip.octets().to_vec();
        params.extend_from_slice(&self.port.to_le_bytes());
        build_command(Self::NUMBER, &params)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ImageResolution {
    R80x64 = 0,
    R160x128 = 1,
    R320x240 = 2,
    R640x480 = 3,
}

/// Requests a camera snapshot at the given resolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommandGetImage {
    pub resolution: ImageResolution,
}

impl CommandGetImage {
    pub const NUMBER: u8 = 20;

    pub fn to_bytes(&self) -> Vec<u8> {
        build_command(Self::NUMBER, &[self.resolution as u8])
    }
}

// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Naviset;

impl SessionProtocol for Naviset {
    type Frame = Frame;

    fn alias(&self) -> &'static str {
        "naviset"
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
            _ => None,
        }
    }

    /// The device expects its own CRC echoed back.
    fn ack_for(&self, frame: &Frame) -> Option<Vec<u8>> {
        Some(frame.checksum().to_le_bytes().to_vec())
    }

    fn command_bytes(&self, issue: &CommandIssue<'_>) -> Result<Option<Vec<u8>>> {
        let bytes = match issue.action {
            "getStatus" => CommandGetStatus.to_bytes(),
            "getImei" => CommandGetImei.to_bytes(),
            "getRegisteredIButtons" => CommandGetRegisteredIButtons.to_bytes(),
            "getPhones" => CommandGetPhones.to_bytes(),
            "getTrackParams" => CommandGetTrackParams.to_bytes(),
            "removeTrackFromBuffer" => CommandRemoveTrackFromBuffer.to_bytes(),
            "restart" => CommandRestart.to_bytes(),
            "setGprsParams" => {
                let value = issue
                    .value
                    .ok_or_else(|| Error::InvalidParams("setGprsParams needs ip/port".into()))?;
                let ip = value
                    .get("ip")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| Error::InvalidParams("bad or missing ip".into()))?;
                let port = value
                    .get("port")
                    .and_then(Value::as_u64)
                    .filter(|p| *p <= u16::MAX as u64)
                    .ok_or_else(|| Error::InvalidParams("bad or missing port".into()))?;
                CommandSetGprsParams { ip, port: port as u16 }.to_bytes()
            }
            "getImage" => {
                let resolution = match issue
                    .value
                    .and_then(|v| v.get("resolution"))
                    .and_then(Value::as_u64)
                {
                    None | Some(2) => ImageResolution::R320x240,
                    Some(0) => ImageResolution::R80x64,
                    Some(1) => ImageResolution::R160x128,
                    Some(3) => ImageResolution::R640x480,
                    Some(other) => {
                        return Err(Error::InvalidParams(format!(
                            "unknown image resolution {other}"
                        )))
                    }
                };
                CommandGetImage { resolution }.to_bytes()
            }
            _ => return Ok(None),
        };
        Ok(Some(bytes))
    }

    fn command_reply(&self, frame: &Frame) -> Option<String> {
        let Frame::Answer(answer) = frame else {
            return None;
        };
        let body: String = answer.body.iter().map(|b| format!("{:02x}", b)).collect();
        Some(format!("{{\"command\":{},\"body\":\"{}\"}}", answer.command, body))
    }

    fn translate(&self, frame: &Frame) -> Vec<ObserverPacket> {
        let Frame::Data(data) = frame else {
            return Vec::new();
        };
        data.items
            .iter()
            .map(|item| {
                let mut packet = ObserverPacket::new();
                packet.time = Some(observer::format_time(item.time));
                packet.latitude = Some(item.latitude);
                packet.longitude = Some(item.longitude);
                packet.speed = Some(item.speed);
                packet.azimuth = Some(item.azimuth);
                packet.altitude = Some(item.altitude);
                packet.hdop = Some(item.hdop);
                packet.satellitescount = Some(item.satellites as u32);
                let mut sensors = BTreeMap::new();
                sensors.insert("sat_count".to_string(), Value::from(item.satellites));
                packet.sensors = sensors;
                packet.flag_invalid_coordinates();
                packet
            })
            .collect()
    }
}

#[cfg(test)]
#[path = "tests/naviset.rs"]
mod vector_tests;
