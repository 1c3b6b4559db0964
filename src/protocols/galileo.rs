//! Galileo wire protocol.
//!
//! Variable-length TLV frames: header byte (`0x01` telemetry, `0x04` image
//! stream), a 16-bit length word (bit 15 flags archived data), the tag
//! stream and a CRC-16/XMODEM trailer. One transport frame may carry several
//! device-time samples; a tag number lower than its predecessor closes the
//! current sample and opens the next.

use std::collections::BTreeMap;

use bitflags::bitflags;
use bytes::Bytes;
use serde_json::Value;

use crate::bits::{bit_range_value, bit_value};
use crate::checksum::crc16_xmodem;
use crate::error::{Error, Result};
use crate::frame::FrameBuf;
use crate::observer::{self, ObserverPacket};
use crate::protocols::{CommandIssue, InitiationConfig, SessionProtocol, SmsMessage};

pub const HEADER_DATA: u8 = 0x01;
pub const HEADER_IMAGE: u8 = 0x04;

pub const TAG_IMEI: u8 = 0x03;
pub const TAG_CODE: u8 = 0x04;
pub const TAG_TIMESTAMP: u8 = 0x20;
pub const TAG_COORDS: u8 = 0x30;
pub const TAG_SPEED_AZIMUTH: u8 = 0x33;
pub const TAG_ALTITUDE: u8 = 0x34;
pub const TAG_HDOP: u8 = 0x35;
pub const TAG_STATUS: u8 = 0x40;
pub const TAG_COMMAND_SEQ: u8 = 0xE0;
pub const TAG_COMMAND_TEXT: u8 = 0xE1;

bitflags! {
    /// Device status word (tag 0x40).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusWord: u16 {
        const VIBRATION         = 1 << 0;
        const INCLINE_ALARM     = 1 << 1;
        const ARMED             = 1 << 4;
        const SOS               = 1 << 5;
        const GPS_ANTENNA_FAULT = 1 << 7;
        const LOW_EXT_VOLTAGE   = 1 << 9;
        const LOW_INT_VOLTAGE   = 1 << 10;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    pub number: u8,
    pub value: TagValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Imei(String),
    Code(u16),
    Timestamp(chrono::DateTime<chrono::Utc>),
    Coords {
        satellites: u8,
        correctness: u8,
        latitude: f64,
        longitude: f64,
    },
    SpeedAzimuth {
        speed: f64,
        azimuth: i32,
    },
    Altitude(i32),
    Hdop(f64),
    Status(StatusWord),
    Accel {
        x: u32,
        y: u32,
        z: u32,
    },
    /// Sixteen discrete output channels (tag 0x45).
    DigitalOutputs(u16),
    /// Sixteen discrete input channels (tag 0x46).
    DigitalInputs(u16),
    /// CAN bus engine group (tag 0xC1): fuel level percent, coolant
    /// temperature, engine speed.
    FuelEngine {
        fuel_level: u8,
        coolant_temperature: i8,
        engine_rpm: u16,
    },
    /// iButton connection state (tag 0xD5), one bit per reader slot.
    IButtonState {
        ibutton_1_connected: bool,
        ibutton_2_connected: bool,
    },
    Text(String),
    UInt(u32),
    Int(i32),
}

/// Value width in bytes for every known tag. Unknown tags make the rest of
/// the frame unparseable, so they are a hard error.
fn tag_length(number: u8) -> Option<usize> {
    Some(match number {
        0x01 | 0x02 => 1,                   // hardware / firmware version
        TAG_IMEI => 15,
        TAG_CODE => 2,
        0x10 => 2,                          // archive record number
        TAG_TIMESTAMP => 4,
        TAG_COORDS => 9,
        TAG_SPEED_AZIMUTH => 4,
        TAG_ALTITUDE => 2,
        TAG_HDOP => 1,
        TAG_STATUS => 2,
        0x41 | 0x42 => 2,                   // supply / battery voltage
        0x43 => 1,                          // terminal temperature
        0x44 => 4,                          // acceleration vector
        0x45 | 0x46 => 2,                   // digital outputs / inputs
        0x50..=0x53 => 2,                   // analog inputs
        0x58 | 0x59 => 2,                   // RS-232 channels
        0x70..=0x77 => 2,                   // external thermometers
        0x90 => 4,                          // iButton 1
        0xC0..=0xC3 => 4,                   // FMS fuel, fuel level, mileage, CAN_B1
        0xC4..=0xD2 => 1,                   // CAN 8-bit registers
        0xD3 => 4,                          // iButton 2
        0xD4 => 4,                          // total mileage
        0xD5 => 1,                          // iButton state
        0xD6..=0xDA => 2,                   // CAN 16-bit registers
        0xDB..=0xDF => 4,                   // CAN 32-bit registers
        TAG_COMMAND_SEQ => 4,
        _ => return None,
    })
}

fn parse_tag(cursor: &mut FrameBuf<'_>) -> Result<Tag> {
    let start = cursor.offset();
    let number = cursor.u8()?;
    if number == TAG_COMMAND_TEXT {
        let len = cursor.u8()? as usize;
        let text = std::str::from_utf8(cursor.take(len)?)
            .map_err(|_| Error::malformed("command text is not UTF-8", start))?
            .to_string();
        return Ok(Tag { number, value: TagValue::Text(text) });
    }
    let len = tag_length(number)
        .ok_or_else(|| Error::malformed(format!("unknown tag 0x{number:02X}"), start))?;
    let mut val = cursor.slice(len)?;
    let value = match number {
        TAG_IMEI => {
            let imei = std::str::from_utf8(val.take(15)?)
                .map_err(|_| Error::malformed("IMEI is not ASCII", start))?;
            TagValue::Imei(imei.to_string())
        }
        TAG_CODE => TagValue::Code(val.u16_le()?),
        TAG_TIMESTAMP => TagValue::Timestamp(observer::time_from_epoch(val.u32_le()? as i64)),
        TAG_COORDS => {
            let packed = val.u8()?;
            TagValue::Coords {
                satellites: packed & 0x0F,
                correctness: packed >> 4,
                latitude: val.i32_le()? as f64 / 1_000_000.0,
                longitude: val.i32_le()? as f64 / 1_000_000.0,
            }
        }
        TAG_SPEED_AZIMUTH => TagValue::SpeedAzimuth {
            speed: val.u16_le()? as f64 / 10.0,
            azimuth: (val.u16_le()? as f64 / 10.0).round() as i32,
        },
        TAG_ALTITUDE => TagValue::Altitude(val.i16_le()? as i32),
        TAG_HDOP => TagValue::Hdop(val.u8()? as f64 / 10.0),
        TAG_STATUS => TagValue::Status(StatusWord::from_bits_truncate(val.u16_le()?)),
        0x43 => TagValue::Int(val.u8()? as i8 as i32),
        0x44 => {
            let packed = val.u32_le()?;
            TagValue::Accel {
                x: bit_range_value(packed, 0, 10),
                y: bit_range_value(packed, 10, 20),
                z: bit_range_value(packed, 20, 30),
            }
        }
        0x45 => TagValue::DigitalOutputs(val.u16_le()?),
        0x46 => TagValue::DigitalInputs(val.u16_le()?),
        0xC1 => TagValue::FuelEngine {
            fuel_level: val.u8()?,
            coolant_temperature: val.u8()? as i8,
            engine_rpm: val.u16_le()?,
        },
        0xD5 => {
            let state = val.u8()?;
            TagValue::IButtonState {
                ibutton_1_connected: state & 0x01 != 0,
                ibutton_2_connected: state & 0x02 != 0,
            }
        }
        0x70..=0x77 => {
            val.u8()?; // thermometer identifier
            TagValue::Int(val.u8()? as i8 as i32)
        }
        _ => match len {
            1 => TagValue::UInt(val.u8()? as u32),
            2 => TagValue::UInt(val.u16_le()? as u32),
            4 => TagValue::UInt(val.u32_le()?),
            _ => unreachable!("tag sizes are 1, 2, 4, 9 or 15"),
        },
    };
    Ok(Tag { number, value })
}

#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    raw: Bytes,
    pub header: u8,
    /// Set when the frame replays archived (non-live) records.
    pub archive: bool,
    pub tags: Vec<Tag>,
    /// Image frames carry an opaque body instead of tags.
    pub body: Bytes,
    pub checksum: u16,
}

impl Packet {
    pub fn has_tag(&self, number: u8) -> bool {
        self.tags.iter().any(|t| t.number == number)
    }

    pub fn tag(&self, number: u8) -> Option<&TagValue> {
        self.tags.iter().find(|t| t.number == number).map(|t| &t.value)
    }
}

pub fn frames_from_buffer(buf: &[u8]) -> Result<Vec<Packet>> {
    let mut cursor = FrameBuf::new(buf);
    let mut frames = Vec::new();
    while !cursor.is_empty() {
        let start = cursor.offset();
        let header = cursor.u8()?;
        if header != HEADER_DATA && header != HEADER_IMAGE {
            return Err(Error::UnknownPrefix(header));
        }
        let word = cursor.u16_le()?;
        let length = (word & 0x7FFF) as usize;
        let archive = word & 0x8000 != 0;
        let body = cursor.take(length)?;
        let checksum = cursor.u16_le()?;

        let expected = crc16_xmodem(&buf[start..start + 3 + length]);
        if expected != checksum {
            return Err(Error::malformed(
                format!("frame checksum {} != {}", checksum, expected),
                start,
            ));
        }

        let tags = if header == HEADER_DATA {
            let mut tag_cursor = FrameBuf::with_base(body, start + 3);
            let mut tags = Vec::new();
            while !tag_cursor.is_empty() {
                tags.push(parse_tag(&mut tag_cursor)?);
            }
            tags
        } else {
            Vec::new()
        };

        frames.push(Packet {
            raw: Bytes::copy_from_slice(&buf[start..cursor.offset()]),
            header,
            archive,
            tags,
            body: Bytes::copy_from_slice(body),
            checksum,
        });
    }
    Ok(frames)
}

/// Serializes a telemetry frame from raw tag bytes (used by the command
/// builder and tests).
pub fn seal_frame(header: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + body.len() + 2);
    out.push(header);
    out.extend_from_slice(&(body.len() as u16).to_le_bytes());
    out.extend_from_slice(body);
    let crc = crc16_xmodem(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

/// Text command addressed to a device, framed as a telemetry packet with
/// the identity tags followed by the command sequence number and text.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandPacket {
    pub imei: String,
    pub code: u16,
    pub sequence: u32,
    pub text: String,
}

impl CommandPacket {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.push(TAG_IMEI);
        let mut imei = self.imei.clone().into_bytes();
        imei.resize(15, b'0');
        body.extend_from_slice(&imei);
        body.push(TAG_CODE);
        body.extend_from_slice(&self.code.to_le_bytes());
        body.push(TAG_COMMAND_SEQ);
        body.extend_from_slice(&self.sequence.to_le_bytes());
        body.push(TAG_COMMAND_TEXT);
        body.push(self.text.len() as u8);
        body.extend_from_slice(self.text.as_bytes());
        seal_frame(HEADER_DATA, &body)
    }
}

fn push_status_sensors(sensors: &mut BTreeMap<String, Value>, status: StatusWord) {
    sensors.insert("status".into(), Value::from(status.bits()));
    sensors.insert("armed".into(), Value::from(status.contains(StatusWord::ARMED) as u8));
    sensors.insert("sos".into(), Value::from(status.contains(StatusWord::SOS) as u8));
    sensors.insert(
        "vibration".into(),
        Value::from(status.contains(StatusWord::VIBRATION) as u8),
    );
    sensors.insert(
        "gps_antenna_fault".into(),
        Value::from(status.contains(StatusWord::GPS_ANTENNA_FAULT) as u8),
    );
}

fn finish_sample(packet: &mut ObserverPacket, sensors: &mut BTreeMap<String, Value>) {
    packet.apply_sensors(std::mem::take(sensors));
}

#[derive(Debug, Default)]
pub struct Galileo;

impl SessionProtocol for Galileo {
    type Frame = Packet;

    fn alias(&self) -> &'static str {
        "galileo"
    }

    fn frames(&self, buf: &[u8]) -> Result<Vec<Packet>> {
        frames_from_buffer(buf)
    }

    fn raw(&self, frame: &Packet) -> Bytes {
        frame.raw.clone()
    }

    fn uid_of(&self, frame: &Packet) -> Option<String> {
        frame.tag(TAG_IMEI).and_then(|value| match value {
            TagValue::Imei(imei) => Some(imei.clone()),
            _ => None,
        })
    }

    /// The identifying frame also carries telemetry samples.
    fn header_only(&self, _frame: &Packet) -> bool {
        false
    }

    fn ack_for(&self, frame: &Packet) -> Option<Vec<u8>> {
        let mut ack = vec![0x02];
        ack.extend_from_slice(&frame.checksum.to_le_bytes());
        Some(ack)
    }

    fn image_chunk(&self, frame: &Packet) -> Option<(u8, Bytes)> {
        if frame.header != HEADER_IMAGE || frame.body.is_empty() {
            return None;
        }
        Some((frame.body[0], frame.body.slice(1..)))
    }

    fn translate(&self, frame: &Packet) -> Vec<ObserverPacket> {
        if frame.header != HEADER_DATA || frame.tags.is_empty() {
            return Vec::new();
        }
        let mut packets = Vec::new();
        let mut packet = ObserverPacket::new();
        let mut sensors: BTreeMap<String, Value> = BTreeMap::new();
        let mut prev_number = 0u8;
        for tag in &frame.tags {
            if tag.number < prev_number {
                finish_sample(&mut packet, &mut sensors);
                packets.push(std::mem::take(&mut packet));
            }
            prev_number = tag.number;
            match (&tag.value, tag.number) {
                (TagValue::Imei(imei), _) => packet.uid = Some(imei.clone()),
                (TagValue::Code(code), _) => packet.uid2 = Some(code.to_string()),
                (TagValue::Timestamp(time), _) => {
                    packet.time = Some(observer::format_time(*time))
                }
                (TagValue::Coords { satellites, correctness, latitude, longitude }, _) => {
                    sensors.insert("latitude".into(), Value::from(*latitude));
                    sensors.insert("longitude".into(), Value::from(*longitude));
                    sensors.insert("sat_count".into(), Value::from(*satellites));
                    if *correctness != 0 {
                        sensors.insert("coord_invalid".into(), Value::from(1));
                    }
                }
                (TagValue::SpeedAzimuth { speed, azimuth }, _) => {
                    sensors.insert("speed".into(), Value::from(*speed));
                    sensors.insert("azimuth".into(), Value::from(*azimuth));
                }
                (TagValue::Altitude(altitude), _) => {
                    sensors.insert("altitude".into(), Value::from(*altitude));
                }
                (TagValue::Hdop(hdop), _) => {
                    packet.hdop = Some(*hdop);
                }
                (TagValue::Status(status), _) => push_status_sensors(&mut sensors, *status),
                (TagValue::Accel { x, y, z }, _) => {
                    sensors.insert("acceleration_x".into(), Value::from(*x));
                    sensors.insert("acceleration_y".into(), Value::from(*y));
                    sensors.insert("acceleration_z".into(), Value::from(*z));
                }
                (TagValue::DigitalOutputs(bits), _) => {
                    for channel in 0..16 {
                        sensors.insert(
                            format!("dout{}", channel),
                            Value::from(bit_value(*bits as u32, channel)),
                        );
                    }
                }
                (TagValue::DigitalInputs(bits), _) => {
                    for channel in 0..16 {
                        sensors.insert(
                            format!("din{}", channel),
                            Value::from(bit_value(*bits as u32, channel)),
                        );
                    }
                }
                (TagValue::FuelEngine { fuel_level, coolant_temperature, engine_rpm }, _) => {
                    sensors.insert("fms_fuel_level".into(), Value::from(*fuel_level));
                    sensors.insert(
                        "fms_coolant_temperature".into(),
                        Value::from(*coolant_temperature),
                    );
                    sensors.insert("fms_engine_rpm".into(), Value::from(*engine_rpm));
                }
                (TagValue::IButtonState { ibutton_1_connected, ibutton_2_connected }, _) => {
                    sensors.insert(
                        "ibutton_1_connected".into(),
                        Value::from(*ibutton_1_connected as u8),
                    );
                    sensors.insert(
                        "ibutton_2_connected".into(),
                        Value::from(*ibutton_2_connected as u8),
                    );
                }
                (TagValue::UInt(v), number) => {
                    let key = sensor_key(number);
                    sensors.insert(key, Value::from(*v));
                }
                (TagValue::Int(v), 0x43) => {
                    sensors.insert("int_temperature".into(), Value::from(*v));
                }
                (TagValue::Int(v), number @ 0x70..=0x77) => {
                    sensors.insert(
                        format!("ext_temperature_{}", number - 0x70),
                        Value::from(*v),
                    );
                }
                (TagValue::Int(v), number) => {
                    sensors.insert(format!("tag{}", number), Value::from(*v));
                }
                (TagValue::Text(text), _) => {
                    sensors.insert("device_answer".into(), Value::from(text.clone()));
                }
            }
        }
        finish_sample(&mut packet, &mut sensors);
        packets.push(packet);
        packets
    }

    /// Free-text device commands ride a telemetry frame addressed with the
    /// retained identity tags.
    fn command_bytes(&self, issue: &CommandIssue<'_>) -> Result<Option<Vec<u8>>> {
        if issue.action != "execute" {
            return Ok(None);
        }
        let text = issue
            .value
            .and_then(|v| v.get("command"))
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| Error::InvalidParams("execute needs a command string".into()))?;
        let imei = issue
            .head
            .uid
            .clone()
            .ok_or(Error::UnidentifiedSession)?;
        let code = issue
            .head
            .uid2
            .as_deref()
            .and_then(|c| c.parse().ok())
            .unwrap_or(0);
        let packet = CommandPacket {
            imei,
            code,
            sequence: issue.sequence,
            text: text.to_string(),
        };
        Ok(Some(packet.to_bytes()))
    }

    /// Initiation goes out of band over SMS.
    fn initiation_messages(&self, config: &InitiationConfig) -> Option<Vec<SmsMessage>> {
        Some(vec![
            SmsMessage::text("AddPhone 1234"),
            SmsMessage::text(format!("ServerIp {},{}", config.host, config.port)),
            SmsMessage::text(format!(
                "APN {},{},{}",
                config.gprs_apn, config.gprs_username, config.gprs_password
            )),
        ])
    }
}

/// Sensor name for plain numeric tags. Compound tags (0x45/0x46, 0xC1,
/// 0xD5) never reach this: they carry dedicated `TagValue` variants.
fn sensor_key(number: u8) -> String {
    match number {
        0x41 => "ext_battery_voltage".into(),
        0x42 => "int_battery_voltage".into(),
        0x50..=0x53 => format!("ain{}", number - 0x50),
        0x58 | 0x59 => format!("rs232_{}", number - 0x58),
        0x90 => "ibutton_1".into(),
        0xC0 => "fms_total_fuel_consumption".into(),
        0xC2 => "fms_total_mileage".into(),
        0xC3 => "can_b1".into(),
        0xC4..=0xD2 => format!("can_8bit_r{}", number - 0xC4),
        0xD3 => "ibutton_2".into(),
        0xD4 => "total_mileage".into(),
        0xD6..=0xDA => format!("can_16bit_r{}", number - 0xD6),
        0xDB..=0xDF => format!("can_32bit_r{}", number - 0xDB),
        TAG_COMMAND_SEQ => "command_seq".into(),
        _ => format!("tag{}", number),
    }
}

#[cfg(test)]
#[path = "tests/galileo.rs"]
mod vector_tests;
