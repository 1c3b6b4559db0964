use bytes::Bytes;
use serde_json::Value;

use crate::protocols::galileo::*;
use crate::protocols::{InitiationConfig, SessionProtocol};

fn tag_bytes(number: u8, value: &[u8]) -> Vec<u8> {
    let mut out = vec![number];
    out.extend_from_slice(value);
    out
}

fn sample_body(imei: Option<&str>, ts: u32, lat: i32, lon: i32) -> Vec<u8> {
    let mut body = Vec::new();
    if let Some(imei) = imei {
        body.extend(tag_bytes(TAG_IMEI, imei.as_bytes()));
        body.extend(tag_bytes(TAG_CODE, &34u16.to_le_bytes()));
    }
    body.extend(tag_bytes(TAG_TIMESTAMP, &ts.to_le_bytes()));
    let mut coords = vec![0x07]; // 7 satellites, correctness 0
    coords.extend_from_slice(&lat.to_le_bytes());
    coords.extend_from_slice(&lon.to_le_bytes());
    body.extend(tag_bytes(TAG_COORDS, &coords));
    let mut speed = 250u16.to_le_bytes().to_vec(); // 25.0 km/h
    speed.extend_from_slice(&1800u16.to_le_bytes()); // azimuth 180
    body.extend(tag_bytes(TAG_SPEED_AZIMUTH, &speed));
    body.extend(tag_bytes(TAG_ALTITUDE, &150i16.to_le_bytes()));
    body.extend(tag_bytes(TAG_HDOP, &[13]));
    body
}

#[test]
fn test_single_sample_frame() {
    let body = sample_body(Some("861785007918323"), 1_371_721_819, 55_636_036, 37_209_076);
    let frame = seal_frame(HEADER_DATA, &body);
    let frames = frames_from_buffer(&frame).unwrap();
    assert_eq!(frames.len(), 1);
    assert!(frames[0].has_tag(TAG_IMEI));
    assert_eq!(
        Galileo.uid_of(&frames[0]).as_deref(),
        Some("861785007918323")
    );

    let observers = Galileo.translate(&frames[0]);
    assert_eq!(observers.len(), 1);
    let packet = &observers[0];
    assert_eq!(packet.time.as_deref(), Some("2013-06-20T09:50:19.000000"));
    assert!((packet.latitude.unwrap() - 55.636036).abs() < 1e-9);
    assert!((packet.longitude.unwrap() - 37.209076).abs() < 1e-9);
    assert_eq!(packet.satellitescount, Some(7));
    assert_eq!(packet.azimuth, Some(180));
    assert_eq!(packet.altitude, Some(150));
    assert!((packet.hdop.unwrap() - 1.3).abs() < 1e-9);
    assert!((packet.speed.unwrap() - 25.0).abs() < 1e-9);
    // top-level geo fields are not mirrored into the sensor sub-object
    assert!(packet.sensors.get("latitude").is_none());
    assert!(packet.sensors.get("speed").is_none());
    assert!(packet.sensors.get("altitude").is_none());
    assert_eq!(packet.sensors.get("sat_count"), Some(&Value::from(7u8)));
}

#[test]
fn test_tag_number_reset_splits_samples() {
    let mut body = sample_body(Some("861785007918323"), 1_371_721_819, 55_636_036, 37_209_076);
    // second sample: timestamp tag number (0x20) is lower than HDOP (0x35)
    body.extend(sample_body(None, 1_371_721_879, 55_640_000, 37_210_000));
    let frame = seal_frame(HEADER_DATA, &body);
    let frames = frames_from_buffer(&frame).unwrap();
    let observers = Galileo.translate(&frames[0]);
    assert_eq!(observers.len(), 2);
    assert_eq!(observers[0].time.as_deref(), Some("2013-06-20T09:50:19.000000"));
    assert_eq!(observers[1].time.as_deref(), Some("2013-06-20T09:51:19.000000"));
    // identity tags only appear in the first sample
    assert!(observers[1].uid.is_none());
}

#[test]
fn test_status_and_voltage_sensors() {
    let mut body = Vec::new();
    body.extend(tag_bytes(TAG_TIMESTAMP, &1_371_721_819u32.to_le_bytes()));
    let status = StatusWord::ARMED | StatusWord::SOS;
    body.extend(tag_bytes(TAG_STATUS, &status.bits().to_le_bytes()));
    body.extend(tag_bytes(0x41, &12500u16.to_le_bytes()));
    body.extend(tag_bytes(0x42, &3900u16.to_le_bytes()));
    body.extend(tag_bytes(0x43, &[(-5i8) as u8]));
    let frame = seal_frame(HEADER_DATA, &body);
    let frames = frames_from_buffer(&frame).unwrap();
    let observers = Galileo.translate(&frames[0]);
    let sensors = &observers[0].sensors;
    assert_eq!(sensors.get("armed"), Some(&Value::from(1u8)));
    assert_eq!(sensors.get("sos"), Some(&Value::from(1u8)));
    assert_eq!(sensors.get("vibration"), Some(&Value::from(0u8)));
    assert_eq!(sensors.get("ext_battery_voltage"), Some(&Value::from(12500u32)));
    assert_eq!(sensors.get("int_battery_voltage"), Some(&Value::from(3900u32)));
    assert_eq!(sensors.get("int_temperature"), Some(&Value::from(-5)));
}

#[test]
fn test_digital_banks_expand_to_channels() {
    let mut body = Vec::new();
    body.extend(tag_bytes(TAG_TIMESTAMP, &1_371_721_819u32.to_le_bytes()));
    body.extend(tag_bytes(0x45, &0b0000_0000_0000_0101u16.to_le_bytes()));
    body.extend(tag_bytes(0x46, &0b1000_0000_0000_0010u16.to_le_bytes()));
    let frame = seal_frame(HEADER_DATA, &body);
    let frames = frames_from_buffer(&frame).unwrap();
    let observers = Galileo.translate(&frames[0]);
    let sensors = &observers[0].sensors;
    assert_eq!(sensors.get("dout0"), Some(&Value::from(1u32)));
    assert_eq!(sensors.get("dout1"), Some(&Value::from(0u32)));
    assert_eq!(sensors.get("dout2"), Some(&Value::from(1u32)));
    assert_eq!(sensors.get("dout15"), Some(&Value::from(0u32)));
    assert_eq!(sensors.get("din1"), Some(&Value::from(1u32)));
    assert_eq!(sensors.get("din15"), Some(&Value::from(1u32)));
    assert_eq!(sensors.get("din0"), Some(&Value::from(0u32)));
    // no collapsed scalar keys
    assert!(sensors.get("douts").is_none());
    assert!(sensors.get("dins").is_none());
}

#[test]
fn test_fuel_engine_group() {
    let mut body = Vec::new();
    body.extend(tag_bytes(TAG_TIMESTAMP, &1_371_721_819u32.to_le_bytes()));
    // fuel 65 %, coolant -12 C, 1800 rpm
    let mut value = vec![65u8, (-12i8) as u8];
    value.extend_from_slice(&1800u16.to_le_bytes());
    body.extend(tag_bytes(0xC1, &value));
    let frame = seal_frame(HEADER_DATA, &body);
    let frames = frames_from_buffer(&frame).unwrap();
    let sensors = &Galileo.translate(&frames[0])[0].sensors;
    assert_eq!(sensors.get("fms_fuel_level"), Some(&Value::from(65u8)));
    assert_eq!(sensors.get("fms_coolant_temperature"), Some(&Value::from(-12)));
    assert_eq!(sensors.get("fms_engine_rpm"), Some(&Value::from(1800u16)));
}

#[test]
fn test_ibutton_state_bits() {
    let mut body = Vec::new();
    body.extend(tag_bytes(TAG_TIMESTAMP, &1_371_721_819u32.to_le_bytes()));
    body.extend(tag_bytes(0xD5, &[0b01]));
    let frame = seal_frame(HEADER_DATA, &body);
    let frames = frames_from_buffer(&frame).unwrap();
    let sensors = &Galileo.translate(&frames[0])[0].sensors;
    assert_eq!(sensors.get("ibutton_1_connected"), Some(&Value::from(1u8)));
    assert_eq!(sensors.get("ibutton_2_connected"), Some(&Value::from(0u8)));
    assert!(sensors.get("ibutton_state").is_none());
}

#[test]
fn test_checksum_mismatch_rejected() {
    let body = sample_body(None, 1_371_721_819, 0, 0);
    let mut frame = seal_frame(HEADER_DATA, &body);
    let last = frame.len() - 1;
    frame[last] ^= 0x55;
    assert!(frames_from_buffer(&frame).is_err());
}

#[test]
fn test_archive_flag() {
    let body = sample_body(None, 1_371_721_819, 1, 1);
    let mut frame = Vec::new();
    frame.push(HEADER_DATA);
    frame.extend_from_slice(&((body.len() as u16) | 0x8000).to_le_bytes());
    frame.extend_from_slice(&body);
    let crc = crate::checksum::crc16_xmodem(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    let frames = frames_from_buffer(&frame).unwrap();
    assert!(frames[0].archive);
}

#[test]
fn test_image_frames_feed_transfer() {
    let mut chunk_body = vec![0u8]; // partition 0
    chunk_body.extend_from_slice(b"JPEGDATA");
    let frame = seal_frame(HEADER_IMAGE, &chunk_body);
    let frames = frames_from_buffer(&frame).unwrap();
    let (partition, chunk) = Galileo.image_chunk(&frames[0]).unwrap();
    assert_eq!(partition, 0);
    assert_eq!(chunk, Bytes::from_static(b"JPEGDATA"));
    assert!(Galileo.translate(&frames[0]).is_empty());

    // terminator: partition byte only
    let frame = seal_frame(HEADER_IMAGE, &[1]);
    let frames = frames_from_buffer(&frame).unwrap();
    let (_, chunk) = Galileo.image_chunk(&frames[0]).unwrap();
    assert!(chunk.is_empty());
}

#[test]
fn test_ack_is_pure_function_of_checksum() {
    let body = sample_body(None, 42, 10, 20);
    let frame_bytes = seal_frame(HEADER_DATA, &body);
    let frames = frames_from_buffer(&frame_bytes).unwrap();
    let ack = Galileo.ack_for(&frames[0]).unwrap();
    assert_eq!(ack[0], 0x02);
    assert_eq!(
        u16::from_le_bytes([ack[1], ack[2]]),
        frames[0].checksum
    );
    assert_eq!(Galileo.ack_for(&frames[0]).unwrap(), ack);
}

#[test]
fn test_command_packet_roundtrip() {
    let command = CommandPacket {
        imei: "861785007918323".into(),
        code: 34,
        sequence: 7,
        text: "Makephoto 1".into(),
    };
    let bytes = command.to_bytes();
    assert_eq!(bytes[0], HEADER_DATA);
    let frames = frames_from_buffer(&bytes).unwrap();
    assert_eq!(frames[0].tag(TAG_COMMAND_SEQ), Some(&TagValue::UInt(7)));
    assert_eq!(
        frames[0].tag(TAG_COMMAND_TEXT),
        Some(&TagValue::Text("Makephoto 1".into()))
    );
}

#[test]
fn test_initiation_messages() {
    let config = InitiationConfig {
        host: "91.77.12.1".into(),
        port: 21001,
        gprs_apn: "internet".into(),
        gprs_username: "user".into(),
        gprs_password: "pass".into(),
        ..Default::default()
    };
    let messages = Galileo.initiation_messages(&config).unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[1].message, "ServerIp 91.77.12.1,21001");
    assert_eq!(messages[2].message, "APN internet,user,pass");
}
