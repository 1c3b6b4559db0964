use crate::checksum::crc16_modbus;
use crate::protocols::naviset::*;
use crate::protocols::SessionProtocol;

const HEAD_FRAME: [u8; 22] = [
    0x12, 0x00, 0x01, 0x00, b'0', b'1', b'2', b'8', b'9', b'6', b'0', b'0', b'1', b'6',
    b'0', b'9', b'1', b'2', b'9', 0x06, 0x9F, 0xB9,
];

#[test]
fn test_head_frame() {
    let frames = frames_from_buffer(&HEAD_FRAME).unwrap();
    assert_eq!(frames.len(), 1);
    let Frame::Head(head) = &frames[0] else {
        panic!("expected a head frame");
    };
    assert_eq!(head.device_number, 1);
    assert_eq!(head.device_imei, "012896001609129");
    assert_eq!(head.protocol_version, 6);
    assert_eq!(head.checksum, 47519);
    assert_eq!(head.to_bytes(), HEAD_FRAME);
}

#[test]
fn test_head_mutation_reseals_checksum() {
    let frames = frames_from_buffer(&HEAD_FRAME).unwrap();
    let Frame::Head(head) = &frames[0] else {
        panic!("expected a head frame");
    };
    let mut head = head.clone();
    head.device_number = 0x0022;
    head.protocol_version = 5;
    let bytes = head.to_bytes();
    assert_eq!(&bytes[bytes.len() - 2..], &[0x24, 0x36]);
    assert_eq!(u16::from_le_bytes([0x24, 0x36]), 13860);
}

fn data_item(number: u16, time: u32, sats: u8, lat: u32, lon: u32, speed10: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(DataItem::BASE_LEN);
    out.extend_from_slice(&number.to_le_bytes());
    out.extend_from_slice(&time.to_le_bytes());
    out.push(sats);
    out.extend_from_slice(&lat.to_le_bytes());
    out.extend_from_slice(&lon.to_le_bytes());
    out.extend_from_slice(&speed10.to_le_bytes());
    out.extend_from_slice(&100u16.to_le_bytes()); // azimuth 10.0
    out.extend_from_slice(&180u16.to_le_bytes()); // altitude
    out.push(12); // hdop 1.2
    out
}

fn seal_data(body: Vec<u8>) -> Vec<u8> {
    let word = (body.len() as u16 & 0x3FFF) | ((KIND_DATA as u16) << 14);
    let mut out = word.to_le_bytes().to_vec();
    out.extend_from_slice(&body);
    let crc = crc16_modbus(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

#[test]
fn test_data_frame_items() {
    let mut body = Vec::new();
    body.extend_from_slice(&7u16.to_le_bytes()); // device number
    body.extend_from_slice(&0u16.to_le_bytes()); // empty data structure
    for i in 0..45u16 {
        if i == 3 {
            body.extend(data_item(i, 1_353_319_086, 7, 55_731_708, 37_589_364, 3));
        } else {
            body.extend(data_item(i, 1_353_319_000 + i as u32, 9, 55_000_001, 37_000_001, 120));
        }
    }
    let frame = seal_data(body);
    let frames = frames_from_buffer(&frame).unwrap();
    let Frame::Data(data) = &frames[0] else {
        panic!("expected a data frame");
    };
    assert_eq!(data.items.len(), 45);

    let item = &data.items[3];
    assert!((item.speed - 0.3).abs() < 1e-9);
    assert!((item.latitude - 55.731708).abs() < 1e-9);
    assert!((item.longitude - 37.589364).abs() < 1e-9);
    assert_eq!(item.satellites, 7);
    assert_eq!(
        crate::observer::format_time(item.time),
        "2012-11-19T09:58:06.000000"
    );

    let observers = Naviset.translate(&frames[0]);
    assert_eq!(observers.len(), 45);
    assert_eq!(observers[3].satellitescount, Some(7));
    assert_eq!(observers[3].azimuth, Some(10));
    assert!((observers[3].hdop.unwrap() - 1.2).abs() < 1e-9);
}

#[test]
fn test_additional_data_length_table() {
    assert_eq!(additional_data_length(0), 0);
    assert_eq!(additional_data_length(1), 1); // bit 0 -> 1 byte
    assert_eq!(additional_data_length(1 << 10), 6);
    assert_eq!(additional_data_length(1 << 15), 8);
    assert_eq!(additional_data_length(0b11), 5);
    assert_eq!(additional_data_length(0xFFFF), 58);
}

#[test]
fn test_data_frame_with_additional_bytes() {
    let mut body = Vec::new();
    body.extend_from_slice(&1u16.to_le_bytes());
    body.extend_from_slice(&0b101u16.to_le_bytes()); // bits 0 and 2 -> 2 bytes
    let mut item = data_item(0, 1_353_319_086, 5, 55_731_708, 37_589_364, 55);
    item.extend_from_slice(&[0xAA, 0xBB]);
    body.extend(item);
    let frame = seal_data(body);
    let frames = frames_from_buffer(&frame).unwrap();
    let Frame::Data(data) = &frames[0] else {
        panic!("expected a data frame");
    };
    assert_eq!(data.items[0].additional.as_ref(), &[0xAA, 0xBB]);
}

#[test]
fn test_corrupt_checksum_rejected() {
    let mut frame = HEAD_FRAME;
    frame[21] ^= 0xFF;
    assert!(frames_from_buffer(&frame).is_err());
}

#[test]
fn test_ack_echoes_crc() {
    let frames = frames_from_buffer(&HEAD_FRAME).unwrap();
    let ack = Naviset.ack_for(&frames[0]).unwrap();
    assert_eq!(ack, vec![0x9F, 0xB9]);
}

#[test]
fn test_two_frames_tail_invariant() {
    let mut buf = HEAD_FRAME.to_vec();
    let mut body = Vec::new();
    body.extend_from_slice(&1u16.to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes());
    body.extend(data_item(1, 1_353_319_086, 8, 55_731_708, 37_589_364, 42));
    buf.extend(seal_data(body));

    let frames = frames_from_buffer(&buf).unwrap();
    assert_eq!(frames.len(), 2);
    let mut rebuilt = Vec::new();
    for frame in &frames {
        rebuilt.extend_from_slice(&frame.raw());
    }
    assert_eq!(rebuilt, buf);
}

#[test]
fn test_simple_commands() {
    let status = CommandGetStatus.to_bytes();
    assert_eq!(status[0], COMMAND_HEADER);
    assert_eq!(status[1], 0);
    assert_eq!(status.len(), 4);
    let crc = crc16_modbus(&status[..2]);
    assert_eq!(&status[2..], crc.to_le_bytes());

    assert_eq!(CommandRestart.to_bytes()[1], 18);
    assert_eq!(CommandRemoveTrackFromBuffer.to_bytes()[1], 16);
    assert_eq!(CommandGetImei.to_bytes()[1], 1);
}

#[test]
fn test_set_gprs_params_command() {
    let command = CommandSetGprsParams {
        ip: "91.77.12.1".parse().unwrap(),
        port: 20200,
    };
    let bytes = command.to_bytes();
    assert_eq!(bytes[1], 4);
    assert_eq!(&bytes[2..6], &[91, 77, 12, 1]);
    assert_eq!(&bytes[6..8], &20200u16.to_le_bytes());
}

#[test]
fn test_get_image_command() {
    let command = CommandGetImage { resolution: ImageResolution::R320x240 };
    let bytes = command.to_bytes();
    assert_eq!(bytes[1], 20);
    assert_eq!(bytes[2], 2);
}

#[test]
fn test_answer_frame() {
    let mut body = vec![0u8; 0];
    body.push(0); // command number: get status
    body.extend_from_slice(&[0x01, 0x02]);
    let word = (body.len() as u16 & 0x3FFF) | ((KIND_ANSWER as u16) << 14);
    let mut frame = word.to_le_bytes().to_vec();
    frame.extend_from_slice(&body);
    let crc = crc16_modbus(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());

    let frames = frames_from_buffer(&frame).unwrap();
    let Frame::Answer(answer) = &frames[0] else {
        panic!("expected an answer frame");
    };
    assert_eq!(answer.command, 0);
    assert_eq!(answer.body.as_ref(), &[0x01, 0x02]);
}
