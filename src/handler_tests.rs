use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::broker::Broker;
use crate::checksum::{crc16_modbus, crc16_xmodem};
use crate::devices::DeviceRegistry;
use crate::handler::{Services, Session};
use crate::pipe::testing::MockStore;
use crate::pipe::HttpPipe;
use crate::protocols::{galileo, naviset};
use crate::spool::Spool;

fn test_services(spool_dir: &std::path::Path) -> Arc<Services> {
    Arc::new(Services {
        // unroutable port: broker calls fail fast in tests
        broker: Arc::new(Broker::new("amqp://127.0.0.1:1", "test")),
        devices: Arc::new(DeviceRegistry::new()),
        pipe: Arc::new(HttpPipe::new(
            "http://127.0.0.1:1/set",
            "http://127.0.0.1:1/finish",
        )),
        spool: Spool::new(spool_dir),
        public_host: "127.0.0.1".into(),
        listen_port: 21100,
        socket_timeout: Duration::from_millis(200),
        socket_packet_length: 4096,
    })
}

fn temp_dir(tag: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("fleetgate-{tag}-{}", std::process::id()))
}

fn naviset_head() -> Vec<u8> {
    let mut body = 1u16.to_le_bytes().to_vec();
    body.extend_from_slice(b"012896001609129");
    body.push(6);
    seal_naviset(naviset::KIND_HEAD, body)
}

fn seal_naviset(kind: u8, body: Vec<u8>) -> Vec<u8> {
    let word = (body.len() as u16 & 0x3FFF) | ((kind as u16) << 14);
    let mut out = word.to_le_bytes().to_vec();
    out.extend_from_slice(&body);
    let crc = crc16_modbus(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

fn naviset_data_frame() -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&1u16.to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes());
    body.extend_from_slice(&9u16.to_le_bytes()); // item number
    body.extend_from_slice(&1_353_319_086u32.to_le_bytes());
    body.push(7);
    body.extend_from_slice(&55_731_708u32.to_le_bytes());
    body.extend_from_slice(&37_589_364u32.to_le_bytes());
    body.extend_from_slice(&3u16.to_le_bytes());
    body.extend_from_slice(&100u16.to_le_bytes());
    body.extend_from_slice(&180u16.to_le_bytes());
    body.push(12);
    seal_naviset(naviset::KIND_DATA, body)
}

#[tokio::test]
async fn test_identification_then_data_forwarding() {
    let services = test_services(&temp_dir("fwd"));
    let store = Arc::new(MockStore::default());
    let mut session = Session::new(Arc::new(naviset::Naviset), store.clone(), services);

    let (mut client, mut server) = tokio::io::duplex(8192);
    let task = tokio::spawn(async move {
        session.run(&mut server).await;
    });

    // head frame: identification plus CRC-echo ack
    let head = naviset_head();
    client.write_all(&head).await.unwrap();
    let mut ack = [0u8; 2];
    client.read_exact(&mut ack).await.unwrap();
    assert_eq!(&ack[..], &head[head.len() - 2..]);

    // data frame: ack then one observer packet with the head uid merged in
    let data = naviset_data_frame();
    client.write_all(&data).await.unwrap();
    client.read_exact(&mut ack).await.unwrap();
    assert_eq!(&ack[..], &data[data.len() - 2..]);

    drop(client);
    task.await.unwrap();

    let batches = store.batches.lock().unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 1);
    assert_eq!(batches[0][0].uid.as_deref(), Some("012896001609129"));
    assert!((batches[0][0].latitude.unwrap() - 55.731708).abs() < 1e-9);
}

#[tokio::test]
async fn test_data_before_header_is_dropped() {
    let services = test_services(&temp_dir("unident"));
    let store = Arc::new(MockStore::default());
    let mut session = Session::new(Arc::new(naviset::Naviset), store.clone(), services);

    let (mut client, mut server) = tokio::io::duplex(8192);
    let task = tokio::spawn(async move {
        session.run(&mut server).await;
    });

    client.write_all(&naviset_data_frame()).await.unwrap();
    // no ack may arrive for a dropped frame; just close
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(client);
    task.await.unwrap();

    assert!(store.batches.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_store_failure_spools_head_and_frame() {
    let dir = temp_dir("spool-on-fail");
    tokio::fs::remove_dir_all(&dir).await.ok();
    let services = test_services(&dir);
    let store = Arc::new(MockStore::default());
    store.fail.store(true, Ordering::Relaxed);
    let mut session = Session::new(Arc::new(naviset::Naviset), store.clone(), services);

    let (mut client, mut server) = tokio::io::duplex(8192);
    let task = tokio::spawn(async move {
        session.run(&mut server).await;
    });

    let head = naviset_head();
    let data = naviset_data_frame();
    client.write_all(&head).await.unwrap();
    let mut ack = [0u8; 2];
    client.read_exact(&mut ack).await.unwrap();
    client.write_all(&data).await.unwrap();
    client.read_exact(&mut ack).await.unwrap();
    drop(client);
    task.await.unwrap();

    let spooled = tokio::fs::read(dir.join("012896001609129.bin")).await.unwrap();
    let mut expected = head.clone();
    expected.extend_from_slice(&data);
    assert_eq!(spooled, expected);
    tokio::fs::remove_dir_all(&dir).await.ok();
}

fn galileo_identity_frame() -> Vec<u8> {
    let mut body = vec![galileo::TAG_IMEI];
    body.extend_from_slice(b"861785007918323");
    body.push(galileo::TAG_TIMESTAMP);
    body.extend_from_slice(&1_371_721_819u32.to_le_bytes());
    galileo::seal_frame(galileo::HEADER_DATA, &body)
}

fn galileo_image_frame(partition: u8, chunk: &[u8]) -> Vec<u8> {
    let mut body = vec![partition];
    body.extend_from_slice(chunk);
    galileo::seal_frame(galileo::HEADER_IMAGE, &body)
}

#[tokio::test]
async fn test_image_reassembly_published_as_base64() {
    use base64::Engine;

    let services = test_services(&temp_dir("img"));
    let store = Arc::new(MockStore::default());
    let mut session = Session::new(Arc::new(galileo::Galileo), store.clone(), services);

    let (mut client, mut server) = tokio::io::duplex(8192);
    let task = tokio::spawn(async move {
        session.run(&mut server).await;
    });

    let mut ack = [0u8; 3];
    client.write_all(&galileo_identity_frame()).await.unwrap();
    client.read_exact(&mut ack).await.unwrap();
    assert_eq!(ack[0], 0x02);

    for (partition, chunk) in [(0u8, b"JPEG".as_slice()), (1, b"DATA")] {
        client.write_all(&galileo_image_frame(partition, chunk)).await.unwrap();
        client.read_exact(&mut ack).await.unwrap();
    }
    // terminator: partition byte only
    client.write_all(&galileo_image_frame(2, b"")).await.unwrap();
    client.read_exact(&mut ack).await.unwrap();

    drop(client);
    task.await.unwrap();

    let batches = store.batches.lock().unwrap();
    // identity frame carried a timestamp sample, then the image record
    let image_batch = batches.last().unwrap();
    let images = image_batch[0].images.as_ref().unwrap();
    assert_eq!(images[0].mime, "image/jpeg");
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(&images[0].content)
        .unwrap();
    assert_eq!(decoded, b"JPEGDATA");
    assert_eq!(image_batch[0].uid.as_deref(), Some("861785007918323"));
}

#[tokio::test]
async fn test_pending_config_handshake() {
    use crate::protocols::teltonika::{self, Teltonika};
    use crate::protocols::InitiationConfig;

    let services = test_services(&temp_dir("cfg"));
    let uid = "861785007918323";
    let blob = teltonika::configuration_packet(&InitiationConfig {
        host: "10.0.0.1".into(),
        port: 20500,
        ..Default::default()
    })
    .to_bytes();
    services
        .devices
        .set_pending_config(uid, bytes::Bytes::from(blob.clone()));

    let store = Arc::new(MockStore::default());
    let devices = services.devices.clone();
    let mut session = Session::new(Arc::new(Teltonika), store.clone(), services);

    let (mut client, mut server) = tokio::io::duplex(8192);
    let task = tokio::spawn(async move {
        session.run(&mut server).await;
    });

    // identification frame: plain 0x01 ack, no config push yet
    let mut head = (uid.len() as u16).to_be_bytes().to_vec();
    head.extend_from_slice(uid.as_bytes());
    client.write_all(&head).await.unwrap();
    let mut ack1 = [0u8; 1];
    client.read_exact(&mut ack1).await.unwrap();
    assert_eq!(ack1, [0x01]);

    // next frame triggers the handshake: blob arrives before the data ack
    let record = {
        use binrw::BinWrite;
        let gps = teltonika::GpsElement {
            longitude: 372_090_760,
            latitude: 556_360_360,
            altitude: 100,
            course: 0,
            satellites: 8,
            speed: 10,
        };
        let mut out = 1_371_721_819_000u64.to_be_bytes().to_vec();
        out.push(0);
        let mut cursor = std::io::Cursor::new(Vec::new());
        gps.write(&mut cursor).unwrap();
        out.extend_from_slice(&cursor.into_inner());
        out.extend_from_slice(&[0, 0, 0, 0, 0, 0]); // no IO elements
        out
    };
    let mut payload = vec![teltonika::CODEC_8, 1];
    payload.extend_from_slice(&record);
    payload.push(1);
    let mut data = vec![0, 0, 0, 0];
    data.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    data.extend_from_slice(&payload);
    data.extend_from_slice(&crate::checksum::crc32(&payload).to_be_bytes());
    client.write_all(&data).await.unwrap();

    let mut pushed = vec![0u8; blob.len()];
    client.read_exact(&mut pushed).await.unwrap();
    assert_eq!(pushed, blob);
    // device echo: packet id + acceptance byte
    client.write_all(&[blob[0], 0x01]).await.unwrap();

    let mut ack4 = [0u8; 4];
    client.read_exact(&mut ack4).await.unwrap();
    assert_eq!(ack4, [0, 0, 0, 1]);

    drop(client);
    task.await.unwrap();
    assert!(devices.pending_config(uid).is_none());
    assert_eq!(store.batches.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_galileo_ack_uses_frame_checksum() {
    let frame = galileo_identity_frame();
    let crc = crc16_xmodem(&frame[..frame.len() - 2]);

    let services = test_services(&temp_dir("ack"));
    let store = Arc::new(MockStore::default());
    let mut session = Session::new(Arc::new(galileo::Galileo), store, services);

    let (mut client, mut server) = tokio::io::duplex(8192);
    let task = tokio::spawn(async move {
        session.run(&mut server).await;
    });

    client.write_all(&frame).await.unwrap();
    let mut ack = [0u8; 3];
    client.read_exact(&mut ack).await.unwrap();
    assert_eq!(ack[0], 0x02);
    assert_eq!(u16::from_le_bytes([ack[1], ack[2]]), crc);
    drop(client);
    task.await.unwrap();
}
