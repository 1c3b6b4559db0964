//! Per-connection dispatch state machine.
//!
//! A [`Session`] owns everything one TCP connection accumulates: the bound
//! uid, the retained head frame, a partial image transfer and the command
//! sequence counter. The session drives a sans-io protocol codec against
//! the socket: identification, acknowledgement, the pending-configuration
//! handshake, normalization and forwarding, and the command round-trip.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, CommandRecord};
use crate::commands::{self, CommandKind};
use crate::devices::{self, DeviceRegistry};
use crate::error::{Error, Result};
use crate::image::{ImageProgress, ImageTransfer};
use crate::observer::{self, ImageRecord, ObserverPacket};
use crate::pipe::{HttpPipe, Store};
use crate::protocols::{CommandIssue, SessionProtocol};
use crate::spool::{Spool, UNKNOWN_UID};

/// Process-wide collaborators shared by every session and listener.
pub struct Services {
    pub broker: Arc<Broker>,
    pub devices: Arc<DeviceRegistry>,
    pub pipe: Arc<HttpPipe>,
    pub spool: Spool,
    /// Host devices are pointed at during provisioning.
    pub public_host: String,
    pub listen_port: u16,
    pub socket_timeout: Duration,
    pub socket_packet_length: usize,
}

enum Burst {
    Data(Vec<u8>),
    Closed,
}

pub struct Session<P: SessionProtocol, S: Store> {
    protocol: Arc<P>,
    store: S,
    services: Arc<Services>,
    uid: Option<String>,
    head_raw: Bytes,
    head_pack: ObserverPacket,
    image: ImageTransfer,
    command_seq: u32,
}

impl<P: SessionProtocol, S: Store> Session<P, S> {
    pub fn new(protocol: Arc<P>, store: S, services: Arc<Services>) -> Self {
        Self {
            protocol,
            store,
            services,
            uid: None,
            head_raw: Bytes::new(),
            head_pack: ObserverPacket::new(),
            image: ImageTransfer::new(),
            command_seq: 0,
        }
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    /// Drives the connection until the peer closes or the transport breaks.
    pub async fn run<T>(&mut self, stream: &mut T)
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        loop {
            match self.recv_burst(stream).await {
                Ok(Burst::Closed) => {
                    debug!(uid = ?self.uid, "peer closed the connection");
                    break;
                }
                Ok(Burst::Data(data)) => {
                    if let Err(e) = self.process_data(&data, stream).await {
                        error!(uid = ?self.uid, error = %e, "session aborted");
                        break;
                    }
                }
                Err(e) => {
                    error!(uid = ?self.uid, error = %e, "receive failed");
                    break;
                }
            }
        }
        self.release();
    }

    /// Reads one dispatch burst: chunks of up to `socket_packet_length`
    /// until a short read. A timeout with nothing received closes the
    /// session; a timeout after data ends the burst only.
    async fn recv_burst<T>(&mut self, stream: &mut T) -> Result<Burst>
    where
        T: AsyncRead + Unpin + Send,
    {
        let chunk_len = self.services.socket_packet_length;
        let mut total = Vec::new();
        let mut chunk = vec![0u8; chunk_len];
        loop {
            match timeout(self.services.socket_timeout, stream.read(&mut chunk)).await {
                Err(_elapsed) => {
                    if total.is_empty() {
                        return Ok(Burst::Closed);
                    }
                    break;
                }
                Ok(Ok(0)) => {
                    if total.is_empty() {
                        return Ok(Burst::Closed);
                    }
                    break;
                }
                Ok(Ok(n)) => {
                    total.extend_from_slice(&chunk[..n]);
                    if n < chunk_len {
                        break;
                    }
                }
                Ok(Err(e)) => return Err(e.into()),
            }
        }
        Ok(Burst::Data(total))
    }

    /// One burst: split into frames, handle each strictly in arrival order,
    /// then drain at most one pending command for this uid.
    async fn process_data<T>(&mut self, data: &[u8], stream: &mut T) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let frames = match self.protocol.frames(data) {
            Ok(frames) => frames,
            Err(e) => {
                // device will resend or reconnect; the connection survives
                warn!(uid = ?self.uid, error = %e, "burst discarded");
                return Ok(());
            }
        };
        for frame in &frames {
            match self.process_frame(frame, stream).await {
                Ok(()) => {}
                Err(Error::UnidentifiedSession) => {
                    warn!("data frame before header, dropped");
                }
                Err(e @ Error::Transport(_)) => return Err(e),
                Err(e) => warn!(uid = ?self.uid, error = %e, "frame failed"),
            }
        }
        self.process_pending_commands(stream).await
    }

    async fn process_frame<T>(&mut self, frame: &P::Frame, stream: &mut T) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if let Some(uid) = self.protocol.uid_of(frame) {
            if self.uid.is_none() {
                info!(%uid, protocol = self.protocol.alias(), "session identified");
            }
            self.uid = Some(uid.clone());
            self.head_raw = self.protocol.raw(frame);
            self.head_pack.uid = Some(uid);
            if self.protocol.header_only(frame) {
                self.send_ack(frame, stream).await?;
                return Ok(());
            }
        }
        let Some(uid) = self.uid.clone() else {
            return Err(Error::UnidentifiedSession);
        };

        if let Some(blob) = self.services.devices.pending_config(&uid) {
            match self.configure(&uid, &blob, stream).await {
                Ok(()) => {
                    info!(%uid, "device accepted configuration");
                    self.services.devices.clear_pending_config(&uid);
                }
                Err(e @ Error::Transport(_)) => return Err(e),
                Err(e) => {
                    // blob stays pending; the next frame retries
                    warn!(%uid, error = %e, "configuration handshake failed");
                }
            }
        }

        self.send_ack(frame, stream).await?;

        if let Some((partition, chunk)) = self.protocol.image_chunk(frame) {
            let frame_raw = self.protocol.raw(frame);
            self.receive_image(&uid, partition, chunk, frame_raw).await;
            return Ok(());
        }

        if let Some(data) = self.protocol.command_reply(frame) {
            debug!(%uid, "command reply received");
            self.services.broker.send_answer(&uid, data).await;
            return Ok(());
        }

        let mut packets = self.protocol.translate(frame);
        for packet in &packets {
            if packet.uid2.is_some() && self.head_pack.uid2.is_none() {
                self.head_pack.uid2 = packet.uid2.clone();
            }
        }
        packets.retain(|p| p.has_payload());
        for packet in &mut packets {
            packet.merge_head(&self.head_pack);
        }
        if packets.is_empty() {
            return Ok(());
        }
        self.forward(&uid, self.protocol.raw(frame), &packets).await;
        Ok(())
    }

    async fn send_ack<T>(&self, frame: &P::Frame, stream: &mut T) -> Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        if let Some(ack) = self.protocol.ack_for(frame) {
            stream.write_all(&ack).await?;
        }
        Ok(())
    }

    /// Pushes the pending configuration blob and waits for the device echo.
    async fn configure<T>(&self, uid: &str, blob: &[u8], stream: &mut T) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        stream.write_all(blob).await?;
        debug!(%uid, bytes = blob.len(), "configuration sent, awaiting echo");
        let mut reply = vec![0u8; self.services.socket_packet_length];
        let n = timeout(self.services.socket_timeout, stream.read(&mut reply))
            .await
            .map_err(|_| Error::Timeout)??;
        if self.protocol.config_answer_ok(blob, &reply[..n]) {
            Ok(())
        } else {
            Err(Error::ConfigHandshakeFailed)
        }
    }

    async fn receive_image(&mut self, uid: &str, partition: u8, chunk: Bytes, frame_raw: Bytes) {
        match self.image.push(partition, chunk) {
            Ok(ImageProgress::InProgress) => {
                debug!(%uid, partition, "image chunk stored");
            }
            Ok(ImageProgress::Complete(data)) => {
                info!(%uid, bytes = data.len(), "image transfer complete");
                let mut packet = ObserverPacket::new();
                packet.uid = Some(uid.to_string());
                packet.time = Some(observer::format_time(chrono::Utc::now()));
                packet.images = Some(vec![ImageRecord {
                    mime: "image/jpeg".to_string(),
                    content: BASE64.encode(&data),
                }]);
                self.forward(uid, frame_raw, &[packet]).await;
            }
            Err(e) => {
                // discard, never publish a partial image
                warn!(%uid, error = %e, "image transfer aborted");
            }
        }
    }

    /// Forwards one batch; on downstream failure the raw wire bytes go to
    /// the spool keyed by uid.
    async fn forward(&self, uid: &str, frame_raw: Bytes, packets: &[ObserverPacket]) {
        let result = self.store.send(packets).await;
        if result.is_success() {
            debug!(%uid, count = packets.len(), "batch forwarded");
            return;
        }
        error!(%uid, errors = ?result.errors, "store rejected batch, spooling");
        let mut raw = self.head_raw.to_vec();
        raw.extend_from_slice(&frame_raw);
        let key = if uid.is_empty() { UNKNOWN_UID } else { uid };
        self.services.spool.save(key, &raw).await;
    }

    /// Opportunistic drain: the in-process map first, then one message from
    /// the per-uid queue with a one-second window.
    async fn process_pending_commands<T>(&mut self, stream: &mut T) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let Some(uid) = self.uid.clone() else {
            return Ok(());
        };
        if self.image.is_active() {
            return Ok(());
        }
        let command = match self.services.broker.command_for(&uid) {
            Some(command) => Some(command),
            None => self.services.broker.poll_command(&uid).await,
        };
        if let Some(command) = command {
            self.execute_command(command, stream).await?;
        }
        Ok(())
    }

    async fn execute_command<T>(&mut self, command: CommandRecord, stream: &mut T) -> Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let uid = command.uid.clone();
        info!(%uid, action = %command.action, "executing command");
        match commands::lookup(&command.action) {
            Err(e) => {
                warn!(%uid, error = %e, "command rejected");
                self.services.broker.send_error(&uid, e.to_string()).await;
            }
            Ok(CommandKind::Format) => {
                match format_command(self.protocol.as_ref(), &self.services, &command).await {
                    Ok(data) => self.services.broker.send_answer(&uid, data).await,
                    Err(e) => self.services.broker.send_error(&uid, e.to_string()).await,
                }
            }
            Ok(CommandKind::ReadSettings) | Ok(CommandKind::SetOption) => {
                // close the task so the observer side is not left hanging
                if let Err(e) = self.services.pipe.close_task(&command.guid, None).await {
                    warn!(%uid, error = %e, "task close failed");
                }
                self.services
                    .broker
                    .send_error(&uid, format!("{} is not supported here", command.action))
                    .await;
            }
            Ok(kind @ (CommandKind::Execute | CommandKind::Device)) => {
                self.command_seq = self.command_seq.wrapping_add(1);
                let issue = CommandIssue {
                    action: &command.action,
                    value: command.value.as_ref(),
                    head: &self.head_pack,
                    sequence: self.command_seq,
                };
                match self.protocol.command_bytes(&issue) {
                    Ok(Some(bytes)) => {
                        stream.write_all(&bytes).await?;
                        if kind == CommandKind::Device {
                            // success is reported when the reply frame
                            // re-enters the dispatch loop
                            debug!(%uid, "command written, awaiting device reply");
                        } else {
                            self.services.broker.send_answer(&uid, String::new()).await;
                        }
                    }
                    Ok(None) => {
                        self.services
                            .broker
                            .send_error(
                                &uid,
                                format!("{} is not supported by {}", command.action,
                                    self.protocol.alias()),
                            )
                            .await;
                    }
                    Err(e) => {
                        self.services.broker.send_error(&uid, e.to_string()).await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Deterministic teardown on peer close.
    fn release(&mut self) {
        if let Some(uid) = &self.uid {
            self.services.broker.remove_command(uid);
        }
        self.image.clear();
        self.head_raw = Bytes::new();
        self.head_pack = ObserverPacket::new();
        self.uid = None;
    }
}

/// The `format` command: fill provisioning defaults, stash the binary
/// configuration for the device's next contact, hand the SMS payloads to
/// the task-close pipe. Shared by live sessions and the offline listener.
pub async fn format_command<P: SessionProtocol>(
    protocol: &P,
    services: &Services,
    command: &CommandRecord,
) -> Result<String> {
    let raw = match &command.value {
        Some(Value::String(inner)) => serde_json::from_str(inner)
            .map_err(|e| Error::InvalidParams(format!("config is not JSON: {e}")))?,
        Some(value) => value.clone(),
        None => Value::Object(Default::default()),
    };
    let config = devices::initiation_config(&raw, &services.public_host, services.listen_port);
    if let Some(blob) = protocol.configuration_blob(&config) {
        let target = if config.identifier.is_empty() {
            command.uid.as_str()
        } else {
            config.identifier.as_str()
        };
        services.devices.set_pending_config(target, blob);
    }
    let messages = protocol
        .initiation_messages(&config)
        .ok_or_else(|| Error::InvalidParams("protocol has no initiation transport".into()))?;
    let data = serde_json::to_value(&messages)
        .map_err(|e| Error::InvalidParams(e.to_string()))?;
    services.pipe.close_task(&command.guid, Some(data.clone())).await?;
    Ok(data.to_string())
}

/// Command executed off the per-protocol listener, with no live socket.
/// Initiation runs immediately; anything needing the device stays queued in
/// the command map until that uid's session drains it.
pub async fn offline_command<P: SessionProtocol>(
    protocol: &P,
    services: &Services,
    command: CommandRecord,
) {
    match commands::lookup(&command.action) {
        Ok(CommandKind::Format) => {
            let uid = command.uid.clone();
            match format_command(protocol, services, &command).await {
                Ok(data) => services.broker.send_answer(&uid, data).await,
                Err(e) => services.broker.send_error(&uid, e.to_string()).await,
            }
        }
        Ok(_) => {
            debug!(uid = %command.uid, action = %command.action, "command queued for live session");
        }
        Err(e) => {
            warn!(uid = %command.uid, error = %e, "command rejected");
            services.broker.send_error(&command.uid, e.to_string()).await;
        }
    }
}

#[cfg(test)]
#[path = "handler_tests.rs"]
mod tests;
