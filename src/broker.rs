//! AMQP integration: packet fan-out and the command round-trip.
//!
//! Two durable topic exchanges, `mon.device` and `n.work`. Observer packets
//! are published with a routing key sharded on the trailing digit of the
//! device uid; commands arrive on per-protocol and per-uid queues and their
//! results go back on `mon.device.command.update`. All routing keys carry
//! the environment prefix.

use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::observer::ObserverPacket;

pub const EXCHANGE_DEVICE: &str = "mon.device";
pub const EXCHANGE_WORK: &str = "n.work";

const COMMAND_UPDATE_KEY: &str = "mon.device.command.update";

/// Reconnect pause of a crashed command listener.
const LISTENER_RETRY: Duration = Duration::from_secs(60);

/// Per-uid command poll window between dispatch bursts.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandStatus {
    Created = 1,
    Success = 2,
    Error = 3,
}

/// An in-flight command: stored on receipt, removed on terminal status.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandRecord {
    pub uid: String,
    pub guid: String,
    pub action: String,
    #[serde(default)]
    pub value: Option<Value>,
}

pub struct Broker {
    url: String,
    environment: String,
    commands: DashMap<String, CommandRecord>,
}

impl Broker {
    pub fn new(url: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            environment: environment.into(),
            commands: DashMap::new(),
        }
    }

    /// Shards packet fan-out across worker queues by the trailing digit of
    /// the uid.
    pub fn routing_key(uid: Option<&str>) -> String {
        let worker = uid
            .and_then(|uid| uid.chars().last())
            .filter(char::is_ascii_digit)
            .unwrap_or('0');
        format!("mon.device.packet.create.worker{worker}")
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}.{}", self.environment, key)
    }

    /// Opens a fresh connection + channel and declares both exchanges. The
    /// connection must outlive the channel, so both are returned.
    async fn open(&self) -> Result<(Connection, Channel)> {
        let connection =
            Connection::connect(&self.url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        for exchange in [EXCHANGE_DEVICE, EXCHANGE_WORK] {
            channel
                .exchange_declare(
                    exchange,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions { durable: true, ..Default::default() },
                    FieldTable::default(),
                )
                .await?;
        }
        Ok((connection, channel))
    }

    async fn declare_bound_queue(&self, channel: &Channel, routing_key: &str) -> Result<()> {
        channel
            .queue_declare(
                routing_key,
                QueueDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(
                routing_key,
                EXCHANGE_DEVICE,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn publish_on(
        &self,
        channel: &Channel,
        routing_key: &str,
        body: &[u8],
    ) -> Result<()> {
        self.declare_bound_queue(channel, routing_key).await?;
        channel
            .basic_publish(
                EXCHANGE_DEVICE,
                routing_key,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default(),
            )
            .await?
            .await?;
        Ok(())
    }

    async fn try_publish(&self, items: &[(String, Vec<u8>)]) -> Result<()> {
        let (_connection, channel) = self.open().await?;
        for (routing_key, body) in items {
            self.publish_on(&channel, routing_key, body).await?;
        }
        Ok(())
    }

    async fn publish(&self, items: Vec<(String, Vec<u8>)>) -> Result<()> {
        // one reconnect attempt per batch, then give up and let the caller
        // spool
        match self.try_publish(&items).await {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(error = %first, "publish failed, reopening connection");
                self.try_publish(&items)
                    .await
                    .map_err(|e| Error::DownstreamUnavailable(e.to_string()))
            }
        }
    }

    /// Forwards one observer batch, preserving frame order.
    pub async fn publish_packets(&self, packets: &[ObserverPacket]) -> Result<()> {
        let mut items = Vec::with_capacity(packets.len());
        for packet in packets {
            let routing_key = self.prefixed(&Self::routing_key(packet.uid.as_deref()));
            let body = serde_json::to_vec(packet)
                .map_err(|e| Error::DownstreamUnavailable(e.to_string()))?;
            items.push((routing_key, body));
        }
        self.publish(items).await?;
        debug!(count = packets.len(), "observer batch published");
        Ok(())
    }

    // -- command map ------------------------------------------------------

    pub fn store_command(&self, command: CommandRecord) {
        self.commands.insert(command.uid.clone(), command);
    }

    pub fn command_for(&self, uid: &str) -> Option<CommandRecord> {
        self.commands.get(uid).map(|c| c.clone())
    }

    pub fn remove_command(&self, uid: &str) {
        self.commands.remove(uid);
    }

    // -- command results --------------------------------------------------

    async fn command_update(&self, uid: &str, status: CommandStatus, data: String) {
        let Some(command) = self.command_for(uid) else {
            debug!(uid, "no in-flight command to answer");
            return;
        };
        let body = serde_json::json!({
            "guid": command.guid,
            "status": status as u8,
            "data": data,
        });
        let key = self.prefixed(COMMAND_UPDATE_KEY);
        if let Err(e) = self
            .publish(vec![(key, body.to_string().into_bytes())])
            .await
        {
            error!(uid, error = %e, "command update lost");
        }
        self.remove_command(uid);
    }

    pub async fn send_answer(&self, uid: &str, data: String) {
        self.command_update(uid, CommandStatus::Success, data).await;
    }

    pub async fn send_error(&self, uid: &str, error: String) {
        self.command_update(uid, CommandStatus::Error, error).await;
    }

    // -- command inbox ----------------------------------------------------

    /// Drains at most one command addressed to the uid, waiting up to one
    /// second. Used opportunistically between dispatch bursts.
    pub async fn poll_command(&self, uid: &str) -> Option<CommandRecord> {
        match self.poll_command_inner(uid).await {
            Ok(command) => command,
            Err(e) => {
                debug!(uid, error = %e, "per-uid command poll failed");
                None
            }
        }
    }

    async fn poll_command_inner(&self, uid: &str) -> Result<Option<CommandRecord>> {
        let (_connection, channel) = self.open().await?;
        let routing_key = self.prefixed(&format!("mon.device.command.{uid}"));
        self.declare_bound_queue(&channel, &routing_key).await?;
        let mut consumer = channel
            .basic_consume(
                &routing_key,
                "fleetgate-poll",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        let delivery = match tokio::time::timeout(POLL_TIMEOUT, consumer.next()).await {
            Ok(Some(Ok(delivery))) => delivery,
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(None) | Err(_) => return Ok(None),
        };
        delivery.ack(BasicAckOptions::default()).await?;
        let command: CommandRecord = serde_json::from_slice(&delivery.data)
            .map_err(|e| Error::InvalidParams(e.to_string()))?;
        self.store_command(command.clone());
        Ok(Some(command))
    }

    /// Per-protocol command listener. Consumes
    /// `<env>.mon.device.command.<alias>` forever, storing each command and
    /// handing it to `execute`. A broker failure backs off for a minute and
    /// reconnects; the ingress path never cancels this loop.
    pub async fn run_command_listener<F, Fut>(&self, alias: &str, execute: F)
    where
        F: Fn(CommandRecord) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        loop {
            if let Err(e) = self.listen_once(alias, &execute).await {
                error!(alias, error = %e, "command listener failed");
                tokio::time::sleep(LISTENER_RETRY).await;
            }
        }
    }

    async fn listen_once<F, Fut>(&self, alias: &str, execute: &F) -> Result<()>
    where
        F: Fn(CommandRecord) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let (_connection, channel) = self.open().await?;
        let routing_key = self.prefixed(&format!("mon.device.command.{alias}"));
        self.declare_bound_queue(&channel, &routing_key).await?;
        let mut consumer = channel
            .basic_consume(
                &routing_key,
                "fleetgate-listener",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        debug!(alias, "command listener connected");
        while let Some(delivery) = consumer.next().await {
            let delivery = delivery?;
            delivery.ack(BasicAckOptions::default()).await?;
            match serde_json::from_slice::<CommandRecord>(&delivery.data) {
                Ok(command) => {
                    debug!(uid = %command.uid, action = %command.action, "command received");
                    self.store_command(command.clone());
                    execute(command).await;
                }
                Err(e) => warn!(error = %e, "unparseable command dropped"),
            }
        }
        Ok(())
    }
}
