//! Vendor protocol codecs.
//!
//! Each module owns one wire format: a `Frame` type, a factory that splits a
//! receive buffer into frames keyed on the leading byte(s), and the
//! [`SessionProtocol`] implementation the connection handler drives. The
//! codecs are sans-io; all socket work happens in [`crate::handler`].

pub mod autolink;
pub mod galileo;
pub mod globalsat;
pub mod naviset;
pub mod teltonika;

use bytes::Bytes;
use serde_json::Value;

use crate::error::Result;
use crate::observer::ObserverPacket;

/// SMS message produced for out-of-band device initiation.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SmsMessage {
    pub message: String,
    /// True when `message` is a hex-encoded binary push payload.
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub bin: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub push: bool,
}

impl SmsMessage {
    pub fn text(message: impl Into<String>) -> Self {
        Self { message: message.into(), bin: false, push: false }
    }
}

/// Device-provisioning input assembled by the command path: connection
/// endpoint plus credentials, with gateway defaults filled in.
#[derive(Debug, Clone, Default)]
pub struct InitiationConfig {
    pub identifier: String,
    pub host: String,
    pub port: u16,
    pub device_login: String,
    pub device_password: String,
    pub gprs_apn: String,
    pub gprs_username: String,
    pub gprs_password: String,
}

/// One command about to be written to a live device connection.
#[derive(Debug, Clone, Copy)]
pub struct CommandIssue<'a> {
    pub action: &'a str,
    pub value: Option<&'a Value>,
    /// Identity retained from the connection's head frame.
    pub head: &'a ObserverPacket,
    /// Per-session monotonic command sequence number.
    pub sequence: u32,
}

/// The seam between a vendor codec and the generic connection handler.
///
/// Implementations are pure: given the same frame they must produce the same
/// acknowledgement and the same observer records.
pub trait SessionProtocol: Send + Sync + 'static {
    type Frame: Send + Sync;

    /// Routing-key alias of the protocol (`mon.device.command.<alias>`).
    fn alias(&self) -> &'static str;

    /// Splits one receive burst into frames, in wire order.
    fn frames(&self, buf: &[u8]) -> Result<Vec<Self::Frame>>;

    /// The exact wire bytes of the frame (spooled on downstream failure).
    fn raw(&self, frame: &Self::Frame) -> Bytes;

    /// `Some(uid)` when the frame identifies the device (a header frame).
    fn uid_of(&self, frame: &Self::Frame) -> Option<String>;

    /// Whether an identifying frame carries nothing but the identity. Text
    /// protocols put telemetry on the same line and override this.
    fn header_only(&self, _frame: &Self::Frame) -> bool {
        true
    }

    /// Acknowledgement bytes, a pure function of the inbound frame.
    fn ack_for(&self, frame: &Self::Frame) -> Option<Vec<u8>>;

    /// `Some((partition, chunk))` when the frame carries image data. An
    /// empty chunk terminates the transfer.
    fn image_chunk(&self, _frame: &Self::Frame) -> Option<(u8, Bytes)> {
        None
    }

    /// Normalizes the frame into observer records (without head merge).
    fn translate(&self, frame: &Self::Frame) -> Vec<ObserverPacket>;

    /// Whether `reply` is the expected device echo for a pushed
    /// configuration blob.
    fn config_answer_ok(&self, _sent: &[u8], _reply: &[u8]) -> bool {
        false
    }

    /// Wire bytes for a command addressed to the live device. `Ok(None)`
    /// when the protocol has no such command.
    fn command_bytes(&self, _issue: &CommandIssue<'_>) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    /// `Some(data)` when the frame is the device's reply to an issued
    /// command; the data string is reported back on the bus.
    fn command_reply(&self, _frame: &Self::Frame) -> Option<String> {
        None
    }

    /// Out-of-band initiation payloads (SMS) for the `format` command.
    fn initiation_messages(&self, _config: &InitiationConfig) -> Option<Vec<SmsMessage>> {
        None
    }

    /// Binary configuration blob stored for the device's next contact.
    fn configuration_blob(&self, _config: &InitiationConfig) -> Option<Bytes> {
        None
    }
}
