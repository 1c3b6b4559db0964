//! # fleetgate - Multi-protocol GPS/telematics ingestion gateway
//!
//! Accepts long-lived TCP connections from heterogeneous fleet-tracking
//! devices, decodes each vendor's wire format, normalizes the records into
//! a common observer shape and forwards them downstream (AMQP fan-out plus
//! an HTTP pipe). In the reverse direction it consumes commands from AMQP,
//! dispatches them to the matching live device session and reports results
//! back on the bus.
//!
//! ## Features
//!
//! - Autolink, Galileo, Naviset, Teltonika FMXXXX and Globalsat TR-151
//!   codecs behind one sans-io [`protocols::SessionProtocol`] seam
//! - Per-connection dispatch state machine: identification, bit-exact
//!   acknowledgements, image reassembly, pending-configuration handshake
//! - Worker-sharded AMQP publishing and the command round-trip
//! - Failover spool: raw wire bytes survive downstream outages
//!
//! ## Example Usage
//!
//! ```rust
//! use fleetgate::protocols::naviset::Naviset;
//! use fleetgate::protocols::SessionProtocol;
//!
//! let frames = Naviset.frames(&[
//!     0x12, 0x00, 0x01, 0x00, b'0', b'1', b'2', b'8', b'9', b'6', b'0',
//!     b'0', b'1', b'6', b'0', b'9', b'1', b'2', b'9', 0x06, 0x9F, 0xB9,
//! ])?;
//! let uid = Naviset.uid_of(&frames[0]);
//! assert_eq!(uid.as_deref(), Some("012896001609129"));
//! # Ok::<(), fleetgate::error::Error>(())
//! ```

pub mod bits;
pub mod broker;
pub mod checksum;
pub mod commands;
pub mod devices;
pub mod error;
pub mod frame;
pub mod handler;
pub mod image;
pub mod observer;
pub mod pipe;
pub mod protocols;
pub mod server;
pub mod settings;
pub mod spool;

pub use error::{Error, Result};
pub use observer::ObserverPacket;
pub use protocols::SessionProtocol;
