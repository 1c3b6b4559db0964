use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Malformed frame at offset {offset}: {reason}")]
    MalformedFrame { reason: String, offset: usize },

    #[error("No packet class for prefix 0x{0:02X}")]
    UnknownPrefix(u8),

    #[error("Data frame received before header frame")]
    UnidentifiedSession,

    #[error("Downstream unavailable: {0}")]
    DownstreamUnavailable(String),

    #[error("Device did not echo the expected configuration answer")]
    ConfigHandshakeFailed,

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Image transfer corrupt: {0}")]
    ImageTransferCorrupt(String),

    #[error("Unknown command action: {0}")]
    UnknownAction(String),

    #[error("Timeout waiting for device response")]
    Timeout,

    #[error("Broker error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("Pipe error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid command parameters: {0}")]
    InvalidParams(String),
}

impl Error {
    /// Shorthand used by the frame cursor and the protocol parsers.
    pub fn malformed(reason: impl Into<String>, offset: usize) -> Self {
        Error::MalformedFrame {
            reason: reason.into(),
            offset,
        }
    }
}
