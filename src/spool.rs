//! On-disk failover spool.
//!
//! When the downstream store rejects a batch, the raw wire bytes (head frame
//! plus the failing frame) are appended under the device uid so a separate
//! restore pass can replay them later.

use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::error::Result;

pub const UNKNOWN_UID: &str = "unknown";

#[derive(Debug, Clone)]
pub struct Spool {
    dir: PathBuf,
}

impl Spool {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, uid: &str) -> PathBuf {
        // uid comes off the wire; only keep filename-safe characters
        let safe: String = uid
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        let name = if safe.is_empty() { UNKNOWN_UID } else { &safe };
        self.dir.join(format!("{name}.bin"))
    }

    /// Appends raw frame bytes for the device. Spooling itself failing is
    /// logged and swallowed; the gateway must keep serving the socket.
    pub async fn save(&self, uid: &str, data: &[u8]) {
        if let Err(e) = self.append(uid, data).await {
            warn!(uid, error = %e, "spool append failed, bytes dropped");
        }
    }

    async fn append(&self, uid: &str, data: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_for(uid))
            .await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }
}
