//! Reassembly of chunked image transfers.
//!
//! Devices stream a photo as numbered partitions; an empty chunk terminates
//! the transfer and the partitions are concatenated in ascending order.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::error::{Error, Result};

/// Confirmation codes echoed to the device after an image frame. Upstream
/// firmware documentation assigned 16 to both outcomes; the corrupt code is
/// remapped to 17 here so the two can be told apart on the wire.
pub const IMAGE_PACKET_CONFIRM_OK: u8 = 16;
pub const IMAGE_PACKET_CONFIRM_CORRUPT: u8 = 17;

/// Upper bound on accumulated image bytes per connection. A device that
/// never sends the terminator cannot grow the buffer without bound.
pub const MAX_IMAGE_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Default)]
pub struct ImageTransfer {
    parts: BTreeMap<u8, Bytes>,
    total: usize,
}

pub enum ImageProgress {
    /// Chunk stored, transfer continues.
    InProgress,
    /// Terminator received; the full image in partition order.
    Complete(Vec<u8>),
}

impl ImageTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        !self.parts.is_empty()
    }

    /// Feeds one image frame. `partition` orders the chunk; an empty chunk
    /// is the terminal marker.
    pub fn push(&mut self, partition: u8, chunk: Bytes) -> Result<ImageProgress> {
        if chunk.is_empty() {
            return self.finish().map(ImageProgress::Complete);
        }
        self.total += chunk.len();
        if self.total > MAX_IMAGE_BYTES {
            self.clear();
            return Err(Error::ImageTransferCorrupt(format!(
                "transfer exceeded {} bytes",
                MAX_IMAGE_BYTES
            )));
        }
        self.parts.insert(partition, chunk);
        Ok(ImageProgress::InProgress)
    }

    fn finish(&mut self) -> Result<Vec<u8>> {
        if self.parts.is_empty() {
            return Err(Error::ImageTransferCorrupt(
                "terminator without any partitions".into(),
            ));
        }
        // partition numbers must be contiguous from the first one received
        let first = *self.parts.keys().next().unwrap();
        let gap = self
            .parts
            .keys()
            .enumerate()
            .find(|(i, &got)| got as usize != first as usize + i)
            .map(|(i, &got)| (first as usize + i, got));
        if let Some((want, got)) = gap {
            self.clear();
            return Err(Error::ImageTransferCorrupt(format!(
                "gap in partitions: expected {}, found {}",
                want, got
            )));
        }
        let mut image = Vec::with_capacity(self.total);
        for chunk in self.parts.values() {
            image.extend_from_slice(chunk);
        }
        self.clear();
        Ok(image)
    }

    pub fn clear(&mut self) {
        self.parts.clear();
        self.total = 0;
    }
}
