//! Firmware download over HDLL
//!
//! The image is streamed in chunks; every chunk but the last carries the
//! chunk-follows flag and each must be acknowledged with status zero. The
//! channel is switched to HDLL framing for the download and back to UCI
//! afterwards, whatever the outcome.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};
use uwb_core::{FramingMode, UciError, UciResult};

use crate::codec::header;
use crate::config::FirmwareConfig;
use crate::retry::RetryController;

/// HDLL message type for host-originated frames
const HDLL_MSG_COMMAND: u8 = 0x00;
/// HDLL opcode for a firmware write
const HDLL_OP_WRITE: u8 = 0x01;

/// A firmware image held in memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Bytes,
}

impl FirmwareImage {
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    pub fn load(path: impl AsRef<Path>) -> UciResult<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| {
            UciError::ResourceCreation(format!(
                "cannot read firmware image {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Self::from_bytes(data))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Split into chunks of at most `max` bytes
    pub fn chunks(&self, max: usize) -> impl Iterator<Item = Bytes> + '_ {
        let max = max.max(1);
        (0..self.data.len())
            .step_by(max)
            .map(move |start| self.data.slice(start..(start + max).min(self.data.len())))
    }
}

pub struct FirmwareLoader {
    retry: Arc<RetryController>,
    max_chunk_len: usize,
    chunk_timeout: Duration,
}

impl FirmwareLoader {
    pub fn new(retry: Arc<RetryController>, config: &FirmwareConfig) -> Self {
        Self {
            retry,
            max_chunk_len: config.max_chunk_len.clamp(1, header::MAX_HDLL_PAYLOAD),
            chunk_timeout: config.chunk_timeout(),
        }
    }

    /// Download the image; returns the number of chunks sent
    pub async fn download(&self, image: &FirmwareImage) -> UciResult<usize> {
        if image.is_empty() {
            return Err(UciError::InvalidFrame("firmware image is empty".to_string()));
        }

        let channel = self.retry.channel();
        channel.set_mode(FramingMode::Hdll)?;
        let result = self.send_chunks(image).await;
        if let Err(e) = channel.set_mode(FramingMode::Uci) {
            warn!(error = %e, "Could not restore UCI framing");
        }

        match &result {
            Ok(chunks) => info!(bytes = image.len(), chunks, "Firmware download complete"),
            Err(e) => warn!(error = %e, "Firmware download failed"),
        }
        result
    }

    async fn send_chunks(&self, image: &FirmwareImage) -> UciResult<usize> {
        let total = image.len().div_ceil(self.max_chunk_len);

        for (index, chunk) in image.chunks(self.max_chunk_len).enumerate() {
            let more = index + 1 < total;
            let frame = header::hdll_frame(more, HDLL_MSG_COMMAND, HDLL_OP_WRITE, chunk);
            let bytes = header::encode_bootstrap(&frame)?;

            debug!(chunk = index, of = total, len = frame.payload.len(), "Sending firmware chunk");
            let reply = self.retry.send_raw(&bytes, self.chunk_timeout).await?;

            match reply.payload().first().copied() {
                Some(0x00) => {}
                Some(status) => {
                    return Err(UciError::FirmwareRejected {
                        chunk: index,
                        status,
                    })
                }
                None => {
                    return Err(UciError::InvalidFrame(format!(
                        "empty acknowledgement for chunk {}",
                        index
                    )))
                }
            }
        }
        Ok(total)
    }
}
