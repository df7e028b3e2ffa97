//! Chunk reassembly for one in-flight asset request

use crate::SyncError;
use bytes::{Bytes, BytesMut};
use meshstream_assets::AssetKind;

/// Accumulates the chunks of one blob in arrival order
#[derive(Debug)]
pub struct Reassembly {
    kind: AssetKind,
    object_id: u8,
    total: Option<u8>,
    received: u8,
    buffer: BytesMut,
}

impl Reassembly {
    pub fn new(kind: AssetKind, object_id: u8) -> Self {
        Self {
            kind,
            object_id,
            total: None,
            received: 0,
            buffer: BytesMut::new(),
        }
    }

    pub fn kind(&self) -> AssetKind {
        self.kind
    }

    pub fn object_id(&self) -> u8 {
        self.object_id
    }

    /// Chunks accepted so far
    pub fn received(&self) -> u8 {
        self.received
    }

    /// Drop any partial data, e.g. before a re-request
    pub fn reset(&mut self) {
        self.total = None;
        self.received = 0;
        self.buffer.clear();
    }

    /// Append one chunk. Returns the complete blob once `index == total`.
    ///
    /// Chunks must belong to this request and arrive in order. An out of order
    /// chunk drops the partial buffer.
    pub fn push(
        &mut self,
        kind: AssetKind,
        object_id: u8,
        total: u8,
        index: u8,
        payload: &[u8],
    ) -> Result<Option<Bytes>, SyncError> {
        if kind != self.kind || object_id != self.object_id {
            // Stray chunk of another request, keep our progress
            return Err(SyncError::UnexpectedChunk {
                kind,
                object_id,
                reason: format!("awaiting {} #{}", self.kind, self.object_id),
            });
        }
        if let Some(expected) = self.total {
            if expected != total {
                return Err(self.unexpected(format!(
                    "total changed from {expected} to {total}"
                )));
            }
        }
        if total == 0 || index != self.received.wrapping_add(1) || index > total {
            return Err(self.unexpected(format!(
                "chunk {index} of {total} after {} chunks",
                self.received
            )));
        }

        self.total = Some(total);
        self.received = index;
        self.buffer.extend_from_slice(payload);

        if index == total {
            let blob = self.buffer.split().freeze();
            self.reset();
            Ok(Some(blob))
        } else {
            Ok(None)
        }
    }

    fn unexpected(&mut self, reason: String) -> SyncError {
        self.reset();
        SyncError::UnexpectedChunk {
            kind: self.kind,
            object_id: self.object_id,
            reason,
        }
    }
}
