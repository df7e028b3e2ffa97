//! Sender side of asset synchronization

use crate::SyncError;
use bytes::Bytes;
use meshstream_assets::{AssetHash, AssetKind, AssetStore, ConfigBlob};
use meshstream_codec::TileGrid;
use meshstream_network::{Message, NetworkError, CHUNK_SIZE};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Split a blob into chunk messages of at most [`CHUNK_SIZE`] bytes.
///
/// An empty blob still produces one chunk so the receiver sees completion.
pub fn chunk_blob(kind: AssetKind, object_id: u8, blob: &Bytes) -> Result<Vec<Message>, NetworkError> {
    let count = blob.len().div_ceil(CHUNK_SIZE).max(1);
    let total =
        u8::try_from(count).map_err(|_| NetworkError::AssetTooLarge { len: blob.len() })?;

    let messages = (0..count)
        .map(|i| {
            let start = i * CHUNK_SIZE;
            let end = (start + CHUNK_SIZE).min(blob.len());
            Message::Chunk {
                kind,
                object_id,
                total,
                index: i as u8 + 1,
                payload: blob.slice(start..end),
            }
        })
        .collect();
    Ok(messages)
}

/// Answers fetch and resend-config requests from a shared store
pub struct AssetPublisher {
    store: Arc<AssetStore>,
    config: ConfigBlob,
}

impl AssetPublisher {
    /// Snapshot the store into the advertisement sent to new connections.
    /// `meshes` lists one hash per streamed mesh in stream order.
    pub fn new(
        store: Arc<AssetStore>,
        grid: TileGrid,
        timestamp: u32,
        meshes: &[AssetHash],
    ) -> Result<Self, SyncError> {
        let config = ConfigBlob::from_store(&store, grid, timestamp, meshes)?;
        info!(
            "Advertising {} textures, {} materials, {} meshes",
            config.textures.len(),
            config.materials.len(),
            config.meshes.len()
        );
        Ok(Self { store, config })
    }

    pub fn store(&self) -> &Arc<AssetStore> {
        &self.store
    }

    pub fn config(&self) -> &ConfigBlob {
        &self.config
    }

    /// Re-snapshot textures and materials after assets were added. The mesh
    /// list is kept.
    pub fn refresh(&mut self, timestamp: u32) -> Result<(), SyncError> {
        self.config =
            ConfigBlob::from_store(&self.store, self.config.grid, timestamp, &self.config.meshes)?;
        Ok(())
    }

    /// The advertisement pushed on connect
    pub fn config_message(&self) -> Message {
        Message::Config(self.config.clone())
    }

    /// Messages answering `request`, or `None` if it is not a sync request
    pub fn respond(&self, request: &Message) -> Result<Option<Vec<Message>>, SyncError> {
        match request {
            Message::ResendConfig => {
                debug!("Resending config");
                Ok(Some(vec![self.config_message()]))
            }
            Message::Fetch {
                kind,
                hash,
                object_id,
            } => match self.store.get(*kind, *hash) {
                Ok(blob) => {
                    let chunks = chunk_blob(*kind, *object_id, &blob)?;
                    debug!(
                        "Serving {kind} {hash} as #{object_id} in {} chunks",
                        chunks.len()
                    );
                    Ok(Some(chunks))
                }
                Err(_) => {
                    warn!("Fetch for unknown {kind} {hash}");
                    Ok(Some(vec![Message::Miss {
                        kind: *kind,
                        object_id: *object_id,
                    }]))
                }
            },
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_boundaries() {
        let blob = Bytes::from(vec![7u8; CHUNK_SIZE * 2 + 10]);
        let chunks = chunk_blob(AssetKind::Texture, 3, &blob).unwrap();
        assert_eq!(chunks.len(), 3);

        let sizes: Vec<usize> = chunks
            .iter()
            .map(|m| match m {
                Message::Chunk {
                    total,
                    payload,
                    object_id,
                    ..
                } => {
                    assert_eq!(*total, 3);
                    assert_eq!(*object_id, 3);
                    payload.len()
                }
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(sizes, vec![CHUNK_SIZE, CHUNK_SIZE, 10]);
    }

    #[test]
    fn test_exact_multiple_has_no_empty_tail() {
        let blob = Bytes::from(vec![0u8; CHUNK_SIZE]);
        assert_eq!(chunk_blob(AssetKind::Mesh, 0, &blob).unwrap().len(), 1);
    }

    #[test]
    fn test_empty_blob_single_chunk() {
        let chunks = chunk_blob(AssetKind::Mesh, 0, &Bytes::new()).unwrap();
        assert!(matches!(
            chunks.as_slice(),
            [Message::Chunk { total: 1, index: 1, .. }]
        ));
    }

    #[test]
    fn test_oversized_blob_rejected() {
        let blob = Bytes::from(vec![0u8; CHUNK_SIZE * 255 + 1]);
        assert!(matches!(
            chunk_blob(AssetKind::Texture, 0, &blob),
            Err(NetworkError::AssetTooLarge { .. })
        ));
    }

    #[test]
    fn test_respond_miss_for_unknown_hash() {
        let publisher =
            AssetPublisher::new(Arc::new(AssetStore::new()), TileGrid::default(), 0, &[]).unwrap();
        let response = publisher
            .respond(&Message::Fetch {
                kind: AssetKind::Texture,
                hash: AssetHash(0xAABBCCDD),
                object_id: 0,
            })
            .unwrap()
            .unwrap();
        assert_eq!(
            response,
            vec![Message::Miss {
                kind: AssetKind::Texture,
                object_id: 0
            }]
        );
        assert_eq!(
            response[0].to_bytes().unwrap().as_ref(),
            &[0x24, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_respond_ignores_stream_messages() {
        let publisher =
            AssetPublisher::new(Arc::new(AssetStore::new()), TileGrid::default(), 0, &[]).unwrap();
        assert!(publisher.respond(&Message::Ack).unwrap().is_none());
    }
}
