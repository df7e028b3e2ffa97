use async_trait::async_trait;
use bytes::Bytes;
use meshstream_network::{ConnectionId, MessageChannel, MessageStats, NetworkError};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct NetworkConditions {
    /// Loss probability for unreliable messages (0.0 to 1.0)
    pub packet_loss: f64,
    /// Duplicate probability for unreliable messages (0.0 to 1.0)
    pub duplicate_probability: f64,
    /// Seed for the loss decisions
    pub seed: u64,
}

impl Default for NetworkConditions {
    fn default() -> Self {
        Self {
            packet_loss: 0.0,
            duplicate_probability: 0.0,
            seed: 7,
        }
    }
}

impl NetworkConditions {
    /// Perfect network conditions
    pub fn perfect() -> Self {
        Self::default()
    }

    /// Typical mobile network
    pub fn mobile() -> Self {
        Self {
            packet_loss: 0.02,
            duplicate_probability: 0.001,
            ..Self::default()
        }
    }

    /// Poor network conditions
    pub fn poor() -> Self {
        Self {
            packet_loss: 0.10,
            duplicate_probability: 0.02,
            ..Self::default()
        }
    }
}

/// Wraps a channel and degrades its unreliable class. Reliable sends pass
/// through untouched unless a send failure was scheduled.
pub struct LossyChannel<C> {
    inner: C,
    conditions: Mutex<NetworkConditions>,
    rng: Mutex<StdRng>,
    fail_next: AtomicU32,
    dropped: AtomicU32,
}

impl<C: MessageChannel> LossyChannel<C> {
    pub fn new(inner: C, conditions: NetworkConditions) -> Self {
        Self {
            inner,
            rng: Mutex::new(StdRng::seed_from_u64(conditions.seed)),
            conditions: Mutex::new(conditions),
            fail_next: AtomicU32::new(0),
            dropped: AtomicU32::new(0),
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn update_conditions(&self, conditions: NetworkConditions) {
        *self.conditions.lock() = conditions;
    }

    /// Make the next `count` sends fail as if no peer were reachable
    pub fn fail_next_sends(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Unreliable messages dropped so far
    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<C: MessageChannel> MessageChannel for LossyChannel<C> {
    async fn send(
        &self,
        connection: ConnectionId,
        payload: Bytes,
        reliable: bool,
    ) -> Result<(), NetworkError> {
        let scheduled_failure = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scheduled_failure {
            return Err(NetworkError::NoConnection);
        }

        if !reliable {
            let conditions = self.conditions.lock().clone();
            let (lost, duplicated) = {
                let mut rng = self.rng.lock();
                (
                    rng.gen::<f64>() < conditions.packet_loss,
                    rng.gen::<f64>() < conditions.duplicate_probability,
                )
            };
            if lost {
                self.dropped.fetch_add(1, Ordering::SeqCst);
                return Ok(());
            }
            if duplicated {
                self.inner.send(connection, payload.clone(), false).await?;
            }
        }

        self.inner.send(connection, payload, reliable).await
    }

    fn connections(&self) -> Vec<ConnectionId> {
        self.inner.connections()
    }

    async fn disconnect(&self, connection: ConnectionId) {
        self.inner.disconnect(connection).await;
    }

    async fn close(&self) {
        self.inner.close().await;
    }

    fn stats(&self) -> MessageStats {
        self.inner.stats()
    }
}
