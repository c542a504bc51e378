//! Id → bounded queue registry
//!
//! One registry per session maps stream ids to the queue feeding that
//! stream's bridge; the server keeps another mapping connection ids to
//! session ingress queues. Ids come from an atomic counter starting at 1
//! and are never reused.

use super::TunnelError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time;

/// Concurrency-safe registry of bounded queues
#[derive(Debug)]
pub struct Registry<T> {
    next_id: AtomicU64,
    entries: RwLock<HashMap<u64, mpsc::Sender<T>>>,
    capacity: usize,
}

impl<T> Registry<T> {
    /// Create a registry whose queues hold `capacity` messages
    pub fn new(capacity: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Allocate the next id and its queue
    pub async fn create(&self) -> (u64, mpsc::Receiver<T>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);

        self.entries.write().await.insert(id, tx);
        (id, rx)
    }

    /// Sending half of the queue for `id`
    pub async fn get(&self, id: u64) -> Result<mpsc::Sender<T>, TunnelError> {
        self.entries
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(TunnelError::StreamNotFound(id))
    }

    /// Remove `id`. Its queue closes once in-flight senders are dropped.
    pub async fn delete(&self, id: u64) -> bool {
        self.entries.write().await.remove(&id).is_some()
    }

    /// Deliver `msg` to `id`, waiting at most `timeout` for queue space
    pub async fn dispatch(&self, id: u64, msg: T, timeout: Duration) -> Result<(), TunnelError> {
        let tx = self.get(id).await?;

        match time::timeout(timeout, tx.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TunnelError::StreamClosed),
            Err(_) => Err(TunnelError::QueueFull(id)),
        }
    }

    /// Remove every entry, closing all queues
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Registered ids
    pub async fn ids(&self) -> Vec<u64> {
        self.entries.read().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
