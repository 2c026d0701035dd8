//! Shared subscribable key-value store.
//!
//! Every participant in a tidepool coordinates exclusively through this
//! store. The contract is deliberately weak:
//!
//! * writes are **last-write-wins per key**; there is no compare-and-set and
//!   no transaction spanning two keys,
//! * a [`Subscription`] yields the value held when it was opened, then one
//!   notification per later write, in write order for that key,
//! * nothing is ordered across different keys.
//!
//! Correctness of the matchmaking protocol rests on participants only writing
//! the keys the protocol allows them to; the store enforces no access control.

mod memory;
#[cfg(feature = "redis")]
mod redis_store;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

/// Value observed for a key: `None` means the key is absent.
pub type Notification = Option<String>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("write to {key} rejected: {reason}")]
    Rejected { key: String, reason: String },
    #[error("store closed")]
    Closed,
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    /// Point-in-time read.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Overwrites `key`. Resolves once the backend has acknowledged the write.
    async fn set(&self, key: &str, value: String) -> StoreResult<()>;

    /// Deletes `key`; subscribers observe `None`.
    async fn remove(&self, key: &str) -> StoreResult<()>;

    /// Opens a push subscription on `key`. The first notification is the
    /// current value.
    async fn subscribe(&self, key: &str) -> StoreResult<Subscription>;

    /// Point-in-time listing of every key starting with `prefix`, in the
    /// backend's iteration order (sorted by key for the bundled backends).
    async fn scan(&self, prefix: &str) -> StoreResult<Vec<(String, String)>>;
}

pub type SharedStore = Arc<dyn Store>;

/// Cancellable stream of notifications for one key.
///
/// Dropping the subscription tears it down; stored data is never touched.
pub struct Subscription {
    key: String,
    rx: mpsc::UnboundedReceiver<Notification>,
    forwarder: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(key: impl Into<String>, rx: mpsc::UnboundedReceiver<Notification>) -> Self {
        Self {
            key: key.into(),
            rx,
            forwarder: None,
        }
    }

    /// Subscription fed by a background task that is aborted on drop.
    pub fn with_forwarder(
        key: impl Into<String>,
        rx: mpsc::UnboundedReceiver<Notification>,
        forwarder: JoinHandle<()>,
    ) -> Self {
        Self {
            key: key.into(),
            rx,
            forwarder: Some(forwarder),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Waits for the next notification. `None` once the store side has gone
    /// away.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("key", &self.key).finish()
    }
}
