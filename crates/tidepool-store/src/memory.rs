use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::{Notification, Store, StoreError, StoreResult, Subscription};

/// Process-local store for tests, simulations and single-process pools.
///
/// Watchers hang off unbounded channels so a slow subscriber never loses a
/// notification, and registration happens under the same lock as writes so
/// a subscriber cannot miss one either.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    values: BTreeMap<String, String>,
    watchers: HashMap<String, Vec<mpsc::UnboundedSender<Notification>>>,
    closed: bool,
}

impl Inner {
    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn notify(&mut self, key: &str, value: &Notification) {
        let Some(watchers) = self.watchers.get_mut(key) else {
            return;
        };
        watchers.retain(|tx| tx.send(value.clone()).is_ok());
        if watchers.is_empty() {
            self.watchers.remove(key);
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shuts the store down: open subscriptions end and every later call
    /// fails with [`StoreError::Closed`].
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.watchers.clear();
    }

    /// Number of live subscriptions on `key`.
    pub fn watcher_count(&self, key: &str) -> usize {
        let mut inner = self.inner.lock();
        match inner.watchers.get_mut(key) {
            Some(watchers) => {
                watchers.retain(|tx| !tx.is_closed());
                watchers.len()
            }
            None => 0,
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let inner = self.inner.lock();
        inner.ensure_open()?;
        Ok(inner.values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;
        trace!(%key, "memory store set");
        inner.values.insert(key.to_string(), value.clone());
        inner.notify(key, &Some(value));
        Ok(())
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;
        trace!(%key, "memory store remove");
        inner.values.remove(key);
        inner.notify(key, &None);
        Ok(())
    }

    async fn subscribe(&self, key: &str) -> StoreResult<Subscription> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        // Receiver is alive, the send cannot fail.
        let _ = tx.send(inner.values.get(key).cloned());
        inner.watchers.entry(key.to_string()).or_default().push(tx);
        Ok(Subscription::new(key, rx))
    }

    async fn scan(&self, prefix: &str) -> StoreResult<Vec<(String, String)>> {
        let inner = self.inner.lock();
        inner.ensure_open()?;
        Ok(inner
            .values
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}
