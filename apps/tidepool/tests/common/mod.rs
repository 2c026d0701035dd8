#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tidepool::tidepool_store::{
    MemoryStore, Store, StoreError, StoreResult, Subscription,
};
use tidepool::{MatchState, ParticipantId};
use tokio::sync::{watch, Barrier};

pub fn id(raw: &str) -> ParticipantId {
    ParticipantId::new(raw).unwrap()
}

/// [`MemoryStore`] with knobs for the failure modes the protocol has to
/// survive.
#[derive(Default)]
pub struct ScriptedStore {
    inner: MemoryStore,
    fail_scans: AtomicBool,
    scans: AtomicUsize,
    scan_gate: Mutex<Option<Arc<Barrier>>>,
    failing_sets: Mutex<HashMap<String, usize>>,
    set_attempts: Mutex<HashMap<String, usize>>,
}

impl ScriptedStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.inner
    }

    /// Every scan fails with [`StoreError::Unavailable`].
    pub fn fail_scans(&self, fail: bool) {
        self.fail_scans.store(fail, Ordering::SeqCst);
    }

    /// Scans take their snapshot, then wait until `parties` scans are in
    /// flight before returning it.
    pub fn gate_scans(&self, parties: usize) {
        *self.scan_gate.lock().unwrap() = Some(Arc::new(Barrier::new(parties)));
    }

    /// The next `times` writes to `key` are rejected.
    pub fn fail_sets(&self, key: &str, times: usize) {
        self.failing_sets
            .lock()
            .unwrap()
            .insert(key.to_string(), times);
    }

    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    pub fn set_attempts(&self, key: &str) -> usize {
        self.set_attempts
            .lock()
            .unwrap()
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Store for ScriptedStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: String) -> StoreResult<()> {
        *self
            .set_attempts
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default() += 1;
        let rejected = {
            let mut failing = self.failing_sets.lock().unwrap();
            match failing.get_mut(key) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };
        if rejected {
            return Err(StoreError::Rejected {
                key: key.to_string(),
                reason: "scripted failure".into(),
            });
        }
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        self.inner.remove(key).await
    }

    async fn subscribe(&self, key: &str) -> StoreResult<Subscription> {
        self.inner.subscribe(key).await
    }

    async fn scan(&self, prefix: &str) -> StoreResult<Vec<(String, String)>> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        if self.fail_scans.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("scripted outage".into()));
        }
        let snapshot = self.inner.scan(prefix).await?;
        let gate = self.scan_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.wait().await;
        }
        Ok(snapshot)
    }
}

/// Waits until the watched state satisfies `accept`, returning it.
pub async fn wait_for_state(
    states: &mut watch::Receiver<MatchState>,
    accept: impl Fn(&MatchState) -> bool,
) -> MatchState {
    let wait = async {
        loop {
            {
                let state = states.borrow_and_update();
                if accept(&state) {
                    return state.clone();
                }
            }
            if states.changed().await.is_err() {
                panic!("session ended before reaching the expected state");
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("timed out waiting for match state")
}
