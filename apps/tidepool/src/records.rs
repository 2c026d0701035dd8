//! Typed access to participant documents in the store.
//!
//! ```text
//! /participants/{id}/status  -> StatusRecord JSON
//! /participants/{id}/inbox   -> SignalEnvelope JSON (single slot)
//! ```

use tidepool_store::{SharedStore, StoreResult, Subscription};
use tracing::{debug, trace};

use crate::model::{ParticipantId, SignalEnvelope, StatusObservation, StatusRecord};

pub const PARTICIPANTS_ROOT: &str = "/participants/";
const STATUS_LEAF: &str = "/status";
const INBOX_LEAF: &str = "/inbox";

pub fn status_key(id: &ParticipantId) -> String {
    format!("{PARTICIPANTS_ROOT}{id}{STATUS_LEAF}")
}

pub fn inbox_key(id: &ParticipantId) -> String {
    format!("{PARTICIPANTS_ROOT}{id}{INBOX_LEAF}")
}

/// Participant owning a status key, `None` for any other key.
pub fn participant_from_status_key(key: &str) -> Option<ParticipantId> {
    let id = key
        .strip_prefix(PARTICIPANTS_ROOT)?
        .strip_suffix(STATUS_LEAF)?;
    ParticipantId::new(id).ok()
}

#[derive(Clone)]
pub struct Records {
    store: SharedStore,
}

impl Records {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Overwrites `id`'s status. Used by a participant on its own record, and
    /// on somebody else's record as a claim.
    pub async fn write_status(&self, id: &ParticipantId, record: &StatusRecord) -> StoreResult<()> {
        trace!(participant = %id, kind = record.kind().as_str(), "writing status");
        self.store.set(&status_key(id), record.encode()).await
    }

    /// Writes another participant's status (the claim primitive).
    pub async fn update_participant_status(
        &self,
        target: &ParticipantId,
        record: &StatusRecord,
    ) -> StoreResult<()> {
        debug!(target_participant = %target, kind = record.kind().as_str(), "updating participant status");
        self.write_status(target, record).await
    }

    pub async fn read_status(&self, id: &ParticipantId) -> StoreResult<StatusObservation> {
        let raw = self.store.get(&status_key(id)).await?;
        Ok(StatusObservation::decode(raw.as_deref()))
    }

    pub async fn subscribe_status(&self, id: &ParticipantId) -> StoreResult<Subscription> {
        self.store.subscribe(&status_key(id)).await
    }

    pub async fn clear_inbox(&self, id: &ParticipantId) -> StoreResult<()> {
        trace!(participant = %id, "clearing inbox");
        self.store.remove(&inbox_key(id)).await
    }

    pub async fn write_inbox(&self, target: &ParticipantId, envelope: &SignalEnvelope) -> StoreResult<()> {
        self.store.set(&inbox_key(target), envelope.encode()).await
    }

    pub async fn subscribe_inbox(&self, id: &ParticipantId) -> StoreResult<Subscription> {
        self.store.subscribe(&inbox_key(id)).await
    }

    /// Every participant whose status decodes as `Searching`, in store order.
    pub async fn searching_participants(&self) -> StoreResult<Vec<ParticipantId>> {
        Ok(self
            .statuses()
            .await?
            .into_iter()
            .filter(|(_, observation)| {
                matches!(observation, StatusObservation::Record(StatusRecord::Searching))
            })
            .map(|(id, _)| id)
            .collect())
    }

    /// Point-in-time view of every status record in the pool.
    pub async fn statuses(&self) -> StoreResult<Vec<(ParticipantId, StatusObservation)>> {
        let entries = self.store.scan(PARTICIPANTS_ROOT).await?;
        Ok(entries
            .into_iter()
            .filter_map(|(key, value)| {
                let id = participant_from_status_key(&key)?;
                Some((id, StatusObservation::decode(Some(&value))))
            })
            .collect())
    }
}
