//! Moves opaque handshake envelopes between paired participants.
//!
//! Each inbox is a single slot: a second send before the recipient has seen
//! the first overwrites it. Callers must not depend on more than one
//! envelope per exchange step arriving.

use tidepool_store::{StoreResult, Subscription};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::feed::Feed;
use crate::model::{ParticipantId, SignalEnvelope};
use crate::records::Records;

pub type SignalFeed = Feed<SignalEnvelope>;

#[derive(Clone)]
pub struct SignalRelay {
    records: Records,
    id: ParticipantId,
}

impl SignalRelay {
    pub fn new(records: Records, id: ParticipantId) -> Self {
        Self { records, id }
    }

    /// Streams envelopes landing in this participant's inbox. Malformed
    /// payloads are logged and dropped; an emptied inbox emits nothing.
    pub async fn observe_incoming_signals(&self) -> StoreResult<SignalFeed> {
        let subscription = self.records.subscribe_inbox(&self.id).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(self.id.clone(), subscription, tx));
        Ok(Feed::new(rx, task))
    }

    /// Overwrites `target`'s inbox. Resolves once the store acknowledged the
    /// write.
    pub async fn send_signal(&self, target: &ParticipantId, envelope: &SignalEnvelope) -> StoreResult<()> {
        trace!(
            participant = %self.id,
            partner = %target,
            kind = envelope.kind.as_str(),
            "sending signal"
        );
        self.records.write_inbox(target, envelope).await
    }
}

async fn run(
    id: ParticipantId,
    mut subscription: Subscription,
    tx: mpsc::UnboundedSender<SignalEnvelope>,
) {
    while let Some(raw) = subscription.recv().await {
        let Some(raw) = raw else {
            continue;
        };
        match SignalEnvelope::decode(&raw) {
            Ok(envelope) => {
                if tx.send(envelope).is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(participant = %id, error = %err, "dropping malformed signal");
            }
        }
    }
    debug!(participant = %id, "inbox subscription closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tidepool_store::{MemoryStore, Store};

    use crate::model::SignalKind;
    use crate::records::inbox_key;

    fn id(raw: &str) -> ParticipantId {
        ParticipantId::new(raw).unwrap()
    }

    #[test_timeout::tokio_timeout_test(secs = 5)]
    async fn sent_envelope_arrives_intact() {
        let store = Arc::new(MemoryStore::new());
        let records = Records::new(store.clone());
        let alice = SignalRelay::new(records.clone(), id("alice"));
        let bob = SignalRelay::new(records, id("bob"));

        let sdp = "v=0\r\no=- 46117317 2 IN IP4 127.0.0.1\r\ns=-\r\n";
        alice
            .send_signal(&id("bob"), &SignalEnvelope::offer(sdp))
            .await
            .unwrap();

        let mut inbox = bob.observe_incoming_signals().await.unwrap();
        let envelope = inbox.recv().await.unwrap();
        assert_eq!(envelope.kind, SignalKind::Offer);
        assert_eq!(envelope.payload, sdp);
    }

    #[test_timeout::tokio_timeout_test(secs = 5)]
    async fn malformed_and_cleared_inboxes_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let records = Records::new(store.clone());
        let bob = SignalRelay::new(records.clone(), id("bob"));
        let mut inbox = bob.observe_incoming_signals().await.unwrap();

        let key = inbox_key(&id("bob"));
        store.set(&key, "definitely not json".into()).await.unwrap();
        store.set(&key, r#"{"kind":"fax","payload":"x"}"#.into()).await.unwrap();
        records.clear_inbox(&id("bob")).await.unwrap();
        SignalRelay::new(records, id("alice"))
            .send_signal(&id("bob"), &SignalEnvelope::chat("still alive"))
            .await
            .unwrap();

        assert_eq!(inbox.recv().await, Some(SignalEnvelope::chat("still alive")));
        assert_eq!(inbox.try_recv(), None);
    }
}
