//! The participant's own matchmaking lifecycle.
//!
//! `Idle → Searching → Offered/Received → Connected`, cyclic: going back to
//! `Searching` starts over. The machine never polls. It reacts to pushes on
//! the participant's status key and rewrites any record it cannot interpret
//! to `Searching` rather than leaving the participant stranded.

use tidepool_store::{StoreResult, Subscription};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::feed::Feed;
use crate::model::{MatchState, ParticipantId, StatusObservation, StatusRecord};
use crate::records::Records;

pub type StatusFeed = Feed<MatchState>;

/// Outcome of interpreting one status notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Deliver(MatchState),
    /// The record is unusable: rewrite it to `Searching`, then deliver
    /// `Searching`.
    Reset,
}

pub fn resolve(observation: &StatusObservation) -> Resolution {
    match observation {
        StatusObservation::Record(record) => Resolution::Deliver(MatchState::from(record)),
        StatusObservation::Absent
        | StatusObservation::Unrecognized { .. }
        | StatusObservation::Malformed { .. } => Resolution::Reset,
    }
}

#[derive(Clone)]
pub struct StatusMachine {
    records: Records,
    id: ParticipantId,
}

impl StatusMachine {
    pub fn new(records: Records, id: ParticipantId) -> Self {
        Self { records, id }
    }

    /// Starts a fresh matchmaking cycle and streams the participant's state.
    ///
    /// Clears the inbox, marks the participant `Searching`, then subscribes
    /// to its status key. One [`MatchState`] is emitted per notification, in
    /// notification order, including the echo of this call's own write.
    pub async fn observe(&self) -> StoreResult<StatusFeed> {
        self.records.clear_inbox(&self.id).await?;
        self.records.write_status(&self.id, &StatusRecord::Searching).await?;
        let subscription = self.records.subscribe_status(&self.id).await?;
        info!(participant = %self.id, "observing status");

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(self.clone(), subscription, tx));
        Ok(Feed::new(rx, task))
    }

    /// Maps one notification to a state, healing the record when needed.
    pub async fn interpret(&self, raw: Option<&str>) -> MatchState {
        let observation = StatusObservation::decode(raw);
        match resolve(&observation) {
            Resolution::Deliver(state) => state,
            Resolution::Reset => {
                warn!(
                    participant = %self.id,
                    ?observation,
                    "unusable status record, resetting to searching"
                );
                if let Err(err) = self
                    .records
                    .write_status(&self.id, &StatusRecord::Searching)
                    .await
                {
                    warn!(participant = %self.id, error = %err, "status reset failed");
                }
                MatchState::Searching
            }
        }
    }
}

async fn run(
    machine: StatusMachine,
    mut subscription: Subscription,
    tx: mpsc::UnboundedSender<MatchState>,
) {
    while let Some(raw) = subscription.recv().await {
        let state = machine.interpret(raw.as_deref()).await;
        if tx.send(state).is_err() {
            break;
        }
    }
    debug!(participant = %machine.id, "status subscription closed");
}
