//! One-shot search for a partner.
//!
//! The claim is two independent writes: the candidate's status becomes
//! `Received(self)` and our own becomes `Offered(candidate)`. Nothing makes
//! them atomic, and nothing stops the candidate from claiming us in the same
//! instant. When that happens, last write wins on each key and the pair may
//! end up `Offered/Offered`, `Received/Received` or consistent; the window
//! closes once either side moves on.

use tidepool_store::StoreResult;
use tracing::{debug, info, warn};

use crate::model::{ParticipantId, StatusRecord};
use crate::records::Records;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// We claimed this participant.
    Claimed(ParticipantId),
    /// Nobody else is searching (or the pool could not be queried); stay
    /// discoverable and wait to be claimed.
    Waiting,
}

/// First candidate that is not `own`, in the order the store listed them.
pub fn select_candidate<'a>(
    own: &ParticipantId,
    candidates: &'a [ParticipantId],
) -> Option<&'a ParticipantId> {
    candidates.iter().find(|candidate| *candidate != own)
}

#[derive(Clone)]
pub struct Matcher {
    records: Records,
    id: ParticipantId,
}

impl Matcher {
    pub fn new(records: Records, id: ParticipantId) -> Self {
        Self { records, id }
    }

    /// Clears the inbox, queries the pool once and claims the first other
    /// `Searching` participant.
    ///
    /// A failed query degrades to [`MatchOutcome::Waiting`]. A failed write
    /// is returned; callers retry by calling this again.
    pub async fn find_next_match(&self) -> StoreResult<MatchOutcome> {
        self.records.clear_inbox(&self.id).await?;

        let candidates = match self.records.searching_participants().await {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(participant = %self.id, error = %err, "pool query failed, waiting to be claimed");
                return Ok(MatchOutcome::Waiting);
            }
        };
        let Some(candidate) = select_candidate(&self.id, &candidates).cloned() else {
            debug!(participant = %self.id, "no other participant searching");
            return Ok(MatchOutcome::Waiting);
        };

        info!(participant = %self.id, partner = %candidate, "claiming participant");
        let claim = StatusRecord::Received {
            partner: self.id.clone(),
        };
        let offered = StatusRecord::Offered {
            partner: candidate.clone(),
        };
        tokio::try_join!(
            self.records.update_participant_status(&candidate, &claim),
            self.records.write_status(&self.id, &offered),
        )?;
        Ok(MatchOutcome::Claimed(candidate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tidepool_store::{MemoryStore, Store};

    use crate::model::{SignalEnvelope, StatusObservation};

    fn id(raw: &str) -> ParticipantId {
        ParticipantId::new(raw).unwrap()
    }

    #[test_timeout::timeout]
    fn never_selects_itself() {
        let me = id("me");
        assert_eq!(select_candidate(&me, &[me.clone()]), None);
        assert_eq!(select_candidate(&me, &[]), None);
        assert_eq!(
            select_candidate(&me, &[me.clone(), id("x"), id("y")]),
            Some(&id("x"))
        );
    }

    #[test_timeout::tokio_timeout_test(secs = 5)]
    async fn claims_the_only_other_searcher() {
        let store = Arc::new(MemoryStore::new());
        let records = Records::new(store.clone());
        records.write_status(&id("me"), &StatusRecord::Searching).await.unwrap();
        records.write_status(&id("x"), &StatusRecord::Searching).await.unwrap();
        records
            .write_inbox(&id("me"), &SignalEnvelope::answer("left over"))
            .await
            .unwrap();

        let matcher = Matcher::new(records.clone(), id("me"));
        assert_eq!(
            matcher.find_next_match().await.unwrap(),
            MatchOutcome::Claimed(id("x"))
        );

        assert_eq!(
            records.read_status(&id("me")).await.unwrap(),
            StatusObservation::Record(StatusRecord::Offered { partner: id("x") })
        );
        assert_eq!(
            records.read_status(&id("x")).await.unwrap(),
            StatusObservation::Record(StatusRecord::Received { partner: id("me") })
        );
        assert_eq!(store.get("/participants/me/inbox").await.unwrap(), None);
    }

    #[test_timeout::tokio_timeout_test(secs = 5)]
    async fn alone_in_the_pool_writes_nothing_else() {
        let store = Arc::new(MemoryStore::new());
        let records = Records::new(store.clone());
        records.write_status(&id("me"), &StatusRecord::Searching).await.unwrap();
        records
            .write_status(&id("busy"), &StatusRecord::Connected { partner: Some(id("z")) })
            .await
            .unwrap();
        let before = store.scan("/").await.unwrap();

        let matcher = Matcher::new(records.clone(), id("me"));
        assert_eq!(matcher.find_next_match().await.unwrap(), MatchOutcome::Waiting);

        assert_eq!(store.scan("/").await.unwrap(), before);
    }
}
