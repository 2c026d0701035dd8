//! Runs several participants against one in-process store and reports how
//! they paired up. Useful for watching the claim race without a server.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tidepool_store::{MemoryStore, SharedStore};
use tracing::info;

use crate::coordinator::{CoordinatorConfig, SessionCoordinator, SessionError, SessionHandle};
use crate::media::ChatSession;
use crate::model::{MatchState, ParticipantId, StatusObservation};
use crate::records::Records;

#[derive(Debug, Clone)]
pub struct ParticipantSummary {
    pub id: ParticipantId,
    /// Last state the participant's coordinator observed.
    pub state: MatchState,
    /// What the store held for the participant when the run settled.
    pub record: StatusObservation,
}

#[derive(Debug, Clone, Default)]
pub struct SimulationReport {
    pub participants: Vec<ParticipantSummary>,
    /// Mutually consistent pairs: each record names the other as partner.
    pub pairs: Vec<(ParticipantId, ParticipantId)>,
    /// Everybody not in a consistent pair, including race leftovers.
    pub unpaired: Vec<ParticipantId>,
}

impl SimulationReport {
    fn build(participants: Vec<ParticipantSummary>) -> Self {
        let partners: BTreeMap<&ParticipantId, &ParticipantId> = participants
            .iter()
            .filter_map(|p| Some((&p.id, p.record.record()?.partner()?)))
            .collect();

        let mut pairs = Vec::new();
        let mut paired = BTreeSet::new();
        for (&id, &partner) in &partners {
            if id < partner && partners.get(partner) == Some(&id) {
                pairs.push((id.clone(), partner.clone()));
                paired.insert(id);
                paired.insert(partner);
            }
        }
        let unpaired = participants
            .iter()
            .filter(|p| !paired.contains(&p.id))
            .map(|p| p.id.clone())
            .collect();

        Self {
            participants,
            pairs,
            unpaired,
        }
    }
}

impl fmt::Display for SimulationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "participants:")?;
        for p in &self.participants {
            let record = match &p.record {
                StatusObservation::Record(record) => record.encode(),
                other => format!("{other:?}"),
            };
            writeln!(f, "  {:<12} {:<16} {}", p.id, p.state.to_string(), record)?;
        }
        writeln!(f, "pairs:")?;
        for (a, b) in &self.pairs {
            writeln!(f, "  {a} <-> {b}")?;
        }
        if !self.unpaired.is_empty() {
            let names: Vec<_> = self.unpaired.iter().map(ParticipantId::as_str).collect();
            writeln!(f, "unpaired: {}", names.join(", "))?;
        }
        Ok(())
    }
}

/// Starts `participants` chat participants on a fresh [`MemoryStore`], lets
/// them run for `settle`, snapshots the outcome and stops everyone.
pub async fn simulate(
    participants: usize,
    settle: Duration,
    config: CoordinatorConfig,
) -> Result<SimulationReport, SessionError> {
    let store: SharedStore = Arc::new(MemoryStore::new());

    let mut handles: Vec<SessionHandle> = Vec::with_capacity(participants);
    for index in 0..participants {
        let id = ParticipantId::new(format!("sim-{index:02}"))?;
        let (media, _lines) = ChatSession::new();
        let coordinator = SessionCoordinator::new(store.clone(), id, Arc::new(media), config);
        handles.push(coordinator.start_searching().await?);
    }
    info!(participants, settle_ms = settle.as_millis() as u64, "simulation running");
    tokio::time::sleep(settle).await;

    let records = Records::new(store);
    let mut summaries = Vec::with_capacity(handles.len());
    for handle in &handles {
        summaries.push(ParticipantSummary {
            id: handle.participant().clone(),
            state: handle.current_state(),
            record: records.read_status(handle.participant()).await?,
        });
    }
    let report = SimulationReport::build(summaries);

    for handle in handles {
        handle.stop().await?;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StatusRecord;

    fn id(raw: &str) -> ParticipantId {
        ParticipantId::new(raw).unwrap()
    }

    fn summary(raw: &str, record: StatusRecord) -> ParticipantSummary {
        ParticipantSummary {
            id: id(raw),
            state: MatchState::from(&record),
            record: StatusObservation::Record(record),
        }
    }

    #[test_timeout::timeout]
    fn report_only_pairs_mutual_partners() {
        let report = SimulationReport::build(vec![
            summary("a", StatusRecord::Connected { partner: Some(id("b")) }),
            summary("b", StatusRecord::Connected { partner: Some(id("a")) }),
            summary("c", StatusRecord::Offered { partner: id("d") }),
            summary("d", StatusRecord::Offered { partner: id("e") }),
            summary("e", StatusRecord::Searching),
        ]);

        assert_eq!(report.pairs, vec![(id("a"), id("b"))]);
        assert_eq!(report.unpaired, vec![id("c"), id("d"), id("e")]);
        let rendered = report.to_string();
        assert!(rendered.contains("a <-> b"));
        assert!(rendered.contains("unpaired: c, d, e"));
    }

    #[test_timeout::tokio_timeout_test(secs = 10)]
    async fn two_participants_end_up_connected_to_each_other() {
        let report = simulate(2, Duration::from_millis(200), CoordinatorConfig::default())
            .await
            .unwrap();

        assert_eq!(report.pairs, vec![(id("sim-00"), id("sim-01"))]);
        assert!(report.unpaired.is_empty());
        for participant in &report.participants {
            assert_eq!(participant.state, MatchState::Connected);
        }
    }

    #[test_timeout::tokio_timeout_test(secs = 10)]
    async fn odd_participant_keeps_searching() {
        let report = simulate(3, Duration::from_millis(200), CoordinatorConfig::default())
            .await
            .unwrap();

        assert_eq!(report.pairs.len(), 1);
        assert_eq!(report.unpaired.len(), 1);
        let loner = &report.unpaired[0];
        let summary = report
            .participants
            .iter()
            .find(|p| &p.id == loner)
            .unwrap();
        assert_eq!(summary.state, MatchState::Searching);
    }
}
