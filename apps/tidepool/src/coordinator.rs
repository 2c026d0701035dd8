//! Local orchestration of one participant.
//!
//! Binds the status feed to actions: `Searching` runs the matcher,
//! `Offered`/`Received` hand the partner to the media session and open the
//! signal relay in both directions, `Connected` stops matching, `Idle` waits
//! for the user. [`SessionHandle::stop`] tears everything down and parks the
//! participant at `Idle`.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tidepool_store::{SharedStore, StoreError};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};

use crate::matcher::{MatchOutcome, Matcher};
use crate::media::{HandshakeRole, LinkEvent, MediaError, MediaLink, MediaSession};
use crate::model::{MatchState, ModelError, ParticipantId, SignalEnvelope, SignalKind, StatusRecord};
use crate::records::Records;
use crate::relay::{SignalFeed, SignalRelay};
use crate::status::{StatusFeed, StatusMachine};

const DEFAULT_MATCH_RETRY: Duration = Duration::from_millis(1000);
/// Transitions a lagging [`SessionHandle::transitions`] receiver may fall behind by.
const TRANSITION_BACKLOG: usize = 64;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Participant(#[from] ModelError),
}

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    /// Delay before re-running a match attempt whose writes failed.
    pub match_retry: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            match_retry: DEFAULT_MATCH_RETRY,
        }
    }
}

pub struct SessionCoordinator {
    records: Records,
    id: ParticipantId,
    media: Arc<dyn MediaSession>,
    config: CoordinatorConfig,
}

impl SessionCoordinator {
    pub fn new(
        store: SharedStore,
        id: ParticipantId,
        media: Arc<dyn MediaSession>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            records: Records::new(store),
            id,
            media,
            config,
        }
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.id
    }

    /// Resets this participant's records, enters the pool and starts
    /// reacting to store notifications in the background.
    pub async fn start_searching(&self) -> Result<SessionHandle, SessionError> {
        let (state, _) = watch::channel(MatchState::New);
        let state = Arc::new(state);
        let (transitions, _) = broadcast::channel(TRANSITION_BACKLOG);
        let status = StatusMachine::new(self.records.clone(), self.id.clone())
            .observe()
            .await?;
        let signals = SignalRelay::new(self.records.clone(), self.id.clone())
            .observe_incoming_signals()
            .await?;

        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let link = MediaLink::new(link_tx);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let driver = Driver {
            id: self.id.clone(),
            records: self.records.clone(),
            matcher: Matcher::new(self.records.clone(), self.id.clone()),
            relay: SignalRelay::new(self.records.clone(), self.id.clone()),
            media: self.media.clone(),
            link: link.clone(),
            state: state.clone(),
            transitions: transitions.clone(),
            current: MatchState::New,
            partner: None,
            pending: None,
            retry_at: None,
            match_retry: self.config.match_retry,
        };
        let task = tokio::spawn(driver.run(status, signals, link_rx, shutdown_rx));

        Ok(SessionHandle {
            id: self.id.clone(),
            records: self.records.clone(),
            media: self.media.clone(),
            state,
            transitions,
            link,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }
}

/// Running participant, as seen by the UI.
pub struct SessionHandle {
    id: ParticipantId,
    records: Records,
    media: Arc<dyn MediaSession>,
    state: Arc<watch::Sender<MatchState>>,
    transitions: broadcast::Sender<MatchState>,
    link: MediaLink,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn participant(&self) -> &ParticipantId {
        &self.id
    }

    /// Match state transitions, starting from [`MatchState::New`].
    pub fn state(&self) -> watch::Receiver<MatchState> {
        self.state.subscribe()
    }

    /// Every state the status feed delivers, one per notification, even
    /// when the driver only acts on the newest of a burst.
    pub fn transitions(&self) -> broadcast::Receiver<MatchState> {
        self.transitions.subscribe()
    }

    pub fn current_state(&self) -> MatchState {
        self.state.borrow().clone()
    }

    /// Whether the background driver is still running.
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Sends an envelope (typically chat) to the current partner.
    pub fn send(&self, envelope: SignalEnvelope) -> Result<(), MediaError> {
        self.link.send(envelope)
    }

    /// Leaves the current partner and searches again.
    pub fn next_partner(&self) -> Result<(), MediaError> {
        self.link.hang_up()
    }

    /// Cancels all subscriptions and in-flight work, then resets the record
    /// to `Idle`. Writes already sent are not rolled back.
    pub async fn stop(mut self) -> Result<(), SessionError> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(participant = %self.id, error = %err, "session driver ended abnormally");
            }
        }
        self.media.close().await;
        self.records
            .write_status(&self.id, &StatusRecord::Idle)
            .await?;
        self.state.send_replace(MatchState::Idle);
        let _ = self.transitions.send(MatchState::Idle);
        info!(participant = %self.id, "session stopped");
        Ok(())
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Driver {
    id: ParticipantId,
    records: Records,
    matcher: Matcher,
    relay: SignalRelay,
    media: Arc<dyn MediaSession>,
    link: MediaLink,
    state: Arc<watch::Sender<MatchState>>,
    transitions: broadcast::Sender<MatchState>,
    current: MatchState,
    partner: Option<(ParticipantId, HandshakeRole)>,
    /// Inbox and status keys are not ordered relative to each other, so an
    /// offer can overtake the claim that explains it. Held here until paired
    /// and dropped whenever the participant searches again.
    pending: Option<SignalEnvelope>,
    retry_at: Option<Instant>,
    match_retry: Duration,
}

impl Driver {
    async fn run(
        mut self,
        mut status: StatusFeed,
        mut signals: SignalFeed,
        mut link_rx: mpsc::UnboundedReceiver<LinkEvent>,
        shutdown: oneshot::Receiver<()>,
    ) {
        tokio::select! {
            biased;
            _ = shutdown => debug!(participant = %self.id, "session shutdown requested"),
            _ = self.event_loop(&mut status, &mut signals, &mut link_rx) => {}
        }
        // Dropping the loop above cancelled any in-flight handler; make sure
        // the feed tasks are gone too before the caller writes `Idle`.
        status.shutdown().await;
        signals.shutdown().await;
    }

    async fn event_loop(
        &mut self,
        status: &mut StatusFeed,
        signals: &mut SignalFeed,
        link_rx: &mut mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                biased;
                state = status.recv() => {
                    let Some(mut state) = state else {
                        warn!(participant = %self.id, "status feed ended");
                        return;
                    };
                    self.publish(&state);
                    // Act on the newest state only; older queued ones are stale.
                    while let Some(newer) = status.try_recv() {
                        self.publish(&newer);
                        state = newer;
                    }
                    self.on_state(state).await;
                }
                envelope = signals.recv() => {
                    let Some(envelope) = envelope else {
                        warn!(participant = %self.id, "signal feed ended");
                        return;
                    };
                    self.on_remote_signal(envelope).await;
                }
                Some(event) = link_rx.recv() => self.on_link_event(event).await,
                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.retry_at = None;
                    if self.current == MatchState::Searching {
                        debug!(participant = %self.id, "retrying match");
                        self.search().await;
                    }
                }
            }
        }
    }

    fn publish(&self, state: &MatchState) {
        self.state.send_replace(state.clone());
        let _ = self.transitions.send(state.clone());
    }

    async fn on_state(&mut self, state: MatchState) {
        if state == self.current {
            trace!(participant = %self.id, %state, "state unchanged");
            return;
        }
        info!(participant = %self.id, from = %self.current, to = %state, "match state changed");
        self.current = state.clone();

        match state {
            MatchState::Searching => {
                self.release_partner().await;
                if let Some(stale) = self.pending.take() {
                    debug!(
                        participant = %self.id,
                        kind = stale.kind.as_str(),
                        "dropping signal held from before this search"
                    );
                }
                self.search().await;
            }
            MatchState::Offered(partner) => self.pair(partner, HandshakeRole::Offerer).await,
            MatchState::Received(partner) => self.pair(partner, HandshakeRole::Answerer).await,
            MatchState::Connected | MatchState::Idle | MatchState::New => {
                self.retry_at = None;
            }
        }
    }

    async fn search(&mut self) {
        match self.matcher.find_next_match().await {
            Ok(MatchOutcome::Claimed(partner)) => {
                debug!(participant = %self.id, %partner, "claim written");
            }
            Ok(MatchOutcome::Waiting) => {
                debug!(participant = %self.id, "waiting to be claimed");
            }
            Err(err) => {
                warn!(participant = %self.id, error = %err, "match attempt failed, will retry");
                self.retry_at = Some(Instant::now() + self.match_retry);
            }
        }
    }

    async fn pair(&mut self, partner: ParticipantId, role: HandshakeRole) {
        self.retry_at = None;
        if self.partner.as_ref() == Some(&(partner.clone(), role)) {
            return;
        }
        self.release_partner().await;

        info!(participant = %self.id, %partner, ?role, "starting handshake");
        self.partner = Some((partner.clone(), role));
        if let Err(err) = self
            .media
            .initiate_handshake(&partner, role, self.link.clone())
            .await
        {
            warn!(participant = %self.id, %partner, error = %err, "media session refused handshake");
        }
        if let Some(envelope) = self.pending.take() {
            self.forward_to_media(envelope).await;
        }
    }

    async fn release_partner(&mut self) {
        if let Some((partner, _)) = self.partner.take() {
            debug!(participant = %self.id, %partner, "releasing partner");
            self.media.close().await;
        }
    }

    async fn on_remote_signal(&mut self, envelope: SignalEnvelope) {
        if self.partner.is_some() {
            self.forward_to_media(envelope).await;
        } else if envelope.kind != SignalKind::Offer {
            // Only an offer can legitimately precede its claim; anything else
            // is left over from a previous partner.
            debug!(
                participant = %self.id,
                kind = envelope.kind.as_str(),
                "signal without a partner, dropping it"
            );
        } else {
            debug!(
                participant = %self.id,
                kind = envelope.kind.as_str(),
                "offer before pairing, holding it"
            );
            if let Some(displaced) = self.pending.replace(envelope) {
                debug!(
                    participant = %self.id,
                    kind = displaced.kind.as_str(),
                    "dropping older unpaired signal"
                );
            }
        }
    }

    async fn forward_to_media(&self, envelope: SignalEnvelope) {
        let kind = envelope.kind.as_str();
        if let Err(err) = self.media.on_remote_signal(envelope).await {
            warn!(participant = %self.id, kind, error = %err, "media session rejected signal");
        }
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Signal(envelope) => {
                let Some((partner, _)) = self.partner.as_ref() else {
                    debug!(
                        participant = %self.id,
                        kind = envelope.kind.as_str(),
                        "no partner, dropping outbound signal"
                    );
                    return;
                };
                if let Err(err) = self.relay.send_signal(partner, &envelope).await {
                    warn!(participant = %self.id, %partner, error = %err, "signal send failed");
                }
            }
            LinkEvent::Connected => {
                let Some((partner, _)) = self.partner.as_ref() else {
                    debug!(participant = %self.id, "connected without a partner, ignoring");
                    return;
                };
                if self.current == MatchState::Connected {
                    return;
                }
                let record = StatusRecord::Connected {
                    partner: Some(partner.clone()),
                };
                if let Err(err) = self.records.write_status(&self.id, &record).await {
                    warn!(participant = %self.id, error = %err, "failed to record connection");
                }
            }
            LinkEvent::HangUp => {
                self.release_partner().await;
                if let Err(err) = self
                    .records
                    .write_status(&self.id, &StatusRecord::Searching)
                    .await
                {
                    warn!(participant = %self.id, error = %err, "failed to re-enter the pool");
                }
            }
        }
    }
}
