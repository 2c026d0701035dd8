//! Seam to the real-time session that consumes relayed handshake payloads.
//!
//! The coordinator never looks inside a payload. It hands the media session
//! a partner and a [`MediaLink`]; the session answers through the link.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::model::{ParticipantId, SignalEnvelope, SignalKind};

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("no handshake in progress")]
    NotPaired,
    #[error("session coordinator is gone")]
    LinkClosed,
}

/// Which side of the handshake this participant plays. The claimer
/// (`Offered`) makes the offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Offerer,
    Answerer,
}

#[derive(Debug)]
pub(crate) enum LinkEvent {
    Signal(SignalEnvelope),
    Connected,
    HangUp,
}

/// Handle the media session uses to talk back to the coordinator.
#[derive(Debug, Clone)]
pub struct MediaLink {
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl MediaLink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self { tx }
    }

    /// Relays a local handshake payload to the current partner.
    pub fn send(&self, envelope: SignalEnvelope) -> Result<(), MediaError> {
        self.emit(LinkEvent::Signal(envelope))
    }

    /// Reports the direct session as established.
    pub fn connected(&self) -> Result<(), MediaError> {
        self.emit(LinkEvent::Connected)
    }

    /// Drops the current partner and goes back to searching.
    pub fn hang_up(&self) -> Result<(), MediaError> {
        self.emit(LinkEvent::HangUp)
    }

    fn emit(&self, event: LinkEvent) -> Result<(), MediaError> {
        self.tx.send(event).map_err(|_| MediaError::LinkClosed)
    }
}

#[async_trait]
pub trait MediaSession: Send + Sync {
    /// A partner was assigned. Called again if the role or partner changes
    /// (for instance when a pairing race flips `Offered` to `Received`).
    async fn initiate_handshake(
        &self,
        partner: &ParticipantId,
        role: HandshakeRole,
        link: MediaLink,
    ) -> Result<(), MediaError>;

    async fn on_remote_signal(&self, envelope: SignalEnvelope) -> Result<(), MediaError>;

    /// Tears down whatever the last handshake built.
    async fn close(&self);
}

pub const CHAT_PROTOCOL: &str = "tidepool-chat/1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    pub from: ParticipantId,
    pub text: String,
}

#[derive(Default)]
struct ChatPeer {
    partner: Option<ParticipantId>,
    link: Option<MediaLink>,
}

/// Text-only session: the offer/answer exchange only agrees on
/// [`CHAT_PROTOCOL`], after which `Chat` envelopes carry lines of text.
pub struct ChatSession {
    peer: Mutex<ChatPeer>,
    lines: mpsc::UnboundedSender<ChatLine>,
}

impl ChatSession {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChatLine>) {
        let (lines, rx) = mpsc::unbounded_channel();
        let session = Self {
            peer: Mutex::new(ChatPeer::default()),
            lines,
        };
        (session, rx)
    }
}

#[async_trait]
impl MediaSession for ChatSession {
    async fn initiate_handshake(
        &self,
        partner: &ParticipantId,
        role: HandshakeRole,
        link: MediaLink,
    ) -> Result<(), MediaError> {
        let mut peer = self.peer.lock().await;
        peer.partner = Some(partner.clone());
        peer.link = Some(link.clone());
        if role == HandshakeRole::Offerer {
            link.send(SignalEnvelope::offer(CHAT_PROTOCOL))?;
        }
        Ok(())
    }

    async fn on_remote_signal(&self, envelope: SignalEnvelope) -> Result<(), MediaError> {
        let peer = self.peer.lock().await;
        let (Some(partner), Some(link)) = (peer.partner.as_ref(), peer.link.as_ref()) else {
            return Err(MediaError::NotPaired);
        };
        match envelope.kind {
            SignalKind::Offer => {
                if envelope.payload != CHAT_PROTOCOL {
                    return Err(MediaError::Handshake(format!(
                        "unsupported protocol {:?}",
                        envelope.payload
                    )));
                }
                link.send(SignalEnvelope::answer(CHAT_PROTOCOL))?;
                link.connected()?;
                info!(%partner, "chat session answered");
            }
            SignalKind::Answer => {
                link.connected()?;
                info!(%partner, "chat session established");
            }
            SignalKind::IceCandidate => {
                debug!(%partner, "ignoring ice candidate on text-only session");
            }
            SignalKind::Chat => {
                let _ = self.lines.send(ChatLine {
                    from: partner.clone(),
                    text: envelope.payload,
                });
            }
        }
        Ok(())
    }

    async fn close(&self) {
        let mut peer = self.peer.lock().await;
        *peer = ChatPeer::default();
    }
}
