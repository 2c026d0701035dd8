//! Anonymous pairwise matchmaking and signaling over a shared key-value
//! store.
//!
//! Every participant owns two documents, a status record and a single-slot
//! inbox. Pairing is done by writing another participant's status (a claim);
//! once two participants name each other, handshake payloads travel through
//! their inboxes until the media session reports a direct connection.

pub mod config;
pub mod coordinator;
pub mod feed;
pub mod identity;
pub mod matcher;
pub mod media;
pub mod model;
pub mod records;
pub mod relay;
pub mod simulate;
pub mod status;

pub use config::{Config, ConfigError};
pub use coordinator::{CoordinatorConfig, SessionCoordinator, SessionError, SessionHandle};
pub use matcher::{MatchOutcome, Matcher};
pub use media::{ChatLine, ChatSession, HandshakeRole, MediaError, MediaLink, MediaSession};
pub use model::{
    MatchState, ParticipantId, SignalEnvelope, SignalKind, StatusObservation, StatusRecord,
};
pub use records::Records;
pub use relay::SignalRelay;
pub use status::StatusMachine;
pub use tidepool_store;
