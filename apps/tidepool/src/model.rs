//! Participant records as they appear in the store, and the local
//! projection the UI consumes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// Ids are embedded in store keys, so they are bounded and path-safe.
pub const MAX_PARTICIPANT_ID_LEN: usize = 128;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("participant id is empty")]
    EmptyId,
    #[error("participant id longer than {MAX_PARTICIPANT_ID_LEN} bytes")]
    IdTooLong,
    #[error("participant id contains forbidden character {0:?}")]
    ForbiddenChar(char),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed signal envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Stable identifier of one participant, persisted once per installation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(raw: impl Into<String>) -> Result<Self, ModelError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(ModelError::EmptyId);
        }
        if raw.len() > MAX_PARTICIPANT_ID_LEN {
            return Err(ModelError::IdTooLong);
        }
        if let Some(bad) = raw.chars().find(|c| *c == '/' || c.is_whitespace() || c.is_control()) {
            return Err(ModelError::ForbiddenChar(bad));
        }
        Ok(Self(raw))
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ParticipantId {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ParticipantId {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ParticipantId> for String {
    fn from(id: ParticipantId) -> Self {
        id.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusKind {
    Idle,
    Searching,
    Offered,
    Received,
    Connected,
}

impl StatusKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusKind::Idle => "idle",
            StatusKind::Searching => "searching",
            StatusKind::Offered => "offered",
            StatusKind::Received => "received",
            StatusKind::Connected => "connected",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "idle" => Some(StatusKind::Idle),
            "searching" => Some(StatusKind::Searching),
            "offered" => Some(StatusKind::Offered),
            "received" => Some(StatusKind::Received),
            "connected" => Some(StatusKind::Connected),
            _ => None,
        }
    }
}

/// A participant's matchmaking status. Exactly one exists per participant;
/// the latest write wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusRecord {
    Idle,
    Searching,
    /// This participant claimed `partner`.
    Offered { partner: ParticipantId },
    /// `partner` claimed this participant.
    Received { partner: ParticipantId },
    Connected { partner: Option<ParticipantId> },
}

#[derive(Deserialize)]
struct StatusWire {
    kind: String,
    #[serde(default)]
    partner: Option<String>,
}

impl StatusRecord {
    pub fn kind(&self) -> StatusKind {
        match self {
            StatusRecord::Idle => StatusKind::Idle,
            StatusRecord::Searching => StatusKind::Searching,
            StatusRecord::Offered { .. } => StatusKind::Offered,
            StatusRecord::Received { .. } => StatusKind::Received,
            StatusRecord::Connected { .. } => StatusKind::Connected,
        }
    }

    pub fn partner(&self) -> Option<&ParticipantId> {
        match self {
            StatusRecord::Offered { partner } | StatusRecord::Received { partner } => Some(partner),
            StatusRecord::Connected { partner } => partner.as_ref(),
            StatusRecord::Idle | StatusRecord::Searching => None,
        }
    }

    /// `{"kind": "...", "partner": "..."}`, partner omitted when absent.
    pub fn encode(&self) -> String {
        let mut doc = json!({ "kind": self.kind().as_str() });
        if let Some(partner) = self.partner() {
            doc["partner"] = json!(partner.as_str());
        }
        doc.to_string()
    }
}

/// What a participant finds when it reads a status key. Anything other than
/// [`StatusObservation::Record`] is a protocol violation the state machine
/// normalizes away; the tag survives so logs show which kind it was.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusObservation {
    Record(StatusRecord),
    Absent,
    /// Well-formed document whose `kind` this build does not know.
    Unrecognized { kind: String },
    Malformed { reason: String },
}

impl StatusObservation {
    pub fn decode(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return StatusObservation::Absent;
        };
        let wire: StatusWire = match serde_json::from_str(raw) {
            Ok(wire) => wire,
            Err(err) => {
                return StatusObservation::Malformed {
                    reason: err.to_string(),
                };
            }
        };
        let Some(kind) = StatusKind::parse(&wire.kind) else {
            return StatusObservation::Unrecognized { kind: wire.kind };
        };
        let partner = match wire.partner.map(ParticipantId::new).transpose() {
            Ok(partner) => partner,
            Err(err) => {
                return StatusObservation::Malformed {
                    reason: format!("invalid partner: {err}"),
                };
            }
        };

        let record = match (kind, partner) {
            (StatusKind::Idle, _) => StatusRecord::Idle,
            (StatusKind::Searching, _) => StatusRecord::Searching,
            (StatusKind::Offered, Some(partner)) => StatusRecord::Offered { partner },
            (StatusKind::Received, Some(partner)) => StatusRecord::Received { partner },
            (StatusKind::Connected, partner) => StatusRecord::Connected { partner },
            (kind, None) => {
                return StatusObservation::Malformed {
                    reason: format!("{} record without partner", kind.as_str()),
                };
            }
        };
        StatusObservation::Record(record)
    }

    pub fn record(&self) -> Option<&StatusRecord> {
        match self {
            StatusObservation::Record(record) => Some(record),
            _ => None,
        }
    }
}

/// UI-facing projection of the participant's own status. `New` exists only
/// locally, before the first notification arrives.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MatchState {
    #[default]
    New,
    Idle,
    Searching,
    Offered(ParticipantId),
    Received(ParticipantId),
    Connected,
}

impl MatchState {
    pub fn partner(&self) -> Option<&ParticipantId> {
        match self {
            MatchState::Offered(partner) | MatchState::Received(partner) => Some(partner),
            _ => None,
        }
    }
}

impl From<&StatusRecord> for MatchState {
    fn from(record: &StatusRecord) -> Self {
        match record {
            StatusRecord::Idle => MatchState::Idle,
            StatusRecord::Searching => MatchState::Searching,
            StatusRecord::Offered { partner } => MatchState::Offered(partner.clone()),
            StatusRecord::Received { partner } => MatchState::Received(partner.clone()),
            StatusRecord::Connected { .. } => MatchState::Connected,
        }
    }
}

impl fmt::Display for MatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchState::New => f.write_str("new"),
            MatchState::Idle => f.write_str("idle"),
            MatchState::Searching => f.write_str("searching"),
            MatchState::Offered(partner) => write!(f, "offered({partner})"),
            MatchState::Received(partner) => write!(f, "received({partner})"),
            MatchState::Connected => f.write_str("connected"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    Chat,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice_candidate",
            SignalKind::Chat => "chat",
        }
    }
}

/// Opaque handshake message moved between paired participants. Only the
/// media session interprets `payload`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub kind: SignalKind,
    pub payload: String,
}

impl SignalEnvelope {
    pub fn new(kind: SignalKind, payload: impl Into<String>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn offer(payload: impl Into<String>) -> Self {
        Self::new(SignalKind::Offer, payload)
    }

    pub fn answer(payload: impl Into<String>) -> Self {
        Self::new(SignalKind::Answer, payload)
    }

    pub fn ice_candidate(payload: impl Into<String>) -> Self {
        Self::new(SignalKind::IceCandidate, payload)
    }

    pub fn chat(text: impl Into<String>) -> Self {
        Self::new(SignalKind::Chat, text)
    }

    pub fn encode(&self) -> String {
        json!({ "kind": self.kind.as_str(), "payload": self.payload }).to_string()
    }

    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: &str) -> ParticipantId {
        ParticipantId::new(raw).unwrap()
    }

    #[test_timeout::timeout]
    fn participant_ids_must_be_path_safe() {
        assert_eq!(ParticipantId::new(""), Err(ModelError::EmptyId));
        assert_eq!(ParticipantId::new("a/b"), Err(ModelError::ForbiddenChar('/')));
        assert_eq!(ParticipantId::new("a b"), Err(ModelError::ForbiddenChar(' ')));
        assert_eq!(
            ParticipantId::new("x".repeat(MAX_PARTICIPANT_ID_LEN + 1)),
            Err(ModelError::IdTooLong)
        );
        assert!(ParticipantId::new("ringo-42").is_ok());

        let generated = ParticipantId::generate();
        assert_eq!(generated.as_str().len(), 36);
        assert_ne!(generated, ParticipantId::generate());
    }

    #[test_timeout::timeout]
    fn every_status_kind_maps_to_one_match_state() {
        let partner = id("peer");
        let cases = vec![
            (StatusRecord::Idle, MatchState::Idle),
            (StatusRecord::Searching, MatchState::Searching),
            (
                StatusRecord::Offered { partner: partner.clone() },
                MatchState::Offered(partner.clone()),
            ),
            (
                StatusRecord::Received { partner: partner.clone() },
                MatchState::Received(partner.clone()),
            ),
            (
                StatusRecord::Connected { partner: Some(partner.clone()) },
                MatchState::Connected,
            ),
            (StatusRecord::Connected { partner: None }, MatchState::Connected),
        ];

        for (record, expected) in cases {
            let observed = StatusObservation::decode(Some(&record.encode()));
            assert_eq!(observed, StatusObservation::Record(record.clone()));
            assert_eq!(MatchState::from(&record), expected);
        }
    }

    #[test_timeout::timeout]
    fn status_wire_format_is_stable() {
        assert_eq!(StatusRecord::Searching.encode(), r#"{"kind":"searching"}"#);
        let offered = StatusRecord::Offered { partner: id("b") };
        let doc: serde_json::Value = serde_json::from_str(&offered.encode()).unwrap();
        assert_eq!(doc, json!({ "kind": "offered", "partner": "b" }));
    }

    #[test_timeout::timeout]
    fn unusable_status_documents_are_tagged() {
        assert_eq!(StatusObservation::decode(None), StatusObservation::Absent);
        assert!(matches!(
            StatusObservation::decode(Some("not json")),
            StatusObservation::Malformed { .. }
        ));
        assert!(matches!(
            StatusObservation::decode(Some(r#"{"partner":"b"}"#)),
            StatusObservation::Malformed { .. }
        ));
        assert_eq!(
            StatusObservation::decode(Some(r#"{"kind":"LookingForMatch"}"#)),
            StatusObservation::Unrecognized {
                kind: "LookingForMatch".into()
            }
        );
        assert!(matches!(
            StatusObservation::decode(Some(r#"{"kind":"offered"}"#)),
            StatusObservation::Malformed { .. }
        ));
        assert!(matches!(
            StatusObservation::decode(Some(r#"{"kind":"received","partner":"a/b"}"#)),
            StatusObservation::Malformed { .. }
        ));
    }

    #[test_timeout::timeout]
    fn stray_partner_on_unpaired_kinds_is_ignored() {
        assert_eq!(
            StatusObservation::decode(Some(r#"{"kind":"searching","partner":"x"}"#)),
            StatusObservation::Record(StatusRecord::Searching)
        );
    }

    #[test_timeout::timeout]
    fn signal_envelope_keeps_kind_and_payload() {
        let envelope = SignalEnvelope::ice_candidate("candidate:1 1 udp 2122260223 10.0.0.2 5000 typ host");
        let raw = envelope.encode();
        assert!(raw.contains(r#""kind":"ice_candidate""#));
        assert_eq!(SignalEnvelope::decode(&raw).unwrap(), envelope);

        assert!(SignalEnvelope::decode(r#"{"kind":"smoke","payload":"x"}"#).is_err());
        assert!(SignalEnvelope::decode("{").is_err());
    }
}
