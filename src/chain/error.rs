//! Error types for team chain loading, verification and editing.

use crate::chain::types::{Generation, KeyId, Position, Seqno, TeamId, UserId};
use thiserror::Error;

/// Reasons a signed statement fails verification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("Key {key_id} not yet valid at position {position} (active from {active_from})")]
    KeyNotYetValid {
        key_id: KeyId,
        position: Position,
        active_from: Position,
    },

    #[error("Key {key_id} revoked at position {revoked_at}, statement claims {position}")]
    KeyRevoked {
        key_id: KeyId,
        position: Position,
        revoked_at: Position,
    },

    #[error("Invalid signature: {reason}")]
    BadSignature { reason: String },

    #[error("Unknown key {key_id} for user {user}")]
    UnknownKey { user: UserId, key_id: KeyId },
}

/// Violations of chain integrity. Always fatal for the operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error("Link {seqno} failed verification: {source}")]
    Signature {
        seqno: Seqno,
        #[source]
        source: VerifyError,
    },

    #[error("Hash chain broken at link {seqno}")]
    BrokenHashChain { seqno: Seqno },

    #[error("Unexpected link seqno: expected {expected}, got {got}")]
    UnexpectedSeqno { expected: Seqno, got: Seqno },

    #[error("Link {seqno} claims position {position}, before previous link at {previous}")]
    PositionRegression {
        seqno: Seqno,
        position: Position,
        previous: Position,
    },

    #[error("Link {seqno} signed by {user} without {required} authority")]
    Unauthorized {
        seqno: Seqno,
        user: UserId,
        required: &'static str,
    },

    #[error("Invalid payload in link {seqno}: {reason}")]
    InvalidPayload { seqno: Seqno, reason: String },

    #[error("Key generation gap: expected {expected}, got {got}")]
    GenerationGap { expected: Generation, got: Generation },

    #[error("Sealed secret for generation {generation} does not match its key check")]
    KeyCheckMismatch { generation: Generation },

    #[error("Link for team {got} delivered while loading team {expected}")]
    TeamIdMismatch { expected: TeamId, got: TeamId },

    #[error("Team {team} is not listed as a subteam of {parent}")]
    UnknownSubteam { team: TeamId, parent: TeamId },

    #[error("Cycle in ancestor chain at team {team}")]
    AncestorCycle { team: TeamId },

    #[error("Ancestor team {team} could not be resolved")]
    MissingAncestor { team: TeamId },

    #[error("Link {seqno} would leave the team without an owner")]
    OwnerlessTeam { seqno: Seqno },

    #[error("Failed to encode link {seqno}: {reason}")]
    Encoding { seqno: Seqno, reason: String },
}

/// Errors from the chain transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    /// Out-of-order or duplicate submission: someone else advanced the chain.
    #[error("Seqno conflict: submitted {submitted}, chain is at {current}")]
    SeqnoConflict { submitted: Seqno, current: Seqno },

    #[error("Team not found: {0}")]
    NotFound(String),
}

/// Errors from the user key directory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("Unknown user {0}")]
    UnknownUser(UserId),

    #[error("Unknown key {key_id} for user {user}")]
    UnknownKey { user: UserId, key_id: KeyId },

    #[error("Key directory unavailable: {0}")]
    Unavailable(String),
}

/// Invalid team names.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("Invalid team name: {0}")]
    InvalidTeamName(String),
}

/// Top-level error for team operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TeamError {
    #[error("Integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("Transport error: {0}")]
    Transport(TransportError),

    #[error("Key directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("Name error: {0}")]
    Name(#[from] NameError),

    #[error("Team not found: {selector}")]
    TeamNotFound { selector: String },

    #[error("Team already exists: {name}")]
    AlreadyExists { name: String },

    #[error("User {user} is not a member of team {team}")]
    NotAMember { team: TeamId, user: UserId },

    #[error("Team {team} has been deleted")]
    TeamDeleted { team: TeamId },

    #[error("Permission denied: {reason}")]
    PermissionDenied { reason: String },

    #[error("{operation} gave up after {attempts} attempts")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
    },

    #[error("Team {team} still at seqno {observed} after {attempts} polls, wanted {target}")]
    TimedOut {
        team: String,
        target: Seqno,
        observed: Seqno,
        attempts: u32,
    },

    #[error("Operation deadline exceeded")]
    DeadlineExceeded,

    #[error("Crypto error: {0}")]
    Crypto(String),
}

impl TeamError {
    /// Staleness and race errors that a reload-and-retry can resolve.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TeamError::Transport(TransportError::SeqnoConflict { .. })
        )
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self, TeamError::Integrity(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            TeamError::TeamNotFound { .. } | TeamError::NotAMember { .. }
        )
    }
}

impl From<TransportError> for TeamError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::NotFound(selector) => TeamError::TeamNotFound { selector },
            other => TeamError::Transport(other),
        }
    }
}

impl From<crate::keys::device::KeyError> for TeamError {
    fn from(e: crate::keys::device::KeyError) -> Self {
        TeamError::Crypto(e.to_string())
    }
}
