//! Error taxonomy for session commands
//!
//! Every command handled by a session lane resolves to either a success value
//! or one of these errors. The failing connection gets a targeted `error`
//! frame built from `code()`, `kind()` and the display message.

use serde::{Deserialize, Serialize};

/// Coarse failure category sent alongside the specific error code
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidInput,
    Conflict,
    ResourceExhausted,
    Forbidden,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Session {0} not found")]
    SessionNotFound(String),

    #[error("Poll is no longer active")]
    PollNotFound,

    #[error("Option {0} is not part of the active poll")]
    UnknownOption(String),

    #[error("No poll is currently active")]
    NoActivePoll,

    #[error("Please enter your name")]
    NameRequired,

    #[error("Name must be at most {0} characters")]
    NameTooLong(usize),

    #[error("Invalid poll: {0}")]
    InvalidPollDefinition(String),

    #[error("Invalid session code: {0}")]
    InvalidSessionCode(String),

    #[error("Invalid chat message: {0}")]
    InvalidChatMessage(String),

    #[error("A poll is already active in this session")]
    PollAlreadyActive,

    #[error("Answer already submitted for this poll")]
    AlreadyAnswered,

    #[error("Session code {0} is already in use")]
    SessionCodeConflict(String),

    #[error("Connection is already attached to session {0}")]
    AlreadyInSession(String),

    #[error("Could not allocate a free session code after {0} attempts")]
    ResourceExhausted(u32),

    #[error("Only the session owner can {0}")]
    NotOwner(&'static str),

    #[error("Connection is not a participant of this session")]
    NotParticipant,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        use SessionError::*;

        match self {
            SessionNotFound(_) | PollNotFound | UnknownOption(_) | NoActivePoll => {
                ErrorKind::NotFound
            }
            NameRequired
            | NameTooLong(_)
            | InvalidPollDefinition(_)
            | InvalidSessionCode(_)
            | InvalidChatMessage(_) => ErrorKind::InvalidInput,
            PollAlreadyActive
            | AlreadyAnswered
            | SessionCodeConflict(_)
            | AlreadyInSession(_) => ErrorKind::Conflict,
            ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            NotOwner(_) | NotParticipant => ErrorKind::Forbidden,
        }
    }

    /// Stable machine-readable code for clients
    pub fn code(&self) -> &'static str {
        use SessionError::*;

        match self {
            SessionNotFound(_) => "SESSION_NOT_FOUND",
            PollNotFound => "POLL_NOT_FOUND",
            UnknownOption(_) => "UNKNOWN_OPTION",
            NoActivePoll => "NO_ACTIVE_POLL",
            NameRequired => "NAME_REQUIRED",
            NameTooLong(_) => "NAME_TOO_LONG",
            InvalidPollDefinition(_) => "INVALID_POLL_DEFINITION",
            InvalidSessionCode(_) => "INVALID_SESSION_CODE",
            InvalidChatMessage(_) => "INVALID_CHAT_MESSAGE",
            PollAlreadyActive => "POLL_ALREADY_ACTIVE",
            AlreadyAnswered => "ALREADY_ANSWERED",
            SessionCodeConflict(_) => "SESSION_CODE_CONFLICT",
            AlreadyInSession(_) => "ALREADY_IN_SESSION",
            ResourceExhausted(_) => "RESOURCE_EXHAUSTED",
            NotOwner(_) => "FORBIDDEN",
            NotParticipant => "NOT_PARTICIPANT",
        }
    }
}
