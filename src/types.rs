use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque ID types for type safety
pub type ConnectionId = String;
pub type ParticipantId = String;
pub type PollId = String;
pub type OptionId = String;
/// Unique per session instance; two sessions reusing a code never share one
pub type SessionInstanceId = String;

/// Normalized, case-insensitive session join code
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionCode(String);

impl SessionCode {
    /// Trim and uppercase without validating; used for lookups
    pub fn normalize(raw: &str) -> Self {
        Self(raw.trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Created,
    AwaitingPoll,
    PollActive,
    Terminated,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VotingState {
    NotAnswered,
    Answered,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    Active,
    Kicked,
    Disconnected,
}

/// Role a connection holds within the session it is bound to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Presenter,
    Respondent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    /// Never sent to clients; the server-held link used for authorization
    #[serde(skip)]
    pub connection_id: ConnectionId,
    pub display_name: String,
    pub voting_state: VotingState,
    pub membership: Membership,
    pub joined_at: DateTime<Utc>,
}

/// A poll option as held by the server (includes the correctness flag)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollOption {
    pub id: OptionId,
    pub text: String,
    pub is_correct: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub author: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Why a session stopped
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The presenter ended the session explicitly
    Ended,
    /// The presenter's connection was lost
    PresenterDisconnected,
    /// Removed from the registry by the server
    Destroyed,
}

/// Per-session input limits, taken from the server config
#[derive(Debug, Clone)]
pub struct SessionLimits {
    pub max_name_chars: usize,
    pub max_question_chars: usize,
    pub max_option_chars: usize,
    pub max_options: usize,
    pub max_timer_seconds: u32,
    pub max_chat_chars: usize,
    pub chat_log_capacity: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_name_chars: 40,
            max_question_chars: 500,
            max_option_chars: 200,
            max_options: 10,
            max_timer_seconds: 3600,
            max_chat_chars: 500,
            chat_log_capacity: 200,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_code_normalization() {
        assert_eq!(SessionCode::normalize("  ab12cd ").as_str(), "AB12CD");
        assert_eq!(
            SessionCode::normalize("Ab12Cd"),
            SessionCode::normalize("AB12CD")
        );
    }

    #[test]
    fn test_state_serializes_screaming_case() {
        let json = serde_json::to_string(&SessionState::AwaitingPoll).unwrap();
        assert_eq!(json, "\"AWAITING_POLL\"");
    }
}
