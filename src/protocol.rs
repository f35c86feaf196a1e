use crate::error::{ErrorKind, SessionError};
use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: &str = "1.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Presenter opens a session, optionally resuming a previously issued code
    CreateSession {
        #[serde(default)]
        session_id: Option<String>,
    },
    JoinStudent {
        session_id: String,
        name: String,
    },
    GetStudents {
        session_id: String,
    },
    CreatePoll {
        session_id: String,
        question: String,
        options: Vec<PollOptionInput>,
        #[serde(default, alias = "timer")]
        timer_seconds: u32,
    },
    SubmitAnswer {
        session_id: String,
        #[serde(default)]
        poll_id: Option<PollId>,
        #[serde(alias = "answer")]
        option_id: OptionId,
    },
    ChatMessage {
        session_id: String,
        #[serde(default, alias = "user")]
        author: Option<String>,
        text: String,
    },
    KickParticipant {
        session_id: String,
        participant_id: ParticipantId,
    },
    EndPoll {
        session_id: String,
    },
    EndSession {
        session_id: String,
    },
}

/// Poll option as authored by the presenter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollOptionInput {
    #[serde(default)]
    pub id: Option<OptionId>,
    pub text: String,
    #[serde(default)]
    pub is_correct: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Welcome {
        connection_id: ConnectionId,
        protocol: String,
        server_now: DateTime<Utc>,
    },
    SessionCreated {
        session_id: String,
    },
    JoinSuccess {
        session_id: String,
        participant_id: ParticipantId,
        name: String,
    },
    JoinError {
        code: String,
        message: String,
    },
    /// Presenter-only roster view
    StudentsList {
        session_id: String,
        students: Vec<StudentInfo>,
    },
    StudentJoined(StudentInfo),
    StudentLeft {
        participant_id: ParticipantId,
        name: Option<String>,
        reason: Membership,
    },
    /// Public poll view sent to respondents (no correctness, no tallies)
    NewQuestion(PollPublicView),
    /// Sent to the respondent whose answer was recorded
    AnswerAccepted {
        poll_id: PollId,
        option_id: OptionId,
    },
    /// Presenter-only notice for each recorded vote
    AnswerSubmitted {
        participant_id: ParticipantId,
        option_id: OptionId,
    },
    /// Presenter-only tally view
    ///
    /// `answered` and `eligible` describe the current roster only, while
    /// `totalVotes` and the per-option counts keep votes from respondents who
    /// have since left. After a voter departs `totalVotes` can exceed
    /// `answered`.
    PollResults {
        poll_id: PollId,
        results: Vec<OptionResult>,
        total_votes: u32,
        answered: usize,
        eligible: usize,
        complete: bool,
        #[serde(rename = "final")]
        is_final: bool,
    },
    PollEnded {
        poll_id: PollId,
    },
    ChatMessage {
        author: String,
        text: String,
        timestamp: DateTime<Utc>,
    },
    KickedOut {
        session_id: String,
    },
    SessionEnded {
        session_id: String,
        reason: EndReason,
    },
    Error {
        code: String,
        kind: ErrorKind,
        message: String,
    },
}

impl ServerMessage {
    pub fn error(err: &SessionError) -> Self {
        ServerMessage::Error {
            code: err.code().to_string(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn join_error(err: &SessionError) -> Self {
        ServerMessage::JoinError {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Roster entry as shown to the presenter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StudentInfo {
    pub id: ParticipantId,
    pub name: String,
    pub has_voted: bool,
    pub joined_at: DateTime<Utc>,
}

impl From<&Participant> for StudentInfo {
    fn from(p: &Participant) -> Self {
        Self {
            id: p.id.clone(),
            name: p.display_name.clone(),
            has_voted: p.voting_state == VotingState::Answered,
            joined_at: p.joined_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PollPublicView {
    pub poll_id: PollId,
    pub question: String,
    pub options: Vec<PublicOption>,
    pub timer_seconds: u32,
    pub created_at: DateTime<Utc>,
}

/// Option without the correctness flag
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublicOption {
    pub id: OptionId,
    pub text: String,
}

impl From<&PollOption> for PublicOption {
    fn from(o: &PollOption) -> Self {
        Self {
            id: o.id.clone(),
            text: o.text.clone(),
        }
    }
}

/// Per-option tally line for the presenter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OptionResult {
    pub option_id: OptionId,
    pub text: String,
    pub is_correct: bool,
    pub votes: u32,
    pub percentage: u32,
}
