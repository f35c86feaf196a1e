//! Session state machine
//!
//! A `Session` owns everything belonging to one live polling instance: the
//! roster, the active poll, poll history, the chat log and the router of
//! attached connections. It is only ever touched from its own lane task
//! (see `lane.rs`), so every method here runs without interleaving.
//!
//! Each command validates fully before mutating. A rejected command leaves
//! the session exactly as it was.

use super::tally::Tally;
use crate::broadcast::{BroadcastRouter, ConnectionSender};
use crate::error::SessionError;
use crate::protocol::{
    OptionResult, PollOptionInput, PollPublicView, PublicOption, ServerMessage, StudentInfo,
};
use crate::types::*;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

pub const DEFAULT_PRESENTER_NAME: &str = "Teacher";

#[derive(Debug, Clone)]
pub struct Poll {
    pub id: PollId,
    pub question: String,
    pub options: Vec<PollOption>,
    /// Advisory only; polls end when the presenter says so
    pub timer_seconds: u32,
    pub tally: Tally,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Poll {
    pub fn public_view(&self) -> PollPublicView {
        PollPublicView {
            poll_id: self.id.clone(),
            question: self.question.clone(),
            options: self.options.iter().map(PublicOption::from).collect(),
            timer_seconds: self.timer_seconds,
            created_at: self.created_at,
        }
    }

    pub fn results(&self) -> Vec<OptionResult> {
        self.tally.snapshot(&self.options)
    }
}

/// Poll as submitted by the presenter, before validation
#[derive(Debug, Clone)]
pub struct PollDefinition {
    pub question: String,
    pub options: Vec<PollOptionInput>,
    pub timer_seconds: u32,
}

/// What a `Disconnect` turned out to be
#[derive(Debug, Clone)]
pub enum Departure {
    Presenter,
    Respondent(Participant),
    Unknown,
}

/// Check if a session state transition is valid
pub fn is_valid_transition(from: SessionState, to: SessionState) -> bool {
    use SessionState::*;

    match (from, to) {
        // Nothing leaves TERMINATED
        (Terminated, _) => false,

        // First participant arrived
        (Created, AwaitingPoll) => true,

        // A poll may start before anyone joined
        (Created, PollActive) | (AwaitingPoll, PollActive) => true,
        (PollActive, AwaitingPoll) => true,

        // Explicit end or presenter loss, from anywhere
        (_, Terminated) => true,

        _ => false,
    }
}

/// Validate a poll definition and build its options
fn validate_poll(
    def: &PollDefinition,
    limits: &SessionLimits,
) -> Result<(String, Vec<PollOption>), SessionError> {
    let invalid = |reason: String| SessionError::InvalidPollDefinition(reason);

    let question = def.question.trim();
    if question.is_empty() {
        return Err(invalid("question is required".to_string()));
    }
    if question.chars().count() > limits.max_question_chars {
        return Err(invalid(format!(
            "question must be at most {} characters",
            limits.max_question_chars
        )));
    }

    if def.options.len() < 2 {
        return Err(invalid("at least two options are required".to_string()));
    }
    if def.options.len() > limits.max_options {
        return Err(invalid(format!(
            "at most {} options are allowed",
            limits.max_options
        )));
    }

    let correct = def.options.iter().filter(|o| o.is_correct).count();
    if correct != 1 {
        return Err(invalid(
            "exactly one option must be marked correct".to_string(),
        ));
    }

    if def.timer_seconds > limits.max_timer_seconds {
        return Err(invalid(format!(
            "timer must be at most {} seconds",
            limits.max_timer_seconds
        )));
    }

    let mut options: Vec<PollOption> = Vec::with_capacity(def.options.len());
    for (index, input) in def.options.iter().enumerate() {
        let text = input.text.trim();
        if text.is_empty() {
            return Err(invalid(format!("option {} has no text", index + 1)));
        }
        if text.chars().count() > limits.max_option_chars {
            return Err(invalid(format!(
                "option {} must be at most {} characters",
                index + 1,
                limits.max_option_chars
            )));
        }

        let id = match &input.id {
            Some(id) if id.trim().is_empty() => {
                return Err(invalid("option ids must not be empty".to_string()));
            }
            Some(id) => id.trim().to_string(),
            None => index.to_string(),
        };
        if options.iter().any(|o| o.id == id) {
            return Err(invalid("option ids must be unique".to_string()));
        }

        options.push(PollOption {
            id,
            text: text.to_string(),
            is_correct: input.is_correct,
        });
    }

    Ok((question.to_string(), options))
}

pub struct Session {
    pub code: SessionCode,
    pub instance_id: SessionInstanceId,
    owner: ConnectionId,
    state: SessionState,
    roster: Vec<Participant>,
    active_poll: Option<Poll>,
    poll_history: Vec<Poll>,
    chat_log: VecDeque<ChatMessage>,
    router: BroadcastRouter,
    limits: SessionLimits,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        code: SessionCode,
        owner: ConnectionId,
        sender: ConnectionSender,
        limits: SessionLimits,
    ) -> Self {
        Self {
            router: BroadcastRouter::new(code.clone(), owner.clone(), sender),
            code,
            instance_id: ulid::Ulid::new().to_string(),
            owner,
            state: SessionState::Created,
            roster: Vec::new(),
            active_poll: None,
            poll_history: Vec::new(),
            chat_log: VecDeque::new(),
            limits,
            created_at: Utc::now(),
        }
    }

    pub fn owner(&self) -> &ConnectionId {
        &self.owner
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_terminated(&self) -> bool {
        self.state == SessionState::Terminated
    }

    pub fn roster(&self) -> &[Participant] {
        &self.roster
    }

    pub fn active_poll(&self) -> Option<&Poll> {
        self.active_poll.as_ref()
    }

    pub fn poll_history(&self) -> &[Poll] {
        &self.poll_history
    }

    pub fn chat_log(&self) -> &VecDeque<ChatMessage> {
        &self.chat_log
    }

    fn transition(&mut self, to: SessionState) {
        if !is_valid_transition(self.state, to) {
            tracing::warn!(
                session = %self.code,
                from = ?self.state,
                to = ?to,
                "Ignoring invalid session state transition"
            );
            return;
        }
        tracing::debug!(session = %self.code, from = ?self.state, to = ?to, "Session state changed");
        self.state = to;
    }

    fn ensure_live(&self) -> Result<(), SessionError> {
        if self.is_terminated() {
            Err(SessionError::SessionNotFound(self.code.to_string()))
        } else {
            Ok(())
        }
    }

    fn ensure_owner(
        &self,
        connection_id: &ConnectionId,
        action: &'static str,
    ) -> Result<(), SessionError> {
        if *connection_id == self.owner {
            Ok(())
        } else {
            tracing::warn!(
                session = %self.code,
                connection = %connection_id,
                "Rejected presenter-only command: {}",
                action
            );
            Err(SessionError::NotOwner(action))
        }
    }

    fn roster_index(&self, connection_id: &ConnectionId) -> Option<usize> {
        self.roster
            .iter()
            .position(|p| p.connection_id == *connection_id)
    }

    pub fn students(&self) -> Vec<StudentInfo> {
        self.roster.iter().map(StudentInfo::from).collect()
    }

    fn students_list(&self) -> ServerMessage {
        ServerMessage::StudentsList {
            session_id: self.code.to_string(),
            students: self.students(),
        }
    }

    /// Participants who have answered and participants still expected to
    fn completion(&self) -> (usize, usize) {
        let answered = self
            .roster
            .iter()
            .filter(|p| p.voting_state == VotingState::Answered)
            .count();
        (answered, self.roster.len())
    }

    fn poll_results(&self, poll: &Poll, is_final: bool) -> ServerMessage {
        let (answered, eligible) = self.completion();
        ServerMessage::PollResults {
            poll_id: poll.id.clone(),
            results: poll.results(),
            total_votes: poll.tally.total_votes(),
            answered,
            eligible,
            complete: eligible > 0 && answered == eligible,
            is_final,
        }
    }

    fn refresh_presenter_results(&self) {
        if let Some(poll) = &self.active_poll {
            self.router.to_presenter(self.poll_results(poll, false));
        }
    }

    /// Add a respondent to the roster
    pub fn join(
        &mut self,
        connection_id: &ConnectionId,
        sender: ConnectionSender,
        name: &str,
    ) -> Result<Participant, SessionError> {
        self.ensure_live()?;

        let name = name.trim();
        if name.is_empty() {
            return Err(SessionError::NameRequired);
        }
        if name.chars().count() > self.limits.max_name_chars {
            return Err(SessionError::NameTooLong(self.limits.max_name_chars));
        }
        if self.router.is_attached(connection_id) {
            return Err(SessionError::AlreadyInSession(self.code.to_string()));
        }

        let participant = Participant {
            id: ulid::Ulid::new().to_string(),
            connection_id: connection_id.clone(),
            display_name: name.to_string(),
            voting_state: VotingState::NotAnswered,
            membership: Membership::Active,
            joined_at: Utc::now(),
        };

        self.roster.push(participant.clone());
        self.router.attach(connection_id.clone(), sender);
        if self.state == SessionState::Created {
            self.transition(SessionState::AwaitingPoll);
        }

        tracing::info!(
            session = %self.code,
            participant = %participant.id,
            "{} joined ({} in roster)",
            participant.display_name,
            self.roster.len()
        );

        self.router.send_to(
            connection_id,
            ServerMessage::JoinSuccess {
                session_id: self.code.to_string(),
                participant_id: participant.id.clone(),
                name: participant.display_name.clone(),
            },
        );
        self.router.to_presenter(self.students_list());
        self.router
            .to_all(ServerMessage::StudentJoined(StudentInfo::from(&participant)));

        // Late joiners can still answer the running poll
        if let Some(poll) = &self.active_poll {
            self.router
                .send_to(connection_id, ServerMessage::NewQuestion(poll.public_view()));
            self.refresh_presenter_results();
        }

        Ok(participant)
    }

    /// Roster view for the presenter
    pub fn list_students(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<Vec<StudentInfo>, SessionError> {
        self.ensure_live()?;
        self.ensure_owner(connection_id, "list participants")?;
        Ok(self.students())
    }

    pub fn start_poll(
        &mut self,
        connection_id: &ConnectionId,
        def: PollDefinition,
    ) -> Result<PollPublicView, SessionError> {
        self.ensure_live()?;
        self.ensure_owner(connection_id, "start polls")?;

        if self.active_poll.is_some() || !is_valid_transition(self.state, SessionState::PollActive)
        {
            return Err(SessionError::PollAlreadyActive);
        }

        let (question, options) = validate_poll(&def, &self.limits)?;

        for participant in &mut self.roster {
            participant.voting_state = VotingState::NotAnswered;
        }

        let poll = Poll {
            id: ulid::Ulid::new().to_string(),
            question,
            tally: Tally::new(&options),
            options,
            timer_seconds: def.timer_seconds,
            created_at: Utc::now(),
            ended_at: None,
        };
        let view = poll.public_view();

        tracing::info!(
            session = %self.code,
            poll = %poll.id,
            options = poll.options.len(),
            "Poll started: {}",
            poll.question
        );

        self.active_poll = Some(poll);
        self.transition(SessionState::PollActive);

        self.router
            .to_respondents(ServerMessage::NewQuestion(view.clone()));
        self.refresh_presenter_results();
        self.router.to_presenter(self.students_list());

        Ok(view)
    }

    /// Record a respondent's answer; returns the poll and option it counted for
    pub fn submit_answer(
        &mut self,
        connection_id: &ConnectionId,
        poll_id: Option<&str>,
        option_id: &str,
    ) -> Result<(PollId, OptionId), SessionError> {
        self.ensure_live()?;

        let index = self
            .roster_index(connection_id)
            .ok_or(SessionError::NotParticipant)?;
        let participant_id = self.roster[index].id.clone();
        let option_id = option_id.trim().to_string();

        let poll = self
            .active_poll
            .as_mut()
            .ok_or(SessionError::NoActivePoll)?;

        if let Some(requested) = poll_id {
            if requested != poll.id {
                return Err(SessionError::PollNotFound);
            }
        }
        if !poll.options.iter().any(|o| o.id == option_id) {
            return Err(SessionError::UnknownOption(option_id));
        }
        if self.roster[index].voting_state == VotingState::Answered {
            return Err(SessionError::AlreadyAnswered);
        }

        poll.tally.record_vote(&participant_id, &option_id)?;
        let poll_id = poll.id.clone();
        self.roster[index].voting_state = VotingState::Answered;

        tracing::debug!(
            session = %self.code,
            poll = %poll_id,
            participant = %participant_id,
            option = %option_id,
            "Answer recorded"
        );

        self.router.to_presenter(ServerMessage::AnswerSubmitted {
            participant_id,
            option_id: option_id.clone(),
        });
        self.refresh_presenter_results();
        self.router.to_presenter(self.students_list());

        let (answered, eligible) = self.completion();
        if answered == eligible {
            tracing::info!(session = %self.code, poll = %poll_id, "All participants answered");
        }

        Ok((poll_id, option_id))
    }

    /// End the active poll and return its final results
    pub fn end_poll(
        &mut self,
        connection_id: &ConnectionId,
    ) -> Result<Vec<OptionResult>, SessionError> {
        self.ensure_live()?;
        self.ensure_owner(connection_id, "end polls")?;

        let mut poll = self.active_poll.take().ok_or(SessionError::NoActivePoll)?;
        poll.ended_at = Some(Utc::now());
        self.transition(SessionState::AwaitingPoll);

        let results = poll.results();
        tracing::info!(
            session = %self.code,
            poll = %poll.id,
            votes = poll.tally.total_votes(),
            "Poll ended"
        );

        self.router.to_all(ServerMessage::PollEnded {
            poll_id: poll.id.clone(),
        });
        self.router.to_presenter(self.poll_results(&poll, true));
        self.poll_history.push(poll);

        Ok(results)
    }

    /// Remove a participant; kicking someone already gone is a no-op
    pub fn kick(
        &mut self,
        connection_id: &ConnectionId,
        participant_id: &ParticipantId,
    ) -> Result<Option<Participant>, SessionError> {
        self.ensure_live()?;
        self.ensure_owner(connection_id, "remove participants")?;

        let Some(index) = self.roster.iter().position(|p| p.id == *participant_id) else {
            tracing::debug!(session = %self.code, participant = %participant_id, "Kick target not in roster");
            return Ok(None);
        };

        let mut participant = self.roster.remove(index);
        participant.membership = Membership::Kicked;

        tracing::info!(
            session = %self.code,
            participant = %participant.id,
            "Kicked {}",
            participant.display_name
        );

        self.router.send_to(
            &participant.connection_id,
            ServerMessage::KickedOut {
                session_id: self.code.to_string(),
            },
        );
        self.router.detach(&participant.connection_id);

        self.router.to_presenter(ServerMessage::StudentLeft {
            participant_id: participant.id.clone(),
            name: Some(participant.display_name.clone()),
            reason: participant.membership,
        });
        self.router.to_presenter(self.students_list());
        self.refresh_presenter_results();

        Ok(Some(participant))
    }

    pub fn send_chat(
        &mut self,
        connection_id: &ConnectionId,
        author: Option<&str>,
        text: &str,
    ) -> Result<ChatMessage, SessionError> {
        self.ensure_live()?;

        // Respondents always speak under their roster name
        let author = if *connection_id == self.owner {
            let author = author
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .unwrap_or(DEFAULT_PRESENTER_NAME);
            if author.chars().count() > self.limits.max_name_chars {
                return Err(SessionError::InvalidChatMessage(format!(
                    "author must be at most {} characters",
                    self.limits.max_name_chars
                )));
            }
            author.to_string()
        } else {
            let index = self
                .roster_index(connection_id)
                .ok_or(SessionError::NotParticipant)?;
            self.roster[index].display_name.clone()
        };

        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::InvalidChatMessage(
                "message is empty".to_string(),
            ));
        }
        if text.chars().count() > self.limits.max_chat_chars {
            return Err(SessionError::InvalidChatMessage(format!(
                "message must be at most {} characters",
                self.limits.max_chat_chars
            )));
        }

        let message = ChatMessage {
            author,
            text: text.to_string(),
            timestamp: Utc::now(),
        };

        if self.limits.chat_log_capacity > 0 {
            if self.chat_log.len() >= self.limits.chat_log_capacity {
                self.chat_log.pop_front();
            }
            self.chat_log.push_back(message.clone());
        }

        self.router.to_all(ServerMessage::ChatMessage {
            author: message.author.clone(),
            text: message.text.clone(),
            timestamp: message.timestamp,
        });

        Ok(message)
    }

    /// Presenter-initiated termination
    pub fn end_session(&mut self, connection_id: &ConnectionId) -> Result<(), SessionError> {
        self.ensure_live()?;
        self.ensure_owner(connection_id, "end the session")?;
        self.terminate(EndReason::Ended);
        Ok(())
    }

    /// Transport loss for a connection attached to this session
    pub fn disconnect(&mut self, connection_id: &ConnectionId) -> Departure {
        if self.is_terminated() {
            return Departure::Unknown;
        }

        if *connection_id == self.owner {
            self.terminate(EndReason::PresenterDisconnected);
            return Departure::Presenter;
        }

        let Some(index) = self.roster_index(connection_id) else {
            return Departure::Unknown;
        };

        let mut participant = self.roster.remove(index);
        participant.membership = Membership::Disconnected;
        self.router.detach(connection_id);

        tracing::info!(
            session = %self.code,
            participant = %participant.id,
            "{} disconnected",
            participant.display_name
        );

        self.router.to_presenter(ServerMessage::StudentLeft {
            participant_id: participant.id.clone(),
            name: Some(participant.display_name.clone()),
            reason: participant.membership,
        });
        self.router.to_presenter(self.students_list());
        self.refresh_presenter_results();

        Departure::Respondent(participant)
    }

    /// Notify and detach everyone; idempotent
    pub fn terminate(&mut self, reason: EndReason) {
        if self.is_terminated() {
            return;
        }

        if let Some(mut poll) = self.active_poll.take() {
            poll.ended_at = Some(Utc::now());
            self.poll_history.push(poll);
        }
        self.transition(SessionState::Terminated);

        tracing::info!(
            session = %self.code,
            reason = ?reason,
            participants = self.roster.len(),
            polls = self.poll_history.len(),
            "Session terminated"
        );

        self.router.to_all(ServerMessage::SessionEnded {
            session_id: self.code.to_string(),
            reason,
        });
        self.roster.clear();
        self.router.detach_all();
    }
}
