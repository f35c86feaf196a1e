//! Single-writer execution lane for a session
//!
//! Every session runs as its own task that owns the `Session` value and
//! applies commands one at a time, in arrival order. Callers talk to it
//! through a `SessionHandle`: each command carries a oneshot reply channel,
//! so a request resolves only after the lane has applied it and queued every
//! resulting event.
//!
//! When a command terminates the session, the lane releases its registry
//! entry before replying and then stops. Commands still queued behind it are
//! dropped unanswered, which callers observe as `SessionNotFound`.

use super::registry::SessionRegistry;
use super::session::{Departure, Poll, PollDefinition, Session};
use crate::broadcast::ConnectionSender;
use crate::error::SessionError;
use crate::protocol::{OptionResult, PollPublicView, StudentInfo};
use crate::types::*;
use tokio::sync::{mpsc, oneshot};

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

pub enum SessionCommand {
    Join {
        connection_id: ConnectionId,
        sender: ConnectionSender,
        name: String,
        reply: Reply<Participant>,
    },
    ListStudents {
        connection_id: ConnectionId,
        reply: Reply<Vec<StudentInfo>>,
    },
    StartPoll {
        connection_id: ConnectionId,
        definition: PollDefinition,
        reply: Reply<PollPublicView>,
    },
    SubmitAnswer {
        connection_id: ConnectionId,
        poll_id: Option<PollId>,
        option_id: OptionId,
        reply: Reply<(PollId, OptionId)>,
    },
    EndPoll {
        connection_id: ConnectionId,
        reply: Reply<Vec<OptionResult>>,
    },
    Kick {
        connection_id: ConnectionId,
        participant_id: ParticipantId,
        reply: Reply<Option<Participant>>,
    },
    Chat {
        connection_id: ConnectionId,
        author: Option<String>,
        text: String,
        reply: Reply<ChatMessage>,
    },
    EndSession {
        connection_id: ConnectionId,
        reply: Reply<()>,
    },
    Disconnect {
        connection_id: ConnectionId,
        reply: oneshot::Sender<Departure>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    /// Server-side teardown; no reply
    Terminate { reason: EndReason },
}

/// Point-in-time copy of a session's state
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub code: SessionCode,
    pub instance_id: SessionInstanceId,
    pub state: SessionState,
    pub roster: Vec<Participant>,
    pub active_poll: Option<Poll>,
    pub poll_history: Vec<Poll>,
    pub chat_log: Vec<ChatMessage>,
}

impl From<&Session> for SessionSnapshot {
    fn from(session: &Session) -> Self {
        Self {
            code: session.code.clone(),
            instance_id: session.instance_id.clone(),
            state: session.state(),
            roster: session.roster().to_vec(),
            active_poll: session.active_poll().cloned(),
            poll_history: session.poll_history().to_vec(),
            chat_log: session.chat_log().iter().cloned().collect(),
        }
    }
}

/// Cloneable address of a running session lane
#[derive(Clone, Debug)]
pub struct SessionHandle {
    pub code: SessionCode,
    pub instance_id: SessionInstanceId,
    pub owner: ConnectionId,
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    fn not_found(&self) -> SessionError {
        SessionError::SessionNotFound(self.code.to_string())
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(build(reply)).map_err(|_| self.not_found())?;
        rx.await.map_err(|_| self.not_found())?
    }

    /// True once the lane has stopped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn join(
        &self,
        connection_id: ConnectionId,
        sender: ConnectionSender,
        name: String,
    ) -> Result<Participant, SessionError> {
        self.request(|reply| SessionCommand::Join {
            connection_id,
            sender,
            name,
            reply,
        })
        .await
    }

    pub async fn list_students(
        &self,
        connection_id: ConnectionId,
    ) -> Result<Vec<StudentInfo>, SessionError> {
        self.request(|reply| SessionCommand::ListStudents {
            connection_id,
            reply,
        })
        .await
    }

    pub async fn start_poll(
        &self,
        connection_id: ConnectionId,
        definition: PollDefinition,
    ) -> Result<PollPublicView, SessionError> {
        self.request(|reply| SessionCommand::StartPoll {
            connection_id,
            definition,
            reply,
        })
        .await
    }

    pub async fn submit_answer(
        &self,
        connection_id: ConnectionId,
        poll_id: Option<PollId>,
        option_id: OptionId,
    ) -> Result<(PollId, OptionId), SessionError> {
        self.request(|reply| SessionCommand::SubmitAnswer {
            connection_id,
            poll_id,
            option_id,
            reply,
        })
        .await
    }

    pub async fn end_poll(
        &self,
        connection_id: ConnectionId,
    ) -> Result<Vec<OptionResult>, SessionError> {
        self.request(|reply| SessionCommand::EndPoll {
            connection_id,
            reply,
        })
        .await
    }

    pub async fn kick(
        &self,
        connection_id: ConnectionId,
        participant_id: ParticipantId,
    ) -> Result<Option<Participant>, SessionError> {
        self.request(|reply| SessionCommand::Kick {
            connection_id,
            participant_id,
            reply,
        })
        .await
    }

    pub async fn chat(
        &self,
        connection_id: ConnectionId,
        author: Option<String>,
        text: String,
    ) -> Result<ChatMessage, SessionError> {
        self.request(|reply| SessionCommand::Chat {
            connection_id,
            author,
            text,
            reply,
        })
        .await
    }

    pub async fn end_session(&self, connection_id: ConnectionId) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::EndSession {
            connection_id,
            reply,
        })
        .await
    }

    /// Report transport loss; a stopped lane reports `Departure::Unknown`
    pub async fn disconnect(&self, connection_id: ConnectionId) -> Departure {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(SessionCommand::Disconnect {
                connection_id,
                reply,
            })
            .is_err()
        {
            return Departure::Unknown;
        }
        rx.await.unwrap_or(Departure::Unknown)
    }

    pub async fn snapshot(&self) -> Option<SessionSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(SessionCommand::Snapshot { reply }).ok()?;
        rx.await.ok()
    }

    pub fn terminate(&self, reason: EndReason) {
        if self.tx.send(SessionCommand::Terminate { reason }).is_err() {
            tracing::debug!(session = %self.code, "Terminate sent to stopped lane");
        }
    }
}

/// Start the lane task for a freshly created session
pub(crate) fn spawn_lane(session: Session, registry: SessionRegistry) -> SessionHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = SessionHandle {
        code: session.code.clone(),
        instance_id: session.instance_id.clone(),
        owner: session.owner().clone(),
        tx,
    };

    tokio::spawn(run(session, rx, registry));
    handle
}

async fn run(
    mut session: Session,
    mut rx: mpsc::UnboundedReceiver<SessionCommand>,
    registry: SessionRegistry,
) {
    tracing::debug!(session = %session.code, instance = %session.instance_id, "Session lane started");

    while let Some(command) = rx.recv().await {
        match command {
            SessionCommand::Join {
                connection_id,
                sender,
                name,
                reply,
            } => {
                let _ = reply.send(session.join(&connection_id, sender, &name));
            }
            SessionCommand::ListStudents {
                connection_id,
                reply,
            } => {
                let _ = reply.send(session.list_students(&connection_id));
            }
            SessionCommand::StartPoll {
                connection_id,
                definition,
                reply,
            } => {
                let _ = reply.send(session.start_poll(&connection_id, definition));
            }
            SessionCommand::SubmitAnswer {
                connection_id,
                poll_id,
                option_id,
                reply,
            } => {
                let result = session.submit_answer(&connection_id, poll_id.as_deref(), &option_id);
                let _ = reply.send(result);
            }
            SessionCommand::EndPoll {
                connection_id,
                reply,
            } => {
                let _ = reply.send(session.end_poll(&connection_id));
            }
            SessionCommand::Kick {
                connection_id,
                participant_id,
                reply,
            } => {
                let _ = reply.send(session.kick(&connection_id, &participant_id));
            }
            SessionCommand::Chat {
                connection_id,
                author,
                text,
                reply,
            } => {
                let _ = reply.send(session.send_chat(&connection_id, author.as_deref(), &text));
            }
            SessionCommand::EndSession {
                connection_id,
                reply,
            } => {
                let result = session.end_session(&connection_id);
                release_if_terminated(&session, &registry).await;
                let _ = reply.send(result);
            }
            SessionCommand::Disconnect {
                connection_id,
                reply,
            } => {
                let departure = session.disconnect(&connection_id);
                release_if_terminated(&session, &registry).await;
                let _ = reply.send(departure);
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(SessionSnapshot::from(&session));
            }
            SessionCommand::Terminate { reason } => {
                session.terminate(reason);
                release_if_terminated(&session, &registry).await;
            }
        }

        if session.is_terminated() {
            break;
        }
    }

    tracing::debug!(session = %session.code, instance = %session.instance_id, "Session lane stopped");
}

async fn release_if_terminated(session: &Session, registry: &SessionRegistry) {
    if session.is_terminated() {
        registry.release(&session.code, &session.instance_id).await;
    }
}
