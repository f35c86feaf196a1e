//! Per-session fan-out of outbound events
//!
//! Each connection owns an unbounded queue of `Outbound` items that its
//! gateway task drains onto the socket. A session's `BroadcastRouter` holds
//! the senders of every connection attached to that session. The router is
//! owned by the session lane, so pushes happen in lane order and every
//! attached connection sees the same sequence of events.

use crate::protocol::ServerMessage;
use crate::types::{ConnectionId, SessionCode};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Item delivered to a connection's gateway task
#[derive(Debug, Clone)]
pub enum Outbound {
    Event(ServerMessage),
    /// The connection is no longer attached to `session`
    Detach { session: SessionCode },
}

pub type ConnectionSender = mpsc::UnboundedSender<Outbound>;
pub type ConnectionReceiver = mpsc::UnboundedReceiver<Outbound>;

pub fn connection_channel() -> (ConnectionSender, ConnectionReceiver) {
    mpsc::unbounded_channel()
}

pub struct BroadcastRouter {
    session: SessionCode,
    presenter: (ConnectionId, ConnectionSender),
    respondents: HashMap<ConnectionId, ConnectionSender>,
}

impl BroadcastRouter {
    pub fn new(session: SessionCode, presenter: ConnectionId, sender: ConnectionSender) -> Self {
        Self {
            session,
            presenter: (presenter, sender),
            respondents: HashMap::new(),
        }
    }

    pub fn attach(&mut self, connection_id: ConnectionId, sender: ConnectionSender) {
        self.respondents.insert(connection_id, sender);
    }

    pub fn is_attached(&self, connection_id: &ConnectionId) -> bool {
        self.presenter.0 == *connection_id || self.respondents.contains_key(connection_id)
    }

    /// Send to a single attached connection
    pub fn send_to(&self, connection_id: &ConnectionId, msg: ServerMessage) {
        if self.presenter.0 == *connection_id {
            push(&self.presenter.0, &self.presenter.1, Outbound::Event(msg));
        } else if let Some(sender) = self.respondents.get(connection_id) {
            push(connection_id, sender, Outbound::Event(msg));
        } else {
            tracing::debug!(
                session = %self.session,
                connection = %connection_id,
                "Dropping message for unattached connection"
            );
        }
    }

    pub fn to_presenter(&self, msg: ServerMessage) {
        push(&self.presenter.0, &self.presenter.1, Outbound::Event(msg));
    }

    pub fn to_respondents(&self, msg: ServerMessage) {
        for (connection_id, sender) in &self.respondents {
            push(connection_id, sender, Outbound::Event(msg.clone()));
        }
    }

    /// Presenter first, then every respondent
    pub fn to_all(&self, msg: ServerMessage) {
        self.to_presenter(msg.clone());
        self.to_respondents(msg);
    }

    /// Remove a respondent and tell its gateway it is no longer attached
    pub fn detach(&mut self, connection_id: &ConnectionId) -> bool {
        match self.respondents.remove(connection_id) {
            Some(sender) => {
                let detach = Outbound::Detach {
                    session: self.session.clone(),
                };
                push(connection_id, &sender, detach);
                true
            }
            None => false,
        }
    }

    /// Detach every connection, presenter included
    pub fn detach_all(&mut self) {
        let detach = Outbound::Detach {
            session: self.session.clone(),
        };
        for (connection_id, sender) in self.respondents.drain() {
            push(&connection_id, &sender, detach.clone());
        }
        push(&self.presenter.0, &self.presenter.1, detach);
    }
}

fn push(connection_id: &ConnectionId, sender: &ConnectionSender, item: Outbound) {
    // A closed queue means the socket task already exited; its Disconnect
    // command is on the way, so dropping here is fine.
    if sender.send(item).is_err() {
        tracing::debug!(connection = %connection_id, "Outbound queue closed");
    }
}
