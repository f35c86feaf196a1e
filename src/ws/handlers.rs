//! WebSocket message dispatch
//!
//! This module provides the main entry point for handling client messages.
//! Presenter-only commands are screened here against the connection's
//! binding, then dispatched to role-specific handler modules. The session
//! lane re-checks ownership when it applies the command.

use crate::error::SessionError;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::state::AppState;
use crate::types::Role;
use std::sync::Arc;

use super::{host, student, Connection};

/// Macro to check presenter authorization and return early if unauthorized
macro_rules! check_presenter {
    ($conn:expr, $session_id:expr, $action:expr) => {
        if $conn.role_in($session_id) != Some(Role::Presenter) {
            tracing::warn!(connection = %$conn.id, "Rejected presenter-only command: {}", $action);
            return Some(ServerMessage::error(&SessionError::NotOwner($action)));
        }
    };
}

/// Handle client messages and return optional response
///
/// Events caused by a command (roster updates, poll broadcasts and so on)
/// are queued by the session itself; the return value is only the direct
/// reply to this connection.
pub async fn handle_message(
    msg: ClientMessage,
    conn: &mut Connection,
    state: &Arc<AppState>,
) -> Option<ServerMessage> {
    match msg {
        ClientMessage::CreateSession { session_id } => {
            host::handle_create_session(state, conn, session_id).await
        }

        ClientMessage::JoinStudent { session_id, name } => {
            student::handle_join(state, conn, session_id, name).await
        }

        ClientMessage::SubmitAnswer {
            session_id,
            poll_id,
            option_id,
        } => student::handle_submit_answer(state, conn, session_id, poll_id, option_id).await,

        // Either role may chat; the session decides the author
        ClientMessage::ChatMessage {
            session_id,
            author,
            text,
        } => handle_chat(state, conn, session_id, author, text).await,

        // Presenter-only commands
        ClientMessage::GetStudents { session_id } => {
            check_presenter!(conn, &session_id, "list participants");
            host::handle_get_students(state, conn, session_id).await
        }

        ClientMessage::CreatePoll {
            session_id,
            question,
            options,
            timer_seconds,
        } => {
            check_presenter!(conn, &session_id, "start polls");
            host::handle_create_poll(state, conn, session_id, question, options, timer_seconds)
                .await
        }

        ClientMessage::KickParticipant {
            session_id,
            participant_id,
        } => {
            check_presenter!(conn, &session_id, "remove participants");
            host::handle_kick(state, conn, session_id, participant_id).await
        }

        ClientMessage::EndPoll { session_id } => {
            check_presenter!(conn, &session_id, "end polls");
            host::handle_end_poll(state, conn, session_id).await
        }

        ClientMessage::EndSession { session_id } => {
            check_presenter!(conn, &session_id, "end the session");
            host::handle_end_session(state, conn, session_id).await
        }
    }
}

async fn handle_chat(
    state: &Arc<AppState>,
    conn: &Connection,
    session_id: String,
    author: Option<String>,
    text: String,
) -> Option<ServerMessage> {
    let result = match state.registry.lookup(&session_id).await {
        Ok(handle) => handle.chat(conn.id.clone(), author, text).await,
        Err(e) => Err(e),
    };

    match result {
        // Delivered to everyone, sender included, by the session
        Ok(_) => None,
        Err(e) => Some(ServerMessage::error(&e)),
    }
}
