//! Presenter command handlers
//!
//! Authorization is screened in the dispatch layer before calling these;
//! the session lane makes the final ownership decision.

use super::Connection;
use crate::error::SessionError;
use crate::protocol::{PollOptionInput, ServerMessage};
use crate::state::{AppState, PollDefinition};
use crate::types::{ParticipantId, Role, SessionCode};
use std::sync::Arc;

/// Turn a command result into the direct reply for this connection
fn reply<T>(
    result: Result<T, SessionError>,
    on_success: impl FnOnce(T) -> Option<ServerMessage>,
) -> Option<ServerMessage> {
    match result {
        Ok(value) => on_success(value),
        Err(e) => Some(ServerMessage::error(&e)),
    }
}

pub async fn handle_create_session(
    state: &Arc<AppState>,
    conn: &mut Connection,
    requested: Option<String>,
) -> Option<ServerMessage> {
    // A bound connection may only re-issue create for the session it runs
    if let Some(binding) = &conn.binding {
        let resuming = requested
            .as_deref()
            .is_some_and(|raw| SessionCode::normalize(raw) == binding.code);
        if !resuming {
            return Some(ServerMessage::error(&SessionError::AlreadyInSession(
                binding.code.to_string(),
            )));
        }
    }

    let result = state
        .registry
        .create_session(&conn.id, conn.sender.clone(), requested.as_deref())
        .await;

    match result {
        Ok(handle) => {
            tracing::info!(connection = %conn.id, session = %handle.code, "Presenter opened session");
            conn.bind(
                handle.code.clone(),
                handle.instance_id.clone(),
                Role::Presenter,
            );
            Some(ServerMessage::SessionCreated {
                session_id: handle.code.to_string(),
            })
        }
        Err(e) => Some(ServerMessage::error(&e)),
    }
}

pub async fn handle_get_students(
    state: &Arc<AppState>,
    conn: &Connection,
    session_id: String,
) -> Option<ServerMessage> {
    let handle = match state.registry.lookup(&session_id).await {
        Ok(handle) => handle,
        Err(e) => return Some(ServerMessage::error(&e)),
    };

    reply(handle.list_students(conn.id.clone()).await, |students| {
        Some(ServerMessage::StudentsList {
            session_id: handle.code.to_string(),
            students,
        })
    })
}

pub async fn handle_create_poll(
    state: &Arc<AppState>,
    conn: &Connection,
    session_id: String,
    question: String,
    options: Vec<PollOptionInput>,
    timer_seconds: u32,
) -> Option<ServerMessage> {
    let handle = match state.registry.lookup(&session_id).await {
        Ok(handle) => handle,
        Err(e) => return Some(ServerMessage::error(&e)),
    };

    let definition = PollDefinition {
        question,
        options,
        timer_seconds,
    };

    // The presenter's results and roster views are queued by the session
    reply(
        handle.start_poll(conn.id.clone(), definition).await,
        |_| None,
    )
}

pub async fn handle_kick(
    state: &Arc<AppState>,
    conn: &Connection,
    session_id: String,
    participant_id: ParticipantId,
) -> Option<ServerMessage> {
    let handle = match state.registry.lookup(&session_id).await {
        Ok(handle) => handle,
        Err(e) => return Some(ServerMessage::error(&e)),
    };

    reply(
        handle.kick(conn.id.clone(), participant_id).await,
        |_| None,
    )
}

pub async fn handle_end_poll(
    state: &Arc<AppState>,
    conn: &Connection,
    session_id: String,
) -> Option<ServerMessage> {
    let handle = match state.registry.lookup(&session_id).await {
        Ok(handle) => handle,
        Err(e) => return Some(ServerMessage::error(&e)),
    };

    reply(handle.end_poll(conn.id.clone()).await, |_| None)
}

pub async fn handle_end_session(
    state: &Arc<AppState>,
    conn: &Connection,
    session_id: String,
) -> Option<ServerMessage> {
    let handle = match state.registry.lookup(&session_id).await {
        Ok(handle) => handle,
        Err(e) => return Some(ServerMessage::error(&e)),
    };

    reply(handle.end_session(conn.id.clone()).await, |_| None)
}
