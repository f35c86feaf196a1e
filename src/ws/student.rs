//! Respondent command handlers

use super::Connection;
use crate::error::SessionError;
use crate::protocol::ServerMessage;
use crate::state::AppState;
use crate::types::{OptionId, PollId, Role};
use std::sync::Arc;

pub async fn handle_join(
    state: &Arc<AppState>,
    conn: &mut Connection,
    session_id: String,
    name: String,
) -> Option<ServerMessage> {
    if let Some(binding) = &conn.binding {
        return Some(ServerMessage::join_error(&SessionError::AlreadyInSession(
            binding.code.to_string(),
        )));
    }

    let handle = match state.registry.lookup(&session_id).await {
        Ok(handle) => handle,
        Err(e) => {
            tracing::debug!(connection = %conn.id, "Join failed: {}", e);
            return Some(ServerMessage::join_error(&e));
        }
    };

    match handle
        .join(conn.id.clone(), conn.sender.clone(), name)
        .await
    {
        Ok(_) => {
            // join-success was queued by the session ahead of the running poll
            conn.bind(
                handle.code.clone(),
                handle.instance_id.clone(),
                Role::Respondent,
            );
            None
        }
        Err(e) => {
            tracing::debug!(connection = %conn.id, session = %handle.code, "Join rejected: {}", e);
            Some(ServerMessage::join_error(&e))
        }
    }
}

pub async fn handle_submit_answer(
    state: &Arc<AppState>,
    conn: &Connection,
    session_id: String,
    poll_id: Option<PollId>,
    option_id: OptionId,
) -> Option<ServerMessage> {
    let handle = match state.registry.lookup(&session_id).await {
        Ok(handle) => handle,
        Err(e) => return Some(ServerMessage::error(&e)),
    };

    match handle
        .submit_answer(conn.id.clone(), poll_id, option_id)
        .await
    {
        Ok((poll_id, option_id)) => Some(ServerMessage::AnswerAccepted { poll_id, option_id }),
        Err(e) => {
            tracing::debug!(connection = %conn.id, session = %handle.code, "Answer rejected: {}", e);
            Some(ServerMessage::error(&e))
        }
    }
}
