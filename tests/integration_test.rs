use futures::{SinkExt, StreamExt};
use livepoll::abuse::{AbuseConfig, RateLimiter};
use livepoll::broadcast::ConnectionReceiver;
use livepoll::config::ServerConfig;
use livepoll::protocol::{ClientMessage, OptionResult, PollOptionInput, ServerMessage};
use livepoll::state::AppState;
use livepoll::types::{EndReason, Membership, Role, SessionState, VotingState};
use livepoll::ws::handlers::handle_message;
use livepoll::ws::{close_connection, Connection};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// A connection plus the queue its socket task would drain
struct Client {
    conn: Connection,
    rx: ConnectionReceiver,
}

impl Client {
    fn new() -> Self {
        let (conn, rx) = Connection::new();
        Self { conn, rx }
    }

    async fn send(&mut self, msg: ClientMessage, state: &Arc<AppState>) -> Option<ServerMessage> {
        handle_message(msg, &mut self.conn, state).await
    }

    /// Everything delivered so far, applying detaches like the gateway does
    fn received(&mut self) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(item) = self.rx.try_recv() {
            if let Some(msg) = self.conn.apply(item) {
                out.push(msg);
            }
        }
        out
    }
}

fn math_poll(session_id: &str) -> ClientMessage {
    ClientMessage::CreatePoll {
        session_id: session_id.to_string(),
        question: "2+2?".to_string(),
        options: vec![
            PollOptionInput {
                id: None,
                text: "3".to_string(),
                is_correct: false,
            },
            PollOptionInput {
                id: None,
                text: "4".to_string(),
                is_correct: true,
            },
        ],
        timer_seconds: 30,
    }
}

fn join(session_id: &str, name: &str) -> ClientMessage {
    ClientMessage::JoinStudent {
        session_id: session_id.to_string(),
        name: name.to_string(),
    }
}

fn answer(session_id: &str, option_id: &str) -> ClientMessage {
    ClientMessage::SubmitAnswer {
        session_id: session_id.to_string(),
        poll_id: None,
        option_id: option_id.to_string(),
    }
}

fn last_results(events: &[ServerMessage]) -> Option<Vec<OptionResult>> {
    events.iter().rev().find_map(|m| match m {
        ServerMessage::PollResults { results, .. } => Some(results.clone()),
        _ => None,
    })
}

fn votes(results: &[OptionResult]) -> Vec<(String, u32)> {
    results
        .iter()
        .map(|r| (r.text.clone(), r.votes))
        .collect()
}

async fn open_session(state: &Arc<AppState>, host: &mut Client, code: &str) {
    let created = host
        .send(
            ClientMessage::CreateSession {
                session_id: Some(code.to_string()),
            },
            state,
        )
        .await;
    match created {
        Some(ServerMessage::SessionCreated { session_id }) => assert_eq!(session_id, code),
        other => panic!("Expected SessionCreated, got {:?}", other),
    }
}

/// Scenarios 1 through 4 of a classroom session, end to end
#[tokio::test]
async fn test_full_session_flow() {
    let state = Arc::new(AppState::new());
    let mut host = Client::new();
    let mut ann = Client::new();
    let mut bob = Client::new();

    // 1. Create session and join as Ann
    open_session(&state, &mut host, "AB12CD").await;

    assert!(ann.send(join("ab12cd", "Ann"), &state).await.is_none());
    match ann.received().first() {
        Some(ServerMessage::JoinSuccess {
            session_id, name, ..
        }) => {
            assert_eq!(session_id, "AB12CD");
            assert_eq!(name, "Ann");
        }
        other => panic!("Expected JoinSuccess, got {:?}", other),
    }

    let roster = host
        .send(
            ClientMessage::GetStudents {
                session_id: "AB12CD".to_string(),
            },
            &state,
        )
        .await;
    match roster {
        Some(ServerMessage::StudentsList { students, .. }) => {
            assert_eq!(students.len(), 1);
            assert_eq!(students[0].name, "Ann");
            assert!(!students[0].has_voted);
        }
        other => panic!("Expected StudentsList, got {:?}", other),
    }

    // 2. Poll, one vote, one rejected retry
    assert!(bob.send(join("AB12CD", "Bob"), &state).await.is_none());
    ann.received();
    bob.received();
    host.received();

    assert!(host.send(math_poll("AB12CD"), &state).await.is_none());
    for client in [&mut ann, &mut bob] {
        let events = client.received();
        assert!(
            events
                .iter()
                .any(|m| matches!(m, ServerMessage::NewQuestion(view) if view.question == "2+2?")),
            "participant should receive new-question"
        );
    }

    let accepted = ann.send(answer("AB12CD", "1"), &state).await;
    assert!(matches!(
        accepted,
        Some(ServerMessage::AnswerAccepted { .. })
    ));
    let results = last_results(&host.received()).expect("presenter should see results");
    assert_eq!(
        votes(&results),
        vec![("3".to_string(), 0), ("4".to_string(), 1)]
    );

    let retry = ann.send(answer("AB12CD", "0"), &state).await;
    match retry {
        Some(ServerMessage::Error { code, .. }) => assert_eq!(code, "ALREADY_ANSWERED"),
        other => panic!("Expected AlreadyAnswered error, got {:?}", other),
    }
    assert!(last_results(&host.received()).is_none());

    let snapshot = state
        .registry
        .lookup("AB12CD")
        .await
        .unwrap()
        .snapshot()
        .await
        .unwrap();
    let poll = snapshot.active_poll.expect("poll still active");
    assert_eq!(
        votes(&poll.results()),
        vec![("3".to_string(), 0), ("4".to_string(), 1)]
    );

    // 3. End poll, then a second poll resets voting flags
    assert!(host
        .send(
            ClientMessage::EndPoll {
                session_id: "AB12CD".to_string(),
            },
            &state,
        )
        .await
        .is_none());

    for client in [&mut host, &mut ann, &mut bob] {
        assert!(client
            .received()
            .iter()
            .any(|m| matches!(m, ServerMessage::PollEnded { .. })));
    }

    assert!(host.send(math_poll("AB12CD"), &state).await.is_none());
    let snapshot = state
        .registry
        .lookup("AB12CD")
        .await
        .unwrap()
        .snapshot()
        .await
        .unwrap();
    assert_eq!(snapshot.state, SessionState::PollActive);
    assert_eq!(snapshot.poll_history.len(), 1);
    assert!(snapshot
        .roster
        .iter()
        .all(|p| p.voting_state == VotingState::NotAnswered));

    // 4. Presenter drops; the session is gone for everyone
    close_connection(&mut host.conn, &state).await;
    assert!(state.registry.lookup("AB12CD").await.is_err());

    let ann_events = ann.received();
    assert!(ann_events.iter().any(|m| matches!(
        m,
        ServerMessage::SessionEnded {
            reason: EndReason::PresenterDisconnected,
            ..
        }
    )));
    assert!(ann.conn.binding.is_none());

    let late = ann.send(answer("AB12CD", "1"), &state).await;
    match late {
        Some(ServerMessage::Error { code, .. }) => assert_eq!(code, "SESSION_NOT_FOUND"),
        other => panic!("Expected SessionNotFound, got {:?}", other),
    }
}

#[tokio::test]
async fn test_late_joiner_sees_join_success_then_question() {
    let state = Arc::new(AppState::new());
    let mut host = Client::new();
    let mut late = Client::new();
    open_session(&state, &mut host, "LATE01").await;

    host.send(math_poll("LATE01"), &state).await;
    late.send(join("LATE01", "Late"), &state).await;

    let events = late.received();
    let join_pos = events
        .iter()
        .position(|m| matches!(m, ServerMessage::JoinSuccess { .. }))
        .expect("join-success");
    let question_pos = events
        .iter()
        .position(|m| matches!(m, ServerMessage::NewQuestion(_)))
        .expect("new-question");
    assert!(join_pos < question_pos);

    // Late joiners count towards completion
    let accepted = late.send(answer("LATE01", "1"), &state).await;
    assert!(matches!(
        accepted,
        Some(ServerMessage::AnswerAccepted { .. })
    ));
    let complete = host.received().iter().rev().find_map(|m| match m {
        ServerMessage::PollResults {
            complete, eligible, ..
        } => Some((*complete, *eligible)),
        _ => None,
    });
    assert_eq!(complete, Some((true, 1)));
}

#[tokio::test]
async fn test_kicked_participant_leaves_roster() {
    let state = Arc::new(AppState::new());
    let mut host = Client::new();
    let mut ann = Client::new();
    open_session(&state, &mut host, "KICK01").await;
    ann.send(join("KICK01", "Ann"), &state).await;

    let participant_id = match ann.received().first() {
        Some(ServerMessage::JoinSuccess { participant_id, .. }) => participant_id.clone(),
        other => panic!("Expected JoinSuccess, got {:?}", other),
    };
    host.received();

    let reply = host
        .send(
            ClientMessage::KickParticipant {
                session_id: "KICK01".to_string(),
                participant_id: participant_id.clone(),
            },
            &state,
        )
        .await;
    assert!(reply.is_none());

    assert!(ann
        .received()
        .iter()
        .any(|m| matches!(m, ServerMessage::KickedOut { .. })));
    assert!(ann.conn.binding.is_none());

    let host_events = host.received();
    assert!(host_events.iter().any(|m| matches!(
        m,
        ServerMessage::StudentLeft { reason: Membership::Kicked, participant_id: id, .. } if *id == participant_id
    )));

    let roster = host
        .send(
            ClientMessage::GetStudents {
                session_id: "KICK01".to_string(),
            },
            &state,
        )
        .await;
    assert!(matches!(
        roster,
        Some(ServerMessage::StudentsList { students, .. }) if students.is_empty()
    ));

    // A kicked connection holds no session role any more
    host.send(math_poll("KICK01"), &state).await;
    let vote = ann.send(answer("KICK01", "1"), &state).await;
    assert!(matches!(
        vote,
        Some(ServerMessage::Error { code, .. }) if code == "NOT_PARTICIPANT"
    ));
}

#[tokio::test]
async fn test_respondent_disconnect_keeps_vote() {
    let state = Arc::new(AppState::new());
    let mut host = Client::new();
    let mut ann = Client::new();
    open_session(&state, &mut host, "DROP01").await;
    ann.send(join("DROP01", "Ann"), &state).await;
    host.send(math_poll("DROP01"), &state).await;
    ann.send(answer("DROP01", "0"), &state).await;
    host.received();

    close_connection(&mut ann.conn, &state).await;

    let host_events = host.received();
    assert!(host_events.iter().any(|m| matches!(
        m,
        ServerMessage::StudentLeft {
            reason: Membership::Disconnected,
            ..
        }
    )));

    let snapshot = state
        .registry
        .lookup("DROP01")
        .await
        .unwrap()
        .snapshot()
        .await
        .unwrap();
    assert!(snapshot.roster.is_empty());
    assert_eq!(snapshot.active_poll.unwrap().tally.total_votes(), 1);
}

#[tokio::test]
async fn test_second_owner_cannot_take_code() {
    let state = Arc::new(AppState::new());
    let mut host = Client::new();
    let mut intruder = Client::new();
    open_session(&state, &mut host, "OWNED1").await;

    let result = intruder
        .send(
            ClientMessage::CreateSession {
                session_id: Some("owned1".to_string()),
            },
            &state,
        )
        .await;
    assert!(matches!(
        result,
        Some(ServerMessage::Error { code, .. }) if code == "SESSION_CODE_CONFLICT"
    ));
    assert_eq!(intruder.conn.role_in("OWNED1"), None);

    // The same presenter re-issuing create gets its session back
    let again = host
        .send(
            ClientMessage::CreateSession {
                session_id: Some("OWNED1".to_string()),
            },
            &state,
        )
        .await;
    assert!(matches!(
        again,
        Some(ServerMessage::SessionCreated { session_id }) if session_id == "OWNED1"
    ));
    assert_eq!(host.conn.role_in("OWNED1"), Some(Role::Presenter));
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let state = Arc::new(AppState::new());
    let mut host_a = Client::new();
    let mut host_b = Client::new();
    let mut ann = Client::new();
    open_session(&state, &mut host_a, "ROOMAA").await;
    open_session(&state, &mut host_b, "ROOMBB").await;

    ann.send(join("ROOMAA", "Ann"), &state).await;
    host_b.received();

    host_a
        .send(
            ClientMessage::ChatMessage {
                session_id: "ROOMAA".to_string(),
                author: None,
                text: "Only for room A".to_string(),
            },
            &state,
        )
        .await;

    assert!(ann
        .received()
        .iter()
        .any(|m| matches!(m, ServerMessage::ChatMessage { text, .. } if text == "Only for room A")));
    assert!(host_b.received().is_empty());

    // Presenter of B has no say over A
    let result = host_b.send(math_poll("ROOMAA"), &state).await;
    assert!(matches!(
        result,
        Some(ServerMessage::Error { code, .. }) if code == "FORBIDDEN"
    ));
}

#[tokio::test]
async fn test_many_sessions_get_distinct_codes() {
    let state = Arc::new(AppState::new());
    let mut codes = std::collections::HashSet::new();

    for _ in 0..25 {
        let mut host = Client::new();
        match host
            .send(ClientMessage::CreateSession { session_id: None }, &state)
            .await
        {
            Some(ServerMessage::SessionCreated { session_id }) => {
                assert!(codes.insert(session_id));
            }
            other => panic!("Expected SessionCreated, got {:?}", other),
        }
    }
    assert_eq!(state.registry.len().await, 25);
}

// Socket-level tests: the real gateway served on a local port

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn serve(config: ServerConfig, abuse: AbuseConfig) -> (String, Arc<AppState>) {
    let state = Arc::new(AppState::with_config(config, abuse));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = livepoll::ws::router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("ws://{}/ws", addr), state)
}

fn quick_timeouts(idle_ms: u64, ping_ms: u64) -> ServerConfig {
    ServerConfig {
        idle_timeout: Duration::from_millis(idle_ms),
        ping_interval: Duration::from_millis(ping_ms),
        ..ServerConfig::default()
    }
}

/// Next text frame as JSON; control frames are skipped
async fn next_json(socket: &mut Socket) -> serde_json::Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send_json(socket: &mut Socket, value: serde_json::Value) {
    socket
        .send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

/// Connect, check the welcome frame and open a session as presenter
async fn connect_presenter(url: &str) -> (Socket, String) {
    let (mut socket, _) = connect_async(url).await.unwrap();
    assert_eq!(next_json(&mut socket).await["t"], "welcome");

    send_json(&mut socket, serde_json::json!({ "t": "create-session" })).await;
    let created = next_json(&mut socket).await;
    assert_eq!(created["t"], "session-created");
    let code = created["sessionId"].as_str().unwrap().to_string();
    (socket, code)
}

async fn wait_for_empty_registry(state: &Arc<AppState>) -> bool {
    for _ in 0..40 {
        if state.registry.is_empty().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_heartbeat_keeps_quiet_presenter_connected() {
    let (url, state) = serve(quick_timeouts(600, 150), AbuseConfig::default()).await;
    let (mut socket, code) = connect_presenter(&url).await;

    // Stay silent for well over the idle timeout, only reading (which answers pings)
    let deadline = tokio::time::Instant::now() + Duration::from_millis(1500);
    let mut pings = 0;
    loop {
        match tokio::time::timeout_at(deadline, socket.next()).await {
            Err(_) => break,
            Ok(Some(Ok(Message::Ping(_)))) => pings += 1,
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => panic!("server closed a live presenter"),
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(e))) => panic!("socket error: {}", e),
        }
    }

    assert!(pings >= 2, "expected repeated pings, got {}", pings);
    assert_eq!(state.registry.len().await, 1);
    assert!(state.registry.lookup(&code).await.is_ok());
}

#[tokio::test]
async fn test_unresponsive_presenter_is_closed_and_session_removed() {
    let (url, state) = serve(quick_timeouts(300, 100), AbuseConfig::default()).await;
    let (mut socket, _code) = connect_presenter(&url).await;

    // Not polling the socket means pings go unanswered
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert!(wait_for_empty_registry(&state).await);

    // The server side has gone away
    loop {
        match tokio::time::timeout(Duration::from_secs(2), socket.next()).await {
            Ok(Some(Ok(_))) => continue,
            Ok(None) | Ok(Some(Err(_))) => break,
            Err(_) => panic!("connection still open after idle timeout"),
        }
    }
}

#[tokio::test]
async fn test_unresponsive_respondent_leaves_roster() {
    let (url, state) = serve(quick_timeouts(300, 100), AbuseConfig::default()).await;
    let mut host = Client::new();
    open_session(&state, &mut host, "IDLE42").await;
    host.received();

    let (mut socket, _) = connect_async(url.as_str()).await.unwrap();
    assert_eq!(next_json(&mut socket).await["t"], "welcome");
    send_json(
        &mut socket,
        serde_json::json!({ "t": "join-student", "sessionId": "IDLE42", "name": "Ann" }),
    )
    .await;
    assert_eq!(next_json(&mut socket).await["t"], "join-success");

    tokio::time::sleep(Duration::from_millis(900)).await;

    let events = host.received();
    assert!(events.iter().any(|m| matches!(
        m,
        ServerMessage::StudentLeft { reason: Membership::Disconnected, name, .. }
            if name.as_deref() == Some("Ann")
    )));
    let snapshot = state
        .registry
        .lookup("IDLE42")
        .await
        .unwrap()
        .snapshot()
        .await
        .unwrap();
    assert!(snapshot.roster.is_empty());
}

#[tokio::test]
async fn test_malformed_frame_gets_parse_error() {
    let (url, _state) = serve(ServerConfig::default(), AbuseConfig::default()).await;
    let (mut socket, _) = connect_async(url.as_str()).await.unwrap();
    assert_eq!(next_json(&mut socket).await["t"], "welcome");

    socket
        .send(Message::Text("{not json".to_string().into()))
        .await
        .unwrap();
    let error = next_json(&mut socket).await;
    assert_eq!(error["t"], "error");
    assert_eq!(error["code"], "PARSE_ERROR");
    assert_eq!(error["kind"], "invalid_input");

    send_json(&mut socket, serde_json::json!({ "t": "unknown-event" })).await;
    assert_eq!(next_json(&mut socket).await["code"], "PARSE_ERROR");

    // The connection stays usable
    send_json(&mut socket, serde_json::json!({ "t": "create-session" })).await;
    assert_eq!(next_json(&mut socket).await["t"], "session-created");
}

#[tokio::test]
async fn test_rate_limited_frames_are_dropped() {
    let abuse = AbuseConfig {
        blocked_agents: Vec::new(),
        rate_limiter: Some(RateLimiter::new(1, Duration::from_secs(60))),
    };
    let (url, _state) = serve(ServerConfig::default(), abuse).await;
    let (mut socket, code) = connect_presenter(&url).await;

    send_json(
        &mut socket,
        serde_json::json!({ "t": "get-students", "sessionId": code }),
    )
    .await;
    let error = next_json(&mut socket).await;
    assert_eq!(error["t"], "error");
    assert_eq!(error["code"], "RATE_LIMITED");
    assert_eq!(error["kind"], "resource_exhausted");

    // The limited command was never handled
    let nothing_else = tokio::time::timeout(Duration::from_millis(200), next_json(&mut socket)).await;
    assert!(nothing_else.is_err());
}

#[tokio::test]
async fn test_upgrade_without_user_agent_is_accepted() {
    let (url, _state) = serve(ServerConfig::default(), AbuseConfig::default()).await;

    let request = url.as_str().into_client_request().unwrap();
    assert!(request.headers().get("user-agent").is_none());

    let (mut socket, _) = connect_async(request).await.unwrap();
    assert_eq!(next_json(&mut socket).await["t"], "welcome");
}

#[tokio::test]
async fn test_listed_user_agent_is_refused() {
    let (url, state) = serve(ServerConfig::default(), AbuseConfig::default()).await;

    let mut request = url.as_str().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("user-agent", "curl/8.5.0".parse().unwrap());

    match connect_async(request).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 403);
        }
        Err(e) => panic!("Expected HTTP 403, got {}", e),
        Ok(_) => panic!("Blocked user agent was upgraded"),
    }
    assert!(state.registry.is_empty().await);
}
