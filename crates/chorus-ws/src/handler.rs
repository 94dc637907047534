use std::num::NonZeroU32;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chorus_core::error::CoreError;
use chorus_core::fanout::{AdmissionError, EventReceiver};
use chorus_core::lifecycle;
use chorus_core::session::Session;
use chorus_core::AppState;
use chorus_models::gateway::{codes, ClientCommand, Connected, ErrorNotice, ServerEvent};
use futures_util::{SinkExt, StreamExt};
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::time::{Duration, Instant};

use crate::wire;

const PING_INTERVAL: Duration = Duration::from_secs(20);

const CLOSE_NORMAL: u16 = 1000;
const CLOSE_POLICY: u16 = 1008;
const CLOSE_INTERNAL: u16 = 1011;
const CLOSE_TRY_AGAIN: u16 = 1013;

/// Per-connection inbound frame budget. Heartbeats are never counted.
struct FrameGuard {
    limiter: DefaultDirectRateLimiter,
}

impl FrameGuard {
    fn new(per_minute: u32) -> Self {
        let per_minute = NonZeroU32::new(per_minute).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
        }
    }

    /// `Err(retry_after_ms)` when the budget is spent.
    fn check(&self) -> Result<(), u64> {
        self.limiter.check().map_err(|not_until| {
            let wait = not_until.wait_time_from(DefaultClock::default().now());
            wait.as_millis().max(1) as u64
        })
    }
}

fn close_for(err: &CoreError) -> (u16, &'static str) {
    match err {
        CoreError::RateLimited { .. } => (CLOSE_TRY_AGAIN, "Too many connection attempts"),
        CoreError::TooManyConnections(AdmissionError::ServerFull) => {
            (CLOSE_TRY_AGAIN, "Gateway is at connection capacity")
        }
        CoreError::TooManyConnections(AdmissionError::UserLimit) => {
            (CLOSE_POLICY, "Too many concurrent connections for this user")
        }
        CoreError::Unauthorized => (CLOSE_POLICY, "Authentication failed"),
        CoreError::DependencyUnavailable(_) | CoreError::Internal(_) => {
            (CLOSE_INTERNAL, "Service temporarily unavailable")
        }
        _ => (CLOSE_POLICY, "Connection rejected"),
    }
}

async fn send_event(
    sender: &mut (impl SinkExt<Message> + Unpin),
    session: Option<&Session>,
    event: &ServerEvent,
) -> Result<(), ()> {
    let payload = serde_json::to_string(event).map_err(|err| {
        tracing::error!(event = event.name(), error = %err, "failed to encode event");
    })?;
    wire::log_out(
        session.map(Session::user_id),
        session.map(|s| s.handle.as_str()),
        event.name(),
        &payload,
    );
    sender.send(Message::Text(payload.into())).await.map_err(|_| ())
}

async fn send_close(
    sender: &mut (impl SinkExt<Message> + Unpin),
    session: Option<&Session>,
    code: u16,
    reason: &str,
) {
    wire::log_close(session.map(Session::user_id), session.map(|s| s.handle.as_str()), code, reason);
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

pub async fn handle_connection(socket: WebSocket, state: AppState, credential: Option<String>, address: String) {
    let (mut sender, receiver) = socket.split();

    let (mut session, events) = match lifecycle::connect(&state, credential.as_deref(), &address).await {
        Ok(admitted) => admitted,
        Err(err) => {
            tracing::info!(address = %address, code = err.code(), error = %err, "connection rejected");
            let _ = send_event(&mut sender, None, &lifecycle::error_event(&err)).await;
            let (code, reason) = close_for(&err);
            send_close(&mut sender, None, code, reason).await;
            return;
        }
    };

    let hello = ServerEvent::Connected(Connected {
        user_id: session.identity.user_id.clone(),
        display_name: session.identity.display_name.clone(),
        role: session.identity.role,
        connection_id: session.connection_id.clone(),
        heartbeat_interval: state.config.heartbeat_interval.as_millis() as u64,
    });
    if send_event(&mut sender, Some(&session), &hello).await.is_ok() {
        run_session(sender, receiver, &mut session, events, &state).await;
    }

    lifecycle::disconnect(&state, &mut session).await;
}

async fn run_session(
    mut sender: impl SinkExt<Message> + Unpin,
    mut receiver: impl StreamExt<Item = Result<Message, axum::Error>> + Unpin,
    session: &mut Session,
    mut events: EventReceiver,
    state: &AppState,
) {
    let heartbeat_timeout = state.config.heartbeat_timeout;
    let frames = FrameGuard::new(state.config.frames_per_minute);
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping_interval.tick().await;
    let heartbeat_sleep = tokio::time::sleep(heartbeat_timeout);
    tokio::pin!(heartbeat_sleep);

    let (reason, timed_out) = loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        heartbeat_sleep.as_mut().reset(Instant::now() + heartbeat_timeout);
                        wire::log_in(session.user_id(), &session.handle, text.as_str());
                        let replies = handle_frame(state, session, &frames, text.as_str()).await;
                        let mut failed = false;
                        for event in &replies {
                            if send_event(&mut sender, Some(&*session), event).await.is_err() {
                                failed = true;
                                break;
                            }
                        }
                        if failed {
                            break ("websocket send error".to_string(), false);
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break (
                            match frame {
                                Some(frame) => format!("client close frame (code={}, reason={})", frame.code, frame.reason),
                                None => "client close frame".to_string(),
                            },
                            false,
                        );
                    }
                    Some(Ok(Message::Binary(_))) => {
                        heartbeat_sleep.as_mut().reset(Instant::now() + heartbeat_timeout);
                        let notice = ServerEvent::Error(ErrorNotice::new(codes::INVALID_PAYLOAD, "Binary frames are not supported"));
                        if send_event(&mut sender, Some(&*session), &notice).await.is_err() {
                            break ("websocket send error".to_string(), false);
                        }
                    }
                    Some(Ok(_)) => {
                        heartbeat_sleep.as_mut().reset(Instant::now() + heartbeat_timeout);
                    }
                    Some(Err(err)) => break (format!("websocket receive error: {err}"), false),
                    None => break ("websocket stream ended".to_string(), false),
                }
            }
            event = events.recv() => {
                match event {
                    Some(event) => {
                        if send_event(&mut sender, Some(&*session), &event).await.is_err() {
                            break ("websocket send error".to_string(), false);
                        }
                    }
                    None => {
                        send_close(&mut sender, Some(&*session), CLOSE_TRY_AGAIN, "Connection fell behind; reconnect required").await;
                        break ("evicted from fan-out".to_string(), false);
                    }
                }
            }
            () = &mut heartbeat_sleep => {
                send_close(&mut sender, Some(&*session), CLOSE_NORMAL, "Heartbeat timeout").await;
                break (format!("heartbeat timeout after {}ms", heartbeat_timeout.as_millis()), true);
            }
            _ = ping_interval.tick() => {
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break ("websocket ping send error".to_string(), false);
                }
            }
        }
    };

    if timed_out {
        tracing::warn!(user_id = %session.identity.user_id, connection = %session.handle, reason = %reason, "client disconnected");
    } else {
        tracing::info!(user_id = %session.identity.user_id, connection = %session.handle, reason = %reason, "client disconnected");
    }
}

async fn handle_frame(state: &AppState, session: &mut Session, frames: &FrameGuard, text: &str) -> Vec<ServerEvent> {
    let parsed = serde_json::from_str::<ClientCommand>(text);
    if !matches!(parsed, Ok(ClientCommand::Heartbeat)) {
        if let Err(retry_after_ms) = frames.check() {
            tracing::debug!(user_id = %session.identity.user_id, retry_after_ms, "frame rate limited");
            return vec![ServerEvent::Error(ErrorNotice::new(
                codes::FRAME_RATE_LIMIT,
                format!("Too many frames, retry in {retry_after_ms}ms"),
            ))];
        }
    }
    match parsed {
        Ok(command) => lifecycle::handle_command(state, session, command).await,
        Err(err) => {
            tracing::debug!(user_id = %session.identity.user_id, error = %err, "unparseable frame");
            vec![ServerEvent::Error(ErrorNotice::new(
                codes::INVALID_PAYLOAD,
                format!("Invalid payload: {err}"),
            ))]
        }
    }
}
