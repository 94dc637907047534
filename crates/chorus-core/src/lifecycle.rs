//! Per-connection orchestration: connect, command dispatch, disconnect.
//!
//! Replies meant only for the requesting connection are returned to the
//! caller. Everything other connections should see is published through the
//! event bus, and reaches local connections (including this one) through the
//! fan-out bridge.

use chorus_models::gateway::{
    codes, ClientCommand, CreateRoom, DeleteMessage, ErrorNotice, GetHistory, JoinRoom, MemberEvent,
    MessageDeleted, OnlineUsers, RateLimitNotice, RoomDeleted, RoomJoined, RoomLeft, RoomList, RoomUsers,
    SendMessage, SendPrivateMessage, ServerEvent, TypingEvent,
};
use chorus_models::message::{MessageKind, PrivateMessage};
use chorus_models::room::RoomConfig;
use chorus_util::pagination::HistoryParams;
use chorus_util::{snowflake, validation};
use chrono::Utc;
use uuid::Uuid;

use crate::error::CoreError;
use crate::events::Target;
use crate::fanout::EventReceiver;
use crate::rate_limit::RateAction;
use crate::rooms::MessageDraft;
use crate::session::{ConnectionState, Session};
use crate::spam::SpamVerdict;
use crate::AppState;

/// Admit a new connection: connection rate limit, identity, local
/// registration, presence. Nothing is left behind on failure.
pub async fn connect(
    state: &AppState,
    credential: Option<&str>,
    address: &str,
) -> Result<(Session, EventReceiver), CoreError> {
    let decision = state.limiter.check(address, RateAction::Connection).await;
    if !decision.allowed {
        tracing::info!(address, count = decision.count, "connection rate limit exceeded");
        return Err(CoreError::RateLimited {
            action: RateAction::Connection,
            decision,
        });
    }

    let identity = match credential.map(str::trim).filter(|c| !c.is_empty()) {
        Some(credential) => state
            .authenticator
            .authenticate(credential)
            .await?
            .ok_or(CoreError::Unauthorized)?,
        None if state.config.guests_enabled => state.guests.allocate().await?,
        None => return Err(CoreError::Unauthorized),
    };

    let connection_id = Uuid::new_v4().simple().to_string();
    let handle = state.registry.handle_for(&connection_id);
    let receiver = state.registry.try_register(&connection_id, &identity.user_id)?;

    let metadata = serde_json::json!({
        "node": state.config.node_id,
        "address": address,
    });
    if let Err(err) = state.presence.set_online(&identity, &handle, metadata).await {
        state.registry.unregister(&connection_id);
        return Err(err);
    }

    let mut session = Session::new(connection_id, handle, identity, address.to_string());
    session.state = ConnectionState::Authenticated;
    tracing::info!(
        user_id = %session.identity.user_id,
        role = %session.identity.role,
        connection = %session.handle,
        "connection authenticated"
    );
    Ok((session, receiver))
}

/// Run one client command. Failures are turned into error events for the
/// requesting connection and never end the session.
pub async fn handle_command(state: &AppState, session: &mut Session, command: ClientCommand) -> Vec<ServerEvent> {
    if session.is_disconnected() {
        return Vec::new();
    }
    let name = command.name();
    if session.identity.is_guest() {
        if let Err(err) = state.guests.touch(session.user_id()).await {
            tracing::debug!(error = %err, "guest touch failed");
        }
    }
    if !matches!(command, ClientCommand::Heartbeat) {
        if let Err(err) = refresh_presence(state, session).await {
            tracing::debug!(error = %err, "presence refresh failed");
        }
    }

    let result = match command {
        ClientCommand::JoinRoom(cmd) => join_room(state, session, cmd).await,
        ClientCommand::LeaveRoom(cmd) => leave_room(state, session, &cmd.room_id).await,
        ClientCommand::SendMessage(cmd) => send_message(state, session, cmd).await,
        ClientCommand::PrivateMessage(cmd) => private_message(state, session, cmd).await,
        ClientCommand::TypingStart(cmd) => typing_start(state, session, &cmd.room_id).await,
        ClientCommand::TypingStop(cmd) => typing_stop(state, session, &cmd.room_id).await,
        ClientCommand::GetRoomUsers(cmd) => room_users(state, &cmd.room_id).await,
        ClientCommand::GetOnlineUsers => state
            .presence
            .list_online()
            .await
            .map(|users| vec![ServerEvent::OnlineUsers(OnlineUsers { users })]),
        ClientCommand::ListRooms => state
            .rooms
            .list_rooms()
            .await
            .map(|rooms| vec![ServerEvent::RoomList(RoomList { rooms })]),
        ClientCommand::CreateRoom(cmd) => create_room(state, session, cmd).await,
        ClientCommand::DeleteRoom(cmd) => delete_room(state, session, &cmd.room_id).await,
        ClientCommand::DeleteMessage(cmd) => delete_message(state, session, cmd).await,
        ClientCommand::GetHistory(cmd) => history(state, session, cmd).await,
        ClientCommand::Heartbeat => heartbeat(state, session).await,
    };

    match result {
        Ok(events) => events,
        Err(err) => {
            tracing::debug!(
                user_id = %session.identity.user_id,
                command = name,
                code = err.code(),
                error = %err,
                "command rejected"
            );
            vec![error_event(&err)]
        }
    }
}

/// Tear the connection down. Every step runs even if an earlier one fails.
pub async fn disconnect(state: &AppState, session: &mut Session) {
    if session.is_disconnected() {
        return;
    }
    let primary = session.primary_room().map(str::to_string);
    let mut typing_rooms = session.typing.rooms();
    if let Some(room_id) = &primary {
        if !typing_rooms.contains(room_id) {
            typing_rooms.push(room_id.clone());
        }
    }
    session.state = ConnectionState::Disconnected;
    session.typing.cancel_all();
    state.registry.unregister(&session.connection_id);

    match state.presence.set_offline(session.user_id(), &session.handle).await {
        Ok(_) => {}
        Err(err) => tracing::warn!(user_id = %session.identity.user_id, error = %err, "presence cleanup failed"),
    }

    for room_id in &typing_rooms {
        if let Err(err) = clear_typing(state, session, room_id).await {
            tracing::warn!(room_id = %room_id, error = %err, "typing cleanup failed");
        }
    }
    if let Some(room_id) = primary {
        if let Err(err) = remove_from_room(state, session, &room_id).await {
            tracing::warn!(room_id, error = %err, "membership cleanup failed");
        }
    }

    tracing::info!(
        user_id = %session.identity.user_id,
        connection = %session.handle,
        "connection closed"
    );
}

/// Map a failure to the event the client receives.
pub fn error_event(err: &CoreError) -> ServerEvent {
    match err {
        CoreError::RateLimited { action, decision } => {
            let now = Utc::now();
            ServerEvent::RateLimitExceeded(RateLimitNotice {
                code: err.code().to_string(),
                message: format!("Too many {action} attempts, slow down"),
                action: action.to_string(),
                count: decision.count,
                limit: decision.limit,
                reset_time: decision.reset_time,
                retry_after_ms: decision.retry_after(now).as_millis() as u64,
            })
        }
        CoreError::SpamBlocked { .. } => ServerEvent::MessageBlocked(ErrorNotice::new(
            err.code(),
            "Message blocked by spam protection",
        )),
        CoreError::DependencyUnavailable(_) | CoreError::Internal(_) => ServerEvent::Error(ErrorNotice::new(
            err.code(),
            "Service temporarily unavailable, try again",
        )),
        _ if err.is_room_error() => ServerEvent::RoomError(ErrorNotice::new(err.code(), err.to_string())),
        _ => ServerEvent::Error(ErrorNotice::new(err.code(), err.to_string())),
    }
}

async fn join_room(state: &AppState, session: &mut Session, cmd: JoinRoom) -> Result<Vec<ServerEvent>, CoreError> {
    validation::validate_room_id(&cmd.room_id)?;
    if !state.rooms.room_exists(&cmd.room_id).await? {
        return Err(CoreError::RoomNotFound(cmd.room_id));
    }

    if let Some(previous) = session.primary_room().map(str::to_string) {
        if previous != cmd.room_id {
            leave_primary(state, session, &previous).await?;
        }
    }

    let outcome = state
        .rooms
        .join_connection(
            &cmd.room_id,
            &session.identity.user_id,
            &session.identity.display_name,
            cmd.password.as_deref(),
            &session.handle,
        )
        .await;
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(err) => {
            if session.primary_room() != Some(cmd.room_id.as_str()) {
                session.state = ConnectionState::Authenticated;
                state.registry.set_room(&session.connection_id, None);
            }
            return Err(err);
        }
    };

    state
        .registry
        .set_room(&session.connection_id, Some(cmd.room_id.clone()));
    session.state = ConnectionState::Joined(cmd.room_id.clone());

    if outcome.newly_joined {
        state
            .events
            .dispatch_to_room(
                &cmd.room_id,
                ServerEvent::UserJoined(member_event(session, &cmd.room_id)),
                Some(&session.handle),
            )
            .await?;
        state
            .events
            .dispatch_to_room(
                &cmd.room_id,
                ServerEvent::RoomUsersUpdated(RoomUsers {
                    room_id: cmd.room_id.clone(),
                    users: outcome.snapshot.members.clone(),
                }),
                None,
            )
            .await?;
    }

    let history = state
        .rooms
        .recent_messages(&cmd.room_id, state.config.join_history)
        .await?;
    tracing::info!(user_id = %session.identity.user_id, room_id = %cmd.room_id, "joined room");
    Ok(vec![ServerEvent::RoomJoined(RoomJoined {
        room: outcome.snapshot.room,
        members: outcome.snapshot.members,
        history,
    })])
}

async fn leave_room(state: &AppState, session: &mut Session, room_id: &str) -> Result<Vec<ServerEvent>, CoreError> {
    validation::validate_room_id(room_id)?;
    if session.primary_room() == Some(room_id) {
        leave_primary(state, session, room_id).await?;
    } else {
        session.typing.cancel(room_id);
        clear_typing(state, session, room_id).await?;
        remove_from_room(state, session, room_id).await?;
    }
    Ok(vec![ServerEvent::RoomLeft(RoomLeft {
        room_id: room_id.to_string(),
    })])
}

/// Fully leave the primary room before anything else happens.
async fn leave_primary(state: &AppState, session: &mut Session, room_id: &str) -> Result<(), CoreError> {
    session.typing.cancel(room_id);
    clear_typing(state, session, room_id).await?;
    state.registry.set_room(&session.connection_id, None);
    session.state = ConnectionState::Authenticated;
    remove_from_room(state, session, room_id).await
}

/// Release this connection's hold on a room. Other members hear about it
/// only when no connection of the user, on any node, still holds it.
async fn remove_from_room(state: &AppState, session: &Session, room_id: &str) -> Result<(), CoreError> {
    if !state
        .rooms
        .release_connection(room_id, session.user_id(), &session.handle)
        .await?
    {
        return Ok(());
    }
    announce_departure(state, room_id, member_event(session, room_id)).await?;
    tracing::info!(user_id = %session.identity.user_id, room_id, "left room");
    Ok(())
}

/// Tell a room that a member has gone and send it the new roster.
pub(crate) async fn announce_departure(state: &AppState, room_id: &str, member: MemberEvent) -> Result<(), CoreError> {
    state
        .events
        .dispatch_to_room(room_id, ServerEvent::UserLeft(member), None)
        .await?;
    let users = state.rooms.members(room_id).await?;
    state
        .events
        .dispatch_to_room(
            room_id,
            ServerEvent::RoomUsersUpdated(RoomUsers {
                room_id: room_id.to_string(),
                users,
            }),
            None,
        )
        .await?;
    Ok(())
}

async fn send_message(state: &AppState, session: &mut Session, cmd: SendMessage) -> Result<Vec<ServerEvent>, CoreError> {
    validation::validate_room_id(&cmd.room_id)?;
    validation::validate_message_content(&cmd.content, state.config.max_message_chars)?;
    check_kind_allowed(session, cmd.kind)?;

    let spam_warning = screen_outgoing(state, session, &cmd.content, cmd.kind).await?;

    if !state.rooms.is_member(&cmd.room_id, session.user_id()).await? {
        return Err(CoreError::NotInRoom(cmd.room_id));
    }

    let draft = MessageDraft {
        room_id: cmd.room_id.clone(),
        author_id: session.identity.user_id.clone(),
        author_name: session.identity.display_name.clone(),
        body: cmd.content,
        kind: cmd.kind,
    };
    let events = state.events.clone();
    let message = state
        .rooms
        .post_message_with(draft, move |message| {
            let envelope = events.envelope(
                Target::Room(message.room_id.clone()),
                None,
                ServerEvent::NewMessage(message.clone()),
            );
            events.publication(&envelope).map(Some)
        })
        .await?;
    tracing::debug!(user_id = %session.identity.user_id, room_id = %message.room_id, message_id = %message.id, "message posted");

    if session.typing.cancel(&cmd.room_id) {
        clear_typing(state, session, &cmd.room_id).await?;
    }

    Ok(spam_warning.into_iter().collect())
}

async fn private_message(
    state: &AppState,
    session: &mut Session,
    cmd: SendPrivateMessage,
) -> Result<Vec<ServerEvent>, CoreError> {
    if cmd.recipient_id.trim().is_empty() {
        return Err(validation::ValidationError::InvalidFormat("recipientId is required".into()).into());
    }
    validation::validate_message_content(&cmd.content, state.config.max_message_chars)?;
    check_kind_allowed(session, cmd.kind)?;
    let spam_warning = screen_outgoing(state, session, &cmd.content, cmd.kind).await?;

    let Some(handle) = state.presence.resolve_connection(&cmd.recipient_id).await? else {
        return Err(CoreError::UserOffline(cmd.recipient_id));
    };

    let message = PrivateMessage {
        id: snowflake::generate_string(state.config.worker_id),
        sender_id: session.identity.user_id.clone(),
        sender_name: session.identity.display_name.clone(),
        recipient_id: cmd.recipient_id,
        body: cmd.content,
        kind: cmd.kind,
        created_at: Utc::now(),
    };
    state
        .events
        .dispatch_to_connection(&handle, ServerEvent::PrivateMessageReceived(message.clone()))
        .await?;
    // Keep the sender's other devices in sync.
    state
        .events
        .dispatch_to_users(
            vec![session.identity.user_id.clone()],
            ServerEvent::PrivateMessageSent(message.clone()),
            Some(&session.handle),
        )
        .await?;

    let mut events = vec![ServerEvent::PrivateMessageSent(message)];
    events.extend(spam_warning);
    Ok(events)
}

/// Rate limits then spam screening. Returns a warning event when the
/// content is allowed through but flagged.
async fn screen_outgoing(
    state: &AppState,
    session: &Session,
    content: &str,
    kind: MessageKind,
) -> Result<Option<ServerEvent>, CoreError> {
    let subject = session.user_id();
    let decision = state.limiter.check(subject, RateAction::Message).await;
    if !decision.allowed {
        return Err(CoreError::RateLimited {
            action: RateAction::Message,
            decision,
        });
    }
    if kind.is_upload() {
        let decision = state.limiter.check(subject, RateAction::Upload).await;
        if !decision.allowed {
            return Err(CoreError::RateLimited {
                action: RateAction::Upload,
                decision,
            });
        }
    }

    let check = state.spam.check_spam(subject, content).await;
    match check.verdict {
        SpamVerdict::Block => Err(CoreError::SpamBlocked { score: check.score }),
        SpamVerdict::Warn => Ok(Some(ServerEvent::Error(ErrorNotice::new(
            codes::SPAM_WARNING,
            "Your messages look like spam; further messages may be blocked",
        )))),
        SpamVerdict::Allow => Ok(None),
    }
}

fn check_kind_allowed(session: &Session, kind: MessageKind) -> Result<(), CoreError> {
    if kind == MessageKind::System && !session.identity.role.can_moderate() {
        return Err(CoreError::Forbidden("only moderators may send system messages".into()));
    }
    if kind.is_upload() && session.identity.is_guest() {
        return Err(CoreError::Forbidden("guests cannot share files".into()));
    }
    Ok(())
}

async fn typing_start(state: &AppState, session: &mut Session, room_id: &str) -> Result<Vec<ServerEvent>, CoreError> {
    validation::validate_room_id(room_id)?;
    if !state.rooms.is_member(room_id, session.user_id()).await? {
        return Err(CoreError::NotInRoom(room_id.to_string()));
    }

    if state
        .rooms
        .set_typing(room_id, session.user_id(), state.config.typing_state_ttl())
        .await?
    {
        state
            .events
            .dispatch_to_room(room_id, typing_event(session, room_id, true), Some(&session.handle))
            .await?;
    }

    let timer_state = state.clone();
    let timeout = state.config.typing_timeout;
    let room = room_id.to_string();
    let user_id = session.identity.user_id.clone();
    let display_name = session.identity.display_name.clone();
    let handle = session.handle.clone();
    let timer = tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        match timer_state.rooms.clear_typing(&room, &user_id).await {
            Ok(true) => {
                let event = ServerEvent::UserTyping(TypingEvent {
                    room_id: room.clone(),
                    user_id,
                    display_name,
                    is_typing: false,
                });
                if let Err(err) = timer_state.events.dispatch_to_room(&room, event, Some(&handle)).await {
                    tracing::warn!(room_id = %room, error = %err, "typing timeout broadcast failed");
                }
            }
            Ok(false) => {}
            Err(err) => tracing::warn!(room_id = %room, error = %err, "typing timeout cleanup failed"),
        }
    });
    session.typing.start(room_id, timer);
    Ok(Vec::new())
}

async fn typing_stop(state: &AppState, session: &mut Session, room_id: &str) -> Result<Vec<ServerEvent>, CoreError> {
    validation::validate_room_id(room_id)?;
    session.typing.cancel(room_id);
    clear_typing(state, session, room_id).await?;
    Ok(Vec::new())
}

async fn clear_typing(state: &AppState, session: &Session, room_id: &str) -> Result<(), CoreError> {
    if state.rooms.clear_typing(room_id, session.user_id()).await? {
        state
            .events
            .dispatch_to_room(room_id, typing_event(session, room_id, false), Some(&session.handle))
            .await?;
    }
    Ok(())
}

async fn room_users(state: &AppState, room_id: &str) -> Result<Vec<ServerEvent>, CoreError> {
    validation::validate_room_id(room_id)?;
    if !state.rooms.room_exists(room_id).await? {
        return Err(CoreError::RoomNotFound(room_id.to_string()));
    }
    let users = state.rooms.members(room_id).await?;
    Ok(vec![ServerEvent::RoomUsers(RoomUsers {
        room_id: room_id.to_string(),
        users,
    })])
}

async fn create_room(state: &AppState, session: &mut Session, cmd: CreateRoom) -> Result<Vec<ServerEvent>, CoreError> {
    if session.identity.is_guest() {
        return Err(CoreError::Forbidden("guests cannot create rooms".into()));
    }
    let config = RoomConfig {
        name: cmd.name,
        description: cmd.description,
        is_private: cmd.is_private,
        password: cmd.password,
        capacity: cmd.capacity.unwrap_or(state.config.default_room_capacity),
        is_default: false,
    };
    let room = state
        .rooms
        .create_room(&cmd.room_id, config, session.user_id())
        .await?;
    state
        .events
        .dispatch_to_all(ServerEvent::RoomCreated(room.summary(0)))
        .await?;
    Ok(Vec::new())
}

async fn delete_room(state: &AppState, session: &mut Session, room_id: &str) -> Result<Vec<ServerEvent>, CoreError> {
    validation::validate_room_id(room_id)?;
    if session.identity.is_guest() {
        return Err(CoreError::Forbidden("guests cannot delete rooms".into()));
    }
    state.rooms.delete_room(room_id, &session.identity).await?;
    state
        .events
        .dispatch_to_all(ServerEvent::RoomDeleted(RoomDeleted {
            room_id: room_id.to_string(),
            deleted_by: session.identity.user_id.clone(),
        }))
        .await?;
    Ok(Vec::new())
}

async fn delete_message(
    state: &AppState,
    session: &mut Session,
    cmd: DeleteMessage,
) -> Result<Vec<ServerEvent>, CoreError> {
    validation::validate_room_id(&cmd.room_id)?;
    if !state.rooms.room_exists(&cmd.room_id).await? {
        return Err(CoreError::RoomNotFound(cmd.room_id));
    }
    let message = state
        .rooms
        .find_message(&cmd.room_id, &cmd.message_id)
        .await?
        .ok_or(CoreError::MessageNotFound)?;
    if message.author_id != session.identity.user_id && !session.identity.role.can_moderate() {
        return Err(CoreError::Forbidden("only the author or a moderator may delete this message".into()));
    }
    state
        .events
        .dispatch_to_room(
            &cmd.room_id,
            ServerEvent::MessageDeleted(MessageDeleted {
                room_id: cmd.room_id.clone(),
                message_id: cmd.message_id,
                deleted_by: session.identity.user_id.clone(),
            }),
            None,
        )
        .await?;
    Ok(Vec::new())
}

async fn history(state: &AppState, session: &mut Session, cmd: GetHistory) -> Result<Vec<ServerEvent>, CoreError> {
    validation::validate_room_id(&cmd.room_id)?;
    let room = state
        .rooms
        .room_config(&cmd.room_id)
        .await?
        .ok_or_else(|| CoreError::RoomNotFound(cmd.room_id.clone()))?;
    if room.is_private && !state.rooms.is_member(&cmd.room_id, session.user_id()).await? {
        return Err(CoreError::NotInRoom(cmd.room_id));
    }
    let page = state
        .rooms
        .history(&cmd.room_id, HistoryParams::new(cmd.limit, cmd.offset))
        .await?;
    Ok(vec![ServerEvent::RoomHistory(page)])
}

async fn heartbeat(state: &AppState, session: &mut Session) -> Result<Vec<ServerEvent>, CoreError> {
    refresh_presence(state, session).await?;
    Ok(vec![ServerEvent::HeartbeatAck])
}

/// Extend the presence record this connection owns.
async fn refresh_presence(state: &AppState, session: &Session) -> Result<(), CoreError> {
    if state.presence.refresh(session.user_id(), &session.handle).await? {
        return Ok(());
    }
    // The record expired or another connection took over. Only reclaim it
    // if nobody else owns it now.
    if state.presence.resolve_connection(session.user_id()).await?.is_none() {
        let metadata = serde_json::json!({
            "node": state.config.node_id,
            "address": session.address,
        });
        state
            .presence
            .set_online(&session.identity, &session.handle, metadata)
            .await?;
    }
    Ok(())
}

fn member_event(session: &Session, room_id: &str) -> MemberEvent {
    MemberEvent {
        room_id: room_id.to_string(),
        user_id: session.identity.user_id.clone(),
        display_name: session.identity.display_name.clone(),
    }
}

fn typing_event(session: &Session, room_id: &str, is_typing: bool) -> ServerEvent {
    ServerEvent::UserTyping(TypingEvent {
        room_id: room_id.to_string(),
        user_id: session.identity.user_id.clone(),
        display_name: session.identity.display_name.clone(),
        is_typing,
    })
}
