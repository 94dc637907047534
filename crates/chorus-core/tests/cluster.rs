//! Several nodes sharing one store, driven through the connection lifecycle.

use std::sync::Arc;
use std::time::Duration;

use chorus_core::auth::StaticTokenAuthenticator;
use chorus_core::error::CoreError;
use chorus_core::fanout::EventReceiver;
use chorus_core::lifecycle;
use chorus_core::session::{ConnectionState, Session};
use chorus_core::{AppConfig, AppState};
use chorus_models::gateway::{
    ClientCommand, CreateRoom, DeleteMessage, GetHistory, JoinRoom, RoomRef, SendMessage, SendPrivateMessage,
    ServerEvent,
};
use chorus_models::message::MessageKind;
use chorus_models::room::RoomConfig;
use chorus_models::user::{Identity, Role};
use chorus_store::MemoryStore;
use tokio::task::JoinHandle;

struct Cluster {
    store: Arc<MemoryStore>,
    nodes: Vec<AppState>,
    _bridges: Vec<JoinHandle<()>>,
}

impl Cluster {
    async fn new(nodes: usize) -> anyhow::Result<Self> {
        let store = Arc::new(MemoryStore::new());
        let auth = Arc::new(
            StaticTokenAuthenticator::default()
                .with_token("t-alice", Identity::new("alice", "Alice", Role::User))
                .with_token("t-bob", Identity::new("bob", "Bob", Role::User))
                .with_token("t-carol", Identity::new("carol", "Carol", Role::User))
                .with_token("t-mod", Identity::new("mia", "Mia", Role::Moderator))
                .with_token("t-admin", Identity::new("root-admin", "Admin", Role::Admin)),
        );

        let mut states = Vec::new();
        let mut bridges = Vec::new();
        for i in 0..nodes {
            let config = AppConfig {
                node_id: format!("node-{i}"),
                worker_id: i as u16,
                ..AppConfig::default()
            };
            let state = AppState::new(config, store.clone(), auth.clone());
            bridges.push(state.start_fanout().await?);
            states.push(state);
        }
        states[0].bootstrap_default_rooms().await?;
        Ok(Self {
            store,
            nodes: states,
            _bridges: bridges,
        })
    }

    async fn connect(&self, node: usize, token: &str) -> anyhow::Result<Client> {
        let state = self.nodes[node].clone();
        let address = format!("10.0.{node}.{}", token.len());
        let (session, rx) = lifecycle::connect(&state, Some(token), &address).await?;
        Ok(Client { state, session, rx })
    }
}

struct Client {
    state: AppState,
    session: Session,
    rx: EventReceiver,
}

impl Client {
    async fn send(&mut self, command: ClientCommand) -> Vec<ServerEvent> {
        lifecycle::handle_command(&self.state, &mut self.session, command).await
    }

    async fn join(&mut self, room_id: &str) -> Vec<ServerEvent> {
        self.send(ClientCommand::JoinRoom(JoinRoom {
            room_id: room_id.into(),
            password: None,
        }))
        .await
    }

    async fn say(&mut self, room_id: &str, content: &str) -> Vec<ServerEvent> {
        self.send(ClientCommand::SendMessage(SendMessage {
            room_id: room_id.into(),
            content: content.into(),
            kind: MessageKind::Text,
        }))
        .await
    }

    async fn disconnect(&mut self) {
        lifecycle::disconnect(&self.state, &mut self.session).await;
    }

    /// Wait for the next pushed event matching `pred`, skipping others.
    async fn expect(&mut self, what: &str, pred: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), self.rx.recv()).await {
                Ok(Some(event)) if pred(&event) => return (*event).clone(),
                Ok(Some(_)) => continue,
                Ok(None) => panic!("event stream closed while waiting for {what}"),
                Err(_) => panic!("timed out waiting for {what}"),
            }
        }
    }

    /// True if no matching event is pushed within a short grace period.
    async fn quiet(&mut self, pred: impl Fn(&ServerEvent) -> bool) -> bool {
        loop {
            match tokio::time::timeout(Duration::from_millis(150), self.rx.recv()).await {
                Ok(Some(event)) if pred(&event) => return false,
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => return true,
            }
        }
    }
}

fn error_code(events: &[ServerEvent]) -> Option<&str> {
    events.iter().find_map(|e| e.error_code())
}

fn is_new_message(event: &ServerEvent) -> bool {
    matches!(event, ServerEvent::NewMessage(_))
}

#[tokio::test]
async fn messages_reach_members_on_every_node_in_order() -> anyhow::Result<()> {
    let cluster = Cluster::new(2).await?;
    let mut alice = cluster.connect(0, "t-alice").await?;
    let mut bob = cluster.connect(1, "t-bob").await?;
    alice.join("general").await;
    bob.join("general").await;

    for body in ["one", "two", "three"] {
        assert!(alice.say("general", body).await.is_empty());
    }

    for client in [&mut bob, &mut alice] {
        let mut bodies = Vec::new();
        for _ in 0..3 {
            if let ServerEvent::NewMessage(message) = client.expect("new-message", is_new_message).await {
                assert_eq!(message.author_id, "alice");
                bodies.push(message.body);
            }
        }
        assert_eq!(bodies, vec!["one", "two", "three"]);
    }
    Ok(())
}

#[tokio::test]
async fn members_of_other_rooms_do_not_receive_messages() -> anyhow::Result<()> {
    let cluster = Cluster::new(2).await?;
    let mut alice = cluster.connect(0, "t-alice").await?;
    let mut carol = cluster.connect(1, "t-carol").await?;
    alice.join("general").await;
    carol.join("random").await;

    alice.say("general", "hello general").await;
    alice.expect("own message", is_new_message).await;
    assert!(carol.quiet(is_new_message).await);
    Ok(())
}

#[tokio::test]
async fn join_announces_to_others_but_not_self() -> anyhow::Result<()> {
    let cluster = Cluster::new(2).await?;
    let mut alice = cluster.connect(0, "t-alice").await?;
    let mut bob = cluster.connect(1, "t-bob").await?;
    alice.join("general").await;

    let reply = bob.join("general").await;
    let ServerEvent::RoomJoined(joined) = &reply[0] else {
        panic!("expected room-joined, got {reply:?}");
    };
    assert_eq!(joined.room.id, "general");
    assert_eq!(joined.members.len(), 2);

    let event = alice
        .expect("user-joined", |e| matches!(e, ServerEvent::UserJoined(_)))
        .await;
    let ServerEvent::UserJoined(member) = event else { unreachable!() };
    assert_eq!(member.user_id, "bob");
    assert!(bob.quiet(|e| matches!(e, ServerEvent::UserJoined(_))).await);
    Ok(())
}

#[tokio::test]
async fn eleventh_message_in_a_minute_is_rate_limited() -> anyhow::Result<()> {
    let cluster = Cluster::new(1).await?;
    let mut alice = cluster.connect(0, "t-alice").await?;
    alice.join("general").await;

    for i in 1..=10 {
        let reply = alice.say("general", &format!("message number {i}")).await;
        assert!(reply.is_empty(), "message {i} rejected: {reply:?}");
    }
    let reply = alice.say("general", "message number 11").await;
    let ServerEvent::RateLimitExceeded(notice) = &reply[0] else {
        panic!("expected rate-limit-exceeded, got {reply:?}");
    };
    assert_eq!(notice.code, "MESSAGE_RATE_LIMIT");
    assert_eq!(notice.count, 11);
    assert_eq!(notice.limit, 10);
    assert_eq!(notice.action, "message");
    Ok(())
}

#[tokio::test]
async fn joining_a_second_room_leaves_the_first() -> anyhow::Result<()> {
    let cluster = Cluster::new(2).await?;
    let mut alice = cluster.connect(0, "t-alice").await?;
    let mut bob = cluster.connect(1, "t-bob").await?;
    alice.join("general").await;
    bob.join("general").await;

    let reply = alice.join("random").await;
    assert!(matches!(&reply[0], ServerEvent::RoomJoined(j) if j.room.id == "random"));
    assert_eq!(alice.session.state, ConnectionState::Joined("random".into()));

    let rooms = &cluster.nodes[0].rooms;
    assert!(!rooms.is_member("general", "alice").await?);
    assert!(rooms.is_member("random", "alice").await?);

    let left = bob
        .expect("user-left", |e| matches!(e, ServerEvent::UserLeft(_)))
        .await;
    assert!(matches!(left, ServerEvent::UserLeft(m) if m.user_id == "alice" && m.room_id == "general"));
    Ok(())
}

#[tokio::test]
async fn failed_join_keeps_connection_authenticated() -> anyhow::Result<()> {
    let cluster = Cluster::new(1).await?;
    cluster.nodes[0]
        .rooms
        .create_room("secret", RoomConfig::private("Secret", "pw1234", 10), "bob")
        .await?;
    let mut alice = cluster.connect(0, "t-alice").await?;

    let reply = alice
        .send(ClientCommand::JoinRoom(JoinRoom {
            room_id: "secret".into(),
            password: Some("wrong".into()),
        }))
        .await;
    assert!(matches!(&reply[0], ServerEvent::RoomError(_)));
    assert_eq!(error_code(&reply), Some("INVALID_PASSWORD"));
    assert_eq!(alice.session.state, ConnectionState::Authenticated);

    let reply = alice.join("missing").await;
    assert_eq!(error_code(&reply), Some("ROOM_NOT_FOUND"));

    let reply = alice
        .send(ClientCommand::JoinRoom(JoinRoom {
            room_id: "secret".into(),
            password: Some("pw1234".into()),
        }))
        .await;
    assert!(matches!(&reply[0], ServerEvent::RoomJoined(_)));
    assert_eq!(alice.session.state, ConnectionState::Joined("secret".into()));
    Ok(())
}

#[tokio::test]
async fn sending_requires_membership() -> anyhow::Result<()> {
    let cluster = Cluster::new(1).await?;
    let mut alice = cluster.connect(0, "t-alice").await?;
    let reply = alice.say("general", "anyone?").await;
    assert_eq!(error_code(&reply), Some("NOT_IN_ROOM"));

    alice.join("general").await;
    let reply = alice.say("general", &"x".repeat(501)).await;
    assert_eq!(error_code(&reply), Some("VALIDATION_ERROR"));
    Ok(())
}

#[tokio::test]
async fn private_messages_cross_nodes() -> anyhow::Result<()> {
    let cluster = Cluster::new(2).await?;
    let mut alice = cluster.connect(0, "t-alice").await?;
    let mut bob = cluster.connect(1, "t-bob").await?;

    let reply = alice
        .send(ClientCommand::PrivateMessage(SendPrivateMessage {
            recipient_id: "bob".into(),
            content: "psst".into(),
            kind: MessageKind::Text,
        }))
        .await;
    assert!(matches!(&reply[0], ServerEvent::PrivateMessageSent(m) if m.recipient_id == "bob"));

    let received = bob
        .expect("private message", |e| matches!(e, ServerEvent::PrivateMessageReceived(_)))
        .await;
    assert!(matches!(received, ServerEvent::PrivateMessageReceived(m) if m.body == "psst" && m.sender_id == "alice"));

    let reply = alice
        .send(ClientCommand::PrivateMessage(SendPrivateMessage {
            recipient_id: "carol".into(),
            content: "hello?".into(),
            kind: MessageKind::Text,
        }))
        .await;
    assert_eq!(error_code(&reply), Some("USER_OFFLINE"));
    Ok(())
}

#[tokio::test]
async fn sent_private_messages_reach_the_senders_other_devices() -> anyhow::Result<()> {
    let cluster = Cluster::new(2).await?;
    let mut laptop = cluster.connect(0, "t-alice").await?;
    let mut phone = cluster.connect(1, "t-alice").await?;
    let mut bob = cluster.connect(1, "t-bob").await?;

    let reply = laptop
        .send(ClientCommand::PrivateMessage(SendPrivateMessage {
            recipient_id: "bob".into(),
            content: "on my way".into(),
            kind: MessageKind::Text,
        }))
        .await;
    assert!(matches!(&reply[0], ServerEvent::PrivateMessageSent(_)));

    let synced = phone
        .expect("sent copy", |e| matches!(e, ServerEvent::PrivateMessageSent(_)))
        .await;
    assert!(matches!(synced, ServerEvent::PrivateMessageSent(m) if m.body == "on my way"));
    bob.expect("private message", |e| matches!(e, ServerEvent::PrivateMessageReceived(_)))
        .await;
    assert!(laptop.quiet(|e| matches!(e, ServerEvent::PrivateMessageSent(_))).await);
    Ok(())
}

#[tokio::test]
async fn stale_disconnect_keeps_reconnected_user_online() -> anyhow::Result<()> {
    let cluster = Cluster::new(2).await?;
    let mut first = cluster.connect(0, "t-alice").await?;
    let mut second = cluster.connect(1, "t-alice").await?;
    let presence = &cluster.nodes[0].presence;
    assert_eq!(
        presence.resolve_connection("alice").await?.as_deref(),
        Some(second.session.handle.as_str())
    );

    first.disconnect().await;
    assert!(presence.is_online("alice").await?);

    second.disconnect().await;
    assert!(!presence.is_online("alice").await?);
    Ok(())
}

#[tokio::test]
async fn disconnect_removes_membership_and_notifies() -> anyhow::Result<()> {
    let cluster = Cluster::new(2).await?;
    let mut alice = cluster.connect(0, "t-alice").await?;
    let mut bob = cluster.connect(1, "t-bob").await?;
    alice.join("general").await;
    bob.join("general").await;

    alice.disconnect().await;
    assert_eq!(alice.session.state, ConnectionState::Disconnected);
    let left = bob
        .expect("user-left", |e| matches!(e, ServerEvent::UserLeft(_)))
        .await;
    assert!(matches!(left, ServerEvent::UserLeft(m) if m.user_id == "alice"));
    assert!(!cluster.nodes[1].rooms.is_member("general", "alice").await?);
    assert!(!cluster.nodes[1].presence.is_online("alice").await?);
    assert_eq!(cluster.nodes[0].registry.connection_count(), 0);

    // Commands after disconnect are ignored.
    assert!(alice.say("general", "ghost").await.is_empty());
    Ok(())
}

#[tokio::test]
async fn disconnect_keeps_membership_for_other_local_device() -> anyhow::Result<()> {
    let cluster = Cluster::new(1).await?;
    let mut phone = cluster.connect(0, "t-alice").await?;
    let mut laptop = cluster.connect(0, "t-alice").await?;
    phone.join("general").await;
    laptop.join("general").await;

    phone.disconnect().await;
    assert!(cluster.nodes[0].rooms.is_member("general", "alice").await?);
    laptop.say("general", "still here").await;
    laptop.expect("own message", is_new_message).await;
    Ok(())
}

#[tokio::test]
async fn switching_rooms_on_one_device_keeps_the_other_in_place() -> anyhow::Result<()> {
    let cluster = Cluster::new(1).await?;
    let mut phone = cluster.connect(0, "t-alice").await?;
    let mut laptop = cluster.connect(0, "t-alice").await?;
    let mut bob = cluster.connect(0, "t-bob").await?;
    phone.join("general").await;
    laptop.join("general").await;
    bob.join("general").await;

    phone.join("random").await;
    assert!(cluster.nodes[0].rooms.is_member("general", "alice").await?);
    assert!(cluster.nodes[0].rooms.is_member("random", "alice").await?);

    let reply = laptop.say("general", "still in general").await;
    assert_eq!(error_code(&reply), None);
    laptop.expect("own message", is_new_message).await;
    assert!(bob.quiet(|e| matches!(e, ServerEvent::UserLeft(_))).await);

    laptop.join("random").await;
    let left = bob
        .expect("user-left", |e| matches!(e, ServerEvent::UserLeft(_)))
        .await;
    assert!(matches!(left, ServerEvent::UserLeft(m) if m.user_id == "alice" && m.room_id == "general"));
    assert!(!cluster.nodes[0].rooms.is_member("general", "alice").await?);
    Ok(())
}

#[tokio::test]
async fn disconnect_keeps_membership_held_by_a_device_on_another_node() -> anyhow::Result<()> {
    let cluster = Cluster::new(2).await?;
    let mut phone = cluster.connect(0, "t-alice").await?;
    let mut laptop = cluster.connect(1, "t-alice").await?;
    let mut bob = cluster.connect(1, "t-bob").await?;
    phone.join("general").await;
    laptop.join("general").await;
    bob.join("general").await;

    phone.disconnect().await;
    assert!(cluster.nodes[1].rooms.is_member("general", "alice").await?);
    let reply = laptop.say("general", "from the laptop").await;
    assert_eq!(error_code(&reply), None);
    laptop.expect("own message", is_new_message).await;
    assert!(bob.quiet(|e| matches!(e, ServerEvent::UserLeft(_))).await);

    laptop.disconnect().await;
    let left = bob
        .expect("user-left", |e| matches!(e, ServerEvent::UserLeft(_)))
        .await;
    assert!(matches!(left, ServerEvent::UserLeft(m) if m.user_id == "alice"));
    assert!(!cluster.nodes[0].rooms.is_member("general", "alice").await?);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn room_activity_keeps_presence_alive() -> anyhow::Result<()> {
    let cluster = Cluster::new(1).await?;
    let mut alice = cluster.connect(0, "t-alice").await?;
    let mut bob = cluster.connect(0, "t-bob").await?;
    alice.join("general").await;

    tokio::time::advance(Duration::from_secs(100)).await;
    assert_eq!(error_code(&alice.say("general", "first thought").await), None);
    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(error_code(&alice.say("general", "second thought").await), None);

    assert!(cluster.nodes[0].presence.is_online("alice").await?);
    let reply = bob
        .send(ClientCommand::PrivateMessage(SendPrivateMessage {
            recipient_id: "alice".into(),
            content: "saw your posts".into(),
            kind: MessageKind::Text,
        }))
        .await;
    assert_eq!(error_code(&reply), None);
    alice
        .expect("private message", |e| matches!(e, ServerEvent::PrivateMessageReceived(_)))
        .await;
    Ok(())
}

#[tokio::test]
async fn disconnect_stops_typing_in_every_room() -> anyhow::Result<()> {
    let cluster = Cluster::new(1).await?;
    let mut phone = cluster.connect(0, "t-alice").await?;
    let mut laptop = cluster.connect(0, "t-alice").await?;
    let mut bob = cluster.connect(0, "t-bob").await?;
    phone.join("random").await;
    laptop.join("general").await;
    bob.join("random").await;

    laptop
        .send(ClientCommand::TypingStart(RoomRef {
            room_id: "random".into(),
        }))
        .await;
    let started = bob
        .expect("typing start", |e| matches!(e, ServerEvent::UserTyping(_)))
        .await;
    assert!(matches!(started, ServerEvent::UserTyping(t) if t.is_typing && t.room_id == "random"));

    laptop.disconnect().await;
    let stopped = bob
        .expect("typing stop", |e| matches!(e, ServerEvent::UserTyping(_)))
        .await;
    assert!(matches!(stopped, ServerEvent::UserTyping(t) if !t.is_typing && t.room_id == "random"));
    assert!(cluster.nodes[0].rooms.typing_users("random").await?.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn typing_indicator_stops_on_its_own() -> anyhow::Result<()> {
    let cluster = Cluster::new(1).await?;
    let mut alice = cluster.connect(0, "t-alice").await?;
    let mut bob = cluster.connect(0, "t-bob").await?;
    alice.join("general").await;
    bob.join("general").await;

    assert!(alice
        .send(ClientCommand::TypingStart(RoomRef {
            room_id: "general".into()
        }))
        .await
        .is_empty());
    let started = bob
        .expect("typing start", |e| matches!(e, ServerEvent::UserTyping(_)))
        .await;
    assert!(matches!(started, ServerEvent::UserTyping(t) if t.is_typing && t.user_id == "alice"));

    let before = tokio::time::Instant::now();
    let stopped = bob
        .expect("typing stop", |e| matches!(e, ServerEvent::UserTyping(_)))
        .await;
    assert!(matches!(stopped, ServerEvent::UserTyping(t) if !t.is_typing));
    assert!(before.elapsed() >= Duration::from_secs(2));
    assert!(cluster.nodes[0].rooms.typing_users("general").await?.is_empty());
    assert!(alice.quiet(|e| matches!(e, ServerEvent::UserTyping(_))).await);
    Ok(())
}

#[tokio::test]
async fn explicit_typing_stop_cancels_timer() -> anyhow::Result<()> {
    let cluster = Cluster::new(1).await?;
    let mut alice = cluster.connect(0, "t-alice").await?;
    let mut bob = cluster.connect(0, "t-bob").await?;
    alice.join("general").await;
    bob.join("general").await;

    let room = || RoomRef {
        room_id: "general".into(),
    };
    alice.send(ClientCommand::TypingStart(room())).await;
    alice.send(ClientCommand::TypingStop(room())).await;
    assert!(!alice.session.typing.is_pending("general"));

    let mut typing = Vec::new();
    for _ in 0..2 {
        if let ServerEvent::UserTyping(t) = bob
            .expect("typing", |e| matches!(e, ServerEvent::UserTyping(_)))
            .await
        {
            typing.push(t.is_typing);
        }
    }
    assert_eq!(typing, vec![true, false]);
    Ok(())
}

#[tokio::test]
async fn store_outage_is_surfaced_and_disconnect_still_completes() -> anyhow::Result<()> {
    let cluster = Cluster::new(1).await?;
    let mut alice = cluster.connect(0, "t-alice").await?;
    alice.join("general").await;

    cluster.store.set_offline(true);
    let reply = alice.say("general", "are you there").await;
    assert_eq!(error_code(&reply), Some("SERVICE_UNAVAILABLE"));
    let reply = alice.join("random").await;
    assert_eq!(error_code(&reply), Some("SERVICE_UNAVAILABLE"));
    assert_eq!(alice.session.state, ConnectionState::Joined("general".into()));

    alice.disconnect().await;
    assert_eq!(alice.session.state, ConnectionState::Disconnected);
    assert_eq!(cluster.nodes[0].registry.connection_count(), 0);
    cluster.store.set_offline(false);
    Ok(())
}

#[tokio::test]
async fn room_creation_and_deletion_are_broadcast() -> anyhow::Result<()> {
    let cluster = Cluster::new(2).await?;
    let mut alice = cluster.connect(0, "t-alice").await?;
    let mut bob = cluster.connect(1, "t-bob").await?;

    let reply = alice
        .send(ClientCommand::CreateRoom(CreateRoom {
            room_id: "side".into(),
            name: "Side Room".into(),
            description: String::new(),
            is_private: false,
            password: None,
            capacity: Some(5),
        }))
        .await;
    assert!(reply.is_empty(), "{reply:?}");
    let created = bob
        .expect("room-created", |e| matches!(e, ServerEvent::RoomCreated(_)))
        .await;
    assert!(matches!(created, ServerEvent::RoomCreated(r) if r.id == "side" && r.capacity == 5));

    // Warm node 1's cache, then leave so the room is empty again.
    bob.join("side").await;
    bob.send(ClientCommand::LeaveRoom(RoomRef { room_id: "side".into() }))
        .await;

    let reply = bob
        .send(ClientCommand::DeleteRoom(RoomRef { room_id: "side".into() }))
        .await;
    assert_eq!(error_code(&reply), Some("FORBIDDEN"));

    assert!(alice
        .send(ClientCommand::DeleteRoom(RoomRef { room_id: "side".into() }))
        .await
        .is_empty());
    bob.expect("room-deleted", |e| matches!(e, ServerEvent::RoomDeleted(_)))
        .await;

    let reply = bob.join("side").await;
    assert_eq!(error_code(&reply), Some("ROOM_NOT_FOUND"));

    let reply = alice.send(ClientCommand::ListRooms).await;
    let ServerEvent::RoomList(list) = &reply[0] else {
        panic!("expected room-list");
    };
    let ids: Vec<&str> = list.rooms.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["general", "random"]);
    Ok(())
}

#[tokio::test]
async fn message_deletion_requires_author_or_moderator() -> anyhow::Result<()> {
    let cluster = Cluster::new(1).await?;
    let mut alice = cluster.connect(0, "t-alice").await?;
    let mut bob = cluster.connect(0, "t-bob").await?;
    let mut mia = cluster.connect(0, "t-mod").await?;
    for client in [&mut alice, &mut bob, &mut mia] {
        client.join("general").await;
    }

    alice.say("general", "oops").await;
    let ServerEvent::NewMessage(message) = alice.expect("own message", is_new_message).await else {
        unreachable!()
    };
    let delete = || {
        ClientCommand::DeleteMessage(DeleteMessage {
            room_id: "general".into(),
            message_id: message.id.clone(),
        })
    };

    let reply = bob.send(delete()).await;
    assert_eq!(error_code(&reply), Some("FORBIDDEN"));
    assert!(mia.send(delete()).await.is_empty());
    let deleted = alice
        .expect("message-deleted", |e| matches!(e, ServerEvent::MessageDeleted(_)))
        .await;
    assert!(matches!(deleted, ServerEvent::MessageDeleted(d) if d.deleted_by == "mia"));

    let reply = bob
        .send(ClientCommand::DeleteMessage(DeleteMessage {
            room_id: "general".into(),
            message_id: "12345".into(),
        }))
        .await;
    assert_eq!(error_code(&reply), Some("MESSAGE_NOT_FOUND"));
    Ok(())
}

#[tokio::test]
async fn history_pages_through_room_log() -> anyhow::Result<()> {
    let cluster = Cluster::new(1).await?;
    let mut alice = cluster.connect(0, "t-alice").await?;
    alice.join("general").await;
    for i in 0..4 {
        alice.say("general", &format!("entry {i}")).await;
    }

    let reply = alice
        .send(ClientCommand::GetHistory(GetHistory {
            room_id: "general".into(),
            limit: Some(3),
            offset: None,
        }))
        .await;
    let ServerEvent::RoomHistory(page) = &reply[0] else {
        panic!("expected room-history");
    };
    let bodies: Vec<&str> = page.messages.iter().map(|m| m.body.as_str()).collect();
    assert_eq!(bodies, vec!["entry 1", "entry 2", "entry 3"]);
    assert!(page.has_more);

    let reply = alice.join("general").await;
    let ServerEvent::RoomJoined(joined) = &reply[0] else {
        panic!("expected room-joined");
    };
    assert_eq!(joined.history.len(), 4);
    Ok(())
}

#[tokio::test]
async fn repeated_spam_is_warned_then_blocked() -> anyhow::Result<()> {
    let cluster = Cluster::new(1).await?;
    let mut alice = cluster.connect(0, "t-alice").await?;
    alice.join("general").await;

    let mut codes = Vec::new();
    for _ in 0..5 {
        let reply = alice.say("general", "FREE MONEY CLICK HERE").await;
        codes.push(error_code(&reply).map(str::to_string));
    }
    assert_eq!(
        codes,
        vec![
            None,
            None,
            Some("SPAM_WARNING".to_string()),
            Some("SPAM_WARNING".to_string()),
            Some("SPAM_DETECTED".to_string()),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn guests_are_admitted_with_restrictions() -> anyhow::Result<()> {
    let cluster = Cluster::new(1).await?;
    let state = cluster.nodes[0].clone();
    let (session, rx) = lifecycle::connect(&state, None, "192.168.1.9").await?;
    let mut guest = Client { state, session, rx };
    assert!(guest.session.identity.user_id.starts_with("guest_"));
    assert_eq!(guest.session.identity.role, Role::Guest);

    let reply = guest
        .send(ClientCommand::CreateRoom(CreateRoom {
            room_id: "mine".into(),
            name: "Mine".into(),
            description: String::new(),
            is_private: false,
            password: None,
            capacity: None,
        }))
        .await;
    assert_eq!(error_code(&reply), Some("FORBIDDEN"));

    guest.join("general").await;
    let reply = guest
        .send(ClientCommand::SendMessage(SendMessage {
            room_id: "general".into(),
            content: "https://example.com/cat.png".into(),
            kind: MessageKind::Image,
        }))
        .await;
    assert_eq!(error_code(&reply), Some("FORBIDDEN"));
    assert!(guest.say("general", "hi all").await.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn expired_guests_are_announced_as_leaving() -> anyhow::Result<()> {
    let cluster = Cluster::new(1).await?;
    let state = cluster.nodes[0].clone();
    let mut bob = cluster.connect(0, "t-bob").await?;
    bob.join("general").await;

    let (session, rx) = lifecycle::connect(&state, None, "192.168.1.10").await?;
    let mut guest = Client { state: state.clone(), session, rx };
    guest.join("general").await;
    let guest_id = guest.session.identity.user_id.clone();
    bob.expect("guest joined", |e| matches!(e, ServerEvent::UserJoined(_)))
        .await;

    tokio::time::advance(state.config.guest_idle + Duration::from_secs(1)).await;
    let (_, swept) = state.run_maintenance(Duration::from_secs(3600)).await?;
    assert_eq!(swept, 1);

    let left = bob
        .expect("guest left", |e| matches!(e, ServerEvent::UserLeft(_)))
        .await;
    assert!(matches!(left, ServerEvent::UserLeft(m) if m.user_id == guest_id && m.room_id == "general"));
    let roster = bob
        .expect("roster", |e| matches!(e, ServerEvent::RoomUsersUpdated(_)))
        .await;
    assert!(matches!(roster, ServerEvent::RoomUsersUpdated(r) if r.users.iter().all(|u| u.user_id != guest_id)));
    Ok(())
}

#[tokio::test]
async fn connection_attempts_are_rate_limited_per_address() -> anyhow::Result<()> {
    let cluster = Cluster::new(1).await?;
    let state = &cluster.nodes[0];
    for _ in 0..5 {
        lifecycle::connect(state, None, "203.0.113.7").await?;
    }
    let Err(err) = lifecycle::connect(state, None, "203.0.113.7").await else {
        panic!("sixth connection from one address was admitted");
    };
    assert!(matches!(err, CoreError::RateLimited { .. }));
    assert_eq!(err.code(), "CONNECTION_RATE_LIMIT");
    assert!(lifecycle::connect(state, None, "203.0.113.8").await.is_ok());
    Ok(())
}

#[tokio::test]
async fn unknown_credentials_are_rejected() -> anyhow::Result<()> {
    let cluster = Cluster::new(1).await?;
    let Err(err) = lifecycle::connect(&cluster.nodes[0], Some("forged"), "10.9.9.9").await else {
        panic!("forged credential was accepted");
    };
    assert_eq!(err.code(), "UNAUTHORIZED");
    assert_eq!(cluster.nodes[0].registry.connection_count(), 0);
    Ok(())
}

#[tokio::test]
async fn maintenance_removes_idle_rooms_only() -> anyhow::Result<()> {
    let cluster = Cluster::new(1).await?;
    let state = &cluster.nodes[0];
    state
        .rooms
        .create_room("stale", RoomConfig::public("Stale", 10), "alice")
        .await?;
    let (rooms, guests) = state.run_maintenance(Duration::ZERO).await?;
    assert_eq!((rooms, guests), (1, 0));
    let ids: Vec<String> = state.rooms.list_rooms().await?.into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec!["general", "random"]);
    Ok(())
}
