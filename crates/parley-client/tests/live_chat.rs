/// Integration tests: client sessions against the real orchestrator, SQLite
/// store and gateway, wired together in-process.
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use tokio::time::timeout;

use parley_api::backend::SqliteBackend;
use parley_api::error::ApiError;
use parley_api::orchestrator::SendOrchestrator;
use parley_api::rate_limit::FixedWindowLimiter;
use parley_client::realtime::MessageChannel;
use parley_client::remote::RemoteStore;
use parley_client::session::SessionUpdate;
use parley_client::timeline::DeliveryStatus;
use parley_client::transport::{Transport, TransportLink};
use parley_client::{ChatSession, ClientConfig, ClientError, ConnectionState, MessageCache};
use parley_db::Database;
use parley_gateway::dispatcher::Dispatcher;
use parley_gateway::local::connect_local;
use parley_types::api::{MessageQuery, SendMessageRequest, SendMessageResponse, UnlockResponse};
use parley_types::events::GatewayEvent;
use parley_types::models::{Message, MessageDraft, MessageKind, NewMessage};
use parley_types::ports::{ChatAccess, MessageStore, Wallet};

const WAIT: Duration = Duration::from_secs(5);
const CHAT: &str = "chat-1";

struct LoopbackTransport {
    dispatcher: Dispatcher,
    user_id: String,
    connects: AtomicUsize,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&self) -> Result<TransportLink, ClientError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let link = connect_local(self.dispatcher.clone(), self.user_id.clone());
        Ok(TransportLink {
            commands: link.commands,
            events: link.events,
        })
    }
}

/// Loopback whose open links can all be cut at once, like a network drop.
struct SeverableLoopback {
    inner: LoopbackTransport,
    cut: Arc<Notify>,
}

#[async_trait]
impl Transport for SeverableLoopback {
    async fn connect(&self) -> Result<TransportLink, ClientError> {
        let TransportLink {
            commands,
            mut events,
        } = self.inner.connect().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let cut = self.cut.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cut.notified() => break,
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(TransportLink { commands, events: rx })
    }
}

/// The REST surface without HTTP: same collaborators, same error bodies.
struct LocalRemote {
    user_id: String,
    backend: SqliteBackend,
    orchestrator: SendOrchestrator,
}

fn client_error(e: impl Into<ApiError>) -> ClientError {
    ClientError::from_body(e.into().body())
}

#[async_trait]
impl RemoteStore for LocalRemote {
    async fn fetch(&self, chat_id: &str, query: &MessageQuery) -> Result<Vec<Message>, ClientError> {
        if !self.backend.is_participant(chat_id, &self.user_id).await.map_err(client_error)? {
            return Err(ClientError::Forbidden);
        }
        self.backend.fetch(chat_id, query).await.map_err(client_error)
    }

    async fn send(
        &self,
        chat_id: &str,
        request: SendMessageRequest,
    ) -> Result<SendMessageResponse, ClientError> {
        let receipt = self
            .orchestrator
            .send(chat_id, &self.user_id, request.draft)
            .await
            .map_err(client_error)?;
        Ok(SendMessageResponse {
            message: receipt.message,
            balance: receipt.balance,
            client_id: request.client_id,
        })
    }

    async fn mark_read(&self, chat_id: &str) -> Result<(), ClientError> {
        self.backend
            .mark_read(chat_id, &self.user_id)
            .await
            .map(|_| ())
            .map_err(client_error)
    }

    async fn unlock(&self, chat_id: &str, message_id: &str) -> Result<UnlockResponse, ClientError> {
        let receipt = self
            .orchestrator
            .unlock(chat_id, message_id, &self.user_id)
            .await
            .map_err(client_error)?;
        Ok(UnlockResponse {
            message: receipt.message,
            balance: receipt.balance,
        })
    }

    async fn balance(&self) -> Result<i64, ClientError> {
        self.backend.balance(&self.user_id).await.map_err(client_error)
    }
}

/// Server that always looks unreachable.
struct Offline;

#[async_trait]
impl RemoteStore for Offline {
    async fn fetch(&self, _: &str, _: &MessageQuery) -> Result<Vec<Message>, ClientError> {
        Err(ClientError::Transient("offline".into()))
    }

    async fn send(&self, _: &str, _: SendMessageRequest) -> Result<SendMessageResponse, ClientError> {
        Err(ClientError::Transient("offline".into()))
    }

    async fn mark_read(&self, _: &str) -> Result<(), ClientError> {
        Err(ClientError::Transient("offline".into()))
    }

    async fn unlock(&self, _: &str, _: &str) -> Result<UnlockResponse, ClientError> {
        Err(ClientError::Transient("offline".into()))
    }

    async fn balance(&self) -> Result<i64, ClientError> {
        Err(ClientError::Transient("offline".into()))
    }
}

struct Server {
    db: Arc<Database>,
    backend: SqliteBackend,
    dispatcher: Dispatcher,
    orchestrator: SendOrchestrator,
}

impl Server {
    fn start() -> Self {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.create_chat(CHAT).unwrap();
        for user in ["alice", "bob"] {
            db.add_participant(CHAT, user).unwrap();
            db.set_balance(user, 5).unwrap();
        }

        let backend = SqliteBackend::new(db.clone());
        let dispatcher = Dispatcher::new(Arc::new(backend.clone()));
        let orchestrator = SendOrchestrator::new(
            Arc::new(backend.clone()),
            Arc::new(backend.clone()),
            Arc::new(backend.clone()),
            Arc::new(FixedWindowLimiter::new(30, 60)),
            dispatcher.clone(),
        );

        Self {
            db,
            backend,
            dispatcher,
            orchestrator,
        }
    }

    fn remote(&self, user_id: &str) -> Arc<LocalRemote> {
        Arc::new(LocalRemote {
            user_id: user_id.into(),
            backend: self.backend.clone(),
            orchestrator: self.orchestrator.clone(),
        })
    }

    fn transport(&self, user_id: &str) -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport {
            dispatcher: self.dispatcher.clone(),
            user_id: user_id.into(),
            connects: AtomicUsize::new(0),
        })
    }

    async fn open(&self, user_id: &str) -> Result<ChatSession, ClientError> {
        self.open_with(user_id, &config()).await
    }

    async fn open_with(
        &self,
        user_id: &str,
        config: &ClientConfig,
    ) -> Result<ChatSession, ClientError> {
        ChatSession::open(
            CHAT,
            user_id,
            Some(user_id.to_uppercase()),
            Arc::new(MessageCache::in_memory()),
            self.remote(user_id),
            self.transport(user_id),
            config,
        )
        .await
    }

    fn insert(&self, sender: &str, content: &str) -> Message {
        self.db
            .insert_message(&NewMessage {
                chat_id: CHAT.into(),
                sender_id: sender.into(),
                kind: MessageKind::Text,
                content: Some(content.into()),
                media_url: None,
                price: None,
            })
            .unwrap()
    }
}

fn config() -> ClientConfig {
    ClientConfig {
        subscribe_timeout: Duration::from_secs(2),
        reconnect_base: Duration::from_millis(50),
        reconnect_cap: Duration::from_millis(200),
        ..ClientConfig::default()
    }
}

async fn until_subscribed(session: &mut ChatSession) {
    timeout(WAIT, async {
        loop {
            match session.next_update().await {
                Some(SessionUpdate::Connection {
                    state: ConnectionState::Subscribed,
                    ..
                }) => return,
                Some(_) => {}
                None => panic!("session closed while connecting"),
            }
        }
    })
    .await
    .expect("message channel never subscribed");
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn test_message(id: &str) -> Message {
    Message {
        id: id.into(),
        chat_id: CHAT.into(),
        sender_id: "alice".into(),
        kind: MessageKind::Text,
        content: Some(id.into()),
        media_url: None,
        price: None,
        unlocked_by: vec![],
        read_at: None,
        created_at: parley_types::time::now(),
    }
}

#[tokio::test]
async fn sent_message_reaches_the_other_participant() {
    let server = Server::start();
    let mut alice = server.open("alice").await.unwrap();
    let mut bob = server.open("bob").await.unwrap();
    until_subscribed(&mut alice).await;
    until_subscribed(&mut bob).await;

    let sent = alice.send(MessageDraft::text("hello bob")).await.unwrap();
    assert_eq!(alice.balance(), Some(4));
    assert_eq!(alice.timeline().get(&sent.id).unwrap().status, DeliveryStatus::Sent);
    assert_eq!(alice.timeline().len(), 1);

    let update = timeout(WAIT, bob.next_update()).await.unwrap().unwrap();
    assert_eq!(
        update,
        SessionUpdate::Message {
            id: sent.id.clone(),
            merge: parley_client::timeline::Merge::Inserted,
        }
    );
    assert_eq!(bob.timeline().get(&sent.id).unwrap().message.content.as_deref(), Some("hello bob"));

    // Alice's own insert is filtered out; her next update is Bob's reply.
    let reply = bob.send(MessageDraft::text("hi alice")).await.unwrap();
    let update = timeout(WAIT, alice.next_update()).await.unwrap().unwrap();
    assert_eq!(
        update,
        SessionUpdate::Message {
            id: reply.id.clone(),
            merge: parley_client::timeline::Merge::Inserted,
        }
    );
    assert_eq!(alice.timeline().len(), 2);
    assert_eq!(alice.timeline().get(&sent.id).unwrap().status, DeliveryStatus::Sent);
    assert_eq!(alice.timeline().get(&reply.id).unwrap().status, DeliveryStatus::Delivered);

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn duplicate_delivery_renders_once() {
    let server = Server::start();
    let mut bob = server.open("bob").await.unwrap();
    until_subscribed(&mut bob).await;

    let first = test_message("m-dup");
    for _ in 0..2 {
        server.dispatcher.publish(GatewayEvent::MessageInsert { message: first.clone() });
    }
    server.dispatcher.publish(GatewayEvent::MessageInsert { message: test_message("m-next") });

    let update = timeout(WAIT, bob.next_update()).await.unwrap().unwrap();
    assert!(matches!(update, SessionUpdate::Message { ref id, .. } if id == "m-dup"));
    let update = timeout(WAIT, bob.next_update()).await.unwrap().unwrap();
    assert!(matches!(update, SessionUpdate::Message { ref id, .. } if id == "m-next"));
    assert_eq!(bob.timeline().len(), 2);

    bob.close().await;
}

#[tokio::test]
async fn open_history_comes_from_the_server_and_pages_backwards() {
    let server = Server::start();
    for i in 0..5 {
        server.insert("alice", &format!("m{}", i));
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let config = ClientConfig {
        page_size: 2,
        ..config()
    };
    let mut bob = server.open_with("bob", &config).await.unwrap();
    let contents = |s: &ChatSession| -> Vec<String> {
        s.timeline()
            .entries()
            .iter()
            .filter_map(|e| e.message.content.clone())
            .collect()
    };
    assert_eq!(contents(&bob), ["m3", "m4"]);

    assert_eq!(bob.load_older().await.unwrap(), 2);
    assert_eq!(bob.load_older().await.unwrap(), 1);
    assert_eq!(bob.load_older().await.unwrap(), 0);
    assert_eq!(contents(&bob), ["m0", "m1", "m2", "m3", "m4"]);

    bob.close().await;
}

#[tokio::test]
async fn unreachable_server_falls_back_to_cache() {
    let server = Server::start();
    let cache = Arc::new(MessageCache::in_memory());
    cache.put(CHAT, &[test_message("cached-1")]).unwrap();

    let session = ChatSession::open(
        CHAT,
        "bob",
        None,
        cache,
        Arc::new(Offline),
        server.transport("bob"),
        &config(),
    )
    .await
    .unwrap();

    assert!(session.timeline().get("cached-1").is_some());
    session.close().await;
}

#[tokio::test]
async fn outsiders_cannot_open_a_chat() {
    let server = Server::start();
    let result = server.open("mallory").await;
    assert!(matches!(result, Err(ClientError::Forbidden)));
}

#[tokio::test]
async fn failed_send_stays_visible_and_can_be_retried() {
    let server = Server::start();
    server.db.set_balance("bob", 0).unwrap();
    let mut bob = server.open("bob").await.unwrap();

    let err = bob.send(MessageDraft::text("broke")).await.unwrap_err();
    assert!(matches!(err, ClientError::InsufficientBalance { balance: 0, required: 1 }));
    assert_eq!(bob.balance(), Some(0));

    let failed = &bob.timeline().entries()[0];
    assert_eq!(failed.status, DeliveryStatus::Failed);
    assert!(failed.error.is_some());
    let provisional = failed.message.id.clone();
    assert!(server.backend.fetch(CHAT, &MessageQuery::default()).await.unwrap().is_empty());

    server.db.credit("bob", 5, "top up").unwrap();
    let sent = bob.retry(&provisional).await.unwrap();
    assert_eq!(bob.balance(), Some(4));
    assert!(bob.timeline().get(&provisional).is_none());
    assert_eq!(bob.timeline().get(&sent.id).unwrap().status, DeliveryStatus::Sent);

    bob.close().await;
}

#[tokio::test]
async fn paid_media_unlock_pays_the_sender() {
    let server = Server::start();
    let mut alice = server.open("alice").await.unwrap();
    let mut bob = server.open("bob").await.unwrap();

    let teaser = alice
        .send(MessageDraft::paid_media("media/clip.mp4", 3))
        .await
        .unwrap();
    assert_eq!(alice.balance(), Some(5));

    let unlocked = bob.unlock(&teaser.id).await.unwrap();
    assert!(unlocked.is_unlocked_for("bob"));
    assert_eq!(bob.balance(), Some(2));
    assert_eq!(server.remote("alice").balance().await.unwrap(), 8);

    // Second unlock is free.
    bob.unlock(&teaser.id).await.unwrap();
    assert_eq!(bob.balance(), Some(2));

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn mark_read_stamps_incoming_messages() {
    let server = Server::start();
    let sent = server.insert("alice", "read me");
    let bob = server.open("bob").await.unwrap();

    bob.mark_read();
    let backend = server.backend.clone();
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let stored = backend.get(&sent.id).await.unwrap();
        if stored.is_read() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "message never marked read");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    bob.close().await;
}

#[tokio::test]
async fn presence_follows_join_and_leave() {
    let server = Server::start();
    let alice = server.open("alice").await.unwrap();
    let bob = server.open("bob").await.unwrap();

    eventually("alice online", || bob.is_online("alice")).await;
    eventually("bob online", || alice.is_online("bob")).await;
    assert!(
        bob.online_users()
            .iter()
            .any(|r| r.user_id == "alice" && r.display_name.as_deref() == Some("ALICE"))
    );

    alice.close().await;
    eventually("alice offline", || !bob.is_online("alice")).await;
    assert!(bob.last_seen("alice").is_some());

    bob.close().await;
}

#[tokio::test]
async fn typing_indicator_excludes_self() {
    let server = Server::start();
    let alice = server.open("alice").await.unwrap();
    let bob = server.open("bob").await.unwrap();

    // A successful send means the typing channel is subscribed.
    eventually("bob typing channel", || bob.notify_typing("Bob")).await;
    eventually("alice typing channel", || alice.notify_typing("Alice")).await;

    eventually("bob sees alice", || bob.typing_users() == ["Alice"]).await;
    assert!(!alice.typing_users().contains(&"Alice".to_string()));

    // Debounced within the window.
    assert!(!alice.notify_typing("Alice"));

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn denied_subscription_stops_without_retry() {
    let server = Server::start();
    let transport = server.transport("mallory");
    let channel = MessageChannel::subscribe(transport.clone(), CHAT, &config());

    let mut state = channel.watch_state();
    timeout(WAIT, state.wait_for(|s| *s == ConnectionState::Errored))
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
    assert_eq!(channel.state(), ConnectionState::Errored);
}

#[tokio::test]
async fn unsubscribe_is_idempotent_and_ends_the_stream() {
    let server = Server::start();
    let mut channel = MessageChannel::subscribe(server.transport("bob"), CHAT, &config());

    let mut state = channel.watch_state();
    timeout(WAIT, state.wait_for(|s| *s == ConnectionState::Subscribed))
        .await
        .unwrap()
        .unwrap();

    server.dispatcher.publish(GatewayEvent::MessageInsert { message: test_message("late") });
    channel.unsubscribe().await;
    channel.unsubscribe().await;

    assert!(channel.recv().await.is_none());
    assert_eq!(channel.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn own_inserts_are_not_rendered_twice() {
    let server = Server::start();
    let mut alice = server.open("alice").await.unwrap();
    until_subscribed(&mut alice).await;

    server.dispatcher.publish(GatewayEvent::MessageInsert { message: test_message("m-own") });
    let theirs = Message {
        sender_id: "bob".into(),
        ..test_message("m-theirs")
    };
    server.dispatcher.publish(GatewayEvent::MessageInsert { message: theirs });

    let update = timeout(WAIT, alice.next_update()).await.unwrap().unwrap();
    assert!(matches!(update, SessionUpdate::Message { ref id, .. } if id == "m-theirs"));
    assert!(alice.timeline().get("m-own").is_none());
    assert_eq!(alice.timeline().len(), 1);

    alice.close().await;
}

#[tokio::test]
async fn dropped_link_catches_up_after_resubscribing() {
    let server = Server::start();
    let cut = Arc::new(Notify::new());
    let transport = Arc::new(SeverableLoopback {
        inner: LoopbackTransport {
            dispatcher: server.dispatcher.clone(),
            user_id: "bob".into(),
            connects: AtomicUsize::new(0),
        },
        cut: cut.clone(),
    });
    let mut bob = ChatSession::open(
        CHAT,
        "bob",
        None,
        Arc::new(MessageCache::in_memory()),
        server.remote("bob"),
        transport.clone(),
        &config(),
    )
    .await
    .unwrap();
    until_subscribed(&mut bob).await;
    let links = transport.inner.connects.load(Ordering::SeqCst);

    // Written while the link is down, so it never reaches the channel.
    cut.notify_waiters();
    let missed = server.insert("alice", "while you were away");

    let mut saw_degraded = false;
    let caught_up = timeout(WAIT, async {
        loop {
            match bob.next_update().await {
                Some(SessionUpdate::Connection { state, caught_up }) => {
                    saw_degraded |= state.is_degraded();
                    if state == ConnectionState::Subscribed && saw_degraded {
                        return caught_up;
                    }
                }
                Some(_) => {}
                None => panic!("session closed while reconnecting"),
            }
        }
    })
    .await
    .expect("message channel never resubscribed");

    assert_eq!(caught_up, 1);
    assert!(bob.timeline().get(&missed.id).is_some());
    assert!(transport.inner.connects.load(Ordering::SeqCst) > links);

    bob.close().await;
}
