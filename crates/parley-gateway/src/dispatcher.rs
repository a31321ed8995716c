use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, broadcast};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_types::events::{GatewayEvent, PresenceMeta, Topic};
use parley_types::ports::ChatAccess;

/// An event on its way to every session. Sessions filter by topic.
#[derive(Debug, Clone)]
pub struct Broadcast {
    pub topic: Option<Topic>,
    /// Connection that produced the event, for echo suppression.
    pub origin: Option<Uuid>,
    pub event: GatewayEvent,
}

/// Presence of one user in one chat, owned by the connection that last
/// announced it.
#[derive(Debug, Clone)]
struct PresenceEntry {
    meta: PresenceMeta,
    last_heartbeat: Instant,
    conn_id: Uuid,
}

/// Manages all connected sessions, presence state and event fan-out.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Broadcast channel for gateway events. Every session sees every event
    /// and keeps the ones for topics it subscribed to.
    broadcast_tx: broadcast::Sender<Broadcast>,

    /// Presence: chat_id -> (user_id -> entry)
    presence: RwLock<HashMap<String, HashMap<String, PresenceEntry>>>,

    access: Arc<dyn ChatAccess>,
}

impl Dispatcher {
    pub fn new(access: Arc<dyn ChatAccess>) -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                presence: RwLock::new(HashMap::new()),
                access,
            }),
        }
    }

    /// Subscribe to gateway events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<Broadcast> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Broadcast a server-originated event (e.g. a message insert).
    pub fn publish(&self, event: GatewayEvent) {
        self.send(None, event);
    }

    /// Broadcast an event produced by a specific connection.
    pub fn publish_from(&self, origin: Uuid, event: GatewayEvent) {
        self.send(Some(origin), event);
    }

    fn send(&self, origin: Option<Uuid>, event: GatewayEvent) {
        let topic = event.topic();
        // No receivers is fine: nobody is listening right now.
        let _ = self.inner.broadcast_tx.send(Broadcast { topic, origin, event });
    }

    /// Whether `user_id` may see events of `chat_id`. Collaborator failures deny.
    pub async fn authorize(&self, chat_id: &str, user_id: &str) -> bool {
        match self.inner.access.is_participant(chat_id, user_id).await {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!("Access check for {} in {} failed: {}", user_id, chat_id, e);
                false
            }
        }
    }

    /// Record a presence announcement. Every announcement doubles as a
    /// heartbeat and is re-broadcast as a join so peers refresh their timers.
    pub async fn presence_track(
        &self,
        chat_id: &str,
        user_id: &str,
        display_name: Option<String>,
        conn_id: Uuid,
    ) {
        let meta = {
            let mut presence = self.inner.presence.write().await;
            let chat = presence.entry(chat_id.to_string()).or_default();
            let entry = chat.entry(user_id.to_string()).or_insert_with(|| PresenceEntry {
                meta: PresenceMeta {
                    display_name: display_name.clone(),
                    online_at: chrono::Utc::now(),
                },
                last_heartbeat: Instant::now(),
                conn_id,
            });
            entry.meta.display_name = display_name;
            entry.last_heartbeat = Instant::now();
            entry.conn_id = conn_id;
            entry.meta.clone()
        };

        self.publish(GatewayEvent::PresenceJoin {
            chat_id: chat_id.to_string(),
            user_id: user_id.to_string(),
            meta,
        });
    }

    /// Withdraw presence, but only if `conn_id` still owns the entry.
    pub async fn presence_untrack(&self, chat_id: &str, user_id: &str, conn_id: Uuid) {
        let removed = {
            let mut presence = self.inner.presence.write().await;
            let Some(chat) = presence.get_mut(chat_id) else {
                return;
            };
            let owned = chat.get(user_id).is_some_and(|e| e.conn_id == conn_id);
            if owned {
                chat.remove(user_id);
            }
            if chat.is_empty() {
                presence.remove(chat_id);
            }
            owned
        };

        if removed {
            self.publish(GatewayEvent::PresenceLeave {
                chat_id: chat_id.to_string(),
                user_id: user_id.to_string(),
            });
        }
    }

    /// Remove every presence entry owned by a closed connection.
    pub async fn presence_drop_connection(&self, conn_id: Uuid) {
        let left = {
            let mut presence = self.inner.presence.write().await;
            let mut left = Vec::new();
            for (chat_id, users) in presence.iter_mut() {
                users.retain(|user_id, entry| {
                    let keep = entry.conn_id != conn_id;
                    if !keep {
                        left.push((chat_id.clone(), user_id.clone()));
                    }
                    keep
                });
            }
            presence.retain(|_, users| !users.is_empty());
            left
        };

        for (chat_id, user_id) in left {
            self.publish(GatewayEvent::PresenceLeave { chat_id, user_id });
        }
    }

    /// Everyone currently present in a chat.
    pub async fn presence_snapshot(&self, chat_id: &str) -> HashMap<String, PresenceMeta> {
        self.inner
            .presence
            .read()
            .await
            .get(chat_id)
            .map(|users| {
                users
                    .iter()
                    .map(|(id, entry)| (id.clone(), entry.meta.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop entries whose last heartbeat is older than `timeout` and announce
    /// their departure. Returns the number of entries expired.
    pub async fn sweep_presence(&self, timeout: Duration) -> usize {
        let now = Instant::now();
        let expired = {
            let mut presence = self.inner.presence.write().await;
            let mut expired = Vec::new();
            for (chat_id, users) in presence.iter_mut() {
                users.retain(|user_id, entry| {
                    let alive = now.duration_since(entry.last_heartbeat) < timeout;
                    if !alive {
                        expired.push((chat_id.clone(), user_id.clone()));
                    }
                    alive
                });
            }
            presence.retain(|_, users| !users.is_empty());
            expired
        };

        let count = expired.len();
        for (chat_id, user_id) in expired {
            debug!("Presence of {} in {} timed out", user_id, chat_id);
            self.publish(GatewayEvent::PresenceLeave { chat_id, user_id });
        }
        count
    }
}

/// Background task that expires presence entries whose heartbeats stopped
/// without an explicit leave (crashed or suspended clients).
pub async fn run_presence_sweeper(dispatcher: Dispatcher, interval: Duration, timeout: Duration) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        ticker.tick().await;

        let count = dispatcher.sweep_presence(timeout).await;
        if count > 0 {
            info!("Presence sweep: expired {} stale entries", count);
        }
    }
}
