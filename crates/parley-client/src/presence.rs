use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use parley_types::events::{GatewayCommand, GatewayEvent, PresenceMeta, Topic};
use parley_types::models::PresenceRecord;

use crate::channel::{ChannelTask, ConnectionState, TopicHandler};
use crate::config::ClientConfig;
use crate::transport::Transport;

/// Online set of one chat, rebuilt from sync snapshots and join/leave
/// deltas. Users whose heartbeat is older than `timeout` count as offline
/// whether or not a leave arrived.
#[derive(Debug)]
pub struct PresenceTracker {
    timeout: chrono::Duration,
    online: HashMap<String, PresenceRecord>,
    last_seen: HashMap<String, DateTime<Utc>>,
}

impl PresenceTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout: chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::seconds(60)),
            online: HashMap::new(),
            last_seen: HashMap::new(),
        }
    }

    /// Replace the online set with an authoritative snapshot.
    pub fn apply_sync(&mut self, users: HashMap<String, PresenceMeta>, now: DateTime<Utc>) {
        let gone: Vec<String> = self
            .online
            .keys()
            .filter(|id| !users.contains_key(*id))
            .cloned()
            .collect();
        for user_id in gone {
            self.online.remove(&user_id);
            self.last_seen.insert(user_id, now);
        }

        for (user_id, meta) in users {
            self.apply_join(user_id, meta, now);
        }
    }

    /// A join or heartbeat.
    pub fn apply_join(&mut self, user_id: String, meta: PresenceMeta, now: DateTime<Utc>) {
        self.online.insert(
            user_id.clone(),
            PresenceRecord {
                user_id,
                last_heartbeat: now,
                display_name: meta.display_name,
            },
        );
    }

    pub fn apply_leave(&mut self, user_id: &str, now: DateTime<Utc>) {
        if self.online.remove(user_id).is_some() {
            self.last_seen.insert(user_id.to_string(), now);
        }
    }

    /// Move users whose heartbeat stopped offline. Their last heartbeat
    /// becomes their last-seen time.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let stale: Vec<String> = self
            .online
            .values()
            .filter(|r| now - r.last_heartbeat >= self.timeout)
            .map(|r| r.user_id.clone())
            .collect();

        for user_id in &stale {
            if let Some(record) = self.online.remove(user_id) {
                debug!("{} timed out", user_id);
                self.last_seen.insert(user_id.clone(), record.last_heartbeat);
            }
        }
        stale
    }

    pub fn is_online(&self, user_id: &str, now: DateTime<Utc>) -> bool {
        self.online
            .get(user_id)
            .is_some_and(|r| now - r.last_heartbeat < self.timeout)
    }

    /// Best-effort time the user was last known to be present. `None` while
    /// online or if never seen.
    pub fn last_seen(&self, user_id: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.online.get(user_id) {
            Some(record) if now - record.last_heartbeat < self.timeout => None,
            Some(record) => Some(record.last_heartbeat),
            None => self.last_seen.get(user_id).copied(),
        }
    }

    /// Online users ordered by id.
    pub fn online(&self, now: DateTime<Utc>) -> Vec<PresenceRecord> {
        let mut users: Vec<PresenceRecord> = self
            .online
            .values()
            .filter(|r| now - r.last_heartbeat < self.timeout)
            .cloned()
            .collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }
}

type SharedTracker = Arc<Mutex<PresenceTracker>>;

fn lock(tracker: &SharedTracker) -> std::sync::MutexGuard<'_, PresenceTracker> {
    tracker.lock().unwrap_or_else(|e| e.into_inner())
}

struct PresenceHandler {
    chat_id: String,
    display_name: Option<String>,
    heartbeat: Duration,
    tracker: SharedTracker,
}

impl PresenceHandler {
    fn track(&self, commands: &mpsc::UnboundedSender<GatewayCommand>) {
        let _ = commands.send(GatewayCommand::PresenceTrack {
            chat_id: self.chat_id.clone(),
            display_name: self.display_name.clone(),
        });
    }
}

impl TopicHandler for PresenceHandler {
    fn topic(&self) -> Topic {
        Topic::presence(&self.chat_id)
    }

    fn on_subscribed(&mut self, commands: &mpsc::UnboundedSender<GatewayCommand>) {
        self.track(commands);
    }

    fn on_event(&mut self, event: GatewayEvent) {
        let now = Utc::now();
        let mut tracker = lock(&self.tracker);
        match event {
            GatewayEvent::PresenceSync { users, .. } => tracker.apply_sync(users, now),
            GatewayEvent::PresenceJoin { user_id, meta, .. } => tracker.apply_join(user_id, meta, now),
            GatewayEvent::PresenceLeave { user_id, .. } => tracker.apply_leave(&user_id, now),
            _ => {}
        }
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.heartbeat)
    }

    fn on_tick(&mut self, commands: &mpsc::UnboundedSender<GatewayCommand>) {
        self.track(commands);
        lock(&self.tracker).expire(Utc::now());
    }

    fn on_close(&mut self, commands: &mpsc::UnboundedSender<GatewayCommand>) {
        let _ = commands.send(GatewayCommand::PresenceUntrack {
            chat_id: self.chat_id.clone(),
        });
    }
}

/// Presence of everyone in one chat, including this client's own
/// announcement on subscribe and every heartbeat.
pub struct PresenceChannel {
    task: ChannelTask,
    tracker: SharedTracker,
}

impl PresenceChannel {
    pub fn subscribe(
        transport: Arc<dyn Transport>,
        chat_id: impl Into<String>,
        display_name: Option<String>,
        config: &ClientConfig,
    ) -> Self {
        let tracker = Arc::new(Mutex::new(PresenceTracker::new(config.presence_timeout())));
        let handler = PresenceHandler {
            chat_id: chat_id.into(),
            display_name,
            heartbeat: config.heartbeat_interval,
            tracker: tracker.clone(),
        };

        Self {
            task: ChannelTask::spawn(transport, handler, config),
            tracker,
        }
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        lock(&self.tracker).is_online(user_id, Utc::now())
    }

    pub fn last_seen(&self, user_id: &str) -> Option<DateTime<Utc>> {
        lock(&self.tracker).last_seen(user_id, Utc::now())
    }

    pub fn online(&self) -> Vec<PresenceRecord> {
        lock(&self.tracker).online(Utc::now())
    }

    pub fn state(&self) -> ConnectionState {
        self.task.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.task.watch_state()
    }

    /// Withdraw presence, stop the heartbeat and release the link.
    pub async fn unsubscribe(&mut self) {
        self.task.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn meta(name: &str) -> PresenceMeta {
        PresenceMeta {
            display_name: Some(name.into()),
            online_at: at(0),
        }
    }

    fn tracker() -> PresenceTracker {
        PresenceTracker::new(Duration::from_secs(60))
    }

    #[test]
    fn silent_user_goes_offline_with_last_seen() {
        let mut t = tracker();
        t.apply_join("x".into(), meta("X"), at(1_000));
        t.apply_join("x".into(), meta("X"), at(1_030));
        assert!(t.is_online("x", at(1_060)));
        assert_eq!(t.last_seen("x", at(1_060)), None);

        // Heartbeats stop; no leave arrives.
        assert!(!t.is_online("x", at(1_090)));
        assert_eq!(t.expire(at(1_090)), vec!["x".to_string()]);
        assert_eq!(t.last_seen("x", at(1_100)), Some(at(1_030)));
        assert!(t.online(at(1_100)).is_empty());
    }

    #[test]
    fn sync_replaces_online_set() {
        let mut t = tracker();
        t.apply_join("a".into(), meta("A"), at(0));
        t.apply_join("b".into(), meta("B"), at(0));

        let snapshot = HashMap::from([("b".to_string(), meta("B")), ("c".to_string(), meta("C"))]);
        t.apply_sync(snapshot, at(10));

        let ids: Vec<String> = t.online(at(10)).into_iter().map(|r| r.user_id).collect();
        assert_eq!(ids, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(t.last_seen("a", at(10)), Some(at(10)));
    }

    #[test]
    fn leave_records_last_seen() {
        let mut t = tracker();
        t.apply_join("a".into(), meta("A"), at(0));
        t.apply_leave("a", at(5));
        assert!(!t.is_online("a", at(5)));
        assert_eq!(t.last_seen("a", at(6)), Some(at(5)));

        // Coming back clears the offline view.
        t.apply_join("a".into(), meta("A"), at(7));
        assert_eq!(t.last_seen("a", at(8)), None);
    }
}
