use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use parley_types::events::{GatewayCommand, GatewayEvent, Topic};
use parley_types::models::TypingSignal;

use crate::channel::{ChannelTask, ConnectionState, TopicHandler};
use crate::config::ClientConfig;
use crate::transport::Transport;

/// Who is typing right now. Entries are stamped on arrival and expire after
/// the liveness window; there is no stop signal.
#[derive(Debug)]
pub struct TypingTracker {
    me: String,
    window: Duration,
    entries: HashMap<String, (TypingSignal, Instant)>,
}

impl TypingTracker {
    pub fn new(me: impl Into<String>, window: Duration) -> Self {
        Self {
            me: me.into(),
            window,
            entries: HashMap::new(),
        }
    }

    pub fn record(&mut self, signal: TypingSignal, now: Instant) {
        if signal.user_id == self.me {
            return;
        }
        self.entries.insert(signal.user_id.clone(), (signal, now));
    }

    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.entries
            .retain(|_, (_, arrived)| now.saturating_duration_since(*arrived) < window);
    }

    /// Display names of users typing at `now`, sorted. Expired entries and
    /// the local user are excluded even if no prune has run.
    pub fn typing_users(&self, now: Instant) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .values()
            .filter(|(signal, arrived)| {
                signal.user_id != self.me && now.saturating_duration_since(*arrived) < self.window
            })
            .map(|(signal, _)| signal.user_name.clone())
            .collect();
        names.sort();
        names
    }
}

/// Lets one typing signal through per window while the user keeps typing.
#[derive(Debug)]
pub struct TypingDebouncer {
    window: Duration,
    last_sent: Option<Instant>,
}

impl TypingDebouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_sent: None,
        }
    }

    pub fn should_send(&mut self, now: Instant) -> bool {
        match self.last_sent {
            Some(last) if now.saturating_duration_since(last) < self.window => false,
            _ => {
                self.last_sent = Some(now);
                true
            }
        }
    }

    /// Start a fresh burst, e.g. after the message was sent.
    pub fn reset(&mut self) {
        self.last_sent = None;
    }
}

type SharedTracker = Arc<Mutex<TypingTracker>>;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

struct TypingHandler {
    chat_id: String,
    prune_tick: Duration,
    tracker: SharedTracker,
}

impl TopicHandler for TypingHandler {
    fn topic(&self) -> Topic {
        Topic::typing(&self.chat_id)
    }

    fn on_event(&mut self, event: GatewayEvent) {
        if let GatewayEvent::Typing {
            user_id,
            user_name,
            timestamp,
            ..
        } = event
        {
            let signal = TypingSignal {
                user_id,
                user_name,
                timestamp,
            };
            lock(&self.tracker).record(signal, Instant::now());
        }
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.prune_tick)
    }

    fn on_tick(&mut self, _commands: &tokio::sync::mpsc::UnboundedSender<GatewayCommand>) {
        lock(&self.tracker).prune(Instant::now());
    }
}

/// Typing indicators of one chat. Subscribed without self-echo; the tracker
/// filters the local user as well.
pub struct TypingChannel {
    chat_id: String,
    task: ChannelTask,
    tracker: SharedTracker,
    debouncer: Mutex<TypingDebouncer>,
}

impl TypingChannel {
    pub fn subscribe(
        transport: Arc<dyn Transport>,
        chat_id: impl Into<String>,
        me: impl Into<String>,
        config: &ClientConfig,
    ) -> Self {
        let chat_id = chat_id.into();
        let tracker = Arc::new(Mutex::new(TypingTracker::new(me, config.typing_window)));
        let handler = TypingHandler {
            chat_id: chat_id.clone(),
            prune_tick: config.typing_prune_tick,
            tracker: tracker.clone(),
        };

        Self {
            task: ChannelTask::spawn(transport, handler, config),
            chat_id,
            tracker,
            debouncer: Mutex::new(TypingDebouncer::new(config.typing_window)),
        }
    }

    /// Announce that the local user is typing. Returns false when the call
    /// was debounced or the channel is not connected.
    pub fn send_typing(&self, user_name: &str) -> bool {
        if self.task.state() != ConnectionState::Subscribed {
            return false;
        }
        if !lock(&self.debouncer).should_send(Instant::now()) {
            return false;
        }
        self.task.send(GatewayCommand::Typing {
            chat_id: self.chat_id.clone(),
            user_name: user_name.to_string(),
        })
    }

    pub fn finished_typing(&self) {
        lock(&self.debouncer).reset();
    }

    pub fn typing_users(&self) -> Vec<String> {
        lock(&self.tracker).typing_users(Instant::now())
    }

    /// Arrival of the most recent signal per user, for callers that render
    /// their own timestamps.
    pub fn signals(&self) -> Vec<TypingSignal> {
        let tracker = lock(&self.tracker);
        let now = Instant::now();
        let mut signals: Vec<TypingSignal> = tracker
            .entries
            .values()
            .filter(|(_, arrived)| now.saturating_duration_since(*arrived) < tracker.window)
            .map(|(signal, _)| signal.clone())
            .collect();
        signals.sort_by_key(|s| s.timestamp);
        signals
    }

    pub fn state(&self) -> ConnectionState {
        self.task.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.task.watch_state()
    }

    pub async fn unsubscribe(&mut self) {
        self.task.close().await;
    }
}
