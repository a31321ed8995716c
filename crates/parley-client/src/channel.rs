//! Subscription driver shared by the message, presence and typing channels.
//!
//! A channel owns one transport link at a time and walks the connection
//! state machine: connect, subscribe, wait for the acknowledgement within the
//! subscribe timeout, then dispatch events until the link drops. Failures
//! back off with jitter and reconnect; an access denial stops the channel.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_types::events::{GatewayCommand, GatewayEvent, Topic};

use crate::backoff::Backoff;
use crate::config::ClientConfig;
use crate::transport::{Transport, TransportLink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// `attempt` is 0 for the first connection and counts reconnects after.
    Connecting { attempt: u32 },
    Subscribed,
    Errored,
    TimedOut,
}

impl ConnectionState {
    /// Whether the UI should show a "reconnecting" indicator.
    pub fn is_degraded(self) -> bool {
        match self {
            Self::Errored | Self::TimedOut => true,
            Self::Connecting { attempt } => attempt > 0,
            Self::Disconnected | Self::Subscribed => false,
        }
    }
}

/// Topic-specific behaviour run inside the channel task.
pub(crate) trait TopicHandler: Send + 'static {
    fn topic(&self) -> Topic;

    fn echo_self(&self) -> bool {
        false
    }

    /// Called each time the subscription is acknowledged.
    fn on_subscribed(&mut self, _commands: &mpsc::UnboundedSender<GatewayCommand>) {}

    /// Events for this handler's topic.
    fn on_event(&mut self, event: GatewayEvent);

    fn tick_interval(&self) -> Option<Duration> {
        None
    }

    fn on_tick(&mut self, _commands: &mpsc::UnboundedSender<GatewayCommand>) {}

    /// Called when the channel is closed while subscribed.
    fn on_close(&mut self, _commands: &mpsc::UnboundedSender<GatewayCommand>) {}
}

/// Sender of the currently subscribed link, if any.
type Outbox = Arc<Mutex<Option<mpsc::UnboundedSender<GatewayCommand>>>>;

#[derive(Debug, Clone)]
struct ChannelTiming {
    subscribe_timeout: Duration,
    reconnect_base: Duration,
    reconnect_cap: Duration,
}

enum Outcome {
    Cancelled,
    Denied(String),
    TimedOut,
    Failed(String),
    /// The link closed after the subscription had been acknowledged.
    Dropped,
}

/// Handle to a running channel task. Closing is idempotent; dropping the
/// handle cancels the task, which still runs the handler's close hook.
pub(crate) struct ChannelTask {
    state_rx: watch::Receiver<ConnectionState>,
    outbox: Outbox,
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl ChannelTask {
    pub(crate) fn spawn<H: TopicHandler>(
        transport: Arc<dyn Transport>,
        handler: H,
        config: &ClientConfig,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let outbox: Outbox = Arc::new(Mutex::new(None));
        let cancel = CancellationToken::new();
        let timing = ChannelTiming {
            subscribe_timeout: config.subscribe_timeout,
            reconnect_base: config.reconnect_base,
            reconnect_cap: config.reconnect_cap,
        };

        let join = tokio::spawn(run_channel(
            transport,
            handler,
            timing,
            state_tx,
            outbox.clone(),
            cancel.clone(),
        ));

        Self {
            state_rx,
            outbox,
            cancel,
            join: Some(join),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub(crate) fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Send on the current link. False when not subscribed.
    pub(crate) fn send(&self, cmd: GatewayCommand) -> bool {
        let outbox = self.outbox.lock().unwrap_or_else(|e| e.into_inner());
        outbox.as_ref().is_some_and(|tx| tx.send(cmd).is_ok())
    }

    /// Stop the task and wait for it to release its link.
    pub(crate) async fn close(&mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                warn!("Channel task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for ChannelTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_channel<H: TopicHandler>(
    transport: Arc<dyn Transport>,
    mut handler: H,
    timing: ChannelTiming,
    state_tx: watch::Sender<ConnectionState>,
    outbox: Outbox,
    cancel: CancellationToken,
) {
    let topic = handler.topic();
    let mut backoff = Backoff::new(timing.reconnect_base, timing.reconnect_cap);
    let mut attempt = 0;

    loop {
        state_tx.send_replace(ConnectionState::Connecting { attempt });

        let outcome = run_once(&*transport, &mut handler, &timing, &state_tx, &outbox, &cancel).await;
        set_outbox(&outbox, None);

        let failed_state = match outcome {
            Outcome::Cancelled => break,
            Outcome::Denied(reason) => {
                warn!("Subscription to {} denied: {}", topic, reason);
                state_tx.send_replace(ConnectionState::Errored);
                return;
            }
            Outcome::TimedOut => {
                warn!("Subscription to {} timed out", topic);
                ConnectionState::TimedOut
            }
            Outcome::Failed(reason) => {
                warn!("Channel {} failed: {}", topic, reason);
                ConnectionState::Errored
            }
            Outcome::Dropped => {
                info!("Channel {} lost its connection", topic);
                backoff.reset();
                ConnectionState::Errored
            }
        };
        state_tx.send_replace(failed_state);

        let delay = backoff.next_delay();
        debug!("Reconnecting {} in {:?}", topic, delay);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        state_tx.send_replace(ConnectionState::Disconnected);
        attempt += 1;
    }

    state_tx.send_replace(ConnectionState::Disconnected);
    debug!("Channel {} closed", topic);
}

async fn run_once<H: TopicHandler>(
    transport: &dyn Transport,
    handler: &mut H,
    timing: &ChannelTiming,
    state_tx: &watch::Sender<ConnectionState>,
    outbox: &Outbox,
    cancel: &CancellationToken,
) -> Outcome {
    let topic = handler.topic();
    let deadline = Instant::now() + timing.subscribe_timeout;

    let link = tokio::select! {
        _ = cancel.cancelled() => return Outcome::Cancelled,
        _ = tokio::time::sleep_until(deadline) => return Outcome::TimedOut,
        link = transport.connect() => link,
    };
    let TransportLink { commands, mut events } = match link {
        Ok(link) => link,
        Err(e) => return Outcome::Failed(e.to_string()),
    };

    let subscribe = GatewayCommand::Subscribe {
        topic: topic.clone(),
        echo_self: handler.echo_self(),
    };
    if commands.send(subscribe).is_err() {
        return Outcome::Failed("link closed before subscribing".into());
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Outcome::Cancelled,
            _ = tokio::time::sleep_until(deadline) => return Outcome::TimedOut,
            event = events.recv() => match event {
                None => return Outcome::Failed("link closed before acknowledgement".into()),
                Some(GatewayEvent::Subscribed { topic: t }) if t == topic => break,
                Some(GatewayEvent::SubscribeDenied { topic: t, reason }) if t == topic => {
                    return Outcome::Denied(reason);
                }
                Some(_) => {}
            },
        }
    }

    debug!("Subscribed to {}", topic);
    state_tx.send_replace(ConnectionState::Subscribed);
    set_outbox(outbox, Some(commands.clone()));
    handler.on_subscribed(&commands);

    let mut ticker = handler.tick_interval().map(|period| {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                handler.on_close(&commands);
                return Outcome::Cancelled;
            }
            _ = tick(&mut ticker) => handler.on_tick(&commands),
            event = events.recv() => match event {
                None => return Outcome::Dropped,
                Some(event) if event.topic().as_ref() == Some(&topic) => handler.on_event(event),
                Some(_) => {}
            },
        }
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn set_outbox(outbox: &Outbox, tx: Option<mpsc::UnboundedSender<GatewayCommand>>) {
    *outbox.lock().unwrap_or_else(|e| e.into_inner()) = tx;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;
    use parley_types::models::{Message, MessageKind};

    use crate::error::ClientError;

    type HeldEnds = (
        mpsc::UnboundedReceiver<GatewayCommand>,
        mpsc::UnboundedSender<GatewayEvent>,
    );

    /// Each connect replays the next script into the link. A script marked
    /// `close` ends the link once replayed; otherwise it stays open and quiet.
    #[derive(Default)]
    struct ScriptedTransport {
        scripts: Mutex<VecDeque<(Vec<GatewayEvent>, bool)>>,
        /// Ends kept alive so open links neither fail sends nor close.
        held: Mutex<Vec<HeldEnds>>,
        connects: AtomicUsize,
    }

    impl ScriptedTransport {
        fn push(&self, events: Vec<GatewayEvent>, close: bool) {
            self.scripts.lock().unwrap().push_back((events, close));
        }

        fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn connect(&self) -> Result<TransportLink, ClientError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let (events, close) = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
            let (command_tx, command_rx) = mpsc::unbounded_channel();
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            for event in events {
                event_tx.send(event).unwrap();
            }
            if close {
                self.held.lock().unwrap().push((command_rx, mpsc::unbounded_channel().0));
                drop(event_tx);
            } else {
                self.held.lock().unwrap().push((command_rx, event_tx));
            }
            Ok(TransportLink {
                commands: command_tx,
                events: event_rx,
            })
        }
    }

    struct Recorder(mpsc::UnboundedSender<GatewayEvent>);

    impl TopicHandler for Recorder {
        fn topic(&self) -> Topic {
            Topic::messages("chat-1")
        }

        fn on_event(&mut self, event: GatewayEvent) {
            let _ = self.0.send(event);
        }
    }

    fn config() -> ClientConfig {
        ClientConfig {
            subscribe_timeout: Duration::from_secs(10),
            reconnect_base: Duration::from_secs(1),
            reconnect_cap: Duration::from_secs(4),
            ..ClientConfig::default()
        }
    }

    fn acked() -> GatewayEvent {
        GatewayEvent::Subscribed {
            topic: Topic::messages("chat-1"),
        }
    }

    fn insert(id: &str) -> GatewayEvent {
        GatewayEvent::MessageInsert {
            message: Message {
                id: id.into(),
                chat_id: "chat-1".into(),
                sender_id: "bob".into(),
                kind: MessageKind::Text,
                content: Some(id.into()),
                media_url: None,
                price: None,
                unlocked_by: vec![],
                read_at: None,
                created_at: Utc::now(),
            },
        }
    }

    fn inserted_id(event: Option<GatewayEvent>) -> String {
        match event {
            Some(GatewayEvent::MessageInsert { message }) => message.id,
            other => panic!("expected an insert, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ack_times_out_and_reconnects() {
        let transport = Arc::new(ScriptedTransport::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let started = Instant::now();
        let mut task = ChannelTask::spawn(transport.clone(), Recorder(tx), &config());
        let mut state = task.watch_state();

        state.wait_for(|s| *s == ConnectionState::TimedOut).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(task.state().is_degraded());
        assert_eq!(transport.connects(), 1);

        state
            .wait_for(|s| *s == ConnectionState::Connecting { attempt: 1 })
            .await
            .unwrap();
        // Backoff waited at least half the base delay before the retry.
        assert!(started.elapsed() >= Duration::from_millis(10_500));
        assert_eq!(transport.connects(), 2);

        state.wait_for(|s| *s == ConnectionState::TimedOut).await.unwrap();
        state
            .wait_for(|s| *s == ConnectionState::Connecting { attempt: 2 })
            .await
            .unwrap();
        assert_eq!(transport.connects(), 3);

        task.close().await;
        assert_eq!(task.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_link_resubscribes() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(vec![acked(), insert("m1")], true);
        transport.push(vec![acked(), insert("m2")], false);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut task = ChannelTask::spawn(transport.clone(), Recorder(tx), &config());
        let mut state = task.watch_state();

        assert_eq!(inserted_id(rx.recv().await), "m1");
        state.wait_for(|s| *s == ConnectionState::Errored).await.unwrap();
        assert!(!task.send(GatewayCommand::Unsubscribe {
            topic: Topic::messages("chat-1"),
        }));

        state.wait_for(|s| *s == ConnectionState::Subscribed).await.unwrap();
        assert_eq!(inserted_id(rx.recv().await), "m2");
        assert_eq!(transport.connects(), 2);
        assert!(task.send(GatewayCommand::Unsubscribe {
            topic: Topic::messages("chat-1"),
        }));

        task.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn link_closed_before_ack_is_an_error() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(Vec::new(), true);
        transport.push(vec![acked()], false);

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut task = ChannelTask::spawn(transport.clone(), Recorder(tx), &config());
        let mut state = task.watch_state();

        state.wait_for(|s| *s == ConnectionState::Errored).await.unwrap();
        state.wait_for(|s| *s == ConnectionState::Subscribed).await.unwrap();
        assert_eq!(transport.connects(), 2);

        task.close().await;
    }

    #[test]
    fn degraded_states() {
        assert!(!ConnectionState::Connecting { attempt: 0 }.is_degraded());
        assert!(ConnectionState::Connecting { attempt: 2 }.is_degraded());
        assert!(ConnectionState::TimedOut.is_degraded());
        assert!(ConnectionState::Errored.is_degraded());
        assert!(!ConnectionState::Subscribed.is_degraded());
    }
}
