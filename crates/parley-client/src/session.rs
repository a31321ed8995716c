//! One open conversation: the timeline a chat view renders, fed by the local
//! cache, the server and the realtime channels.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use parley_types::api::{MessageQuery, SendMessageRequest};
use parley_types::models::{Message, MessageDraft, PresenceRecord};

use crate::cache::MessageCache;
use crate::channel::ConnectionState;
use crate::config::ClientConfig;
use crate::error::{CacheError, ClientError};
use crate::presence::PresenceChannel;
use crate::realtime::MessageChannel;
use crate::remote::RemoteStore;
use crate::timeline::{Merge, Timeline};
use crate::transport::Transport;
use crate::typing::TypingChannel;

/// Something the view should re-render for.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    /// A realtime message was added to or changed in the timeline.
    Message { id: String, merge: Merge },
    /// The message channel changed state. `caught_up` counts messages
    /// fetched after a (re)subscription.
    Connection {
        state: ConnectionState,
        caught_up: usize,
    },
}

pub struct ChatSession {
    chat_id: String,
    me: String,
    cache: Arc<MessageCache>,
    remote: Arc<dyn RemoteStore>,
    page_size: u32,
    timeline: Timeline,
    messages: MessageChannel,
    presence: PresenceChannel,
    typing: TypingChannel,
    state_rx: watch::Receiver<ConnectionState>,
    balance: Option<i64>,
}

impl ChatSession {
    /// Render from cache first, then reconcile with the server and go live.
    /// An unreachable server leaves the cached view in place; a refusal is
    /// returned to the caller.
    pub async fn open(
        chat_id: impl Into<String>,
        me: impl Into<String>,
        display_name: Option<String>,
        cache: Arc<MessageCache>,
        remote: Arc<dyn RemoteStore>,
        transport: Arc<dyn Transport>,
        config: &ClientConfig,
    ) -> Result<Self, ClientError> {
        let chat_id = chat_id.into();
        let me = me.into();
        let mut timeline = Timeline::new(chat_id.clone(), me.clone());

        let cached = cached_page(&cache, &chat_id, config.page_size, None).await;
        let from_cache = timeline.merge(cached);

        match remote
            .fetch(&chat_id, &MessageQuery::before(None, config.page_size))
            .await
        {
            Ok(latest) => {
                remember(&cache, &chat_id, &latest).await;
                timeline.merge(latest);
            }
            Err(e) if e.is_transient() => {
                warn!("Showing cached history of {}, server unreachable: {}", chat_id, e);
            }
            Err(e) => return Err(e),
        }

        let messages = MessageChannel::subscribe(transport.clone(), chat_id.clone(), config);
        let presence =
            PresenceChannel::subscribe(transport.clone(), chat_id.clone(), display_name, config);
        let typing = TypingChannel::subscribe(transport, chat_id.clone(), me.clone(), config);
        let state_rx = messages.watch_state();

        info!(
            "Opened {} with {} messages ({} from cache)",
            chat_id,
            timeline.len(),
            from_cache
        );

        Ok(Self {
            chat_id,
            me,
            cache,
            remote,
            page_size: config.page_size,
            timeline,
            messages,
            presence,
            typing,
            state_rx,
            balance: None,
        })
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    /// Wallet balance reported by the last send or unlock.
    pub fn balance(&self) -> Option<i64> {
        self.balance
    }

    /// Wait for the next change worth rendering. `None` once the session is
    /// closed.
    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        loop {
            tokio::select! {
                message = self.messages.recv() => {
                    let message = message?;
                    // Own sends are already rendered from the send response.
                    if message.sender_id == self.me {
                        debug!("Skipping own echo {} in {}", message.id, self.chat_id);
                        continue;
                    }
                    let id = message.id.clone();
                    remember(&self.cache, &self.chat_id, std::slice::from_ref(&message)).await;
                    let merge = self.timeline.merge_one(message);
                    if merge != Merge::Duplicate {
                        return Some(SessionUpdate::Message { id, merge });
                    }
                }

                changed = self.state_rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                    // Every (re)subscription may follow a gap, including the
                    // one between the initial fetch and the first ack.
                    let state = *self.state_rx.borrow_and_update();
                    let caught_up = if state == ConnectionState::Subscribed {
                        self.catch_up().await
                    } else {
                        0
                    };
                    return Some(SessionUpdate::Connection { state, caught_up });
                }
            }
        }
    }

    /// Fetch whatever arrived while the channel was down.
    async fn catch_up(&mut self) -> usize {
        let after = self.timeline.newest_confirmed().map(|m| m.created_at);
        match self
            .remote
            .fetch(&self.chat_id, &MessageQuery::after(after, self.page_size))
            .await
        {
            Ok(missed) => {
                remember(&self.cache, &self.chat_id, &missed).await;
                let inserted = self.timeline.merge(missed);
                debug!("Caught up {} messages in {}", inserted, self.chat_id);
                inserted
            }
            Err(e) => {
                warn!("Catch-up fetch for {} failed: {}", self.chat_id, e);
                0
            }
        }
    }

    /// Render the draft immediately and send it. On failure the entry stays
    /// in the timeline as failed with a user-facing reason; there is no
    /// automatic retry.
    pub async fn send(&mut self, draft: MessageDraft) -> Result<Message, ClientError> {
        let provisional = self.timeline.begin_send(draft.clone());
        self.deliver(provisional, draft).await
    }

    /// Resend a failed entry.
    pub async fn retry(&mut self, provisional_id: &str) -> Result<Message, ClientError> {
        let draft = self
            .timeline
            .mark_sending(provisional_id)
            .ok_or_else(|| ClientError::Invalid("nothing to retry".into()))?;
        self.deliver(provisional_id.to_string(), draft).await
    }

    async fn deliver(
        &mut self,
        provisional: String,
        draft: MessageDraft,
    ) -> Result<Message, ClientError> {
        let request = SendMessageRequest {
            draft,
            client_id: Some(provisional.clone()),
        };

        match self.remote.send(&self.chat_id, request).await {
            Ok(resp) => {
                self.balance = Some(resp.balance);
                remember(&self.cache, &self.chat_id, std::slice::from_ref(&resp.message)).await;
                self.timeline.confirm(&provisional, resp.message.clone());
                Ok(resp.message)
            }
            Err(e) => {
                if let ClientError::InsufficientBalance { balance, .. } = &e {
                    self.balance = Some(*balance);
                }
                let reason = match e.retry_hint(Utc::now()) {
                    Some(hint) => format!("{}, {}", e, hint),
                    None => e.to_string(),
                };
                self.timeline.fail(&provisional, reason);
                Err(e)
            }
        }
    }

    pub fn discard(&mut self, provisional_id: &str) -> bool {
        self.timeline.discard(provisional_id)
    }

    /// Pay for a paid-media message and refresh it in place.
    pub async fn unlock(&mut self, message_id: &str) -> Result<Message, ClientError> {
        let resp = self.remote.unlock(&self.chat_id, message_id).await?;
        self.balance = Some(resp.balance);
        remember(&self.cache, &self.chat_id, std::slice::from_ref(&resp.message)).await;
        self.timeline.merge_one(resp.message.clone());
        Ok(resp.message)
    }

    /// Mark the chat read on the server without waiting for the result.
    pub fn mark_read(&self) {
        let remote = self.remote.clone();
        let chat_id = self.chat_id.clone();
        tokio::spawn(async move {
            if let Err(e) = remote.mark_read(&chat_id).await {
                warn!("Failed to mark {} read: {}", chat_id, e);
            }
        });
    }

    /// Extend the timeline backwards, from the cache when it has the page and
    /// from the server otherwise. Returns how many messages were added.
    pub async fn load_older(&mut self) -> Result<usize, ClientError> {
        let before = self.timeline.oldest_confirmed().map(|m| m.created_at);

        let cached = cached_page(&self.cache, &self.chat_id, self.page_size, before).await;
        if cached.len() as u32 >= self.page_size {
            return Ok(self.timeline.merge(cached));
        }

        let older = self
            .remote
            .fetch(&self.chat_id, &MessageQuery::before(before, self.page_size))
            .await?;
        remember(&self.cache, &self.chat_id, &older).await;
        Ok(self.timeline.merge(cached) + self.timeline.merge(older))
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.presence.is_online(user_id)
    }

    pub fn last_seen(&self, user_id: &str) -> Option<DateTime<Utc>> {
        self.presence.last_seen(user_id)
    }

    pub fn online_users(&self) -> Vec<PresenceRecord> {
        self.presence.online()
    }

    pub fn typing_users(&self) -> Vec<String> {
        self.typing.typing_users()
    }

    /// Call on every keystroke; the channel debounces.
    pub fn notify_typing(&self, user_name: &str) -> bool {
        self.typing.send_typing(user_name)
    }

    pub fn finished_typing(&self) {
        self.typing.finished_typing();
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.messages.state()
    }

    /// Drives the "reconnecting" indicator.
    pub fn is_degraded(&self) -> bool {
        self.messages.state().is_degraded()
    }

    /// Leave the chat: every channel is unsubscribed and presence withdrawn.
    pub async fn close(mut self) {
        self.messages.unsubscribe().await;
        self.presence.unsubscribe().await;
        self.typing.unsubscribe().await;
        debug!("Closed {}", self.chat_id);
    }
}

async fn cached_page(
    cache: &Arc<MessageCache>,
    chat_id: &str,
    limit: u32,
    before: Option<DateTime<Utc>>,
) -> Vec<Message> {
    let chat_id = chat_id.to_string();
    cache
        .blocking(move |c| c.get(&chat_id, limit, before))
        .await
        .unwrap_or_else(|e| {
            log_cache_error(&e);
            Vec::new()
        })
}

async fn remember(cache: &Arc<MessageCache>, chat_id: &str, messages: &[Message]) {
    let chat_id = chat_id.to_string();
    let messages = messages.to_vec();
    if let Err(e) = cache.blocking(move |c| c.put(&chat_id, &messages)).await {
        log_cache_error(&e);
    }
}

fn log_cache_error(e: &CacheError) {
    match e {
        CacheError::Disabled => {}
        e => warn!("Local cache error: {}", e),
    }
}
