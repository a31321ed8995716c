//! Background sync: keeps the local cache close to the server while the app
//! is in the foreground, and runs cache maintenance on a slow cadence.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_types::api::MessageQuery;
use parley_types::models::Message;
use parley_types::time;

use crate::backoff::Backoff;
use crate::cache::MessageCache;
use crate::config::ClientConfig;
use crate::error::{CacheError, CacheResult, ClientError};
use crate::remote::RemoteStore;

const MAINTENANCE_FLAG: &str = "maintenance_last_run";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Foreground,
    Background,
}

/// Outcome of the most recent sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Passes completed since the scheduler started.
    pub pass: u64,
    pub synced: usize,
    pub failed: usize,
    pub fetched: usize,
}

/// Control surface of a running scheduler. Dropping it stops the task.
pub struct SchedulerHandle {
    visibility: watch::Sender<Visibility>,
    trigger: Arc<Notify>,
    reports: watch::Receiver<SyncReport>,
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn set_visibility(&self, visibility: Visibility) {
        self.visibility.send_replace(visibility);
    }

    /// Run a pass as soon as the task is free, regardless of visibility.
    pub fn sync_now(&self) {
        self.trigger.notify_one();
    }

    pub fn reports(&self) -> watch::Receiver<SyncReport> {
        self.reports.clone()
    }

    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct SyncScheduler {
    cache: Arc<MessageCache>,
    remote: Arc<dyn RemoteStore>,
    config: ClientConfig,
    reports: watch::Sender<SyncReport>,
    passes: u64,
}

impl SyncScheduler {
    fn new(
        cache: Arc<MessageCache>,
        remote: Arc<dyn RemoteStore>,
        config: ClientConfig,
    ) -> (Self, watch::Receiver<SyncReport>) {
        let (reports, reports_rx) = watch::channel(SyncReport::default());
        let scheduler = Self {
            cache,
            remote,
            config,
            reports,
            passes: 0,
        };
        (scheduler, reports_rx)
    }

    pub fn spawn(
        cache: Arc<MessageCache>,
        remote: Arc<dyn RemoteStore>,
        config: ClientConfig,
        initial: Visibility,
    ) -> SchedulerHandle {
        let (scheduler, reports) = Self::new(cache, remote, config);
        let (visibility, visibility_rx) = watch::channel(initial);
        let trigger = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        let join = tokio::spawn(scheduler.run(visibility_rx, trigger.clone(), cancel.clone()));

        SchedulerHandle {
            visibility,
            trigger,
            reports,
            cancel,
            join: Some(join),
        }
    }

    async fn run(
        mut self,
        mut visibility_rx: watch::Receiver<Visibility>,
        trigger: Arc<Notify>,
        cancel: CancellationToken,
    ) {
        let mut ticker = None;
        let initial = *visibility_rx.borrow_and_update();
        self.apply_visibility(initial, &mut ticker);
        self.maintain_if_due(Utc::now()).await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                changed = visibility_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let visibility = *visibility_rx.borrow_and_update();
                    self.apply_visibility(visibility, &mut ticker);
                    continue;
                }

                _ = next_tick(&mut ticker) => {}

                _ = trigger.notified() => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.run_pass() => {}
            }
        }

        debug!("Sync scheduler stopped after {} passes", self.passes);
    }

    /// Foreground keeps exactly one timer alive; background drops it. A new
    /// timer fires immediately, so resuming syncs right away.
    fn apply_visibility(&self, visibility: Visibility, ticker: &mut Option<Interval>) {
        match visibility {
            Visibility::Foreground if ticker.is_none() => {
                debug!("Foregrounded, syncing every {:?}", self.config.sync_interval);
                let mut interval = tokio::time::interval(self.config.sync_interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                *ticker = Some(interval);
            }
            Visibility::Foreground => {}
            Visibility::Background => {
                if ticker.take().is_some() {
                    debug!("Backgrounded, sync paused");
                }
            }
        }
    }

    /// One pass over every chat the cache knows about.
    async fn run_pass(&mut self) -> SyncReport {
        self.maintain_if_due(Utc::now()).await;

        let mut report = SyncReport::default();
        let chats = match self.cache.blocking(|c| c.known_chats()).await {
            Ok(chats) => chats,
            Err(CacheError::Disabled) => Vec::new(),
            Err(e) => {
                warn!("Sync pass skipped, cannot list cached chats: {}", e);
                Vec::new()
            }
        };

        for chat_id in &chats {
            match self.sync_chat(chat_id).await {
                Ok(fetched) => {
                    report.synced += 1;
                    report.fetched += fetched;
                }
                Err(e) => {
                    warn!("Sync of {} failed: {}", chat_id, e);
                    report.failed += 1;
                }
            }
        }

        self.passes += 1;
        report.pass = self.passes;
        if report.fetched > 0 || report.failed > 0 {
            info!(
                "Sync pass {}: {} chats, {} new messages, {} failed",
                report.pass, report.synced, report.fetched, report.failed
            );
        }
        self.reports.send_replace(report.clone());
        report
    }

    /// Page forward from the chat's cursor until the server runs out.
    async fn sync_chat(&self, chat_id: &str) -> Result<usize, ClientError> {
        let owned = chat_id.to_string();
        let mut cursor = self.cache.blocking(move |c| c.sync_cursor(&owned)).await?;
        let mut fetched = 0;

        loop {
            let query = MessageQuery::after(cursor, self.config.page_size);
            let page = self.fetch_with_retry(chat_id, &query).await?;
            fetched += page.len();

            let exhausted = page.len() < query.clamped_limit() as usize;
            if let Some(newest) = page.iter().map(|m| m.created_at).max() {
                let owned = chat_id.to_string();
                self.cache
                    .blocking(move |c| {
                        c.put(&owned, &page)?;
                        c.advance_sync_cursor(&owned, newest)
                    })
                    .await?;
                cursor = Some(newest);
            }

            if exhausted {
                return Ok(fetched);
            }
        }
    }

    async fn fetch_with_retry(
        &self,
        chat_id: &str,
        query: &MessageQuery,
    ) -> Result<Vec<Message>, ClientError> {
        let mut backoff = Backoff::new(self.config.reconnect_base, self.config.reconnect_cap);
        loop {
            match self.remote.fetch(chat_id, query).await {
                Ok(page) => return Ok(page),
                Err(e) if e.is_transient() && backoff.attempt() + 1 < self.config.read_retries => {
                    let delay = backoff.next_delay();
                    debug!("Fetch of {} failed ({}), retrying in {:?}", chat_id, e, delay);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Returns whether maintenance ran.
    async fn maintain_if_due(&self, now: DateTime<Utc>) -> bool {
        let config = self.config.clone();
        let result = self
            .cache
            .blocking(move |cache| {
                if maintenance_due(cache, &config, now)? {
                    run_maintenance(cache, &config, now)?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            })
            .await;

        match result {
            Ok(ran) => ran,
            Err(CacheError::Disabled) => false,
            Err(e) => {
                warn!("Cache maintenance failed: {}", e);
                false
            }
        }
    }
}

fn maintenance_due(
    cache: &MessageCache,
    config: &ClientConfig,
    now: DateTime<Utc>,
) -> CacheResult<bool> {
    let last = cache.flag(MAINTENANCE_FLAG)?;
    let Some(Ok(last)) = last.as_deref().map(time::decode) else {
        return Ok(true);
    };
    Ok(now
        .signed_duration_since(last)
        .to_std()
        .is_ok_and(|elapsed| elapsed >= config.maintenance_interval))
}

fn run_maintenance(
    cache: &MessageCache,
    config: &ClientConfig,
    now: DateTime<Utc>,
) -> CacheResult<()> {
    let evicted = cache.evict_older_than_at(config.retention, config.keep_recent, now)?;

    let mut capped = 0;
    for chat_id in cache.known_chats()? {
        capped += cache.cap_per_chat(&chat_id, config.max_per_chat)?;
    }

    cache.set_flag(MAINTENANCE_FLAG, &time::encode(now))?;
    info!("Cache maintenance: evicted {}, capped {}", evicted, capped);
    Ok(())
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use parley_types::api::{SendMessageRequest, SendMessageResponse, UnlockResponse};
    use parley_types::models::MessageKind;

    #[derive(Default)]
    struct FakeRemote {
        messages: Mutex<HashMap<String, Vec<Message>>>,
        denied: HashSet<String>,
        /// Transient failures to return before succeeding.
        flaky: AtomicUsize,
        fetches: AtomicUsize,
    }

    impl FakeRemote {
        fn with(chat_id: &str, messages: Vec<Message>) -> Self {
            let remote = Self::default();
            remote.messages.lock().unwrap().insert(chat_id.to_string(), messages);
            remote
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RemoteStore for FakeRemote {
        async fn fetch(
            &self,
            chat_id: &str,
            query: &MessageQuery,
        ) -> Result<Vec<Message>, ClientError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.denied.contains(chat_id) {
                return Err(ClientError::Forbidden);
            }
            if self
                .flaky
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ClientError::Transient("flaky".into()));
            }

            let messages = self.messages.lock().unwrap();
            let all = messages.get(chat_id).cloned().unwrap_or_default();
            Ok(all
                .into_iter()
                .filter(|m| query.after.is_none_or(|after| m.created_at > after))
                .take(query.clamped_limit() as usize)
                .collect())
        }

        async fn send(
            &self,
            _chat_id: &str,
            _request: SendMessageRequest,
        ) -> Result<SendMessageResponse, ClientError> {
            Err(ClientError::Transient("not supported".into()))
        }

        async fn mark_read(&self, _chat_id: &str) -> Result<(), ClientError> {
            Ok(())
        }

        async fn unlock(
            &self,
            _chat_id: &str,
            _message_id: &str,
        ) -> Result<UnlockResponse, ClientError> {
            Err(ClientError::Transient("not supported".into()))
        }

        async fn balance(&self) -> Result<i64, ClientError> {
            Ok(0)
        }
    }

    fn msg(chat_id: &str, id: &str, secs: i64) -> Message {
        Message {
            id: id.into(),
            chat_id: chat_id.into(),
            sender_id: "alice".into(),
            kind: MessageKind::Text,
            content: Some(id.into()),
            media_url: None,
            price: None,
            unlocked_by: vec![],
            read_at: None,
            created_at: DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap(),
        }
    }

    fn seeded_cache(chats: &[&str]) -> Arc<MessageCache> {
        let cache = MessageCache::in_memory();
        for chat in chats {
            cache.put(chat, &[msg(chat, &format!("{}-seed", chat), 0)]).unwrap();
        }
        Arc::new(cache)
    }

    #[tokio::test]
    async fn pass_pages_until_exhausted() {
        let cache = seeded_cache(&["chat-1"]);
        let remote = Arc::new(FakeRemote::with(
            "chat-1",
            (1..=5).map(|i| msg("chat-1", &format!("m{}", i), i)).collect(),
        ));
        let config = ClientConfig {
            page_size: 2,
            ..ClientConfig::default()
        };
        let (mut scheduler, _) = SyncScheduler::new(cache.clone(), remote.clone(), config);

        let report = scheduler.run_pass().await;

        assert_eq!(report.fetched, 5);
        assert_eq!(remote.fetches(), 3);
        assert_eq!(cache.get("chat-1", 10, None).unwrap().len(), 6);
        assert_eq!(cache.sync_cursor("chat-1").unwrap(), Some(msg("chat-1", "m5", 5).created_at));

        // Nothing new: one short page and no refetch of old messages.
        let report = scheduler.run_pass().await;
        assert_eq!(report.fetched, 0);
        assert_eq!(remote.fetches(), 4);
    }

    #[tokio::test]
    async fn failing_chat_does_not_block_others() {
        let cache = seeded_cache(&["chat-bad", "chat-good"]);
        let mut remote = FakeRemote::with("chat-good", vec![msg("chat-good", "g1", 10)]);
        remote.denied.insert("chat-bad".into());
        let (mut scheduler, _) =
            SyncScheduler::new(cache.clone(), Arc::new(remote), ClientConfig::default());

        let report = scheduler.run_pass().await;

        assert_eq!(report.synced, 1);
        assert_eq!(report.failed, 1);
        assert!(cache.get_entry("g1").unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_fetch_errors_are_retried() {
        let cache = seeded_cache(&["chat-1"]);
        let remote = Arc::new(FakeRemote::with("chat-1", vec![msg("chat-1", "m1", 1)]));
        remote.flaky.store(2, Ordering::SeqCst);
        let (mut scheduler, _) =
            SyncScheduler::new(cache.clone(), remote.clone(), ClientConfig::default());

        let report = scheduler.run_pass().await;

        assert_eq!(report.synced, 1);
        assert_eq!(remote.fetches(), 3);
        assert!(cache.get_entry("m1").unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn foreground_syncs_immediately_then_on_cadence() {
        let cache = seeded_cache(&["chat-1"]);
        let remote = Arc::new(FakeRemote::default());
        let config = ClientConfig {
            sync_interval: Duration::from_secs(60),
            ..ClientConfig::default()
        };
        let handle = SyncScheduler::spawn(cache, remote.clone(), config, Visibility::Background);
        let mut reports = handle.reports();

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(reports.borrow().pass, 0);
        assert_eq!(remote.fetches(), 0);

        // Repeated foreground notifications must not stack timers.
        for _ in 0..3 {
            handle.set_visibility(Visibility::Foreground);
        }
        reports.changed().await.unwrap();
        assert_eq!(reports.borrow_and_update().pass, 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(reports.borrow().pass, 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(reports.borrow().pass, 2);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(reports.borrow().pass, 3);

        handle.set_visibility(Visibility::Background);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(reports.borrow().pass, 3);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn sync_now_runs_while_backgrounded() {
        let cache = seeded_cache(&["chat-1"]);
        let handle = SyncScheduler::spawn(
            cache,
            Arc::new(FakeRemote::default()),
            ClientConfig::default(),
            Visibility::Background,
        );
        let mut reports = handle.reports();

        handle.sync_now();
        reports.changed().await.unwrap();
        assert_eq!(reports.borrow().pass, 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn maintenance_runs_at_most_once_per_interval() {
        let cache = Arc::new(MessageCache::in_memory());
        let old = Utc::now() - chrono::Duration::days(60);
        let stale: Vec<Message> = (0..3).map(|i| msg("chat-1", &format!("old{}", i), i)).collect();
        cache.put_at("chat-1", &stale, old).unwrap();

        let config = ClientConfig {
            keep_recent: 1,
            ..ClientConfig::default()
        };
        let (scheduler, _) =
            SyncScheduler::new(cache.clone(), Arc::new(FakeRemote::default()), config);

        let now = Utc::now();
        assert!(scheduler.maintain_if_due(now).await);
        assert_eq!(cache.get("chat-1", 10, None).unwrap().len(), 1);
        assert!(cache.flag(MAINTENANCE_FLAG).unwrap().is_some());

        // Fresh stale rows survive until the interval has passed.
        cache.put_at("chat-1", &stale, old).unwrap();
        assert!(!scheduler.maintain_if_due(now + chrono::Duration::days(1)).await);
        assert_eq!(cache.get("chat-1", 10, None).unwrap().len(), 3);

        assert!(scheduler.maintain_if_due(now + chrono::Duration::days(8)).await);
        assert_eq!(cache.get("chat-1", 10, None).unwrap().len(), 1);
    }
}
