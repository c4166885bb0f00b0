//! Live, non-durable conversation state.
//!
//! [`HistoryHandler`] owns one [`ChatHistory`] per active conversation, keeps
//! them ordered least-recently-touched first, and runs a reaper that evicts
//! conversations nobody has watched for the idle TTL.
//!
//! Lock order: the registry lock may be held while a `ChatHistory` lock is
//! taken, never the reverse.

use std::{
    collections::HashSet,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex as StdMutex, PoisonError, Weak},
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use futures::FutureExt;
use indexmap::IndexMap;
use metrics::{counter, gauge};
use shared::{config::server::SessionConfig, models::Message};
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, error, info};

/// Timing knobs for buffering and eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistorySettings {
    /// How long an unsubscribed conversation stays buffered.
    pub idle_ttl: Duration,
    /// Period of the reaper.
    pub sweep_interval: Duration,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(15 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl From<&SessionConfig> for HistorySettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            idle_ttl: config.idle_ttl(),
            sweep_interval: config.sweep_interval(),
        }
    }
}

fn to_time_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

#[derive(Debug, Default)]
struct ChatState {
    system_message: Option<Message>,
    messages: IndexMap<String, Vec<Message>>,
    subscribers: HashSet<String>,
    deletion_deadline: Option<DateTime<Utc>>,
}

impl ChatState {
    fn subscribe(&mut self, subscriber_id: &str) {
        self.subscribers.insert(subscriber_id.to_string());
        self.deletion_deadline = None;
    }

    fn arm_if_empty(&mut self, now: DateTime<Utc>, ttl: TimeDelta) -> bool {
        if self.subscribers.is_empty() && self.deletion_deadline.is_none() {
            self.deletion_deadline = Some(now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC));
        }
        self.deletion_deadline.is_some()
    }
}

/// One conversation's buffered messages, system message and subscribers.
///
/// A deletion deadline is only ever set while nobody is subscribed; adding a
/// subscriber clears it under the same lock.
#[derive(Debug)]
pub struct ChatHistory {
    idle_ttl: TimeDelta,
    state: Mutex<ChatState>,
}

impl ChatHistory {
    /// Creates an empty history, optionally seeded with a system message.
    #[must_use]
    pub fn new(system_message: Option<Message>, idle_ttl: Duration) -> Self {
        Self {
            idle_ttl: to_time_delta(idle_ttl),
            state: Mutex::new(ChatState {
                system_message,
                ..ChatState::default()
            }),
        }
    }

    /// Registers `subscriber_id` and appends `message` under its id.
    pub async fn add_message(&self, message: Message, subscriber_id: &str) {
        let mut state = self.state.lock().await;
        state.subscribe(subscriber_id);
        state
            .messages
            .entry(message.id.clone())
            .or_default()
            .push(message);
    }

    /// Appends `message` without touching subscribers.
    pub async fn append(&self, message: Message) {
        self.state
            .lock()
            .await
            .messages
            .entry(message.id.clone())
            .or_default()
            .push(message);
    }

    /// Buffered fragments for `message_id`; empty when unknown.
    pub async fn get(&self, message_id: &str) -> Vec<Message> {
        self.state
            .lock()
            .await
            .messages
            .get(message_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns whether anything is buffered under `message_id`.
    pub async fn contains(&self, message_id: &str) -> bool {
        self.state.lock().await.messages.contains_key(message_id)
    }

    /// Drops everything buffered under `message_id`. Returns whether it existed.
    pub async fn remove_message(&self, message_id: &str) -> bool {
        self.state
            .lock()
            .await
            .messages
            .shift_remove(message_id)
            .is_some()
    }

    /// Replaces the system message.
    pub async fn set_system_message(&self, message: Message) {
        self.state.lock().await.system_message = Some(message);
    }

    /// Current system message.
    pub async fn system_message(&self) -> Option<Message> {
        self.state.lock().await.system_message.clone()
    }

    /// System message followed by every buffered message in arrival order.
    pub async fn transcript(&self) -> Vec<Message> {
        let state = self.state.lock().await;
        state
            .system_message
            .iter()
            .chain(state.messages.values().flatten())
            .cloned()
            .collect()
    }

    /// Adds a subscriber and cancels any pending eviction.
    pub async fn add_subscriber(&self, subscriber_id: &str) {
        self.state.lock().await.subscribe(subscriber_id);
    }

    /// Removes a subscriber without arming eviction.
    pub async fn remove_subscriber(&self, subscriber_id: &str) {
        self.state.lock().await.subscribers.remove(subscriber_id);
    }

    /// Snapshot of the subscriber set.
    pub async fn subscribers(&self) -> HashSet<String> {
        self.state.lock().await.subscribers.clone()
    }

    /// Removes `subscriber_id` and, if nobody is left and no deadline is set,
    /// arms one `idle_ttl` from now. Returns whether a deadline is armed.
    pub async fn mark_idle_if_unsubscribed(&self, subscriber_id: &str) -> bool {
        self.mark_idle_at(subscriber_id, Utc::now()).await
    }

    pub(crate) async fn mark_idle_at(&self, subscriber_id: &str, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock().await;
        state.subscribers.remove(subscriber_id);
        state.arm_if_empty(now, self.idle_ttl)
    }

    /// Drops subscribers missing from `live` and arms eviction if none remain.
    /// Returns the ids that were dropped.
    pub async fn retain_subscribers(&self, live: &HashSet<String>) -> Vec<String> {
        let mut state = self.state.lock().await;
        let stale: Vec<String> = state.subscribers.difference(live).cloned().collect();
        if stale.is_empty() {
            return stale;
        }
        for id in &stale {
            state.subscribers.remove(id);
        }
        state.arm_if_empty(Utc::now(), self.idle_ttl);
        stale
    }

    /// Pending eviction deadline.
    pub async fn deletion_deadline(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.deletion_deadline
    }

    /// Returns whether the conversation may be evicted at `now`.
    pub async fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let state = self.state.lock().await;
        state.subscribers.is_empty() && state.deletion_deadline.is_some_and(|deadline| deadline <= now)
    }
}

#[derive(Debug)]
struct Registry {
    chats: Mutex<IndexMap<String, Arc<ChatHistory>>>,
    reaper: StdMutex<Option<JoinHandle<()>>>,
    settings: HistorySettings,
}

impl Registry {
    async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut chats = self.chats.lock().await;

        let mut expired = HashSet::new();
        for (id, chat) in chats.iter() {
            if chat.is_expired(now).await {
                expired.insert(id.clone());
            }
        }

        if !expired.is_empty() {
            chats.retain(|id, _| !expired.contains(id));
            counter!("confab_history_evictions_total").increment(expired.len() as u64);
            debug!(evicted = ?expired, "evicted idle conversations");
        }
        record_active(chats.len());
        expired.len()
    }
}

#[allow(clippy::cast_precision_loss)]
fn record_active(len: usize) {
    gauge!("confab_history_active_chats").set(len as f64);
}

/// Process-wide registry of live conversations.
///
/// Cheap to clone; clones share the registry and its reaper. The reaper
/// holds only a weak reference and stops once every handle is dropped.
#[derive(Debug, Clone)]
pub struct HistoryHandler {
    registry: Arc<Registry>,
}

impl Default for HistoryHandler {
    fn default() -> Self {
        Self::new(HistorySettings::default())
    }
}

impl HistoryHandler {
    /// Creates an empty registry. The reaper starts with the first mutation.
    #[must_use]
    pub fn new(settings: HistorySettings) -> Self {
        Self {
            registry: Arc::new(Registry {
                chats: Mutex::new(IndexMap::new()),
                reaper: StdMutex::new(None),
                settings,
            }),
        }
    }

    /// Settings the handler was built with.
    #[must_use]
    pub fn settings(&self) -> HistorySettings {
        self.registry.settings
    }

    /// Starts the reaper unless it is already running.
    pub fn ensure_reaper(&self) {
        let mut reaper = self
            .registry
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if reaper.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        if reaper.is_some() {
            info!("history reaper stopped unexpectedly; restarting");
        }
        let registry = Arc::downgrade(&self.registry);
        let interval = self.registry.settings.sweep_interval.max(Duration::from_millis(1));
        *reaper = Some(tokio::spawn(run_reaper(registry, interval)));
    }

    /// Returns whether the reaper task is alive.
    #[must_use]
    pub fn reaper_running(&self) -> bool {
        self.registry
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stops the reaper. A later mutation starts a fresh one.
    pub fn shutdown(&self) {
        let handle = self
            .registry
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            debug!("history reaper stopped");
        }
    }

    /// Registers conversation `id` if absent. The first writer's system message wins.
    /// Returns whether a new entry was created.
    pub async fn add_chat(&self, id: &str, system_message: Option<Message>) -> bool {
        self.ensure_reaper();
        let mut chats = self.registry.chats.lock().await;
        if chats.contains_key(id) {
            return false;
        }
        chats.insert(
            id.to_string(),
            Arc::new(ChatHistory::new(system_message, self.registry.settings.idle_ttl)),
        );
        record_active(chats.len());
        true
    }

    /// Buffers `message` for conversation `id` and subscribes `subscriber_id`.
    /// No-op for unknown conversations.
    pub async fn add_message(&self, id: &str, message: Message, subscriber_id: &str) -> bool {
        self.ensure_reaper();
        let mut chats = self.registry.chats.lock().await;
        let Some(chat) = touch_back(&mut chats, id) else {
            return false;
        };
        chat.add_message(message, subscriber_id).await;
        true
    }

    /// Buffers a generated reply without subscribing anyone.
    pub async fn record_reply(&self, id: &str, message: Message) -> bool {
        self.ensure_reaper();
        let mut chats = self.registry.chats.lock().await;
        let Some(chat) = touch_back(&mut chats, id) else {
            return false;
        };
        chat.append(message).await;
        true
    }

    /// Drops a buffered message. No-op if the conversation or message is unknown.
    pub async fn remove_message(&self, id: &str, message_id: &str) -> bool {
        self.ensure_reaper();
        let mut chats = self.registry.chats.lock().await;
        let Some(chat) = chats.get(id).cloned() else {
            return false;
        };
        if !chat.remove_message(message_id).await {
            return false;
        }
        touch_back(&mut chats, id);
        true
    }

    /// Replaces the system message of a known conversation.
    pub async fn add_system_message(&self, id: &str, message: Message) -> bool {
        self.ensure_reaper();
        let chats = self.registry.chats.lock().await;
        let Some(chat) = chats.get(id) else {
            return false;
        };
        chat.set_system_message(message).await;
        true
    }

    /// Subscribes a connection to a known conversation, cancelling eviction.
    pub async fn add_subscriber(&self, id: &str, subscriber_id: &str) -> bool {
        self.ensure_reaper();
        let mut chats = self.registry.chats.lock().await;
        let Some(chat) = touch_back(&mut chats, id) else {
            return false;
        };
        chat.add_subscriber(subscriber_id).await;
        true
    }

    /// Unsubscribes a connection, arming eviction if it was the last one, and
    /// moves the conversation to the front of the eviction order.
    pub async fn unload_chat(&self, id: &str, subscriber_id: &str) -> bool {
        self.unload_chat_at(id, subscriber_id, Utc::now()).await
    }

    pub(crate) async fn unload_chat_at(
        &self,
        id: &str,
        subscriber_id: &str,
        now: DateTime<Utc>,
    ) -> bool {
        self.ensure_reaper();
        let mut chats = self.registry.chats.lock().await;
        let Some(index) = chats.get_index_of(id) else {
            return false;
        };
        if let Some((_, chat)) = chats.get_index(index) {
            chat.mark_idle_at(subscriber_id, now).await;
        }
        chats.move_index(index, 0);
        true
    }

    /// Drops cached subscribers that the transport no longer reports in the room.
    /// Returns the dropped ids.
    pub async fn reconcile_subscribers(&self, id: &str, live: &HashSet<String>) -> Vec<String> {
        self.ensure_reaper();
        let chats = self.registry.chats.lock().await;
        let Some(chat) = chats.get(id) else {
            return Vec::new();
        };
        let stale = chat.retain_subscribers(live).await;
        if !stale.is_empty() {
            debug!(chat_id = %id, ?stale, "dropped stale subscribers");
        }
        stale
    }

    /// Shared handle to a conversation's state.
    pub async fn get(&self, id: &str) -> Option<Arc<ChatHistory>> {
        self.registry.chats.lock().await.get(id).cloned()
    }

    /// Returns whether conversation `id` is buffered.
    pub async fn contains(&self, id: &str) -> bool {
        self.registry.chats.lock().await.contains_key(id)
    }

    /// Number of buffered conversations.
    pub async fn len(&self) -> usize {
        self.registry.chats.lock().await.len()
    }

    /// Returns whether no conversation is buffered.
    pub async fn is_empty(&self) -> bool {
        self.registry.chats.lock().await.is_empty()
    }

    /// Conversation ids, least-recently-touched first.
    pub async fn ids(&self) -> Vec<String> {
        self.registry.chats.lock().await.keys().cloned().collect()
    }

    /// System message plus buffered messages of `id`; empty when unknown.
    pub async fn transcript(&self, id: &str) -> Vec<Message> {
        let chat = self.get(id).await;
        match chat {
            Some(chat) => chat.transcript().await,
            None => Vec::new(),
        }
    }

    /// Evicts every conversation whose deadline has passed at `now`.
    /// Returns how many were evicted.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        self.registry.sweep(now).await
    }
}

fn touch_back(chats: &mut IndexMap<String, Arc<ChatHistory>>, id: &str) -> Option<Arc<ChatHistory>> {
    let index = chats.get_index_of(id)?;
    let last = chats.len() - 1;
    chats.move_index(index, last);
    chats.get_index(last).map(|(_, chat)| Arc::clone(chat))
}

async fn run_reaper(registry: Weak<Registry>, interval: Duration) {
    reap_every(interval, move || {
        let registry = registry.upgrade()?;
        Some(async move { registry.sweep(Utc::now()).await })
    })
    .await;
}

/// Runs one `sweep` pass per tick until it yields no pass. A panicking pass
/// is logged and the next tick sweeps again.
async fn reap_every<F, Fut>(interval: Duration, mut sweep: F)
where
    F: FnMut() -> Option<Fut>,
    Fut: Future<Output = usize>,
{
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(interval_secs = interval.as_secs(), "history reaper started");

    loop {
        ticker.tick().await;
        let Some(pass) = sweep() else {
            debug!("history registry dropped; reaper exiting");
            return;
        };

        match AssertUnwindSafe(pass).catch_unwind().await {
            Ok(0) => {}
            Ok(evicted) => info!(evicted, "reaper evicted idle conversations"),
            Err(_) => error!("history sweep panicked; retrying next interval"),
        }
    }
}
