//! Prioritised publish/subscribe bus.
//!
//! Published messages land in a priority queue. A single dispatch loop pops
//! them (highest priority first, FIFO within a priority) and hands each one to
//! the matching handlers. Every handler owns a bounded channel drained by its
//! own delivery task, so a slow handler only back-pressures the bus and
//! per-handler ordering is preserved. Handler failures, including panics, are
//! counted and never reach the publisher.
//!
//! A handler id may listen on several topics. It has one callback, one filter
//! and one set of counters, shared by all of its topics.

use crate::config::BusConfig;
use chrono::{DateTime, Utc};
use ensemble_core::{CancellationToken, EnsembleResult};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Topic that receives every published message.
pub const WILDCARD_TOPIC: &str = "*";

/// Dispatch priority. Higher variants are delivered first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    /// Background traffic.
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// Delivered ahead of normal traffic.
    High,
    /// Delivered before everything else.
    Critical,
}

/// A message travelling through the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique id, `msg_<uuid>`.
    pub message_id: String,
    /// Topic the message was published to.
    pub topic: String,
    /// Free-form id of the publisher.
    pub sender: String,
    /// Message body.
    pub payload: serde_json::Value,
    /// Dispatch priority.
    pub priority: MessagePriority,
    /// Extra publisher-supplied fields.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// When the message was created.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Build a message with a fresh id and the current timestamp.
    pub fn new(
        topic: impl Into<String>,
        sender: impl Into<String>,
        payload: serde_json::Value,
        priority: MessagePriority,
    ) -> Self {
        Self {
            message_id: format!("msg_{}", Uuid::new_v4().simple()),
            topic: topic.into(),
            sender: sender.into(),
            payload,
            priority,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }
}

/// Async message handler.
pub type MessageCallback =
    Arc<dyn Fn(Message) -> BoxFuture<'static, EnsembleResult<()>> + Send + Sync>;

/// Predicate deciding whether a handler sees a message.
pub type MessageFilter = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// Wrap an async closure as a [`MessageCallback`].
pub fn message_handler<F, Fut>(func: F) -> MessageCallback
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = EnsembleResult<()>> + Send + 'static,
{
    Arc::new(move |message| func(message).boxed())
}

/// Delivery counters for one handler id, summed over all of its topics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerStats {
    /// Handler these counters belong to.
    pub handler_id: String,
    /// Messages the callback handled successfully.
    pub message_count: u64,
    /// Callback errors, callback panics and filter panics.
    pub error_count: u64,
    /// Time of the last successful delivery.
    pub last_message_at: Option<DateTime<Utc>>,
}

impl HandlerStats {
    fn new(handler_id: &str) -> Self {
        Self {
            handler_id: handler_id.to_string(),
            message_count: 0,
            error_count: 0,
            last_message_at: None,
        }
    }
}

#[derive(Clone)]
struct Handler {
    handler_id: String,
    filter: Option<MessageFilter>,
    sender: mpsc::Sender<Message>,
    stats: Arc<Mutex<HandlerStats>>,
}

/// Handlers by id plus topic membership in subscription order.
#[derive(Default)]
struct Registry {
    handlers: HashMap<String, Handler>,
    topics: HashMap<String, Vec<String>>,
}

impl Registry {
    /// Handlers a message on `topic` goes to, each at most once.
    fn targets(&self, topic: &str) -> Vec<Handler> {
        let mut topics = vec![topic];
        if topic != WILDCARD_TOPIC {
            topics.push(WILDCARD_TOPIC);
        }
        let mut seen = HashSet::new();
        topics
            .into_iter()
            .filter_map(|t| self.topics.get(t))
            .flatten()
            .filter(|id| seen.insert(id.as_str()))
            .filter_map(|id| self.handlers.get(id))
            .cloned()
            .collect()
    }

    /// Drop `handler_id` from `topic`; forget the handler once it has no topics left.
    fn leave(&mut self, topic: &str, handler_id: &str) -> bool {
        let Some(members) = self.topics.get_mut(topic) else {
            return false;
        };
        let before = members.len();
        members.retain(|id| id != handler_id);
        let removed = members.len() != before;
        if members.is_empty() {
            self.topics.remove(topic);
        }
        if removed && !self.topics.values().flatten().any(|id| id == handler_id) {
            self.handlers.remove(handler_id);
        }
        removed
    }

    fn remove_handler(&mut self, handler_id: &str) -> bool {
        for members in self.topics.values_mut() {
            members.retain(|id| id != handler_id);
        }
        self.topics.retain(|_, members| !members.is_empty());
        self.handlers.remove(handler_id).is_some()
    }
}

/// A message waiting for dispatch, with the handlers it has already reached.
struct Queued {
    seq: u64,
    message: Message,
    dispatched: HashSet<String>,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // Max-heap: higher priority first, then lower sequence number.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.message
            .priority
            .cmp(&other.message.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct BusInner {
    name: String,
    queue: Mutex<BinaryHeap<Queued>>,
    notify: Notify,
    running: AtomicBool,
    seq: AtomicU64,
    registry: RwLock<Registry>,
    history: Mutex<VecDeque<Message>>,
}

impl BusInner {
    async fn dispatch_loop(self: Arc<Self>, shutdown: CancellationToken) {
        while !shutdown.is_cancelled() {
            let next = self.queue.lock().pop();
            match next {
                Some(queued) => {
                    if let Some(unfinished) = self.dispatch(queued, &shutdown).await {
                        debug!(
                            bus = %self.name,
                            message_id = %unfinished.message.message_id,
                            "Stopped mid-dispatch, message requeued"
                        );
                        self.queue.lock().push(unfinished);
                        break;
                    }
                }
                None => {
                    tokio::select! {
                        () = self.notify.notified() => {}
                        () = shutdown.cancelled() => break,
                    }
                }
            }
        }
        debug!(bus = %self.name, "Dispatch loop exited");
    }

    /// Hand `queued` to every matching handler it has not reached yet.
    ///
    /// Returns the message back if `shutdown` fires while a handler's channel
    /// is full; its `dispatched` set records who already has it.
    async fn dispatch(&self, mut queued: Queued, shutdown: &CancellationToken) -> Option<Queued> {
        let targets = self.registry.read().await.targets(&queued.message.topic);

        for Handler {
            handler_id,
            filter,
            sender,
            stats,
        } in targets
        {
            if queued.dispatched.contains(&handler_id) {
                continue;
            }
            if let Some(filter) = filter {
                let message = &queued.message;
                match std::panic::catch_unwind(AssertUnwindSafe(|| filter(message))) {
                    Ok(true) => {}
                    Ok(false) => {
                        queued.dispatched.insert(handler_id);
                        continue;
                    }
                    Err(_) => {
                        error!(handler_id = %handler_id, message_id = %message.message_id, "Message filter panicked");
                        stats.lock().error_count += 1;
                        queued.dispatched.insert(handler_id);
                        continue;
                    }
                }
            }

            let message = queued.message.clone();
            tokio::select! {
                biased;
                sent = sender.send(message) => {
                    if sent.is_err() {
                        debug!(handler_id = %handler_id, "Handler gone, message dropped");
                    }
                    queued.dispatched.insert(handler_id);
                }
                () = shutdown.cancelled() => return Some(queued),
            }
        }
        None
    }
}

async fn deliver(
    handler_id: String,
    mut receiver: mpsc::Receiver<Message>,
    callback: MessageCallback,
    stats: Arc<Mutex<HandlerStats>>,
) {
    while let Some(message) = receiver.recv().await {
        let message_id = message.message_id.clone();
        let callback = callback.clone();
        let outcome = AssertUnwindSafe(async move { callback(message).await })
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {
                let mut s = stats.lock();
                s.message_count += 1;
                s.last_message_at = Some(Utc::now());
            }
            Ok(Err(e)) => {
                error!(handler_id = %handler_id, message_id = %message_id, error = %e, "Message handler failed");
                stats.lock().error_count += 1;
            }
            Err(_) => {
                error!(handler_id = %handler_id, message_id = %message_id, "Message handler panicked");
                stats.lock().error_count += 1;
            }
        }
    }
    debug!(handler_id = %handler_id, "Handler delivery task exited");
}

struct Dispatcher {
    handle: JoinHandle<()>,
    shutdown: CancellationToken,
}

/// Topic-based message bus with priority dispatch.
pub struct MessageBus {
    config: BusConfig,
    inner: Arc<BusInner>,
    dispatcher: Mutex<Option<Dispatcher>>,
}

impl MessageBus {
    /// A stopped bus with the default [`BusConfig`].
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, BusConfig::default())
    }

    /// A stopped bus with explicit history and buffer sizes.
    pub fn with_config(name: impl Into<String>, config: BusConfig) -> Self {
        Self {
            config,
            inner: Arc::new(BusInner {
                name: name.into(),
                queue: Mutex::new(BinaryHeap::new()),
                notify: Notify::new(),
                running: AtomicBool::new(false),
                seq: AtomicU64::new(0),
                registry: RwLock::new(Registry::default()),
                history: Mutex::new(VecDeque::new()),
            }),
            dispatcher: Mutex::new(None),
        }
    }

    /// Bus name, used in log fields.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Spawn the dispatch loop. Must be called from within a Tokio runtime.
    /// Starting a running bus only logs a warning.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!(bus = %self.inner.name, "Message bus already running");
            return;
        }
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(self.inner.clone().dispatch_loop(shutdown.clone()));
        *self.dispatcher.lock() = Some(Dispatcher { handle, shutdown });
        info!(bus = %self.inner.name, "Message bus started");
    }

    /// Stop dispatching and wait for the loop to exit.
    ///
    /// Messages still queued, including one interrupted while waiting on a
    /// full handler channel, stay queued until the next start.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let dispatcher = self.dispatcher.lock().take();
        if let Some(Dispatcher { handle, shutdown }) = dispatcher {
            shutdown.cancel();
            if let Err(e) = handle.await {
                error!(bus = %self.inner.name, error = %e, "Dispatch loop failed");
            }
        }
        info!(bus = %self.inner.name, "Message bus stopped");
    }

    /// Whether the dispatch loop is running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Subscribe `handler_id` to `topic` ([`WILDCARD_TOPIC`] for everything).
    ///
    /// A handler id may be subscribed to several topics. Subscribing it again
    /// installs the new callback and filter for all of its topics; its stats
    /// keep accumulating.
    pub async fn subscribe(
        &self,
        topic: impl Into<String>,
        handler_id: impl Into<String>,
        callback: MessageCallback,
        filter: Option<MessageFilter>,
    ) {
        let topic = topic.into();
        let handler_id = handler_id.into();

        let mut registry = self.inner.registry.write().await;
        let stats = match registry.handlers.get(&handler_id) {
            Some(existing) => {
                debug!(handler_id = %handler_id, "Replacing handler callback");
                existing.stats.clone()
            }
            None => Arc::new(Mutex::new(HandlerStats::new(&handler_id))),
        };

        // The previous delivery task drains what it already holds, then exits
        // once its sender is dropped here.
        let (sender, receiver) = mpsc::channel(self.config.subscriber_buffer.max(1));
        tokio::spawn(deliver(handler_id.clone(), receiver, callback, stats.clone()));
        registry.handlers.insert(
            handler_id.clone(),
            Handler {
                handler_id: handler_id.clone(),
                filter,
                sender,
                stats,
            },
        );

        let members = registry.topics.entry(topic.clone()).or_default();
        if members.contains(&handler_id) {
            warn!(topic = %topic, handler_id = %handler_id, "Handler already subscribed to topic");
        } else {
            members.push(handler_id.clone());
            info!(topic = %topic, handler_id = %handler_id, "Subscribed handler");
        }
    }

    /// Remove `handler_id` from one topic. A handler left with no topics is
    /// forgotten along with its stats. Messages already handed to it are
    /// still delivered.
    pub async fn unsubscribe(&self, topic: &str, handler_id: &str) -> bool {
        let removed = self.inner.registry.write().await.leave(topic, handler_id);
        if removed {
            info!(topic = %topic, handler_id = %handler_id, "Unsubscribed handler");
        }
        removed
    }

    /// Remove `handler_id` from every topic and forget its stats.
    pub async fn remove_handler(&self, handler_id: &str) -> bool {
        let removed = self.inner.registry.write().await.remove_handler(handler_id);
        if removed {
            info!(handler_id = %handler_id, "Removed handler");
        }
        removed
    }

    /// Queue a message and return its id. Never blocks on handlers.
    pub fn publish(
        &self,
        topic: impl Into<String>,
        sender: impl Into<String>,
        payload: serde_json::Value,
        priority: MessagePriority,
        metadata: Option<HashMap<String, serde_json::Value>>,
    ) -> String {
        let mut message = Message::new(topic, sender, payload, priority);
        if let Some(metadata) = metadata {
            message.metadata = metadata;
        }
        self.publish_message(message)
    }

    /// Queue a prebuilt message and return its id.
    pub fn publish_message(&self, message: Message) -> String {
        let message_id = message.message_id.clone();
        debug!(
            bus = %self.inner.name,
            topic = %message.topic,
            message_id = %message_id,
            priority = ?message.priority,
            "Message published"
        );

        {
            let mut history = self.inner.history.lock();
            history.push_back(message.clone());
            while history.len() > self.config.max_history {
                history.pop_front();
            }
        }

        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst);
        self.inner.queue.lock().push(Queued {
            seq,
            message,
            dispatched: HashSet::new(),
        });
        self.inner.notify.notify_one();
        message_id
    }

    /// Messages waiting for dispatch.
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Counters for a subscribed handler, or `None` if it has no topics.
    pub async fn handler_stats(&self, handler_id: &str) -> Option<HandlerStats> {
        self.inner
            .registry
            .read()
            .await
            .handlers
            .get(handler_id)
            .map(|h| h.stats.lock().clone())
    }

    /// Topics with at least one subscriber, sorted.
    pub async fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.inner.registry.read().await.topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Handler ids subscribed to `topic`, in subscription order.
    pub async fn subscribers(&self, topic: &str) -> Vec<String> {
        self.inner
            .registry
            .read()
            .await
            .topics
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// The most recent `limit` published messages, oldest first, optionally
    /// restricted to one topic.
    pub fn message_history(&self, topic: Option<&str>, limit: usize) -> Vec<Message> {
        let history = self.inner.history.lock();
        let matching: Vec<&Message> = history
            .iter()
            .filter(|m| topic.map_or(true, |t| m.topic == t))
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).cloned().collect()
    }

    /// Forget the published-message history. Queued messages are unaffected.
    pub fn clear_history(&self) {
        self.inner.history.lock().clear();
    }
}

impl Drop for MessageBus {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(dispatcher) = self.dispatcher.lock().take() {
            dispatcher.shutdown.cancel();
            dispatcher.handle.abort();
        }
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("name", &self.inner.name)
            .field("config", &self.config)
            .field("running", &self.is_running())
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}
