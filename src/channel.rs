//! Per-recipient mailboxes with publish/subscribe and timed request-reply
//!
//! Every subscriber owns exactly one unbounded mailbox. Requests are
//! correlated by id: [`MessageBus::request_reply`] parks a oneshot slot under
//! the message's correlation id and [`MessageBus::reply`] fills it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// An immutable message exchanged between named participants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: String,
    sender: String,
    recipient: String,
    message_type: String,
    payload: Map<String, Value>,
    correlation_id: String,
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reply_to: Option<String>,
}

impl Message {
    /// Creates a message with a fresh id and correlation id
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        message_type: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender: sender.into(),
            recipient: recipient.into(),
            message_type: message_type.into(),
            payload,
            correlation_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            reply_to: None,
        }
    }

    /// Sets the address replies should go to
    pub fn with_reply_to(mut self, address: impl Into<String>) -> Self {
        self.reply_to = Some(address.into());
        self
    }

    /// Builds the reply to `request`, keeping its correlation id
    pub fn reply_for(request: &Message, message_type: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender: request.recipient.clone(),
            recipient: request.reply_address().to_string(),
            message_type: message_type.into(),
            payload,
            correlation_id: request.correlation_id.clone(),
            timestamp: Utc::now(),
            reply_to: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    /// `reply_to` if set, otherwise the sender
    pub fn reply_address(&self) -> &str {
        self.reply_to.as_deref().unwrap_or(&self.sender)
    }
}

/// Receiving side of a mailbox; clones share the same receiver
#[derive(Debug, Clone)]
pub struct Inbox {
    name: String,
    receiver: Arc<AsyncMutex<mpsc::UnboundedReceiver<Message>>>,
}

impl Inbox {
    /// Name of the mailbox owner
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the next message; `None` once the mailbox is removed
    pub async fn recv(&self) -> Option<Message> {
        self.receiver.lock().await.recv().await
    }

    /// Returns a queued message without waiting
    pub async fn try_recv(&self) -> Option<Message> {
        self.receiver.lock().await.try_recv().ok()
    }

    /// Whether both handles point at the same mailbox
    pub fn same_mailbox(&self, other: &Inbox) -> bool {
        Arc::ptr_eq(&self.receiver, &other.receiver)
    }
}

/// Handles messages delivered to a listener
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes one message; replies go through `bus`
    async fn handle(&self, bus: &MessageBus, message: Message);
}

/// Which listeners exited on their own during shutdown and which were aborted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Listeners that finished within the join timeout
    pub clean: Vec<String>,
    /// Listeners that had to be aborted
    pub forced: Vec<String>,
    /// Request-reply awaits cancelled after the grace period
    pub cancelled_requests: usize,
}

struct Mailbox {
    sender: mpsc::UnboundedSender<Message>,
    inbox: Inbox,
}

struct Listener {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct BusInner {
    mailboxes: RwLock<HashMap<String, Mailbox>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Message>>>,
    listeners: Mutex<HashMap<String, Listener>>,
    accepting: AtomicBool,
    settled: Notify,
    listener_cancel: CancellationToken,
    request_cancel: CancellationToken,
}

/// In-process message channel shared by the dispatcher and its workers
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    /// Creates a bus with no subscribers
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                mailboxes: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                listeners: Mutex::new(HashMap::new()),
                accepting: AtomicBool::new(true),
                settled: Notify::new(),
                listener_cancel: CancellationToken::new(),
                request_cancel: CancellationToken::new(),
            }),
        }
    }

    /// Returns the inbox for `name`, creating it on first use
    pub async fn subscribe(&self, name: &str) -> Inbox {
        if let Some(mailbox) = self.inner.mailboxes.read().await.get(name) {
            return mailbox.inbox.clone();
        }
        let mut mailboxes = self.inner.mailboxes.write().await;
        mailboxes
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(subscriber = name, "Created mailbox");
                let (sender, receiver) = mpsc::unbounded_channel();
                Mailbox {
                    sender,
                    inbox: Inbox {
                        name: name.to_string(),
                        receiver: Arc::new(AsyncMutex::new(receiver)),
                    },
                }
            })
            .inbox
            .clone()
    }

    /// Removes a mailbox and stops its listener, if any
    pub async fn unsubscribe(&self, name: &str) -> bool {
        let removed = self.inner.mailboxes.write().await.remove(name).is_some();
        if let Some(listener) = self.lock_listeners().remove(name) {
            listener.cancel.cancel();
        }
        if removed {
            debug!(subscriber = name, "Removed mailbox");
        }
        removed
    }

    /// Checks whether `name` has a mailbox
    pub async fn is_subscribed(&self, name: &str) -> bool {
        self.inner.mailboxes.read().await.contains_key(name)
    }

    /// Spawns a listener task feeding `name`'s inbox to `handler`
    ///
    /// Returns `false` without spawning when a listener for `name` is
    /// already running.
    pub async fn listen(&self, name: &str, handler: Arc<dyn MessageHandler>) -> bool {
        let inbox = self.subscribe(name).await;
        let mut listeners = self.lock_listeners();
        if listeners.get(name).map(|l| !l.handle.is_finished()).unwrap_or(false) {
            return false;
        }

        let cancel = self.inner.listener_cancel.child_token();
        let bus = self.clone();
        let token = cancel.clone();
        let listener_name = name.to_string();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    message = inbox.recv() => match message {
                        Some(message) => handler.handle(&bus, message).await,
                        None => break,
                    },
                }
            }
            debug!(listener = %listener_name, "Listener exited");
        });
        listeners.insert(name.to_string(), Listener { cancel, handle });
        true
    }

    /// Delivers a message to its recipient's mailbox
    ///
    /// Returns `false` when the recipient is not subscribed or the bus is
    /// shutting down; the message is dropped in both cases.
    pub async fn publish(&self, message: Message) -> bool {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            warn!(recipient = message.recipient(), message_type = message.message_type(), "Bus is shutting down, dropping message");
            return false;
        }
        self.deliver(message).await
    }

    async fn deliver(&self, message: Message) -> bool {
        let mailboxes = self.inner.mailboxes.read().await;
        match mailboxes.get(message.recipient()) {
            Some(mailbox) => {
                let recipient = message.recipient().to_string();
                if mailbox.sender.send(message).is_err() {
                    warn!(recipient = %recipient, "Mailbox closed, dropping message");
                    return false;
                }
                true
            }
            None => {
                warn!(
                    recipient = message.recipient(),
                    sender = message.sender(),
                    message_type = message.message_type(),
                    "No subscriber for recipient, dropping message"
                );
                false
            }
        }
    }

    /// Publishes `message` and waits up to `wait` for the correlated reply
    ///
    /// The recipient is taken from the message. A timeout, an undeliverable
    /// request or shutdown yields `None`.
    pub async fn request_reply(&self, message: Message, wait: Duration) -> Option<Message> {
        let correlation_id = message.correlation_id().to_string();
        let recipient = message.recipient().to_string();
        let (slot, reply) = oneshot::channel();
        self.lock_pending().insert(correlation_id.clone(), slot);

        if !self.publish(message).await {
            self.release_slot(&correlation_id);
            return None;
        }

        let result = tokio::select! {
            reply = timeout(wait, reply) => match reply {
                Ok(Ok(message)) => Some(message),
                Ok(Err(_)) => None,
                Err(_) => {
                    debug!(recipient = %recipient, correlation_id = %correlation_id, "Request timed out after {:?}", wait);
                    None
                }
            },
            _ = self.inner.request_cancel.cancelled() => {
                debug!(recipient = %recipient, correlation_id = %correlation_id, "Request cancelled by shutdown");
                None
            }
        };
        self.release_slot(&correlation_id);
        result
    }

    /// Sends a reply to `request`
    ///
    /// The reply fills the waiting request-reply slot if there is one,
    /// otherwise it is delivered to the requester's mailbox.
    pub async fn reply(&self, request: &Message, message_type: &str, payload: Map<String, Value>) -> bool {
        let reply = Message::reply_for(request, message_type, payload);
        let slot = self.lock_pending().remove(reply.correlation_id());
        if let Some(slot) = slot {
            self.inner.settled.notify_waiters();
            match slot.send(reply) {
                Ok(()) => return true,
                Err(reply) => return self.deliver(reply).await,
            }
        }
        self.publish(reply).await
    }

    /// Number of request-reply calls currently waiting
    pub fn pending_requests(&self) -> usize {
        self.lock_pending().len()
    }

    /// Stops the bus
    ///
    /// Publishing stops immediately. Listeners keep draining their inboxes
    /// while waiting requests get `grace` to receive their replies; requests
    /// still waiting after that are cancelled. Listeners are then stopped and
    /// given `join_timeout` to exit before they are aborted.
    pub async fn shutdown(&self, grace: Duration, join_timeout: Duration) -> ShutdownReport {
        info!("Shutting down message bus");
        self.inner.accepting.store(false, Ordering::SeqCst);

        let settled = async {
            loop {
                let notified = self.inner.settled.notified();
                if self.pending_requests() == 0 {
                    break;
                }
                notified.await;
            }
        };
        let mut report = ShutdownReport::default();
        if timeout(grace, settled).await.is_err() {
            report.cancelled_requests = self.pending_requests();
            warn!(pending = report.cancelled_requests, "Grace period elapsed, cancelling pending requests");
        }
        self.inner.request_cancel.cancel();
        self.inner.listener_cancel.cancel();

        let listeners: Vec<(String, Listener)> = self.lock_listeners().drain().collect();
        let deadline = Instant::now() + join_timeout;
        for (name, mut listener) in listeners {
            match timeout_at(deadline, &mut listener.handle).await {
                Ok(_) => report.clean.push(name),
                Err(_) => {
                    listener.handle.abort();
                    warn!(listener = %name, "Listener did not exit in time, aborted");
                    report.forced.push(name);
                }
            }
        }
        report.clean.sort();
        report.forced.sort();
        info!(clean = report.clean.len(), forced = report.forced.len(), "Message bus stopped");
        report
    }

    fn release_slot(&self, correlation_id: &str) {
        if self.lock_pending().remove(correlation_id).is_some() {
            self.inner.settled.notify_waiters();
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<Message>>> {
        self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, HashMap<String, Listener>> {
        self.inner.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl MessageHandler for Echo {
        async fn handle(&self, bus: &MessageBus, message: Message) {
            bus.reply(&message, "echo", message.payload().clone()).await;
        }
    }

    struct SlowEcho(Duration);

    #[async_trait]
    impl MessageHandler for SlowEcho {
        async fn handle(&self, bus: &MessageBus, message: Message) {
            tokio::time::sleep(self.0).await;
            bus.reply(&message, "echo", message.payload().clone()).await;
        }
    }

    fn payload(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let bus = MessageBus::new();
        let first = bus.subscribe("worker").await;
        let second = bus.subscribe("worker").await;
        assert!(first.same_mailbox(&second));

        assert!(bus.publish(Message::new("a", "worker", "ping", Map::new())).await);
        let received = second.recv().await.unwrap();
        assert_eq!(received.message_type(), "ping");
        assert!(first.try_recv().await.is_none());
    }

    #[tokio::test]
    async fn test_publish_to_unknown_recipient_is_dropped() {
        let bus = MessageBus::new();
        assert!(!bus.publish(Message::new("a", "nobody", "ping", Map::new())).await);
    }

    #[tokio::test]
    async fn test_request_reply_roundtrip() {
        let bus = MessageBus::new();
        assert!(bus.listen("echo", Arc::new(Echo)).await);
        assert!(!bus.listen("echo", Arc::new(Echo)).await);

        let request = Message::new("dispatcher", "echo", "task", payload(json!({"n": 7})));
        let correlation_id = request.correlation_id().to_string();
        let reply = bus.request_reply(request, Duration::from_secs(1)).await.unwrap();

        assert_eq!(reply.correlation_id(), correlation_id);
        assert_eq!(reply.sender(), "echo");
        assert_eq!(reply.recipient(), "dispatcher");
        assert_eq!(reply.payload()["n"], json!(7));
        assert_eq!(bus.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_request_reply_times_out_quietly() {
        let bus = MessageBus::new();
        let _silent = bus.subscribe("silent").await;

        let started = std::time::Instant::now();
        let reply = bus
            .request_reply(Message::new("dispatcher", "silent", "task", Map::new()), Duration::from_millis(1))
            .await;
        assert!(reply.is_none());
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(bus.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_late_reply_goes_to_requester_inbox() {
        let bus = MessageBus::new();
        let requester = bus.subscribe("dispatcher").await;
        let request = Message::new("dispatcher", "worker", "task", Map::new());
        assert!(bus.reply(&request, "task_result", Map::new()).await);

        let late = requester.recv().await.unwrap();
        assert_eq!(late.correlation_id(), request.correlation_id());
    }

    #[tokio::test]
    async fn test_shutdown_joins_listeners_and_stops_publishing() {
        let bus = MessageBus::new();
        bus.listen("echo", Arc::new(Echo)).await;

        let report = bus.shutdown(Duration::from_millis(10), Duration::from_secs(1)).await;
        assert_eq!(report.clean, vec!["echo".to_string()]);
        assert!(report.forced.is_empty());
        assert!(!bus.publish(Message::new("a", "echo", "ping", Map::new())).await);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_requests_after_grace() {
        let bus = MessageBus::new();
        let _silent = bus.subscribe("silent").await;

        let requester = bus.clone();
        let waiting = tokio::spawn(async move {
            requester
                .request_reply(Message::new("dispatcher", "silent", "task", Map::new()), Duration::from_secs(30))
                .await
        });
        while bus.pending_requests() == 0 {
            tokio::task::yield_now().await;
        }

        let report = bus.shutdown(Duration::from_millis(20), Duration::from_millis(100)).await;
        assert_eq!(report.cancelled_requests, 1);
        assert!(waiting.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_answers_requests_queued_behind_a_slow_handler() {
        let bus = MessageBus::new();
        bus.listen("slow", Arc::new(SlowEcho(Duration::from_millis(30)))).await;

        let mut waiting = Vec::new();
        for n in 0..2 {
            let requester = bus.clone();
            waiting.push(tokio::spawn(async move {
                requester
                    .request_reply(
                        Message::new("dispatcher", "slow", "task", payload(json!({"n": n}))),
                        Duration::from_secs(5),
                    )
                    .await
            }));
        }
        while bus.pending_requests() < 2 {
            tokio::task::yield_now().await;
        }

        let report = bus.shutdown(Duration::from_millis(500), Duration::from_secs(1)).await;
        assert_eq!(report.cancelled_requests, 0);
        assert_eq!(report.clean, vec!["slow".to_string()]);
        for handle in waiting {
            assert!(handle.await.unwrap().is_some());
        }
    }
}
