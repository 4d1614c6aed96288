//! Point-to-point and broadcast messaging between the engine and workers.
//!
//! Delivery is at-least-once: the same [`Message`] (same id) may be delivered
//! more than once, for example when a stop is redelivered to workers that have
//! not finished yet. [`Inbox`] drops duplicates so handling is idempotent.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::errors::{EngineError, EngineResult};

const OBSERVER_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Note,
    /// Stop working immediately
    Stop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub kind: MessageKind,
    /// `None` for broadcasts
    pub recipient: Option<String>,
    pub content: String,
    pub summary: String,
    pub sent_at: DateTime<Utc>,
}

impl Message {
    fn new(kind: MessageKind, recipient: Option<&str>, content: &str, summary: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            recipient: recipient.map(str::to_string),
            content: content.to_string(),
            summary: summary.to_string(),
            sent_at: Utc::now(),
        }
    }

    pub fn is_stop(&self) -> bool {
        self.kind == MessageKind::Stop
    }
}

#[derive(Default)]
struct Registry {
    inboxes: HashMap<String, mpsc::UnboundedSender<Message>>,
}

/// Shared message bus. Cloning shares the same registry.
#[derive(Clone)]
pub struct MessageBus {
    registry: Arc<Mutex<Registry>>,
    observers: broadcast::Sender<Message>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        let (observers, _) = broadcast::channel(OBSERVER_CAPACITY);
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            observers,
        }
    }

    fn registry(&self) -> EngineResult<std::sync::MutexGuard<'_, Registry>> {
        self.registry
            .lock()
            .map_err(|e| EngineError::Other(anyhow::anyhow!("message bus lock poisoned: {}", e)))
    }

    /// Register a recipient and return its inbox. Re-registering replaces
    /// the previous inbox.
    pub fn register(&self, name: &str) -> EngineResult<Inbox> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry()?.inboxes.insert(name.to_string(), tx);
        trace!(recipient = name, "inbox registered");
        Ok(Inbox::new(name, rx))
    }

    pub fn unregister(&self, name: &str) -> EngineResult<()> {
        self.registry()?.inboxes.remove(name);
        Ok(())
    }

    pub fn recipients(&self) -> EngineResult<Vec<String>> {
        let mut names: Vec<String> = self.registry()?.inboxes.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Observe every message sent on the bus (for logging and tests).
    pub fn observe(&self) -> broadcast::Receiver<Message> {
        self.observers.subscribe()
    }

    /// Send a note to one recipient.
    pub fn send(&self, recipient: &str, content: &str, summary: &str) -> EngineResult<Message> {
        let message = Message::new(MessageKind::Note, Some(recipient), content, summary);
        self.deliver_to(recipient, &message)?;
        Ok(message)
    }

    /// Ask one recipient to stop.
    pub fn send_stop(&self, recipient: &str, reason: &str) -> EngineResult<Message> {
        let message = Message::new(MessageKind::Stop, Some(recipient), reason, "stop");
        self.deliver_to(recipient, &message)?;
        Ok(message)
    }

    /// Send a note to every registered recipient.
    pub fn broadcast(&self, content: &str, summary: &str) -> EngineResult<Message> {
        let message = Message::new(MessageKind::Note, None, content, summary);
        self.deliver_all(&message)?;
        Ok(message)
    }

    /// Ask every registered recipient to stop.
    pub fn broadcast_stop(&self, reason: &str) -> EngineResult<Message> {
        let message = Message::new(MessageKind::Stop, None, reason, "stop");
        self.deliver_all(&message)?;
        debug!(id = %message.id, reason, "stop broadcast");
        Ok(message)
    }

    /// Deliver an already-sent message again. Recipients that have gone away
    /// are skipped.
    pub fn redeliver(&self, message: &Message, recipient: &str) -> EngineResult<bool> {
        let registry = self.registry()?;
        Ok(registry
            .inboxes
            .get(recipient)
            .is_some_and(|tx| tx.send(message.clone()).is_ok()))
    }

    fn deliver_to(&self, recipient: &str, message: &Message) -> EngineResult<()> {
        {
            let registry = self.registry()?;
            let tx = registry.inboxes.get(recipient).ok_or_else(|| {
                EngineError::Other(anyhow::anyhow!("Unknown message recipient '{}'", recipient))
            })?;
            // A closed inbox means the worker already exited; nothing to do.
            let _ = tx.send(message.clone());
        }
        let _ = self.observers.send(message.clone());
        Ok(())
    }

    fn deliver_all(&self, message: &Message) -> EngineResult<()> {
        {
            let registry = self.registry()?;
            for tx in registry.inboxes.values() {
                let _ = tx.send(message.clone());
            }
        }
        let _ = self.observers.send(message.clone());
        Ok(())
    }
}

/// Receiving side. Duplicate deliveries of the same message id are dropped.
pub struct Inbox {
    name: String,
    rx: mpsc::UnboundedReceiver<Message>,
    seen: HashSet<Uuid>,
    stop: Option<Message>,
    notes: VecDeque<Message>,
}

impl Inbox {
    fn new(name: &str, rx: mpsc::UnboundedReceiver<Message>) -> Self {
        Self {
            name: name.to_string(),
            rx,
            seen: HashSet::new(),
            stop: None,
            notes: VecDeque::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn accept(&mut self, message: Message) -> Option<Message> {
        if !self.seen.insert(message.id) {
            return None;
        }
        if message.is_stop() && self.stop.is_none() {
            self.stop = Some(message.clone());
        }
        Some(message)
    }

    /// Next unseen message, waiting if necessary. Returns `None` once the bus
    /// side is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        if let Some(note) = self.notes.pop_front() {
            return Some(note);
        }
        while let Some(message) = self.rx.recv().await {
            if let Some(m) = self.accept(message) {
                return Some(m);
            }
        }
        None
    }

    /// Next unseen message without waiting.
    pub fn try_recv(&mut self) -> Option<Message> {
        if let Some(note) = self.notes.pop_front() {
            return Some(note);
        }
        while let Ok(message) = self.rx.try_recv() {
            if let Some(m) = self.accept(message) {
                return Some(m);
            }
        }
        None
    }

    /// Drain pending deliveries and report whether a stop has arrived.
    /// Notes drained here stay queued for `recv`.
    pub fn is_stopped(&mut self) -> bool {
        while let Ok(message) = self.rx.try_recv() {
            if let Some(m) = self.accept(message)
                && !m.is_stop()
            {
                self.notes.push_back(m);
            }
        }
        self.stop.is_some()
    }

    /// Wait until a stop arrives. Notes received meanwhile stay queued.
    /// Pends forever if the bus goes away without a stop.
    pub async fn stopped(&mut self) -> Message {
        loop {
            if let Some(stop) = &self.stop {
                return stop.clone();
            }
            match self.rx.recv().await {
                Some(message) => {
                    if let Some(m) = self.accept(message)
                        && !m.is_stop()
                    {
                        self.notes.push_back(m);
                    }
                }
                None => std::future::pending::<()>().await,
            }
        }
    }
}
