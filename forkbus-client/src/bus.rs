//! In-process publish/subscribe bus.
//!
//! A [`Bus`] owns the registry of named topics inside one process. Local
//! resources publish and subscribe through typed [`Topic`] handles; the
//! bus reports subscription lifecycle (`ON`/`OFF`) and published values
//! (`OUT`) through a signal callback so a transport can mirror them across
//! the process boundary, and accepts inbound values (`IN`) via
//! [`Bus::deliver`].
//!
//! Activation is reference counted per topic name: the first local
//! subscriber emits exactly one `ON`, the last one to leave emits exactly
//! one `OFF`. Both signals are emitted while the registry lock is held, so
//! the transport observes them in the same order the registry changed.
//!
//! # Example
//!
//! ```rust,ignore
//! let (bus, mut signals) = Bus::channel();
//! let jobs = bus.topic("jobs", Schema::<Job>::new());
//!
//! let mut sub = jobs.subscribe();          // emits ON
//! jobs.publish(&Job { id: 1 });            // emits OUT
//! bus.deliver(&TopicEvent::inbound("jobs", json!({"id": 2})));
//! assert_eq!(sub.next().await, Some(Job { id: 2 }));
//! drop(sub);                               // emits OFF
//! ```

use crate::stream::EventStream;
use crate::topic::{TopicEvent, TopicSignal};
use futures::Stream;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, warn};

type SignalFn = dyn Fn(TopicEvent) + Send + Sync;
type Validator<T> = dyn Fn(&T) -> Result<(), String> + Send + Sync;

/// The declared shape of a topic's values.
///
/// The value type gives the structural check (serde); an optional
/// predicate adds value-level rules.
pub struct Schema<T> {
    validator: Option<Arc<Validator<T>>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Schema<T> {
    /// A schema accepting every value of `T`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            validator: None,
            _marker: PhantomData,
        }
    }

    /// Add a validation predicate.
    #[must_use]
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&T) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Run the predicate, if any.
    ///
    /// # Errors
    ///
    /// Returns the predicate's rejection message.
    pub fn validate(&self, value: &T) -> Result<(), String> {
        self.validator.as_ref().map_or(Ok(()), |validate| validate(value))
    }
}

impl<T: DeserializeOwned> Schema<T> {
    /// Deserialize and validate an inbound value.
    fn decode(&self, value: Value) -> Result<T, String> {
        let typed: T = serde_json::from_value(value).map_err(|e| e.to_string())?;
        self.validate(&typed)?;
        Ok(typed)
    }
}

impl<T> Default for Schema<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Schema<T> {
    fn clone(&self) -> Self {
        Self {
            validator: self.validator.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Schema<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("type", &std::any::type_name::<T>())
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

struct TopicSlot {
    queue: Option<String>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<Value>>,
}

#[derive(Default)]
struct Registry {
    topics: HashMap<String, TopicSlot>,
    next_id: u64,
    closed: bool,
}

struct BusInner {
    on_signal: Box<SignalFn>,
    registry: Mutex<Registry>,
}

impl BusInner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        // Registry updates are single statements; a poisoned lock still
        // holds a consistent map.
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn attach(&self, name: &str, queue: Option<&str>) -> (Option<u64>, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.registry();
        if registry.closed {
            return (None, rx);
        }

        let id = registry.next_id;
        registry.next_id += 1;

        let slot = registry
            .topics
            .entry(name.to_string())
            .or_insert_with(|| TopicSlot {
                queue: queue.map(ToString::to_string),
                subscribers: HashMap::new(),
            });
        let first = slot.subscribers.is_empty();
        slot.subscribers.insert(id, tx);

        if first {
            debug!(topic = %name, queue = ?slot.queue, "topic activated");
            (self.on_signal)(TopicEvent::on(name, slot.queue.clone()));
        }
        (Some(id), rx)
    }

    fn detach(&self, name: &str, id: u64) {
        let mut registry = self.registry();
        let Some(slot) = registry.topics.get_mut(name) else {
            return;
        };
        if slot.subscribers.remove(&id).is_some() && slot.subscribers.is_empty() {
            registry.topics.remove(name);
            debug!(topic = %name, "topic deactivated");
            (self.on_signal)(TopicEvent::off(name));
        }
    }
}

/// Per-process topic registry.
///
/// Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    /// Create a bus reporting `ON`, `OFF` and `OUT` through `on_signal`.
    ///
    /// The callback runs synchronously, sometimes with the registry lock
    /// held. It must not call back into the bus.
    pub fn new<F>(on_signal: F) -> Self
    where
        F: Fn(TopicEvent) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(BusInner {
                on_signal: Box::new(on_signal),
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    /// Create a bus whose signals are queued on a stream.
    #[must_use]
    pub fn channel() -> (Self, EventStream<TopicEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let bus = Self::new(move |signal| {
            // A dropped signal stream just means nobody mirrors this bus.
            let _ = tx.send(signal);
        });
        (bus, EventStream::new(rx))
    }

    /// A handle on the topic `name` carrying values of `T`.
    pub fn topic<T>(&self, name: impl Into<String>, schema: Schema<T>) -> Topic<T>
    where
        T: Serialize + DeserializeOwned,
    {
        Topic {
            name: name.into(),
            queue: None,
            schema,
            bus: self.clone(),
        }
    }

    /// Fan an `IN` value out to every local subscriber of its topic.
    ///
    /// Other signals and unknown topics are ignored. Returns the number of
    /// subscribers reached.
    pub fn deliver(&self, event: &TopicEvent) -> usize {
        if event.signal() != TopicSignal::In {
            return 0;
        }
        let Some(value) = event.data() else {
            return 0;
        };

        let registry = self.inner.registry();
        let Some(slot) = registry.topics.get(event.sub()) else {
            return 0;
        };
        slot.subscribers
            .values()
            .filter(|tx| tx.send(value.clone()).is_ok())
            .count()
    }

    /// Complete every subscription and refuse new ones.
    ///
    /// Each active topic emits its `OFF`. Later subscriptions end
    /// immediately and emit nothing.
    pub fn close(&self) {
        let mut registry = self.inner.registry();
        if registry.closed {
            return;
        }
        registry.closed = true;

        let mut names: Vec<String> = registry.topics.keys().cloned().collect();
        names.sort();
        registry.topics.clear();
        for name in names {
            (self.inner.on_signal)(TopicEvent::off(name));
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.registry().closed
    }

    /// Names of the topics that currently have local subscribers.
    #[must_use]
    pub fn active_topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.registry().topics.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of local subscribers of `name`.
    #[must_use]
    pub fn subscriber_count(&self, name: &str) -> usize {
        self.inner
            .registry()
            .topics
            .get(name)
            .map_or(0, |slot| slot.subscribers.len())
    }

    fn emit(&self, signal: TopicEvent) {
        (self.inner.on_signal)(signal);
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("active_topics", &self.active_topics())
            .finish()
    }
}

/// A typed handle on one named topic.
pub struct Topic<T> {
    name: String,
    queue: Option<String>,
    schema: Schema<T>,
    bus: Bus,
}

impl<T> Clone for Topic<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            queue: self.queue.clone(),
            schema: self.schema.clone(),
            bus: self.bus.clone(),
        }
    }
}

impl<T> fmt::Debug for Topic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("queue", &self.queue)
            .field("schema", &self.schema)
            .finish()
    }
}

impl<T> Topic<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Request competing-consumer delivery within `queue`.
    ///
    /// Takes effect when this handle's subscription activates the topic.
    #[must_use]
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    /// Publish a value. Never fails: an invalid value is dropped with a
    /// warning.
    ///
    /// Returns whether the value was emitted.
    pub fn publish(&self, value: &T) -> bool {
        if let Err(reason) = self.schema.validate(value) {
            warn!(topic = %self.name, %reason, "dropping publish that failed validation");
            return false;
        }
        match serde_json::to_value(value) {
            Ok(data) => {
                self.bus.emit(TopicEvent::outbound(self.name.clone(), data));
                true
            }
            Err(e) => {
                warn!(topic = %self.name, error = %e, "dropping publish that failed to serialize");
                false
            }
        }
    }

    /// Attach a local subscriber.
    pub fn subscribe(&self) -> Subscription<T> {
        let (id, receiver) = self.bus.inner.attach(&self.name, self.queue.as_deref());
        Subscription {
            name: self.name.clone(),
            id,
            receiver,
            schema: self.schema.clone(),
            bus: self.bus.clone(),
        }
    }
}

/// A live subscription to one topic.
///
/// Dropping it unsubscribes.
pub struct Subscription<T> {
    name: String,
    id: Option<u64>,
    receiver: mpsc::UnboundedReceiver<Value>,
    schema: Schema<T>,
    bus: Bus,
}

impl<T: DeserializeOwned> Subscription<T> {
    /// Receive the next valid value.
    ///
    /// Values that fail to deserialize or validate are skipped with a
    /// warning. Returns `None` after unsubscribing or when the bus closes.
    pub async fn next(&mut self) -> Option<T> {
        loop {
            let value = self.receiver.recv().await?;
            if let Some(typed) = self.accept(value) {
                return Some(typed);
            }
        }
    }

    fn accept(&self, value: Value) -> Option<T> {
        match self.schema.decode(value) {
            Ok(typed) => Some(typed),
            Err(reason) => {
                warn!(topic = %self.name, %reason, "skipping inbound value that failed validation");
                None
            }
        }
    }
}

impl<T> Subscription<T> {
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.name
    }

    /// Detach from the topic. Safe to call more than once.
    pub fn unsubscribe(&mut self) {
        if let Some(id) = self.id.take() {
            self.bus.inner.detach(&self.name, id);
        }
        self.receiver.close();
    }
}

impl<T: DeserializeOwned> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        loop {
            match this.receiver.poll_recv(cx) {
                Poll::Ready(Some(value)) => {
                    if let Some(typed) = this.accept(value) {
                        return Poll::Ready(Some(typed));
                    }
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.name)
            .field("active", &self.id.is_some())
            .finish()
    }
}
