//! Pub/sub transport abstraction.
//!
//! The engine only needs publish, subscribe and a connection-lost signal.
//! [`MemoryBroker`] is a deterministic in-process broker: publishing enqueues,
//! and [`MemoryBroker::pump`] delivers queued messages in order.

use crate::config::PublishMode;
use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use songsync_protocol::{QoS, TopicFilter};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

/// Callback for messages arriving on a subscription: `(topic, payload)`.
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Callback invoked with a cause when the connection drops.
pub type ConnectionLostHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Identifier of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// A pub/sub transport handles communication with the broker.
///
/// Implementations deliver messages from their own dispatch context;
/// handlers must not assume any particular thread.
pub trait PubSubTransport: Send + Sync {
    /// Publishes a payload. An empty retained payload clears the retained
    /// message of the topic.
    fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retained: bool) -> SyncResult<()>;

    /// Subscribes `handler` to every topic matching `filter`.
    fn subscribe(
        &self,
        filter: &TopicFilter,
        qos: QoS,
        handler: MessageHandler,
    ) -> SyncResult<SubscriptionId>;

    /// Removes a subscription.
    fn unsubscribe(&self, id: SubscriptionId) -> SyncResult<()>;

    /// Registers a connection-lost callback.
    fn on_connection_lost(&self, handler: ConnectionLostHandler);

    /// Client ID of this connection.
    fn client_id(&self) -> &str;

    /// Checks if the transport is connected.
    fn is_connected(&self) -> bool;
}

/// A message waiting in the broker queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    /// Topic the message was published on.
    pub topic: String,
    /// Payload bytes.
    pub payload: Vec<u8>,
    target: Option<SubscriptionId>,
}

impl QueuedMessage {
    /// Creates a message for every matching subscriber.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            target: None,
        }
    }
}

struct Subscription {
    id: SubscriptionId,
    client: String,
    filter: TopicFilter,
    handler: MessageHandler,
}

#[derive(Default)]
struct BrokerState {
    subscriptions: Vec<Subscription>,
    retained: BTreeMap<String, Vec<u8>>,
    queue: VecDeque<QueuedMessage>,
    disconnected: Vec<String>,
    connection_lost: Vec<(String, ConnectionLostHandler)>,
}

/// An in-memory broker shared by several [`MemoryTransport`] clients.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryBroker {
    /// Creates an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects a new client.
    pub fn client(&self, client_id: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            broker: self.clone(),
            client_id: client_id.into(),
        }
    }

    /// Delivers queued messages, including messages published while
    /// delivering, until the queue is empty. Returns the number of messages
    /// processed.
    pub fn pump(&self) -> usize {
        let mut count = 0;
        while self.pump_one() {
            count += 1;
        }
        count
    }

    /// Delivers the next queued message. Returns false if the queue was empty.
    pub fn pump_one(&self) -> bool {
        let (message, handlers) = {
            let mut state = self.state.lock();
            let Some(message) = state.queue.pop_front() else {
                return false;
            };
            let handlers: Vec<MessageHandler> = state
                .subscriptions
                .iter()
                .filter(|s| !state.disconnected.contains(&s.client))
                .filter(|s| match message.target {
                    Some(target) => s.id == target,
                    None => s.filter.matches(&message.topic),
                })
                .map(|s| Arc::clone(&s.handler))
                .collect();
            (message, handlers)
        };

        for handler in handlers {
            handler(&message.topic, &message.payload);
        }
        true
    }

    /// Number of queued messages.
    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Removes and returns every queued message.
    pub fn take_queue(&self) -> Vec<QueuedMessage> {
        self.state.lock().queue.drain(..).collect()
    }

    /// Appends a message to the queue without touching retained state.
    pub fn inject(&self, message: QueuedMessage) {
        self.state.lock().queue.push_back(message);
    }

    /// Returns the retained payload of a topic.
    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.state.lock().retained.get(topic).cloned()
    }

    /// Simulates a dropped connection for one client: its subscriptions stop
    /// receiving and its connection-lost handlers fire.
    pub fn disconnect(&self, client_id: &str, cause: &str) {
        let handlers: Vec<ConnectionLostHandler> = {
            let mut state = self.state.lock();
            if !state.disconnected.iter().any(|c| c == client_id) {
                state.disconnected.push(client_id.to_string());
            }
            state
                .connection_lost
                .iter()
                .filter(|(c, _)| c == client_id)
                .map(|(_, h)| Arc::clone(h))
                .collect()
        };
        for handler in handlers {
            handler(cause);
        }
    }

    /// Reconnects a client dropped by [`MemoryBroker::disconnect`]. Retained
    /// messages are redelivered to its subscriptions.
    pub fn reconnect(&self, client_id: &str) {
        let mut state = self.state.lock();
        state.disconnected.retain(|c| c != client_id);
        let redeliver: Vec<QueuedMessage> = state
            .subscriptions
            .iter()
            .filter(|s| s.client == client_id)
            .flat_map(|s| Self::retained_for(&state.retained, s))
            .collect();
        state.queue.extend(redeliver);
    }

    fn retained_for(retained: &BTreeMap<String, Vec<u8>>, sub: &Subscription) -> Vec<QueuedMessage> {
        retained
            .iter()
            .filter(|(topic, _)| sub.filter.matches(topic))
            .map(|(topic, payload)| QueuedMessage {
                topic: topic.clone(),
                payload: payload.clone(),
                target: Some(sub.id),
            })
            .collect()
    }
}

/// A client connection to a [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryTransport {
    broker: MemoryBroker,
    client_id: String,
}

impl MemoryTransport {
    /// Returns the broker this client is connected to.
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}

impl PubSubTransport for MemoryTransport {
    fn publish(&self, topic: &str, payload: &[u8], _qos: QoS, retained: bool) -> SyncResult<()> {
        let mut state = self.broker.state.lock();
        if state.disconnected.contains(&self.client_id) {
            return Err(SyncError::NotConnected);
        }
        if retained {
            if payload.is_empty() {
                state.retained.remove(topic);
            } else {
                state.retained.insert(topic.to_string(), payload.to_vec());
            }
        }
        state.queue.push_back(QueuedMessage::new(topic, payload));
        Ok(())
    }

    fn subscribe(
        &self,
        filter: &TopicFilter,
        _qos: QoS,
        handler: MessageHandler,
    ) -> SyncResult<SubscriptionId> {
        let id = SubscriptionId(self.broker.next_id.fetch_add(1, Ordering::SeqCst));
        let subscription = Subscription {
            id,
            client: self.client_id.clone(),
            filter: filter.clone(),
            handler,
        };

        let mut state = self.broker.state.lock();
        if state.disconnected.contains(&self.client_id) {
            return Err(SyncError::NotConnected);
        }
        let retained = MemoryBroker::retained_for(&state.retained, &subscription);
        state.queue.extend(retained);
        state.subscriptions.push(subscription);
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> SyncResult<()> {
        self.broker.state.lock().subscriptions.retain(|s| s.id != id);
        Ok(())
    }

    fn on_connection_lost(&self, handler: ConnectionLostHandler) {
        self.broker
            .state
            .lock()
            .connection_lost
            .push((self.client_id.clone(), handler));
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn is_connected(&self) -> bool {
        !self.broker.state.lock().disconnected.contains(&self.client_id)
    }
}

struct PublishJob {
    topic: String,
    payload: Vec<u8>,
    qos: QoS,
    retained: bool,
}

/// Fire-and-forget publisher in front of a transport.
///
/// In [`PublishMode::Background`] jobs are handed to a dedicated worker
/// thread in submission order, so a slow broker never blocks the caller.
/// Failures are logged, never returned.
pub struct Publisher {
    transport: Arc<dyn PubSubTransport>,
    worker: Option<mpsc::Sender<PublishJob>>,
}

impl Publisher {
    /// Creates a publisher.
    pub fn new(transport: Arc<dyn PubSubTransport>, mode: PublishMode) -> Self {
        let worker = match mode {
            PublishMode::Inline => None,
            PublishMode::Background => Self::spawn_worker(Arc::clone(&transport)),
        };
        Self { transport, worker }
    }

    fn spawn_worker(transport: Arc<dyn PubSubTransport>) -> Option<mpsc::Sender<PublishJob>> {
        let (tx, rx) = mpsc::channel::<PublishJob>();
        let spawned = thread::Builder::new()
            .name("songsync-publish".into())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    Self::send(transport.as_ref(), &job);
                }
                debug!("publish worker stopped");
            });
        match spawned {
            Ok(_) => Some(tx),
            Err(e) => {
                warn!(error = %e, "could not start publish worker, publishing inline");
                None
            }
        }
    }

    fn send(transport: &dyn PubSubTransport, job: &PublishJob) {
        if let Err(e) = transport.publish(&job.topic, &job.payload, job.qos, job.retained) {
            warn!(topic = %job.topic, error = %e, retryable = e.is_retryable(), "publish failed");
        }
    }

    /// Publishes without waiting for the broker.
    pub fn publish(&self, topic: String, payload: Vec<u8>, qos: QoS, retained: bool) {
        let job = PublishJob {
            topic,
            payload,
            qos,
            retained,
        };
        match &self.worker {
            Some(worker) => {
                if let Err(mpsc::SendError(job)) = worker.send(job) {
                    Self::send(self.transport.as_ref(), &job);
                }
            }
            None => Self::send(self.transport.as_ref(), &job),
        }
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Arc<dyn PubSubTransport> {
        &self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn collector() -> (MessageHandler, Arc<Mutex<Vec<(String, Vec<u8>)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: MessageHandler = Arc::new(move |topic: &str, payload: &[u8]| {
            sink.lock().push((topic.to_string(), payload.to_vec()));
        });
        (handler, seen)
    }

    #[test]
    fn publish_is_queued_until_pumped() {
        let broker = MemoryBroker::new();
        let a = broker.client("a");
        let (handler, seen) = collector();
        a.subscribe(&TopicFilter::new("x/+"), QoS::AtLeastOnce, handler).unwrap();

        a.publish("x/1", b"one", QoS::AtLeastOnce, false).unwrap();
        a.publish("y/1", b"ignored", QoS::AtLeastOnce, false).unwrap();
        assert!(seen.lock().is_empty());
        assert_eq!(broker.pending(), 2);

        assert_eq!(broker.pump(), 2);
        assert_eq!(seen.lock().as_slice(), &[("x/1".to_string(), b"one".to_vec())]);
    }

    #[test]
    fn retained_messages_reach_late_subscribers() {
        let broker = MemoryBroker::new();
        let a = broker.client("a");
        a.publish("head", b"5", QoS::ExactlyOnce, true).unwrap();
        broker.pump();

        let b = broker.client("b");
        let (handler, seen) = collector();
        b.subscribe(&TopicFilter::new("head"), QoS::ExactlyOnce, handler).unwrap();
        broker.pump();
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(broker.retained("head"), Some(b"5".to_vec()));

        a.publish("head", b"", QoS::ExactlyOnce, true).unwrap();
        assert_eq!(broker.retained("head"), None);
    }

    #[test]
    fn disconnect_blocks_delivery_and_fires_handlers() {
        let broker = MemoryBroker::new();
        let a = broker.client("a");
        let lost = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lost);
        a.on_connection_lost(Arc::new(move |cause: &str| sink.lock().push(cause.to_string())));
        let (handler, seen) = collector();
        a.subscribe(&TopicFilter::new("t"), QoS::AtMostOnce, handler).unwrap();

        broker.disconnect("a", "network down");
        assert!(!a.is_connected());
        assert_eq!(lost.lock().as_slice(), &["network down".to_string()]);
        assert!(matches!(
            a.publish("t", b"x", QoS::AtMostOnce, false),
            Err(SyncError::NotConnected)
        ));

        broker.client("b").publish("t", b"y", QoS::AtMostOnce, true).unwrap();
        broker.pump();
        assert!(seen.lock().is_empty());

        broker.reconnect("a");
        broker.pump();
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn background_publisher_delivers_in_order() {
        let broker = MemoryBroker::new();
        let transport: Arc<dyn PubSubTransport> = Arc::new(broker.client("a"));
        let publisher = Publisher::new(transport, PublishMode::Background);
        for i in 0..10 {
            publisher.publish("t".into(), vec![i], QoS::AtLeastOnce, false);
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while broker.pending() < 10 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let payloads: Vec<u8> = broker.take_queue().into_iter().map(|m| m.payload[0]).collect();
        assert_eq!(payloads, (0..10).collect::<Vec<u8>>());
    }

    #[test]
    fn inline_publisher_swallows_errors() {
        let broker = MemoryBroker::new();
        let client = broker.client("a");
        broker.disconnect("a", "gone");
        let publisher = Publisher::new(Arc::new(client), PublishMode::Inline);
        publisher.publish("t".into(), b"x".to_vec(), QoS::AtMostOnce, false);
        assert_eq!(broker.pending(), 0);
    }
}
