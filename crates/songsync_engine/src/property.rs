//! Typed values bound to pub/sub topics.
//!
//! A [`SyncedProperty`] holds an optional value. Local `set` calls update the
//! value, notify `on_change` listeners and publish. Messages on the
//! subscription are decoded, filtered through the accept predicate and the
//! equality check, and then update the value and notify both `on_change`
//! and `on_remote_change` listeners without publishing again.
//!
//! An empty payload decodes to `None`, which is how retained values are
//! cleared.

use crate::error::SyncResult;
use crate::transport::{MessageHandler, PubSubTransport, Publisher, SubscriptionId};
use parking_lot::Mutex;
use songsync_protocol::TopicSpec;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{trace, warn};

/// Change listener: new value and the wildcard arguments of the topic.
pub type Listener<T> = Arc<dyn Fn(Option<&T>, &[String]) + Send + Sync>;

type EncodeFn<T> = Arc<dyn Fn(&T) -> SyncResult<Vec<u8>> + Send + Sync>;
type DecodeFn<T> = Arc<dyn Fn(&[u8]) -> SyncResult<T> + Send + Sync>;
type EqualityFn<T> = Arc<dyn Fn(Option<&T>, Option<&T>) -> bool + Send + Sync>;
type AcceptFn<T> = Arc<dyn Fn(Option<&T>, Option<&T>) -> bool + Send + Sync>;

/// Identifier returned when registering a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Encode/decode pair for a property type.
pub struct PropertyCodec<T> {
    encode: EncodeFn<T>,
    decode: DecodeFn<T>,
}

impl<T> Clone for PropertyCodec<T> {
    fn clone(&self) -> Self {
        Self {
            encode: Arc::clone(&self.encode),
            decode: Arc::clone(&self.decode),
        }
    }
}

impl<T> PropertyCodec<T> {
    /// Creates a codec from an encoder and a decoder.
    pub fn new<E, D>(encode: E, decode: D) -> Self
    where
        E: Fn(&T) -> SyncResult<Vec<u8>> + Send + Sync + 'static,
        D: Fn(&[u8]) -> SyncResult<T> + Send + Sync + 'static,
    {
        Self {
            encode: Arc::new(encode),
            decode: Arc::new(decode),
        }
    }
}

/// Builder for [`SyncedProperty`].
pub struct PropertyBuilder<T> {
    name: String,
    codec: PropertyCodec<T>,
    initial: Option<T>,
    subscribe: Option<TopicSpec>,
    publish: Option<TopicSpec>,
    equality: Option<EqualityFn<T>>,
    accept: Option<AcceptFn<T>>,
}

impl<T> PropertyBuilder<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Subscribes to the given topic.
    pub fn subscribe_to(mut self, spec: TopicSpec) -> Self {
        self.subscribe = Some(spec);
        self
    }

    /// Publishes local changes to the given topic.
    pub fn publish_to(mut self, spec: TopicSpec) -> Self {
        self.publish = Some(spec);
        self
    }

    /// Subscribes to and publishes on the same topic.
    pub fn bind(self, spec: TopicSpec) -> Self {
        self.subscribe_to(spec.clone()).publish_to(spec)
    }

    /// Sets the initial value, published on connect.
    pub fn initial(mut self, value: T) -> Self {
        self.initial = Some(value);
        self
    }

    /// Replaces the equality check used to suppress unchanged updates.
    pub fn with_equality<F>(mut self, equality: F) -> Self
    where
        F: Fn(Option<&T>, Option<&T>) -> bool + Send + Sync + 'static,
    {
        self.equality = Some(Arc::new(equality));
        self
    }

    /// Treats every update as a change. Used for event-like channels where
    /// two equal messages are still two messages.
    pub fn never_equal(self) -> Self {
        self.with_equality(|_, _| false)
    }

    /// Only takes remote values for which `accept(current, incoming)` holds.
    pub fn accept_if<F>(mut self, accept: F) -> Self
    where
        F: Fn(Option<&T>, Option<&T>) -> bool + Send + Sync + 'static,
    {
        self.accept = Some(Arc::new(accept));
        self
    }

    /// Builds the property. Nothing is subscribed until
    /// [`SyncedProperty::connect`] is called.
    pub fn build(self, transport: Arc<dyn PubSubTransport>, publisher: Arc<Publisher>) -> SyncedProperty<T> {
        let equality: EqualityFn<T> = match self.equality {
            Some(equality) => equality,
            None => Arc::new(|a: Option<&T>, b: Option<&T>| a == b),
        };
        SyncedProperty {
            inner: Arc::new(Inner {
                name: self.name,
                codec: self.codec,
                value: Mutex::new(self.initial),
                subscribe: self.subscribe,
                publish: self.publish,
                equality,
                accept: self.accept,
                transport,
                publisher,
                subscription: Mutex::new(None),
                on_change: Mutex::new(Vec::new()),
                on_remote_change: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }
}

struct Inner<T> {
    name: String,
    codec: PropertyCodec<T>,
    value: Mutex<Option<T>>,
    subscribe: Option<TopicSpec>,
    publish: Option<TopicSpec>,
    equality: EqualityFn<T>,
    accept: Option<AcceptFn<T>>,
    transport: Arc<dyn PubSubTransport>,
    publisher: Arc<Publisher>,
    subscription: Mutex<Option<SubscriptionId>>,
    on_change: Mutex<Vec<(ListenerId, Listener<T>)>>,
    on_remote_change: Mutex<Vec<(ListenerId, Listener<T>)>>,
    next_listener: AtomicU64,
}

/// A typed value synchronized over pub/sub.
pub struct SyncedProperty<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for SyncedProperty<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for SyncedProperty<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncedProperty")
            .field("name", &self.inner.name)
            .field("subscribe", &self.inner.subscribe.as_ref().map(|s| s.filter.as_str()))
            .field("publish", &self.inner.publish.as_ref().map(|s| s.filter.as_str()))
            .finish()
    }
}

impl<T> SyncedProperty<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Starts building a property.
    pub fn builder(name: impl Into<String>, codec: PropertyCodec<T>) -> PropertyBuilder<T> {
        PropertyBuilder {
            name: name.into(),
            codec,
            initial: None,
            subscribe: None,
            publish: None,
            equality: None,
            accept: None,
        }
    }

    /// Name used in logs.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Publishes a non-empty initial value and subscribes.
    pub fn connect(&self) -> SyncResult<()> {
        if let Some(value) = self.get() {
            self.publish_value(Some(&value), &[]);
        }
        let Some(spec) = &self.inner.subscribe else {
            return Ok(());
        };
        let mut subscription = self.inner.subscription.lock();
        if subscription.is_some() {
            return Ok(());
        }

        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        let handler: MessageHandler = Arc::new(move |topic: &str, payload: &[u8]| {
            if let Some(inner) = weak.upgrade() {
                SyncedProperty { inner }.on_message(topic, payload);
            }
        });
        *subscription = Some(self.inner.transport.subscribe(&spec.filter, spec.qos, handler)?);
        trace!(property = %self.inner.name, filter = %spec.filter, "subscribed");
        Ok(())
    }

    /// Removes the subscription. Listeners stay registered.
    pub fn disconnect(&self) -> SyncResult<()> {
        if let Some(id) = self.inner.subscription.lock().take() {
            self.inner.transport.unsubscribe(id)?;
        }
        Ok(())
    }

    /// Returns the current value.
    pub fn get(&self) -> Option<T> {
        self.inner.value.lock().clone()
    }

    /// Sets the value locally, notifies `on_change` listeners and publishes.
    ///
    /// `args` fill the wildcards of the publish topic. Returns false if the
    /// value was equal to the current one and nothing happened.
    pub fn set(&self, value: Option<T>, args: &[&str]) -> bool {
        {
            let mut current = self.inner.value.lock();
            if (self.inner.equality)(current.as_ref(), value.as_ref()) {
                return false;
            }
            *current = value.clone();
        }
        let owned: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.notify(&self.inner.on_change, value.as_ref(), &owned);
        self.publish_value(value.as_ref(), args);
        true
    }

    /// Publishes a value without storing it. The value takes effect when the
    /// broker echoes it back on the subscription.
    pub fn publish(&self, value: &T, args: &[&str]) {
        self.publish_value(Some(value), args);
    }

    fn publish_value(&self, value: Option<&T>, args: &[&str]) {
        let Some(spec) = &self.inner.publish else {
            return;
        };
        let topic = match spec.filter.render(args) {
            Ok(topic) => topic,
            Err(e) => {
                warn!(property = %self.inner.name, error = %e, "cannot render publish topic");
                return;
            }
        };
        let payload = match value {
            Some(value) => match (self.inner.codec.encode)(value) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(property = %self.inner.name, error = %e, "cannot encode value");
                    return;
                }
            },
            None => Vec::new(),
        };
        self.inner.publisher.publish(topic, payload, spec.qos, spec.retained);
    }

    fn on_message(&self, topic: &str, payload: &[u8]) {
        let args = self
            .inner
            .subscribe
            .as_ref()
            .and_then(|spec| spec.filter.wildcard_args(topic))
            .unwrap_or_default();

        let incoming = if payload.is_empty() {
            None
        } else {
            match (self.inner.codec.decode)(payload) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(property = %self.inner.name, topic, error = %e, "dropping undecodable message");
                    return;
                }
            }
        };

        {
            let mut current = self.inner.value.lock();
            if let Some(accept) = &self.inner.accept {
                if !accept(current.as_ref(), incoming.as_ref()) {
                    trace!(property = %self.inner.name, topic, "message not accepted");
                    return;
                }
            }
            if (self.inner.equality)(current.as_ref(), incoming.as_ref()) {
                return;
            }
            *current = incoming.clone();
        }

        self.notify(&self.inner.on_change, incoming.as_ref(), &args);
        self.notify(&self.inner.on_remote_change, incoming.as_ref(), &args);
    }

    fn notify(&self, listeners: &Mutex<Vec<(ListenerId, Listener<T>)>>, value: Option<&T>, args: &[String]) {
        let snapshot: Vec<Listener<T>> = listeners.lock().iter().map(|(_, l)| Arc::clone(l)).collect();
        for listener in snapshot {
            listener(value, args);
        }
    }

    fn add(&self, listeners: &Mutex<Vec<(ListenerId, Listener<T>)>>, listener: Listener<T>) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::SeqCst));
        listeners.lock().push((id, listener));
        id
    }

    /// Registers a listener for every change, local or remote.
    pub fn on_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(Option<&T>, &[String]) + Send + Sync + 'static,
    {
        self.add(&self.inner.on_change, Arc::new(listener))
    }

    /// Registers a listener for changes that arrived from the broker.
    pub fn on_remote_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(Option<&T>, &[String]) + Send + Sync + 'static,
    {
        self.add(&self.inner.on_remote_change, Arc::new(listener))
    }

    /// Removes a listener registered with either method.
    pub fn remove_listener(&self, id: ListenerId) {
        self.inner.on_change.lock().retain(|(l, _)| *l != id);
        self.inner.on_remote_change.lock().retain(|(l, _)| *l != id);
    }

    /// Removes every listener.
    pub fn clear_listeners(&self) {
        self.inner.on_change.lock().clear();
        self.inner.on_remote_change.lock().clear();
    }
}

/// Codecs for common property types.
pub mod codecs {
    use super::PropertyCodec;
    use crate::error::SyncError;
    use songsync_protocol::{
        from_cbor, to_cbor, ChangeReject, Document, FileRequest, FileSetResponse, Health, Patch,
        PatchRequest, PatchVersion, Position, ProtocolError,
    };

    /// Version tuples in their comma form.
    pub fn version() -> PropertyCodec<PatchVersion> {
        PropertyCodec::new(|v: &PatchVersion| Ok(v.to_bytes()), |b| Ok(PatchVersion::from_bytes(b)?))
    }

    /// CBOR patch payloads.
    pub fn patch() -> PropertyCodec<Patch> {
        PropertyCodec::new(|p: &Patch| Ok(p.encode()?), |b| Ok(Patch::decode(b)?))
    }

    /// Bare patch IDs.
    pub fn reject() -> PropertyCodec<ChangeReject> {
        PropertyCodec::new(|r: &ChangeReject| Ok(r.to_bytes()), |b| Ok(ChangeReject::from_bytes(b)?))
    }

    /// Decimal sequence requests.
    pub fn request() -> PropertyCodec<PatchRequest> {
        PropertyCodec::new(|r: &PatchRequest| Ok(r.to_bytes()), |b| Ok(PatchRequest::from_bytes(b)?))
    }

    /// `online` / `offline`.
    pub fn health() -> PropertyCodec<Health> {
        PropertyCodec::new(|h: &Health| Ok(h.as_str().as_bytes().to_vec()), |b| Ok(Health::from_bytes(b)?))
    }

    /// CBOR documents.
    pub fn document() -> PropertyCodec<Document> {
        PropertyCodec::new(|d: &Document| Ok(to_cbor(d)?), |b| Ok(from_cbor(b)?))
    }

    /// `document,part,line`.
    pub fn position() -> PropertyCodec<Position> {
        PropertyCodec::new(|p: &Position| Ok(p.to_bytes()), |b| Ok(Position::from_bytes(b)?))
    }

    /// `true` / `false`.
    pub fn boolean() -> PropertyCodec<bool> {
        PropertyCodec::new(
            |v: &bool| Ok(v.to_string().into_bytes()),
            |b| match std::str::from_utf8(b).map(str::trim) {
                Ok("true") => Ok(true),
                Ok("false") => Ok(false),
                _ => Err(SyncError::Protocol(ProtocolError::DecodingFailed {
                    message: "expected true or false".into(),
                })),
            },
        )
    }

    /// Blob requests by file name.
    pub fn file_request() -> PropertyCodec<FileRequest> {
        PropertyCodec::new(|r: &FileRequest| Ok(r.to_bytes()), |b| Ok(FileRequest::from_bytes(b)?))
    }

    /// CBOR upload results.
    pub fn file_set_response() -> PropertyCodec<FileSetResponse> {
        PropertyCodec::new(|r: &FileSetResponse| Ok(r.encode()?), |b| Ok(FileSetResponse::decode(b)?))
    }

    /// Raw bytes.
    pub fn bytes() -> PropertyCodec<Vec<u8>> {
        PropertyCodec::new(|v: &Vec<u8>| Ok(v.clone()), |b| Ok(b.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PublishMode;
    use crate::transport::MemoryBroker;
    use songsync_protocol::{Health, QoS, TopicFilter};

    fn spec(pattern: &str) -> TopicSpec {
        TopicSpec {
            filter: TopicFilter::new(pattern),
            qos: QoS::AtLeastOnce,
            retained: false,
        }
    }

    fn property(broker: &MemoryBroker, client: &str) -> SyncedProperty<Health> {
        let transport: Arc<dyn PubSubTransport> = Arc::new(broker.client(client));
        let publisher = Arc::new(Publisher::new(Arc::clone(&transport), PublishMode::Inline));
        let prop = SyncedProperty::builder("health", codecs::health())
            .bind(spec("ns/health"))
            .build(transport, publisher);
        prop.connect().unwrap();
        prop
    }

    fn recorder<T: Clone + Send + 'static>() -> (Arc<Mutex<Vec<Option<T>>>>, impl Fn(Option<&T>, &[String]) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |v: Option<&T>, _: &[String]| sink.lock().push(v.cloned()))
    }

    #[test]
    fn local_set_publishes_and_remote_updates() {
        let broker = MemoryBroker::new();
        let a = property(&broker, "a");
        let b = property(&broker, "b");

        let (local_seen, local) = recorder();
        let (remote_seen, remote) = recorder();
        a.on_change(local);
        a.on_remote_change(remote);
        let (b_remote, b_listener) = recorder();
        b.on_remote_change(b_listener);

        assert!(a.set(Some(Health::Online), &[]));
        assert!(!a.set(Some(Health::Online), &[]));
        broker.pump();

        assert_eq!(b.get(), Some(Health::Online));
        assert_eq!(b_remote.lock().as_slice(), &[Some(Health::Online)]);
        assert_eq!(local_seen.lock().as_slice(), &[Some(Health::Online)]);
        // The echo equals the local value and is suppressed.
        assert!(remote_seen.lock().is_empty());
    }

    #[test]
    fn empty_payload_clears_value() {
        let broker = MemoryBroker::new();
        let a = property(&broker, "a");
        let b = property(&broker, "b");
        a.set(Some(Health::Offline), &[]);
        broker.pump();
        assert_eq!(b.get(), Some(Health::Offline));

        a.set(None, &[]);
        broker.pump();
        assert_eq!(b.get(), None);
    }

    #[test]
    fn undecodable_messages_are_dropped() {
        let broker = MemoryBroker::new();
        let a = property(&broker, "a");
        broker
            .client("raw")
            .publish("ns/health", b"sideways", QoS::AtLeastOnce, false)
            .unwrap();
        broker.pump();
        assert_eq!(a.get(), None);
    }

    #[test]
    fn wildcard_args_reach_listeners() {
        let broker = MemoryBroker::new();
        let transport: Arc<dyn PubSubTransport> = Arc::new(broker.client("a"));
        let publisher = Arc::new(Publisher::new(Arc::clone(&transport), PublishMode::Inline));
        let prop = SyncedProperty::builder("blob", codecs::bytes())
            .bind(spec("files/+/+"))
            .never_equal()
            .build(transport, publisher);
        prop.connect().unwrap();

        let args_seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&args_seen);
        prop.on_remote_change(move |_, args| sink.lock().push(args.to_vec()));

        prop.publish(&b"data".to_vec(), &["x", "y.png"]);
        assert!(prop.get().is_none());
        broker.pump();
        assert_eq!(prop.get(), Some(b"data".to_vec()));
        assert_eq!(args_seen.lock()[0], vec!["x".to_string(), "y.png".to_string()]);
    }

    #[test]
    fn accept_predicate_filters() {
        let broker = MemoryBroker::new();
        let transport: Arc<dyn PubSubTransport> = Arc::new(broker.client("a"));
        let publisher = Arc::new(Publisher::new(Arc::clone(&transport), PublishMode::Inline));
        let prop = SyncedProperty::builder("visible", codecs::boolean())
            .subscribe_to(spec("room/visible"))
            .accept_if(|_, incoming| incoming != Some(&false))
            .build(transport, publisher);
        prop.connect().unwrap();

        let raw = broker.client("raw");
        raw.publish("room/visible", b"false", QoS::AtLeastOnce, false).unwrap();
        raw.publish("room/visible", b"true", QoS::AtLeastOnce, false).unwrap();
        broker.pump();
        assert_eq!(prop.get(), Some(true));
    }

    #[test]
    fn removed_listeners_are_not_called() {
        let broker = MemoryBroker::new();
        let a = property(&broker, "a");
        let (seen, listener) = recorder();
        let id = a.on_change(listener);
        a.remove_listener(id);
        a.set(Some(Health::Online), &[]);
        assert!(seen.lock().is_empty());

        a.disconnect().unwrap();
        broker.client("raw").publish("ns/health", b"offline", QoS::AtLeastOnce, false).unwrap();
        broker.pump();
        assert_eq!(a.get(), Some(Health::Online));
    }
}
