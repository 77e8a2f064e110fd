//! In-process stand-in for the database service.
//!
//! The arbiter owns the authoritative version chain of one namespace. It
//! accepts a proposal only if it extends the chain by exactly one
//! (first writer wins), republishes it as the retained head, and rejects
//! everything else. It also answers sequence requests and serves the file
//! side-channel from memory.

use crate::error::SyncResult;
use crate::transport::{MessageHandler, PubSubTransport, SubscriptionId};
use parking_lot::Mutex;
use songsync_protocol::{
    ChangeReject, FileRequest, FileSetResponse, Health, Patch, PatchId, PatchRequest,
    PatchVersion, TopicSpec, Topics,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Wildcard standing in for any client ID in request topics.
const ANY_CLIENT: &str = "+";

/// Last segment of the upload response topic, which shares the upload filter.
const SET_RESPONSE: &str = "response";

#[derive(Default)]
struct Ledger {
    chain: Vec<PatchVersion>,
    patches: HashMap<PatchId, Patch>,
    chain_id: Option<String>,
    files: BTreeMap<String, Vec<u8>>,
}

struct ArbiterInner {
    transport: Arc<dyn PubSubTransport>,
    prefix: String,
    ledger: Mutex<Ledger>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

/// First-writer-wins arbiter of a version chain.
#[derive(Clone)]
pub struct ChainArbiter {
    inner: Arc<ArbiterInner>,
}

impl ChainArbiter {
    /// Starts arbitrating the namespace under `namespace_prefix`.
    pub fn start(
        transport: Arc<dyn PubSubTransport>,
        namespace_prefix: impl Into<String>,
    ) -> SyncResult<Self> {
        let arbiter = Self {
            inner: Arc::new(ArbiterInner {
                transport,
                prefix: namespace_prefix.into(),
                ledger: Mutex::new(Ledger::default()),
                subscriptions: Mutex::new(Vec::new()),
            }),
        };

        let any = arbiter.topics(ANY_CLIENT);
        arbiter.route(&any.propose_version(), |a, _, payload| a.on_proposal(payload))?;
        arbiter.route(&any.latest_patch(), |a, _, payload| a.on_patch(payload))?;
        arbiter.route(&any.request_get_any(), |a, topic, payload| a.on_request(topic, payload))?;
        arbiter.route(&any.files_request_get(), |a, topic, payload| a.on_file_get(topic, payload))?;
        arbiter.route(&any.files_request_set(), |a, topic, payload| a.on_file_set(topic, payload))?;

        info!(prefix = %arbiter.inner.prefix, "arbiter started");
        Ok(arbiter)
    }

    fn topics(&self, client: &str) -> Topics {
        Topics::new(self.inner.prefix.clone(), "", client)
    }

    fn route<F>(&self, spec: &TopicSpec, handler: F) -> SyncResult<()>
    where
        F: Fn(&ChainArbiter, &str, &[u8]) + Send + Sync + 'static,
    {
        let weak: Weak<ArbiterInner> = Arc::downgrade(&self.inner);
        let callback: MessageHandler = Arc::new(move |topic: &str, payload: &[u8]| {
            if let Some(inner) = weak.upgrade() {
                handler(&ChainArbiter { inner }, topic, payload);
            }
        });
        let id = self.inner.transport.subscribe(&spec.filter, spec.qos, callback)?;
        self.inner.subscriptions.lock().push(id);
        Ok(())
    }

    fn publish(&self, spec: &TopicSpec, args: &[&str], payload: &[u8]) {
        let topic = match spec.filter.render(args) {
            Ok(topic) => topic,
            Err(e) => {
                warn!(error = %e, "arbiter cannot render topic");
                return;
            }
        };
        if let Err(e) = self.inner.transport.publish(&topic, payload, spec.qos, spec.retained) {
            warn!(topic = %topic, error = %e, "arbiter publish failed");
        }
    }

    fn on_proposal(&self, payload: &[u8]) {
        let proposal = match PatchVersion::from_bytes(payload) {
            Ok(version) => version,
            Err(e) => {
                warn!(error = %e, "dropping malformed proposal");
                return;
            }
        };

        let accepted = {
            let mut ledger = self.inner.ledger.lock();
            let next = ledger.chain.len() as u64 + 1;
            let duplicate = ledger.chain.iter().any(|v| v.patch_id == proposal.patch_id);
            if proposal.sequence == next && !duplicate {
                let mut accepted = proposal.clone();
                accepted.chain_id = ledger.chain_id.clone();
                ledger.chain.push(accepted.clone());
                Some(accepted)
            } else {
                None
            }
        };

        let topics = self.topics(ANY_CLIENT);
        match accepted {
            Some(version) => {
                debug!(sequence = version.sequence, patch = %version.patch_id, "accepted proposal");
                self.publish(&topics.latest_version(), &[], &version.to_bytes());
            }
            None => {
                debug!(sequence = proposal.sequence, patch = %proposal.patch_id, "rejected proposal");
                let reject = ChangeReject {
                    patch_id: proposal.patch_id,
                };
                self.publish(&topics.latest_reject(), &[], &reject.to_bytes());
            }
        }
    }

    fn on_patch(&self, payload: &[u8]) {
        match Patch::decode(payload) {
            Ok(patch) => {
                self.inner.ledger.lock().patches.insert(patch.patch_id.clone(), patch);
            }
            Err(e) => warn!(error = %e, "dropping undecodable patch"),
        }
    }

    fn on_request(&self, topic: &str, payload: &[u8]) {
        let any = self.topics(ANY_CLIENT);
        let Some(client) = any
            .request_get_any()
            .filter
            .wildcard_args(topic)
            .and_then(|args| args.into_iter().next())
        else {
            return;
        };
        let request = match PatchRequest::from_bytes(payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "dropping malformed request");
                return;
            }
        };

        let (version, patch) = {
            let ledger = self.inner.ledger.lock();
            let version = request
                .sequence
                .checked_sub(1)
                .and_then(|i| ledger.chain.get(i as usize))
                .cloned();
            let patch = version
                .as_ref()
                .and_then(|v| ledger.patches.get(&v.patch_id))
                .cloned();
            (version, patch)
        };
        let Some(version) = version else {
            debug!(sequence = request.sequence, %client, "request beyond chain head");
            return;
        };

        let topics = self.topics(&client);
        if let Some(patch) = patch {
            match patch.encode() {
                Ok(bytes) => {
                    let sequence = version.sequence.to_string();
                    self.publish(
                        &topics.request_patch(),
                        &[version.author.as_str(), sequence.as_str(), version.patch_id.as_str()],
                        &bytes,
                    );
                }
                Err(e) => warn!(error = %e, "cannot encode patch"),
            }
        }
        self.publish(&topics.request_version(), &[], &version.to_bytes());
    }

    fn on_file_get(&self, topic: &str, payload: &[u8]) {
        let Some(client) = self
            .topics(ANY_CLIENT)
            .files_request_get()
            .filter
            .wildcard_args(topic)
            .and_then(|args| args.into_iter().next())
        else {
            return;
        };
        let Ok(request) = FileRequest::from_bytes(payload) else {
            warn!(%client, "dropping malformed file request");
            return;
        };
        let content = self.inner.ledger.lock().files.get(&request.name).cloned();
        if content.is_none() {
            debug!(name = %request.name, "requested file is unknown");
        }
        let topics = self.topics(&client);
        self.publish(
            &topics.files_request_file(),
            &[request.name.as_str()],
            &content.unwrap_or_default(),
        );
    }

    fn on_file_set(&self, topic: &str, payload: &[u8]) {
        let Some(args) = self.topics(ANY_CLIENT).files_request_set().filter.wildcard_args(topic) else {
            return;
        };
        let [client, name] = args.as_slice() else {
            return;
        };
        if name == SET_RESPONSE {
            return;
        }

        let response = if payload.is_empty() {
            FileSetResponse::failed(name.as_str(), "empty upload")
        } else {
            self.inner.ledger.lock().files.insert(name.clone(), payload.to_vec());
            FileSetResponse::ok(name.as_str())
        };
        match response.encode() {
            Ok(bytes) => {
                let topics = self.topics(client);
                self.publish(&topics.files_request_set_response(), &[], &bytes);
            }
            Err(e) => warn!(error = %e, "cannot encode upload response"),
        }
    }

    /// Publishes the retained database health.
    pub fn set_health(&self, health: Health) {
        let topics = self.topics(ANY_CLIENT);
        self.publish(&topics.health(), &[], health.as_str().as_bytes());
    }

    /// Drops the chain and starts a new one under `chain_id`. The retained
    /// head is cleared.
    pub fn reset_chain(&self, chain_id: Option<String>) {
        {
            let mut ledger = self.inner.ledger.lock();
            ledger.chain.clear();
            ledger.patches.clear();
            ledger.chain_id = chain_id;
        }
        info!("arbiter chain reset");
        self.publish(&self.topics(ANY_CLIENT).latest_version(), &[], &[]);
    }

    /// Sequence of the chain head.
    pub fn head(&self) -> u64 {
        self.inner.ledger.lock().chain.len() as u64
    }

    /// The accepted versions in order.
    pub fn chain(&self) -> Vec<PatchVersion> {
        self.inner.ledger.lock().chain.clone()
    }

    /// Stores a blob for download.
    pub fn put_file(&self, name: impl Into<String>, content: Vec<u8>) {
        self.inner.ledger.lock().files.insert(name.into(), content);
    }

    /// Returns a stored blob.
    pub fn file(&self, name: &str) -> Option<Vec<u8>> {
        self.inner.ledger.lock().files.get(name).cloned()
    }

    /// Removes every subscription.
    pub fn stop(&self) -> SyncResult<()> {
        let ids: Vec<SubscriptionId> = self.inner.subscriptions.lock().drain(..).collect();
        for id in ids {
            self.inner.transport.unsubscribe(id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryBroker;
    use songsync_protocol::{QoS, TopicFilter};

    fn recorder(broker: &MemoryBroker, filter: &str) -> Arc<Mutex<Vec<(String, Vec<u8>)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        broker
            .client("observer")
            .subscribe(
                &TopicFilter::new(filter),
                QoS::ExactlyOnce,
                Arc::new(move |topic: &str, payload: &[u8]| {
                    sink.lock().push((topic.to_string(), payload.to_vec()));
                }),
            )
            .unwrap();
        seen
    }

    fn propose(broker: &MemoryBroker, version: &PatchVersion) {
        let client = broker.client("proposer");
        let spec = Topics::new("t/", "", "proposer").propose_version();
        client
            .publish(spec.filter.as_str(), &version.to_bytes(), spec.qos, false)
            .unwrap();
    }

    #[test]
    fn first_writer_wins() {
        let broker = MemoryBroker::new();
        let arbiter = ChainArbiter::start(Arc::new(broker.client("arbiter")), "t/").unwrap();
        let rejects = recorder(&broker, "t/db/v1/patches/latest/reject");

        let first = PatchVersion::new(1, "a", PatchId::generate()).unwrap();
        let second = PatchVersion::new(1, "b", PatchId::generate()).unwrap();
        propose(&broker, &first);
        propose(&broker, &second);
        broker.pump();

        assert_eq!(arbiter.head(), 1);
        assert_eq!(arbiter.chain()[0].patch_id, first.patch_id);
        assert_eq!(
            broker.retained("t/db/v1/patches/latest/version"),
            Some(first.to_bytes())
        );
        let rejects = rejects.lock();
        assert_eq!(rejects.len(), 1);
        assert_eq!(rejects[0].1, second.patch_id.as_str().as_bytes());
    }

    #[test]
    fn chain_identity_is_stamped() {
        let broker = MemoryBroker::new();
        let arbiter = ChainArbiter::start(Arc::new(broker.client("arbiter")), "t/").unwrap();
        arbiter.reset_chain(Some("db-7".into()));
        propose(&broker, &PatchVersion::new(1, "a", PatchId::generate()).unwrap());
        broker.pump();
        assert_eq!(arbiter.chain()[0].chain_id.as_deref(), Some("db-7"));
    }

    #[test]
    fn answers_requests_for_the_asking_client() {
        let broker = MemoryBroker::new();
        let arbiter = ChainArbiter::start(Arc::new(broker.client("arbiter")), "t/").unwrap();
        let version = PatchVersion::new(1, "a", PatchId::generate()).unwrap();
        propose(&broker, &version);
        broker.pump();
        assert_eq!(arbiter.head(), 1);

        let replies = recorder(&broker, "t/db/v1/patches/request/c1/version");
        let spec = Topics::new("t/", "", "c1").request_get();
        broker
            .client("c1")
            .publish(spec.filter.as_str(), &PatchRequest { sequence: 1 }.to_bytes(), spec.qos, false)
            .unwrap();
        broker
            .client("c1")
            .publish(spec.filter.as_str(), &PatchRequest { sequence: 9 }.to_bytes(), spec.qos, false)
            .unwrap();
        broker.pump();

        let replies = replies.lock();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0, "t/db/v1/patches/request/c1/version");
    }

    #[test]
    fn stores_uploads_and_serves_downloads() {
        let broker = MemoryBroker::new();
        let arbiter = ChainArbiter::start(Arc::new(broker.client("arbiter")), "t/").unwrap();
        let responses = recorder(&broker, "t/db/v1/files/request/c1/set/response");

        let topics = Topics::new("t/", "", "c1");
        let upload = topics.files_request_set().filter.render(&["img.png"]).unwrap();
        broker
            .client("c1")
            .publish(&upload, b"png", QoS::ExactlyOnce, false)
            .unwrap();
        broker.pump();

        assert_eq!(arbiter.file("img.png"), Some(b"png".to_vec()));
        let responses = responses.lock();
        assert_eq!(responses.len(), 1);
        let response = FileSetResponse::decode(&responses[0].1).unwrap();
        assert!(response.ok);
        assert_eq!(response.name, "img.png");
    }
}
