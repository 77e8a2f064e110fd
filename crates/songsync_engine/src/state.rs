//! Sync engine state machine.
//!
//! All replication state lives in one mutex-guarded core. Every entry point
//! (`on_version`, `on_patch`, `on_reject`, `on_health`, local edits, `tick`)
//! locks the core for the duration of the handler, records side effects, and
//! runs them after the lock is released: publishing, working copy
//! notifications and events never happen under the lock.

use crate::channels::SyncChannels;
use crate::config::{RetryConfig, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::persistence::{SyncState, SyncStorage};
use crate::property::SyncedProperty;
use crate::store::{DocumentStore, WorkingCopy, WorkingCopyChange};
use crate::transport::{PubSubTransport, Publisher};
use parking_lot::{Mutex, RwLock};
use songsync_protocol::{
    Conflict, Document, DocumentId, FieldPatchSet, Health, Patch, PatchId, PatchRequest,
    PatchVersion,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Applied versions remembered to tell late announcements from divergence.
const RECENT_VERSIONS: usize = 64;

/// The current phase of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncPhase {
    /// Local store is being cleared.
    Resetting,
    /// Offline edits are being collected from the working copy.
    Loading,
    /// Behind the chain head, or the database is not reachable.
    CatchingUp,
    /// At the chain head with the database online.
    Synced,
}

impl SyncPhase {
    /// Returns true if local edits can be published right away.
    pub fn is_synced(&self) -> bool {
        matches!(self, SyncPhase::Synced)
    }
}

/// Why the local store was reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetReason {
    /// Namespace prefix or server differ from the persisted snapshot.
    IdentityChanged,
    /// A version announced a different chain identity.
    ChainChanged {
        /// Previously known chain.
        from: Option<String>,
        /// Announced chain.
        to: String,
    },
    /// The chain head is behind, or disagrees with, the local store.
    Divergence {
        /// Local sequence.
        local: u64,
        /// Announced sequence.
        remote: u64,
    },
    /// Catch-up stayed stalled after every retry.
    GapExhausted {
        /// First missing sequence.
        sequence: u64,
        /// Retries spent.
        attempts: u32,
    },
}

/// Notifications published on [`SyncEngine::subscribe`] receivers.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A contiguous run of versions was committed.
    Applied {
        /// First applied sequence.
        from: u64,
        /// Last applied sequence.
        to: u64,
        /// Changed documents.
        documents: Vec<DocumentId>,
    },
    /// A pending offline edit was superseded by a remote change.
    ConflictDetected(Conflict),
    /// A patch published by this client lost the race for its sequence.
    OwnPatchRejected {
        /// The rejected patch.
        patch_id: PatchId,
        /// The sequence it proposed.
        sequence: u64,
    },
    /// A patch and its version proposal were published.
    Published {
        /// The published patch.
        patch_id: PatchId,
        /// The proposed sequence.
        sequence: u64,
        /// Number of changed documents.
        documents: usize,
    },
    /// The local store was cleared.
    Reset {
        /// Cause of the reset.
        reason: ResetReason,
    },
    /// The engine moved to another phase.
    PhaseChanged {
        /// Previous phase.
        from: SyncPhase,
        /// New phase.
        to: SyncPhase,
    },
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Versions committed to the store.
    pub versions_applied: u64,
    /// Patches buffered for later application.
    pub patches_buffered: u64,
    /// Reject messages received.
    pub rejects: u64,
    /// Conflicts detected.
    pub conflicts: u64,
    /// Document patches that did not apply cleanly.
    pub partial_applications: u64,
    /// Local store resets.
    pub resets: u64,
    /// Offline edit flushes.
    pub flushes: u64,
    /// Re-requests issued for a stalled catch-up.
    pub rerequests: u64,
    /// Patches published by this client.
    pub published: u64,
    /// Time of the last commit.
    pub last_applied: Option<Instant>,
}

/// Where a version message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSource {
    /// The retained chain head announcement.
    Latest,
    /// A reply to this client's request.
    Requested,
}

struct BufferedPatch {
    patch: Patch,
    /// Sequence named by the topic, if any.
    sequence: Option<u64>,
}

struct GapTracker {
    attempts: u32,
    next_retry: Instant,
}

enum Effect {
    Publish { patch: Patch, version: PatchVersion },
    Request(u64),
    Notify(WorkingCopyChange),
    Emit(SyncEvent),
    ResetStorage,
}

struct Core {
    author: String,
    retry: RetryConfig,
    gap_timeout: Duration,
    working: WorkingCopy,

    phase: SyncPhase,
    store: DocumentStore,
    state: SyncState,
    versions: BTreeMap<u64, PatchVersion>,
    patches: HashMap<PatchId, BufferedPatch>,
    /// Rejected patches not seen yet, with the sequence after which they are moot.
    rejects: HashMap<PatchId, u64>,
    /// Losing patches already dropped, so redelivered copies and rejects are ignored.
    settled: VecDeque<PatchId>,
    pending: Option<Vec<Document>>,
    conflicts: Vec<Conflict>,
    requested_missing: bool,
    latest_known: u64,
    health: Option<Health>,
    own_proposals: HashMap<PatchId, u64>,
    recent: VecDeque<(u64, PatchId)>,
    gap: Option<GapTracker>,
    stats: SyncStats,
    effects: Vec<Effect>,
}

impl Core {
    fn new(config: &SyncConfig, working: WorkingCopy) -> Self {
        Self {
            author: config.author.clone(),
            retry: config.retry.clone(),
            gap_timeout: config.gap_timeout,
            working,
            phase: SyncPhase::Loading,
            store: DocumentStore::new(),
            state: SyncState::new(&config.namespace_prefix, &config.server),
            versions: BTreeMap::new(),
            patches: HashMap::new(),
            rejects: HashMap::new(),
            settled: VecDeque::new(),
            pending: None,
            conflicts: Vec::new(),
            requested_missing: false,
            latest_known: 0,
            health: None,
            own_proposals: HashMap::new(),
            recent: VecDeque::new(),
            gap: None,
            stats: SyncStats::default(),
            effects: Vec::new(),
        }
    }

    fn emit(&mut self, event: SyncEvent) {
        self.effects.push(Effect::Emit(event));
    }

    fn set_phase(&mut self, phase: SyncPhase) {
        if self.phase != phase {
            info!(from = ?self.phase, to = ?phase, "sync phase changed");
            let from = std::mem::replace(&mut self.phase, phase);
            self.emit(SyncEvent::PhaseChanged { from, to: phase });
        }
    }

    fn is_online(&self) -> bool {
        self.health.is_some_and(|h| h.is_online())
    }

    fn refresh_phase(&mut self) {
        let phase = if self.state.current_sequence >= self.latest_known && self.is_online() {
            SyncPhase::Synced
        } else {
            SyncPhase::CatchingUp
        };
        self.set_phase(phase);
    }

    /// Collects offline edits and aligns the working copy to the store.
    fn load_working_copy(&mut self) {
        self.set_phase(SyncPhase::Loading);
        let changes = self.store.changes_from(&self.working.documents());
        if !changes.is_empty() {
            info!(documents = changes.len(), "collected offline edits");
            self.pending = Some(changes);
        }
        let aligned = self.working.replace_quiet(self.store.live().cloned().collect::<Vec<_>>());
        self.effects.push(Effect::Notify(aligned));
        self.refresh_phase();
    }

    fn clear_store(&mut self) {
        self.store.clear();
        self.state.current_sequence = 0;
        self.versions.clear();
        self.patches.clear();
        self.rejects.clear();
        self.settled.clear();
        self.own_proposals.clear();
        self.recent.clear();
        self.requested_missing = false;
        self.latest_known = 0;
        self.gap = None;
        self.effects.push(Effect::ResetStorage);
    }

    /// Runtime reset: pending edits and conflicts are dropped and the
    /// working copy is emptied; the chain is fetched again from 1.
    fn reset(&mut self, reason: ResetReason) {
        info!(?reason, sequence = self.state.current_sequence, "resetting local store");
        self.set_phase(SyncPhase::Resetting);
        self.clear_store();
        self.pending = None;
        self.conflicts.clear();
        let cleared = self.working.replace_quiet(Vec::new());
        self.effects.push(Effect::Notify(cleared));
        self.stats.resets += 1;
        self.emit(SyncEvent::Reset { reason });
    }

    fn diverges(&self, version: &PatchVersion) -> bool {
        let current = self.state.current_sequence;
        if version.sequence > current {
            return false;
        }
        match self.recent.iter().find(|(seq, _)| *seq == version.sequence) {
            Some((_, id)) => *id != version.patch_id,
            None => version.sequence < current,
        }
    }

    fn on_version(&mut self, version: PatchVersion, source: VersionSource) {
        debug!(
            sequence = version.sequence,
            patch = %version.patch_id,
            author = %version.author,
            ?source,
            "version received"
        );

        if let Some(chain) = &version.chain_id {
            match self.state.chain_id.clone() {
                Some(known) if known == *chain => {}
                None if self.state.current_sequence == 0 => {
                    self.state.chain_id = Some(chain.clone());
                }
                known => {
                    self.reset(ResetReason::ChainChanged {
                        from: known,
                        to: chain.clone(),
                    });
                    self.state.chain_id = Some(chain.clone());
                }
            }
        }

        if source == VersionSource::Latest && self.diverges(&version) {
            self.reset(ResetReason::Divergence {
                local: self.state.current_sequence,
                remote: version.sequence,
            });
        }
        self.latest_known = self.latest_known.max(version.sequence);

        if version.sequence > self.state.current_sequence {
            self.versions.insert(version.sequence, version);
        }
        self.apply_patches();

        if !self.requested_missing && self.state.current_sequence < self.latest_known {
            self.requested_missing = true;
            self.request_missing();
        }
    }

    fn on_patch(&mut self, patch: Patch, args: &[String]) {
        let sequence = args.get(1).and_then(|s| s.parse::<u64>().ok());
        debug!(patch = %patch.patch_id, ?sequence, documents = patch.len(), "patch received");
        if let Some(id) = args.get(2) {
            if id != patch.patch_id.as_str() {
                warn!(topic_id = %id, payload_id = %patch.patch_id, "patch id differs from topic");
            }
        }

        if self.rejects.remove(&patch.patch_id).is_some() {
            debug!(patch = %patch.patch_id, "dropping rejected patch");
            self.settle(patch.patch_id);
            return;
        }
        if self.settled.contains(&patch.patch_id) {
            debug!(patch = %patch.patch_id, "ignoring dropped patch");
            return;
        }
        if sequence.is_some_and(|s| s <= self.state.current_sequence) {
            debug!(patch = %patch.patch_id, "ignoring patch for an applied sequence");
            return;
        }

        self.patches
            .insert(patch.patch_id.clone(), BufferedPatch { patch, sequence });
        self.stats.patches_buffered += 1;
        self.apply_patches();
    }

    fn on_reject(&mut self, patch_id: PatchId) {
        debug!(patch = %patch_id, "reject received");
        self.stats.rejects += 1;
        if let Some(sequence) = self.own_proposals.remove(&patch_id) {
            warn!(patch = %patch_id, sequence, "own patch rejected");
            self.emit(SyncEvent::OwnPatchRejected {
                patch_id: patch_id.clone(),
                sequence,
            });
        }
        if self.patches.remove(&patch_id).is_some() || self.settled.contains(&patch_id) {
            self.settle(patch_id);
        } else {
            let moot_after = self.latest_known.max(self.state.current_sequence + 1);
            self.rejects.insert(patch_id, moot_after);
        }
    }

    fn settle(&mut self, patch_id: PatchId) {
        if self.settled.contains(&patch_id) {
            return;
        }
        self.settled.push_back(patch_id);
        if self.settled.len() > RECENT_VERSIONS {
            self.settled.pop_front();
        }
    }

    /// Drops buffered patches, rejects and own proposals for sequences that
    /// are applied now. An own proposal still open at this point lost.
    fn evict_settled(&mut self, applied: u64) {
        let stale: Vec<PatchId> = self
            .patches
            .iter()
            .filter(|(_, b)| b.sequence.is_some_and(|s| s <= applied))
            .map(|(id, _)| id.clone())
            .collect();
        for patch_id in stale {
            debug!(patch = %patch_id, "dropping patch superseded by the chain");
            self.patches.remove(&patch_id);
            self.settle(patch_id);
        }
        self.rejects.retain(|_, moot_after| *moot_after > applied);

        let lost: Vec<(PatchId, u64)> = self
            .own_proposals
            .iter()
            .filter(|(_, s)| **s <= applied)
            .map(|(id, s)| (id.clone(), *s))
            .collect();
        for (patch_id, sequence) in lost {
            warn!(patch = %patch_id, sequence, "own patch superseded");
            self.own_proposals.remove(&patch_id);
            self.emit(SyncEvent::OwnPatchRejected { patch_id, sequence });
        }
    }

    fn on_health(&mut self, health: Health) {
        if self.health != Some(health) {
            info!(%health, "database health changed");
            self.health = Some(health);
        }
        self.maybe_flush();
        self.refresh_phase();
    }

    fn request_missing(&mut self) {
        let from = self.state.current_sequence + 1;
        for sequence in from..=self.latest_known {
            let complete = self
                .versions
                .get(&sequence)
                .is_some_and(|v| self.patches.contains_key(&v.patch_id));
            if !complete {
                self.effects.push(Effect::Request(sequence));
            }
        }
        debug!(from, to = self.latest_known, "requested missing versions");
    }

    fn apply_patches(&mut self) {
        let start = self.state.current_sequence;
        let mut next = start + 1;
        let mut changed: BTreeMap<DocumentId, Document> = BTreeMap::new();
        let mut touched_by: BTreeMap<DocumentId, (u64, String)> = BTreeMap::new();

        while let Some(version) = self.versions.get(&next) {
            let Some(BufferedPatch { patch, .. }) = self.patches.get(&version.patch_id) else {
                break;
            };
            for (id, set) in &patch.entries {
                let base = changed.get(id).or_else(|| self.store.get(id));
                let applied = set.apply_to(*id, base);
                if !applied.is_clean() {
                    warn!(
                        document = %id,
                        sequence = next,
                        partial = ?applied.partial_fields,
                        malformed = ?applied.malformed_fields,
                        "patch applied partially"
                    );
                    self.stats.partial_applications += 1;
                }
                touched_by.insert(*id, (next, version.author.clone()));
                changed.insert(*id, applied.document);
            }
            next += 1;
        }

        let last = next - 1;
        if last > start {
            for sequence in start + 1..=last {
                if let Some(version) = self.versions.remove(&sequence) {
                    self.patches.remove(&version.patch_id);
                    self.own_proposals.remove(&version.patch_id);
                    self.recent.push_back((sequence, version.patch_id));
                    if self.recent.len() > RECENT_VERSIONS {
                        self.recent.pop_front();
                    }
                }
            }

            self.store.upsert_all(changed.values().cloned());
            self.state.current_sequence = last;
            self.evict_settled(last);
            self.stats.versions_applied += last - start;
            self.stats.last_applied = Some(Instant::now());
            debug!(from = start + 1, to = last, documents = changed.len(), "applied versions");

            self.identify_conflicts(&changed, &touched_by);
            let merged = self.working.merge_quiet(changed.values());
            self.effects.push(Effect::Notify(merged));
            self.emit(SyncEvent::Applied {
                from: start + 1,
                to: last,
                documents: changed.keys().copied().collect(),
            });
        }

        if self.state.current_sequence >= self.latest_known {
            self.gap = None;
        }
        self.maybe_flush();
        self.refresh_phase();
    }

    fn identify_conflicts(
        &mut self,
        changed: &BTreeMap<DocumentId, Document>,
        touched_by: &BTreeMap<DocumentId, (u64, String)>,
    ) {
        let Some(pending) = self.pending.as_mut() else {
            return;
        };
        let mut kept = Vec::with_capacity(pending.len());
        for local in pending.drain(..) {
            let Some(remote) = changed.get(&local.id()) else {
                kept.push(local);
                continue;
            };
            let (sequence, author) = touched_by.get(&local.id()).cloned().unwrap_or_default();
            warn!(document = %local.id(), sequence, %author, "offline edit superseded by remote change");
            let conflict = Conflict::new(local, remote.clone(), sequence, author);
            self.stats.conflicts += 1;
            self.conflicts.push(conflict.clone());
            self.effects.push(Effect::Emit(SyncEvent::ConflictDetected(conflict)));
        }
        *pending = kept;
    }

    /// Publishes pending offline edits once the store is at the chain head
    /// and the database is online. Pending edits are cleared first, so they
    /// are never published twice.
    fn maybe_flush(&mut self) {
        if self.pending.is_none()
            || !self.is_online()
            || self.state.current_sequence < self.latest_known
            || self.phase == SyncPhase::Resetting
        {
            return;
        }
        let Some(documents) = self.pending.take() else {
            return;
        };
        if documents.is_empty() {
            return;
        }
        info!(documents = documents.len(), "publishing offline edits");
        self.stats.flushes += 1;
        if let Err(e) = self.change_songs(&documents) {
            warn!(error = %e, "could not publish offline edits");
        }
    }

    fn change_songs(&mut self, documents: &[Document]) -> SyncResult<Option<PatchVersion>> {
        let mut patch = Patch::new(PatchId::generate());
        for document in documents {
            let set = FieldPatchSet::between(self.store.get(&document.id()), document);
            patch.insert(document.id(), set);
        }
        if patch.is_empty() {
            debug!("no changes to publish");
            return Ok(None);
        }

        let sequence = self.state.current_sequence + 1;
        let mut version = PatchVersion::new(sequence, self.author.clone(), patch.patch_id.clone())?;
        if let Some(chain) = &self.state.chain_id {
            version = version.with_chain_id(chain.clone())?;
        }

        info!(sequence, patch = %patch.patch_id, documents = patch.len(), "publishing patch");
        self.own_proposals.insert(patch.patch_id.clone(), sequence);
        self.stats.published += 1;
        self.emit(SyncEvent::Published {
            patch_id: patch.patch_id.clone(),
            sequence,
            documents: patch.len(),
        });
        self.effects.push(Effect::Publish {
            patch,
            version: version.clone(),
        });
        Ok(Some(version))
    }

    /// Publishes right away when synced, otherwise stages the documents as
    /// pending edits (later edits of the same document replace earlier ones).
    fn submit(&mut self, documents: Vec<Document>) -> SyncResult<Option<PatchVersion>> {
        if self.phase.is_synced() {
            return self.change_songs(&documents);
        }
        let pending = self.pending.get_or_insert_with(Vec::new);
        for document in documents {
            match pending.iter_mut().find(|d| d.id() == document.id()) {
                Some(slot) => *slot = document,
                None => pending.push(document),
            }
        }
        debug!(pending = pending.len(), "staged local edits");
        self.maybe_flush();
        Ok(None)
    }

    fn tick(&mut self, now: Instant) {
        if self.phase == SyncPhase::Resetting || self.state.current_sequence >= self.latest_known {
            self.gap = None;
            return;
        }
        let first_missing = self.state.current_sequence + 1;
        let timeout = self.gap_timeout;
        let gap = self.gap.get_or_insert(GapTracker {
            attempts: 0,
            next_retry: now + timeout,
        });
        if now < gap.next_retry {
            return;
        }

        if self.retry.is_exhausted(gap.attempts) {
            let attempts = gap.attempts;
            let latest = self.latest_known;
            warn!(sequence = first_missing, attempts, "catch-up stalled, forcing reset");
            self.reset(ResetReason::GapExhausted {
                sequence: first_missing,
                attempts,
            });
            self.latest_known = latest;
            self.requested_missing = true;
            self.request_missing();
            self.refresh_phase();
            return;
        }

        gap.attempts += 1;
        let attempt = gap.attempts;
        gap.next_retry = now + timeout + self.retry.delay_for_attempt(attempt);
        self.stats.rerequests += 1;
        info!(from = first_missing, to = self.latest_known, attempt, "re-requesting missing versions");
        self.request_missing();
    }
}

struct Shared {
    config: SyncConfig,
    channels: SyncChannels,
    working: WorkingCopy,
    storage: Option<SyncStorage>,
    core: Mutex<Core>,
    save_lock: Mutex<()>,
    subscribers: RwLock<Vec<Sender<SyncEvent>>>,
    closed: AtomicBool,
}

/// Replicates a document collection over pub/sub.
///
/// Cloning yields another handle to the same engine.
#[derive(Clone)]
pub struct SyncEngine {
    shared: Arc<Shared>,
}

impl SyncEngine {
    /// Loads persisted state, collects offline edits from `working`, and
    /// subscribes to the database channels.
    pub fn start(
        config: SyncConfig,
        transport: Arc<dyn PubSubTransport>,
        working: WorkingCopy,
    ) -> SyncResult<Self> {
        if config.author.is_empty() || config.author.contains([',', '/', '+', '#']) {
            return Err(SyncError::InvalidAuthor(config.author.clone()));
        }

        let publisher = Arc::new(Publisher::new(Arc::clone(&transport), config.publish_mode));
        let channels = SyncChannels::new(&config.topics(), Arc::clone(&transport), publisher);
        let storage = config.data_dir.as_ref().map(SyncStorage::new);
        let core = Core::new(&config, working.clone());

        let engine = Self {
            shared: Arc::new(Shared {
                config,
                channels,
                working,
                storage,
                core: Mutex::new(core),
                save_lock: Mutex::new(()),
                subscribers: RwLock::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        };

        engine.load();
        engine.attach(transport.as_ref());
        engine.shared.channels.connect()?;
        info!(
            client = %engine.shared.config.client_id,
            prefix = %engine.shared.config.namespace_prefix,
            sequence = engine.current_sequence(),
            "sync engine started"
        );
        Ok(engine)
    }

    fn load(&self) {
        let snapshot = match &self.shared.storage {
            None => None,
            Some(storage) => match storage.load() {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    error!(error = %e, dir = %storage.dir().display(), "could not read sync state, starting empty");
                    if let Err(e) = storage.reset() {
                        error!(error = %e, "could not delete unreadable sync state");
                    }
                    None
                }
            },
        };

        let config = &self.shared.config;
        self.with_core(|core| {
            if let Some(snapshot) = snapshot {
                if snapshot
                    .state
                    .same_identity(&config.namespace_prefix, &config.server)
                {
                    core.store = DocumentStore::from_documents(snapshot.documents);
                    core.state = snapshot.state;
                } else {
                    core.set_phase(SyncPhase::Resetting);
                    core.clear_store();
                    core.stats.resets += 1;
                    core.emit(SyncEvent::Reset {
                        reason: ResetReason::IdentityChanged,
                    });
                }
            }
            core.load_working_copy();
        });
    }

    fn attach(&self, transport: &dyn PubSubTransport) {
        let channels = &self.shared.channels;
        self.listen(&channels.latest_version, |engine, version, _| {
            if let Some(version) = version {
                engine.on_version(version.clone(), VersionSource::Latest);
            }
        });
        self.listen(&channels.request_version, |engine, version, _| {
            if let Some(version) = version {
                engine.on_version(version.clone(), VersionSource::Requested);
            }
        });
        self.listen(&channels.latest_patch, |engine, patch, args| {
            if let Some(patch) = patch {
                engine.on_patch(patch.clone(), args);
            }
        });
        self.listen(&channels.request_patch, |engine, patch, args| {
            if let Some(patch) = patch {
                engine.on_patch(patch.clone(), args);
            }
        });
        self.listen(&channels.latest_reject, |engine, reject, _| {
            if let Some(reject) = reject {
                engine.on_reject(reject.patch_id.clone());
            }
        });
        self.listen(&channels.health, |engine, health, _| {
            engine.on_health(health.copied().unwrap_or(Health::Offline));
        });

        let weak = Arc::downgrade(&self.shared);
        transport.on_connection_lost(Arc::new(move |cause: &str| {
            if let Some(shared) = weak.upgrade() {
                warn!(cause, "broker connection lost");
                SyncEngine { shared }.on_health(Health::Offline);
            }
        }));
    }

    fn listen<T, F>(&self, property: &SyncedProperty<T>, handler: F)
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: Fn(&SyncEngine, Option<&T>, &[String]) + Send + Sync + 'static,
    {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        property.on_remote_change(move |value, args| {
            if let Some(shared) = weak.upgrade() {
                handler(&SyncEngine { shared }, value, args);
            }
        });
    }

    fn with_core<R>(&self, f: impl FnOnce(&mut Core) -> R) -> R {
        let (result, effects) = {
            let mut core = self.shared.core.lock();
            let result = f(&mut core);
            (result, std::mem::take(&mut core.effects))
        };
        self.run(effects);
        result
    }

    fn run(&self, effects: Vec<Effect>) {
        let channels = &self.shared.channels;
        for effect in effects {
            match effect {
                Effect::Publish { patch, version } => {
                    let sequence = version.sequence.to_string();
                    let patch_id = patch.patch_id.to_string();
                    channels
                        .latest_patch
                        .publish(&patch, &[version.author.as_str(), sequence.as_str(), patch_id.as_str()]);
                    channels.propose_version.publish(&version, &[]);
                }
                Effect::Request(sequence) => {
                    channels.request_get.publish(&PatchRequest { sequence }, &[]);
                }
                Effect::Notify(change) => self.shared.working.notify(&change),
                Effect::Emit(event) => self.emit(event),
                Effect::ResetStorage => {
                    if let Some(storage) = &self.shared.storage {
                        let _guard = self.shared.save_lock.lock();
                        if let Err(e) = storage.reset() {
                            error!(error = %e, "could not delete sync state");
                        }
                    }
                }
            }
        }
    }

    fn emit(&self, event: SyncEvent) {
        self.shared
            .subscribers
            .write()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Handles a version announcement or request reply.
    pub fn on_version(&self, version: PatchVersion, source: VersionSource) {
        if !self.is_closed() {
            self.with_core(|core| core.on_version(version, source));
        }
    }

    /// Handles a patch; `args` are the topic arguments (author, sequence, patch ID).
    pub fn on_patch(&self, patch: Patch, args: &[String]) {
        if !self.is_closed() {
            self.with_core(|core| core.on_patch(patch, args));
        }
    }

    /// Handles a reject. Order-independent: a reject may precede its patch.
    pub fn on_reject(&self, patch_id: PatchId) {
        if !self.is_closed() {
            self.with_core(|core| core.on_reject(patch_id));
        }
    }

    /// Handles a health change.
    pub fn on_health(&self, health: Health) {
        if !self.is_closed() {
            self.with_core(|core| core.on_health(health));
        }
    }

    /// Diffs `documents` against the store and publishes one patch with a
    /// version proposal for the next sequence. Returns the proposal, or
    /// `None` if nothing changed.
    ///
    /// Acceptance is only learned through the inbound version and reject
    /// channels.
    pub fn change_songs(&self, documents: &[Document]) -> SyncResult<Option<PatchVersion>> {
        if self.is_closed() {
            return Err(SyncError::Closed);
        }
        self.with_core(|core| core.change_songs(documents))
    }

    /// Re-diffs the whole working copy against the store and publishes the
    /// difference. Safe to call again after a reject.
    pub fn update(&self) -> SyncResult<Option<PatchVersion>> {
        if self.is_closed() {
            return Err(SyncError::Closed);
        }
        let working = self.shared.working.documents();
        self.with_core(|core| {
            let changes = core.store.changes_from(&working);
            if core.phase.is_synced() {
                core.change_songs(&changes)
            } else {
                core.pending = (!changes.is_empty()).then_some(changes);
                core.maybe_flush();
                Ok(None)
            }
        })
    }

    /// Stores local edits in the working copy and publishes them, or stages
    /// them until the engine is synced.
    pub fn update_songs(&self, documents: Vec<Document>) -> SyncResult<Option<PatchVersion>> {
        if self.is_closed() {
            return Err(SyncError::Closed);
        }
        for document in &documents {
            self.shared.working.put(document.clone());
        }
        self.with_core(|core| core.submit(documents))
    }

    /// Removes a document by patching all of its fields away.
    pub fn remove_song(&self, id: DocumentId) -> SyncResult<Option<PatchVersion>> {
        if self.is_closed() {
            return Err(SyncError::Closed);
        }
        self.shared.working.remove(&id);
        self.with_core(|core| core.submit(vec![Document::new(id)]))
    }

    /// Drives the bounded gap retry. Call periodically, or use
    /// [`SyncEngine::spawn_watchdog`].
    pub fn tick(&self, now: Instant) {
        if !self.is_closed() {
            self.with_core(|core| core.tick(now));
        }
    }

    /// Spawns a task calling [`SyncEngine::tick`] every `period`. Must be
    /// called inside a tokio runtime. The task ends when the engine is
    /// closed or dropped.
    pub fn spawn_watchdog(&self, period: Duration) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                let engine = SyncEngine { shared };
                if engine.is_closed() {
                    break;
                }
                engine.tick(Instant::now());
            }
            debug!("gap watchdog stopped");
        })
    }

    /// Persists the store and sync state. Returns false on failure.
    pub fn save(&self) -> bool {
        match self.try_save() {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "could not save sync state");
                false
            }
        }
    }

    /// Persists the store and sync state.
    pub fn try_save(&self) -> SyncResult<()> {
        let Some(storage) = &self.shared.storage else {
            return Ok(());
        };
        let _guard = self.shared.save_lock.lock();
        let (state, documents) = {
            let core = self.shared.core.lock();
            (core.state.clone(), core.store.snapshot())
        };
        storage.save(&state, &documents)
    }

    /// Subscribes to engine events.
    pub fn subscribe(&self) -> Receiver<SyncEvent> {
        let (tx, rx) = mpsc::channel();
        self.shared.subscribers.write().push(tx);
        rx
    }

    /// Detaches from every channel. Later inbound messages are ignored and
    /// local edits are refused.
    pub fn close(&self) -> SyncResult<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(client = %self.shared.config.client_id, "sync engine closed");
        self.shared.channels.close()
    }

    /// Current phase.
    pub fn phase(&self) -> SyncPhase {
        self.shared.core.lock().phase
    }

    /// Last applied sequence.
    pub fn current_sequence(&self) -> u64 {
        self.shared.core.lock().state.current_sequence
    }

    /// Highest sequence announced by the chain.
    pub fn latest_known_sequence(&self) -> u64 {
        self.shared.core.lock().latest_known
    }

    /// Last reported database health.
    pub fn health(&self) -> Option<Health> {
        self.shared.core.lock().health
    }

    /// Persistable sync state.
    pub fn sync_state(&self) -> SyncState {
        self.shared.core.lock().state.clone()
    }

    /// Every document in the store, tombstones included.
    pub fn documents(&self) -> Vec<Document> {
        self.shared.core.lock().store.snapshot()
    }

    /// A document from the store.
    pub fn document(&self, id: &DocumentId) -> Option<Document> {
        self.shared.core.lock().store.get(id).cloned()
    }

    /// Offline edits waiting to be published.
    pub fn pending_edits(&self) -> Vec<Document> {
        self.shared.core.lock().pending.clone().unwrap_or_default()
    }

    /// Conflicts kept for manual handling.
    pub fn conflicts(&self) -> Vec<Conflict> {
        self.shared.core.lock().conflicts.clone()
    }

    /// Removes and returns the conflicts.
    pub fn take_conflicts(&self) -> Vec<Conflict> {
        std::mem::take(&mut self.shared.core.lock().conflicts)
    }

    /// Sync statistics.
    pub fn stats(&self) -> SyncStats {
        self.shared.core.lock().stats.clone()
    }

    /// The working copy this engine maintains.
    pub fn working_copy(&self) -> &WorkingCopy {
        &self.shared.working
    }

    /// The database channels.
    pub fn channels(&self) -> &SyncChannels {
        &self.shared.channels
    }

    /// The configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.shared.config
    }
}
