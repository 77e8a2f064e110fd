//! The synced properties the engine and the presentation share.

use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::property::{codecs, SyncedProperty};
use crate::transport::{PubSubTransport, Publisher};
use songsync_protocol::{
    ChangeReject, Document, Health, Patch, PatchRequest, PatchVersion, Position, Topics,
};
use std::sync::Arc;

/// Database channels of one client.
#[derive(Debug, Clone)]
pub struct SyncChannels {
    /// Head of the version chain (retained).
    pub latest_version: SyncedProperty<PatchVersion>,
    /// Outgoing version proposals.
    pub propose_version: SyncedProperty<PatchVersion>,
    /// Patches broadcast to everyone; arguments are author, sequence, patch ID.
    pub latest_patch: SyncedProperty<Patch>,
    /// Rejected patch IDs.
    pub latest_reject: SyncedProperty<ChangeReject>,
    /// Outgoing requests for missing sequences.
    pub request_get: SyncedProperty<PatchRequest>,
    /// Versions answering this client's requests.
    pub request_version: SyncedProperty<PatchVersion>,
    /// Patches answering this client's requests.
    pub request_patch: SyncedProperty<Patch>,
    /// Database reachability (retained).
    pub health: SyncedProperty<Health>,
}

impl SyncChannels {
    /// Builds the channels. Call [`SyncChannels::connect`] after attaching
    /// listeners.
    pub fn new(topics: &Topics, transport: Arc<dyn PubSubTransport>, publisher: Arc<Publisher>) -> Self {
        let t = || Arc::clone(&transport);
        let p = || Arc::clone(&publisher);
        Self {
            latest_version: SyncedProperty::builder("latest_version", codecs::version())
                .subscribe_to(topics.latest_version())
                .build(t(), p()),
            propose_version: SyncedProperty::builder("propose_version", codecs::version())
                .publish_to(topics.propose_version())
                .never_equal()
                .build(t(), p()),
            latest_patch: SyncedProperty::builder("latest_patch", codecs::patch())
                .bind(topics.latest_patch())
                .never_equal()
                .build(t(), p()),
            latest_reject: SyncedProperty::builder("latest_reject", codecs::reject())
                .subscribe_to(topics.latest_reject())
                .never_equal()
                .build(t(), p()),
            request_get: SyncedProperty::builder("request_get", codecs::request())
                .publish_to(topics.request_get())
                .never_equal()
                .build(t(), p()),
            request_version: SyncedProperty::builder("request_version", codecs::version())
                .subscribe_to(topics.request_version())
                .never_equal()
                .build(t(), p()),
            request_patch: SyncedProperty::builder("request_patch", codecs::patch())
                .subscribe_to(topics.request_patch())
                .never_equal()
                .build(t(), p()),
            health: SyncedProperty::builder("health", codecs::health())
                .subscribe_to(topics.health())
                .never_equal()
                .build(t(), p()),
        }
    }

    /// Subscribes every channel. The retained version head is subscribed
    /// before health so it is known before offline edits may flush.
    pub fn connect(&self) -> SyncResult<()> {
        self.latest_version.connect()?;
        self.latest_patch.connect()?;
        self.latest_reject.connect()?;
        self.request_version.connect()?;
        self.request_patch.connect()?;
        self.propose_version.connect()?;
        self.request_get.connect()?;
        self.health.connect()?;
        Ok(())
    }

    /// Unsubscribes and removes every listener.
    pub fn close(&self) -> SyncResult<()> {
        self.latest_version.clear_listeners();
        self.latest_version.disconnect()?;
        self.latest_patch.clear_listeners();
        self.latest_patch.disconnect()?;
        self.latest_reject.clear_listeners();
        self.latest_reject.disconnect()?;
        self.request_version.clear_listeners();
        self.request_version.disconnect()?;
        self.request_patch.clear_listeners();
        self.request_patch.disconnect()?;
        self.health.clear_listeners();
        self.health.disconnect()?;
        Ok(())
    }
}

/// Shared presentation state of one room.
#[derive(Debug, Clone)]
pub struct RoomChannels {
    /// Song currently presented.
    pub song: SyncedProperty<Document>,
    /// Position inside the presented song.
    pub position: SyncedProperty<Position>,
    /// Whether the presentation is visible.
    pub visibility: SyncedProperty<bool>,
}

impl RoomChannels {
    /// Builds and connects the room channels.
    pub fn connect(config: &SyncConfig, transport: Arc<dyn PubSubTransport>, publisher: Arc<Publisher>) -> SyncResult<Self> {
        let topics = config.topics();
        let channels = Self {
            song: SyncedProperty::builder("song", codecs::document())
                .bind(topics.song())
                .build(Arc::clone(&transport), Arc::clone(&publisher)),
            position: SyncedProperty::builder("position", codecs::position())
                .bind(topics.position())
                .build(Arc::clone(&transport), Arc::clone(&publisher)),
            visibility: SyncedProperty::builder("visibility", codecs::boolean())
                .bind(topics.visibility())
                .build(transport, publisher),
        };
        channels.song.connect()?;
        channels.position.connect()?;
        channels.visibility.connect()?;
        Ok(channels)
    }

    /// Unsubscribes every channel.
    pub fn close(&self) -> SyncResult<()> {
        self.song.disconnect()?;
        self.position.disconnect()?;
        self.visibility.disconnect()?;
        Ok(())
    }
}
