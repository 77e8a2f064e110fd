//! Configuration for the sync engine.

use rand::Rng;
use songsync_protocol::Topics;
use std::path::PathBuf;
use std::time::Duration;

/// How [`SyncedProperty`](crate::SyncedProperty) publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishMode {
    /// Hand every publish to a dedicated worker thread.
    #[default]
    Background,
    /// Publish on the calling thread.
    Inline,
}

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Topic namespace prefix, normally ending with `/`.
    pub namespace_prefix: String,
    /// Room for shared presentation state.
    pub room: String,
    /// Identity of the broker the namespace lives on.
    pub server: String,
    /// Author recorded in published versions.
    pub author: String,
    /// Client ID used in request topics.
    pub client_id: String,
    /// Directory for the persisted store; `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    /// Retry configuration for stalled catch-up.
    pub retry: RetryConfig,
    /// Time a gap may persist before the missing range is requested again.
    pub gap_timeout: Duration,
    /// Publish mode for synced properties.
    pub publish_mode: PublishMode,
}

impl SyncConfig {
    /// Creates a new sync configuration with a random client ID.
    pub fn new(
        server: impl Into<String>,
        namespace_prefix: impl Into<String>,
        author: impl Into<String>,
    ) -> Self {
        Self {
            namespace_prefix: namespace_prefix.into(),
            room: "default".into(),
            server: server.into(),
            author: author.into(),
            client_id: songsync_protocol::PatchId::generate().to_string(),
            data_dir: None,
            retry: RetryConfig::default(),
            gap_timeout: Duration::from_secs(10),
            publish_mode: PublishMode::Background,
        }
    }

    /// Sets the room.
    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = room.into();
        self
    }

    /// Sets the client ID.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Sets the data directory.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the gap timeout.
    pub fn with_gap_timeout(mut self, timeout: Duration) -> Self {
        self.gap_timeout = timeout;
        self
    }

    /// Sets the publish mode.
    pub fn with_publish_mode(mut self, mode: PublishMode) -> Self {
        self.publish_mode = mode;
        self
    }

    /// Topic layout for this configuration.
    pub fn topics(&self) -> Topics {
        Topics::new(&self.namespace_prefix, &self.room, &self.client_id)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("", "", "anonymous")
    }
}

/// Backoff for re-requesting a stalled catch-up.
///
/// Attempt `n` (1-based) waits `initial_delay * backoff_multiplier^(n-1)`,
/// capped at `max_delay`, on top of the gap timeout. Once `max_attempts`
/// re-requests went unanswered the engine resets and fetches the chain again.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Re-requests before a forced reset.
    pub max_attempts: u32,
    /// Delay added before the first re-request.
    pub initial_delay: Duration,
    /// Upper bound of the added delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub backoff_multiplier: f64,
    /// Adds up to 25% random delay so clients stalled on the same gap spread out.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Backoff with `max_attempts` re-requests and default delays.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Resets on the first expired gap timeout without re-requesting.
    pub fn none() -> Self {
        Self {
            add_jitter: false,
            ..Self::new(0)
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Returns true once `attempts` re-requests have been spent.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    /// Extra wait before re-request number `attempt`. Attempt 0 waits nothing.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let Some(exponent) = attempt.checked_sub(1) else {
            return Duration::ZERO;
        };
        let exponent = i32::try_from(exponent).unwrap_or(i32::MAX);
        let growth = self.backoff_multiplier.max(1.0).powi(exponent);
        let capped = (self.initial_delay.as_secs_f64() * growth).min(self.max_delay.as_secs_f64());

        let spread = if self.add_jitter {
            rand::thread_rng().gen_range(0.0..0.25)
        } else {
            0.0
        };
        Duration::from_secs_f64(capped * (1.0 + spread))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new("tcp://broker:1883", "church/", "alice")
            .with_room("hall")
            .with_client_id("c1")
            .with_data_dir("/tmp/songs")
            .with_gap_timeout(Duration::from_secs(3))
            .with_publish_mode(PublishMode::Inline);

        assert_eq!(config.server, "tcp://broker:1883");
        assert_eq!(config.namespace_prefix, "church/");
        assert_eq!(config.author, "alice");
        assert_eq!(config.room, "hall");
        assert_eq!(config.client_id, "c1");
        assert_eq!(config.data_dir, Some(PathBuf::from("/tmp/songs")));
        assert_eq!(config.gap_timeout, Duration::from_secs(3));
        assert_eq!(config.publish_mode, PublishMode::Inline);
        assert_eq!(
            config.topics().request_get().filter.as_str(),
            "church/db/v1/patches/request/c1/get"
        );
    }

    #[test]
    fn generated_client_ids_differ() {
        let a = SyncConfig::default();
        let b = SyncConfig::default();
        assert_ne!(a.client_id, b.client_id);
    }

    #[test]
    fn no_retries_means_immediately_exhausted() {
        assert!(RetryConfig::none().is_exhausted(0));
        assert!(!RetryConfig::new(2).is_exhausted(1));
        assert!(RetryConfig::new(2).is_exhausted(2));
    }

    #[test]
    fn backoff_doubles_within_jitter() {
        let config = RetryConfig::new(5).with_initial_delay(Duration::from_millis(100));

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        let first = config.delay_for_attempt(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
        let third = config.delay_for_attempt(3);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(500));
    }

    #[test]
    fn backoff_is_capped() {
        let config = RetryConfig::new(50)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0)
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(5));
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_secs(5));
    }
}
