//! Database configuration.

use crate::error::{Error, Result};
use crate::tx::Tx;
use std::sync::Arc;

/// Asynchronous expiration hook: called with each evicted key and value
/// after the sweep's transaction has committed. When installed, the
/// sweep no longer deletes items itself.
pub type OnExpired = Arc<dyn Fn(&[u8], &[u8]) + Send + Sync>;

/// Synchronous expiration hook: called with each expiring key and value
/// inside the sweep's write transaction. The hook decides the item's
/// fate - delete it, re-set it with a fresh TTL, or leave it. When
/// installed, the sweep no longer deletes items itself.
pub type OnExpiredSync = Arc<dyn Fn(&[u8], &[u8], &mut Tx) -> Result<()> + Send + Sync>;

/// How often committed data is synced to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPolicy {
    /// Never fsync explicitly. Fast, least safe.
    Never,
    /// Fsync about once per second from the background worker. At most
    /// one second of commits can be lost. The recommended setting.
    #[default]
    EverySecond,
    /// Fsync after every commit. Slow, safest.
    Always,
}

impl TryFrom<u8> for SyncPolicy {
    type Error = Error;

    /// Decodes the numeric form used by embedders' own config files.
    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SyncPolicy::Never),
            1 => Ok(SyncPolicy::EverySecond),
            2 => Ok(SyncPolicy::Always),
            _ => Err(Error::InvalidSyncPolicy),
        }
    }
}

/// Configuration for a database.
///
/// Read and replaced as a whole via `Database::read_config` and
/// `Database::set_config`.
#[derive(Clone)]
pub struct Config {
    /// When to fsync the command log after commits.
    pub sync_policy: SyncPolicy,

    /// Grow the log this many percent past the last compacted size
    /// before the background worker schedules another compaction.
    /// With the default of 100, a log compacted to 100 MB must reach
    /// 200 MB to be compacted again.
    pub auto_shrink_percentage: u64,

    /// Minimum log size before automatic compaction kicks in.
    pub auto_shrink_min_size: u64,

    /// Turns off automatic background compaction entirely.
    pub auto_shrink_disabled: bool,

    /// Asynchronous expiration hook.
    pub on_expired: Option<OnExpired>,

    /// Synchronous expiration hook.
    pub on_expired_sync: Option<OnExpiredSync>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sync_policy: SyncPolicy::EverySecond,
            auto_shrink_percentage: 100,
            auto_shrink_min_size: 32 * 1024 * 1024,
            auto_shrink_disabled: false,
            on_expired: None,
            on_expired_sync: None,
        }
    }
}

impl Config {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the sync policy.
    #[must_use]
    pub fn sync_policy(mut self, policy: SyncPolicy) -> Self {
        self.sync_policy = policy;
        self
    }

    /// Disables automatic background compaction.
    #[must_use]
    pub fn auto_shrink_disabled(mut self, value: bool) -> Self {
        self.auto_shrink_disabled = value;
        self
    }

    /// Installs the asynchronous expiration hook.
    #[must_use]
    pub fn on_expired(mut self, hook: OnExpired) -> Self {
        self.on_expired = Some(hook);
        self
    }

    /// Installs the synchronous expiration hook.
    #[must_use]
    pub fn on_expired_sync(mut self, hook: OnExpiredSync) -> Self {
        self.on_expired_sync = Some(hook);
        self
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("sync_policy", &self.sync_policy)
            .field("auto_shrink_percentage", &self.auto_shrink_percentage)
            .field("auto_shrink_min_size", &self.auto_shrink_min_size)
            .field("auto_shrink_disabled", &self.auto_shrink_disabled)
            .field("on_expired", &self.on_expired.is_some())
            .field("on_expired_sync", &self.on_expired_sync.is_some())
            .finish()
    }
}
