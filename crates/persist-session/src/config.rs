//! Session configuration.

use crate::bulk::InvalidationMode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a [`Session`](crate::Session).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Flush pending changes before running a query descriptor.
    pub auto_flush: bool,
    /// How long a pessimistic lock request may wait before failing.
    #[serde(with = "millis")]
    pub lock_timeout: Duration,
    /// Warn once this many lazy loads hit one association. `None` disables
    /// N+1 detection.
    pub n1_threshold: Option<usize>,
    /// Invalidation used by [`Session::bulk_update_default`](crate::Session::bulk_update_default).
    pub default_invalidation: InvalidationMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_flush: true,
            lock_timeout: Duration::from_secs(5),
            n1_threshold: None,
            default_invalidation: InvalidationMode::Evict,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn with_auto_flush(mut self, auto_flush: bool) -> Self {
        self.auto_flush = auto_flush;
        self
    }

    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_n1_detection(mut self, threshold: usize) -> Self {
        self.n1_threshold = Some(threshold);
        self
    }

    #[must_use]
    pub fn with_default_invalidation(mut self, mode: InvalidationMode) -> Self {
        self.default_invalidation = mode;
        self
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
