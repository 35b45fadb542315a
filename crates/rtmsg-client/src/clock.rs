//! Context identity and the timer/wall-clock bridge.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

/// Opaque identifier of one execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source of the wall-clock milliseconds written into the shared store.
///
/// Lease timestamps are compared across contexts, so in production they come
/// from the system clock. The monotonic `Instant` stops while the machine is
/// suspended and only drives local deadlines. Tests on the paused tokio clock
/// use [`Clock::anchored`] so that wall time advances with `tokio::time`.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    source: WallSource,
}

#[derive(Debug, Clone, Copy)]
enum WallSource {
    System,
    Anchored {
        origin: Instant,
        origin_wall_millis: i64,
    },
}

impl Clock {
    /// Read the system clock on every call.
    pub fn system() -> Self {
        Self {
            source: WallSource::System,
        }
    }

    /// Derive wall time from the timer clock, for deterministic tests.
    pub fn anchored(origin: Instant, origin_wall_millis: i64) -> Self {
        Self {
            source: WallSource::Anchored {
                origin,
                origin_wall_millis,
            },
        }
    }

    /// Wall-clock milliseconds at `now`. The system source ignores `now`.
    pub fn wall_millis(&self, now: Instant) -> i64 {
        match self.source {
            WallSource::System => chrono::Utc::now().timestamp_millis(),
            WallSource::Anchored {
                origin,
                origin_wall_millis,
            } => {
                let elapsed = now.saturating_duration_since(origin);
                origin_wall_millis + i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX / 2)
            }
        }
    }
}
