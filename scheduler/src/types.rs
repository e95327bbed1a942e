//! Shared types used by the trigger subsystem.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// When a pending batch is allowed to dispatch.
///
/// The first condition to be met wins; the rest become no-ops for that batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Fire as soon as the batch holds at least this many jobs.
    pub max_items: Option<usize>,

    /// Fire once this much time has passed since the batch was created.
    pub max_wait: Option<Duration>,

    /// Accept explicit `trigger()` calls. Ignored when neither automatic
    /// condition is set: an explicit trigger is then the only way to fire.
    pub manual: bool,
}

impl TriggerConfig {
    /// Explicit trigger only.
    pub fn manual() -> Self {
        Self::default()
    }

    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = Some(max_items);
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    pub fn with_manual(mut self, manual: bool) -> Self {
        self.manual = manual;
        self
    }

    pub fn has_automatic(&self) -> bool {
        self.max_items.is_some() || self.max_wait.is_some()
    }

    pub fn accepts_manual(&self) -> bool {
        self.manual || !self.has_automatic()
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            max_items: None,
            max_wait: None,
            manual: true,
        }
    }
}

/// Which condition moved a batch to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerSource {
    Explicit,
    ItemCount,
    Timeout,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerSource::Explicit => "explicit",
            TriggerSource::ItemCount => "item_count",
            TriggerSource::Timeout => "timeout",
        };
        f.write_str(s)
    }
}
