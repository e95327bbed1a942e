//! Decides whether a pending batch's automatic trigger conditions are met.
//
//  Pure: no async, no IO.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::types::TriggerConfig;

/// True when the batch is large enough to fire on size alone.
pub fn item_count_reached(cfg: &TriggerConfig, len: usize) -> bool {
    cfg.max_items.is_some_and(|max| len >= max)
}

/// Time left before the timeout condition fires, measured from `created_at`.
///
/// `None` when no timeout is configured; `Some(Duration::ZERO)` when it is
/// already due.
pub fn timeout_remaining(
    cfg: &TriggerConfig,
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<Duration> {
    let max_wait = cfg.max_wait?;
    // A clock that went backwards counts as no time elapsed.
    let elapsed = (now - created_at).to_std().unwrap_or_default();
    Some(max_wait.saturating_sub(elapsed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn cfg(max_items: Option<usize>, max_wait_ms: Option<u64>) -> TriggerConfig {
        TriggerConfig {
            max_items,
            max_wait: max_wait_ms.map(Duration::from_millis),
            manual: true,
        }
    }

    #[test]
    fn no_count_condition_never_fires() {
        assert!(!item_count_reached(&cfg(None, None), 10_000));
    }

    #[test]
    fn count_fires_at_threshold() {
        let c = cfg(Some(2), None);
        assert!(!item_count_reached(&c, 1));
        assert!(item_count_reached(&c, 2));
        assert!(item_count_reached(&c, 3));
    }

    #[test]
    fn no_timeout_configured() {
        let now = Utc::now();
        assert_eq!(timeout_remaining(&cfg(Some(1), None), now, now), None);
    }

    #[test]
    fn remaining_shrinks_with_age() {
        let created = Utc::now();
        let later = created + TimeDelta::milliseconds(300);

        assert_eq!(
            timeout_remaining(&cfg(None, Some(1_000)), created, later),
            Some(Duration::from_millis(700))
        );
    }

    #[test]
    fn overdue_batch_is_due_now() {
        let created = Utc::now();
        let later = created + TimeDelta::seconds(5);

        assert_eq!(
            timeout_remaining(&cfg(None, Some(1_000)), created, later),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn clock_skew_does_not_shorten_wait() {
        let created = Utc::now();
        let earlier = created - TimeDelta::seconds(5);

        assert_eq!(
            timeout_remaining(&cfg(None, Some(1_000)), created, earlier),
            Some(Duration::from_millis(1_000))
        );
    }

    #[test]
    fn zero_wait_is_due_immediately() {
        let now = Utc::now();
        assert_eq!(
            timeout_remaining(&cfg(None, Some(0)), now, now),
            Some(Duration::ZERO)
        );
    }
}
