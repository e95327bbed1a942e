use std::str::FromStr;
use std::time::Duration;

use executor::{DispatchConfig, OrderingPolicy};
use scheduler::TriggerConfig;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeferredConfig {
    // =========================
    // Trigger configuration
    // =========================
    /// When a pending batch dispatches.
    ///
    /// - `DEFERRED_MAX_ITEMS`: fire once a batch holds this many jobs
    /// - `DEFERRED_MAX_WAIT_MS`: fire this long after the batch was created
    /// - `DEFERRED_MANUAL_TRIGGER`: accept explicit triggers (default true)
    ///
    /// With neither automatic condition set, batches only fire when triggered.
    pub trigger: TriggerConfig,

    // =========================
    // Dispatch configuration
    // =========================
    /// How the jobs of a fired batch run.
    ///
    /// - `DEFERRED_MAX_PARALLEL`: jobs in flight per batch (default 1)
    /// - `DEFERRED_ORDERING`: `insertion` or `reverse`
    /// - `DEFERRED_JOB_TIMEOUT_MS`: per-job deadline (default none)
    /// - `DEFERRED_SLOW_JOB_MS`: slow-job warning threshold (default 500)
    pub dispatch: DispatchConfig,
}

impl DeferredConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Missing or unparseable values
    /// keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let dispatch_defaults = DispatchConfig::default();

        let trigger = TriggerConfig {
            max_items: parse(&lookup, "DEFERRED_MAX_ITEMS"),
            max_wait: parse(&lookup, "DEFERRED_MAX_WAIT_MS").map(Duration::from_millis),
            manual: parse(&lookup, "DEFERRED_MANUAL_TRIGGER").unwrap_or(true),
        };

        let dispatch = DispatchConfig {
            ordering: parse::<OrderingPolicy, _>(&lookup, "DEFERRED_ORDERING")
                .unwrap_or(dispatch_defaults.ordering),
            max_parallel: parse(&lookup, "DEFERRED_MAX_PARALLEL")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(dispatch_defaults.max_parallel),
            job_timeout: parse(&lookup, "DEFERRED_JOB_TIMEOUT_MS").map(Duration::from_millis),
            slow_job_threshold: parse(&lookup, "DEFERRED_SLOW_JOB_MS")
                .map(Duration::from_millis)
                .unwrap_or(dispatch_defaults.slow_job_threshold),
        };

        Self { trigger, dispatch }
    }
}

fn parse<T, F>(lookup: &F, name: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparseable config value");
            None
        }
    }
}
