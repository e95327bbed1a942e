use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use batch::{JobOutcome, JobUnit, Payload};
use common::logger::init_logger;
use deferred::{BatchDispatcher, DeferredConfig};
use executor::JobHandler;

/// Pretends to deliver notifications. Addresses without an `@` are refused.
struct NotifyHandler;

#[async_trait::async_trait]
impl JobHandler for NotifyHandler {
    async fn handle(&self, job: &JobUnit) -> anyhow::Result<Payload> {
        let to = job.payload()["to"].as_str().unwrap_or_default();
        if !to.contains('@') {
            // Stable, short messages make failures easy to group in logs.
            anyhow::bail!("InvalidRecipient: {to:?}");
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(json!({ "delivered_to": to }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let is_production = std::env::var("APP_ENV").unwrap_or_default() == "production";
    init_logger("deferred-demo", is_production);

    tracing::info!("Starting deferred batch demo...");

    let cfg = DeferredConfig::from_env();
    let dispatcher = BatchDispatcher::start(cfg, Arc::new(NotifyHandler))?;

    let mut batch = dispatcher.deferred_batch_keyed("welcome-mails", |jobs| {
        anyhow::ensure!(!jobs.is_empty(), "refusing to send an empty mailing");
        Ok(())
    });
    let recipients = [
        ("alice", "alice@example.com"),
        ("bob", "bob-at-example.com"),
        ("carol", "carol@example.com"),
    ];
    for (id, to) in recipients {
        if batch.is_submitted() {
            tracing::info!(job_id = id, "batch already submitted by item count, skipping");
            continue;
        }
        batch.add_with_id(id, json!({ "to": to }))?;
    }

    let handle = batch.submit()?;
    if dispatcher.trigger_config().accepts_manual() {
        // Losing to an automatic condition is fine: the batch fires either way.
        if let Err(e) = handle.trigger() {
            tracing::debug!(error = %e, "explicit trigger skipped");
        }
    }

    let result = handle.wait().await?;
    for job in result.batch().jobs() {
        match result.outcome(job.id()) {
            Some(JobOutcome::Success(out)) => tracing::info!(job_id = job.id(), %out, "delivered"),
            Some(JobOutcome::Failure(reason)) => {
                tracing::warn!(job_id = job.id(), %reason, "not delivered")
            }
            None => {}
        }
    }
    tracing::info!(state = ?result.state(), "first pass finished");

    // Retrying is the caller's call. Same payloads, so the same jobs fail again.
    if !result.failed_jobs().is_empty() {
        let mut retry = result.retry_builder(|_| Ok(()))?;

        let handle = dispatcher.submit(&mut retry)?;
        if dispatcher.trigger_config().accepts_manual() {
            if let Err(e) = handle.trigger() {
                tracing::debug!(error = %e, "explicit trigger skipped");
            }
        }
        let retried = handle.wait().await?;
        tracing::info!(
            state = ?retried.state(),
            succeeded = retried.succeeded(),
            failed = retried.failed(),
            "retry finished"
        );
    }

    let cancelled = dispatcher.shutdown();
    tracing::info!(
        cancelled = cancelled.len(),
        counters = ?dispatcher.counters().snapshot(),
        "Shutdown complete"
    );

    Ok(())
}
