use std::sync::Arc;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info};

use crate::authz::cache::DecisionCache;
use crate::errors::WardenError;

/// Initialize and start the job scheduler with the cache maintenance task.
pub async fn init_scheduler(
    cache: Arc<DecisionCache>,
    sweep_schedule: &str,
) -> Result<JobScheduler, WardenError> {
    let sched = JobScheduler::new()
        .await
        .map_err(|e| WardenError::Other(format!("Failed to create job scheduler: {}", e)))?;

    let sweep_job = sweep_job(cache, sweep_schedule)?;
    sched
        .add(sweep_job)
        .await
        .map_err(|e| WardenError::Other(format!("Failed to add cache sweep job: {}", e)))?;

    sched
        .start()
        .await
        .map_err(|e| WardenError::Other(format!("Failed to start job scheduler: {}", e)))?;

    info!(schedule = sweep_schedule, "Job scheduler started");

    Ok(sched)
}

/// Drop expired entries from the in-process cache tier on `schedule`.
fn sweep_job(cache: Arc<DecisionCache>, schedule: &str) -> Result<Job, WardenError> {
    Job::new_async(schedule, move |_uuid, _l| {
        let cache = cache.clone();
        Box::pin(async move {
            let removed = cache.sweep_expired();
            let stats = cache.stats();
            debug!(
                removed,
                remaining = stats.local_entries,
                local_hits = stats.local_hits,
                local_misses = stats.local_misses,
                "Swept expired cache entries"
            );
        })
    })
    .map_err(|e| WardenError::Other(format!("Failed to create cache sweep job: {}", e)))
}
