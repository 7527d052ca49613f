//! Completion watcher for parent Jobs
//!
//! Tracks a parent Job through a small state machine:
//! Watching → Succeeded | Failed
//!
//! Each check re-reads the Job from the synced cache and never blocks: while
//! the Job is missing or still running the check asks to be re-queued after
//! a jittered delay. On success the five dependent Jobs are ensured one by
//! one, each guarded by an existence check, so an interrupted fan-out
//! resumes where it stopped.
//!
//! A check only speaks for the Intent it was created for. Once that Intent
//! is deleted, or replaced by a new Intent of the same name, or the cached
//! Job turns out to belong to another Intent, the check ends without acting.

use std::time::Duration;

use k8s_openapi::api::batch::v1::Job;
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use rand::Rng;
use tracing::{debug, info, instrument, warn};

use super::{Action, Context};
use crate::crd::Intent;
use crate::job::{
    compile_dependent_job, controller_owner_uid, dependent_job_name, JobPhase, FAN_OUT,
};
use crate::Error;

/// Observed state of a tracked parent Job
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionState {
    /// Not yet visible in the cache, or still pending/running
    Watching,
    /// The Job succeeded; dependents should exist
    Succeeded,
    /// The Job failed; no dependents are created
    Failed,
}

impl CompletionState {
    /// Classify a cache lookup result
    pub fn observe(job: Option<&Job>) -> Self {
        match job.map(JobPhase::of) {
            Some(JobPhase::Succeeded) => Self::Succeeded,
            Some(JobPhase::Failed) => Self::Failed,
            Some(JobPhase::Pending | JobPhase::Running) | None => Self::Watching,
        }
    }
}

/// Check a parent Job and fan out dependents once it has succeeded
///
/// # Errors
///
/// Returns [`Error::ParentJobFailed`] (not retryable) when the Job failed.
/// Cache and create failures during fan-out are returned for retry.
/// A check for an Intent that is gone or replaced returns [`Action::Done`].
#[instrument(skip_all, fields(job = %job_ref, intent = %intent.name_any()))]
pub async fn check_completion(
    job_ref: &ObjectRef<Job>,
    intent: &Intent,
    ctx: &Context,
) -> Result<Action, Error> {
    let namespace = job_ref
        .namespace
        .as_deref()
        .ok_or_else(|| Error::malformed(format!("job reference {job_ref} has no namespace")))?;

    if !ctx.is_current(intent)? {
        info!(uid = ?intent.uid(), "intent deleted or recreated, ending completion check");
        return Ok(Action::Done);
    }

    let job = ctx.cache.get(namespace, &job_ref.name)?;
    if let Some(job) = job.as_deref() {
        let owner = controller_owner_uid(job);
        if owner != intent.uid().as_deref() {
            info!(
                owner_uid = ?owner,
                uid = ?intent.uid(),
                "job belongs to another intent, ending completion check"
            );
            return Ok(Action::Done);
        }
    }

    match CompletionState::observe(job.as_deref()) {
        CompletionState::Watching => {
            let delay = jittered(ctx.config.completion_poll_interval);
            debug!(
                delay_ms = delay.as_millis(),
                "job not finished, checking again later"
            );
            Ok(Action::RequeueAfter(delay))
        }
        CompletionState::Succeeded => {
            let created = fan_out(intent, ctx).await?;
            info!(created, total = FAN_OUT, "parent job succeeded, dependent jobs ensured");
            Ok(Action::Done)
        }
        CompletionState::Failed => {
            warn!("parent job failed, not creating dependent jobs");
            Err(Error::ParentJobFailed {
                namespace: namespace.to_string(),
                name: job_ref.name.clone(),
            })
        }
    }
}

/// Ensure every dependent Job exists, returning how many were created
async fn fan_out(intent: &Intent, ctx: &Context) -> Result<usize, Error> {
    let mut created = 0;

    for index in 0..FAN_OUT {
        let job = compile_dependent_job(intent, index)?;
        let name = dependent_job_name(index);
        let namespace = job.metadata.namespace.clone().unwrap_or_default();

        if ctx.cache.get(&namespace, &name)?.is_some() {
            debug!(job = %name, "dependent job already exists, skipping creation");
            continue;
        }

        match ctx.jobs.create(&job).await {
            Ok(_) => {
                info!(job = %name, "created dependent job");
                created += 1;
            }
            Err(e) if e.is_already_exists() => {
                debug!(job = %name, "dependent job created concurrently, skipping");
            }
            Err(e) => return Err(e),
        }
    }

    Ok(created)
}

/// Spread re-checks of many Jobs over time: 0.5x to 1.5x of the base delay
pub(crate) fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}
