//! Intent reconciler
//!
//! Converges an Intent onto exactly one parent Job named after it. The
//! existence check against the synced cache runs before every create, so
//! reconciling the same Intent any number of times creates the Job once.
//!
//! When an Intent is recreated under the same name, the Job of the deleted
//! one may still be cached until garbage collection removes it. The new
//! Intent waits for that instead of adopting a Job it does not own.

use std::sync::Arc;

use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use tracing::{debug, info, instrument};

use super::{jittered, Action, Context};
use crate::crd::Intent;
use crate::event::Event;
use crate::job::{compile_parent_job, controller_owner_uid};
use crate::Error;

/// Reconcile an Intent
///
/// Returns [`Action::Enqueue`] with a completion check when the parent Job
/// was created, and [`Action::Done`] when it already existed or the Intent
/// is no longer live. A Job of the same name owned by a previous Intent is
/// waited out with [`Action::RequeueAfter`].
///
/// # Errors
///
/// Cache and API failures are returned for the dispatcher to retry. An
/// Intent without namespace or uid yields a non-retryable
/// [`Error::MalformedObject`].
#[instrument(skip_all, fields(intent = %intent.name_any(), namespace = ?intent.namespace()))]
pub async fn reconcile_intent(intent: &Arc<Intent>, ctx: &Context) -> Result<Action, Error> {
    let job = compile_parent_job(intent)?;
    let name = intent.name_any();
    let namespace = intent
        .namespace()
        .ok_or_else(|| Error::malformed(format!("intent {name} has no namespace")))?;

    if !ctx.is_current(intent)? {
        debug!(uid = ?intent.uid(), "intent deleted or recreated, skipping");
        return Ok(Action::Done);
    }

    if let Some(existing) = ctx.cache.get(&namespace, &name)? {
        let owner = controller_owner_uid(&existing);
        if owner == intent.uid().as_deref() {
            debug!("job already exists, skipping creation");
            return Ok(Action::Done);
        }
        let delay = jittered(ctx.config.completion_poll_interval);
        info!(
            owner_uid = ?owner,
            delay_ms = delay.as_millis(),
            "job left by a previous intent with this name, waiting for its removal"
        );
        return Ok(Action::RequeueAfter(delay));
    }

    match ctx.jobs.create(&job).await {
        Ok(_) => {
            info!(job = %name, "created job for intent");
            let job_ref = ObjectRef::new(&name).within(&namespace);
            Ok(Action::Enqueue(Event::completion_check(
                job_ref,
                Arc::clone(intent),
            )))
        }
        Err(e) if e.is_already_exists() => {
            debug!(job = %name, "job created concurrently, skipping");
            Ok(Action::Done)
        }
        Err(e) => Err(e),
    }
}
