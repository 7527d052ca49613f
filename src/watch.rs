//! Watch source: reflector-backed caches and change notifications
//!
//! Two watchers run for the lifetime of the controller, one for Intents and
//! one for Jobs, across all namespaces. Each feeds a reflector store, which
//! is the read-only local cache the workers consult. Notifications are turned
//! into queue events:
//! - every applied Intent becomes an [`Event::IntentAdded`]
//! - a parent Job that reaches a terminal phase becomes an
//!   [`Event::JobCompletionCheck`], so completion is noticed without waiting
//!   for the next delayed re-check
//!
//! Parent Jobs that had already failed before a (re)start are skipped during
//! the initial listing; their failure was reported when it happened.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use k8s_openapi::api::batch::v1::Job;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, ResourceExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::{IntentCache, JobCache};
use crate::crd::Intent;
use crate::event::Event;
use crate::job::{parent_intent_name, JobPhase};
use crate::queue::WorkQueue;
use crate::Error;

/// Running watchers and the caches they keep in sync
pub struct WatchSource {
    intents: Store<Intent>,
    jobs: Store<Job>,
    tasks: JoinSet<()>,
}

impl WatchSource {
    /// Start the Intent and Job watchers.
    ///
    /// Both stop when `shutdown` is cancelled.
    pub fn spawn(
        client: Client,
        queue: WorkQueue<Event>,
        shutdown: CancellationToken,
        watch_timeout_secs: u32,
    ) -> Self {
        let config = WatcherConfig::default().timeout(watch_timeout_secs);
        let mut tasks = JoinSet::new();

        let (intents, intent_writer) = reflector::store::<Intent>();
        let intent_stream = reflector::reflector(
            intent_writer,
            watcher::watcher(Api::<Intent>::all(client.clone()), config.clone()),
        )
        .default_backoff();
        tasks.spawn(pump(
            "intent",
            intent_stream,
            queue.clone(),
            shutdown.clone(),
            intent_event,
        ));

        let (jobs, job_writer) = reflector::store::<Job>();
        let job_stream = reflector::reflector(
            job_writer,
            watcher::watcher(Api::<Job>::all(client), config),
        )
        .default_backoff();
        let intent_cache = intents.clone();
        tasks.spawn(pump(
            "job",
            job_stream,
            queue,
            shutdown,
            move |event| job_event(event, |ns, name| lookup(&intent_cache, ns, name)),
        ));

        info!("- Intent watcher");
        info!("- Job watcher");

        Self {
            intents,
            jobs,
            tasks,
        }
    }

    /// Wait until both caches hold a full initial listing.
    ///
    /// Returns `Ok(false)` if `shutdown` fired first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cache`] if a watcher stopped before its cache synced.
    pub async fn wait_for_sync(&self, shutdown: &CancellationToken) -> Result<bool, Error> {
        let synced = async {
            self.intents
                .wait_until_ready()
                .await
                .map_err(|e| Error::cache(format!("intent cache: {e}")))?;
            self.jobs
                .wait_until_ready()
                .await
                .map_err(|e| Error::cache(format!("job cache: {e}")))
        };

        tokio::select! {
            _ = shutdown.cancelled() => Ok(false),
            result = synced => result.map(|()| true),
        }
    }

    /// Read-only view of the Job cache for the workers
    pub fn job_cache(&self) -> StoreJobCache {
        StoreJobCache::new(self.jobs.clone())
    }

    /// Read-only view of the Intent cache for the workers
    pub fn intent_cache(&self) -> StoreIntentCache {
        StoreIntentCache::new(self.intents.clone())
    }

    /// Wait for the watch loops to exit
    pub async fn stopped(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "watch task failed");
            }
        }
    }
}

/// [`JobCache`] backed by a reflector store
#[derive(Clone)]
pub struct StoreJobCache {
    store: Store<Job>,
}

impl StoreJobCache {
    /// Wrap a reflector store
    pub fn new(store: Store<Job>) -> Self {
        Self { store }
    }
}

impl JobCache for StoreJobCache {
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<Job>>, Error> {
        Ok(self.store.get(&ObjectRef::new(name).within(namespace)))
    }
}

/// [`IntentCache`] backed by a reflector store
#[derive(Clone)]
pub struct StoreIntentCache {
    store: Store<Intent>,
}

impl StoreIntentCache {
    /// Wrap a reflector store
    pub fn new(store: Store<Intent>) -> Self {
        Self { store }
    }
}

impl IntentCache for StoreIntentCache {
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<Intent>>, Error> {
        Ok(lookup(&self.store, namespace, name))
    }
}

fn lookup(intents: &Store<Intent>, namespace: &str, name: &str) -> Option<Arc<Intent>> {
    intents.get(&ObjectRef::new(name).within(namespace))
}

/// Drive a watch stream until shutdown, translating notifications to events
async fn pump<K, S, F>(
    kind: &'static str,
    stream: S,
    queue: WorkQueue<Event>,
    shutdown: CancellationToken,
    translate: F,
) where
    S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send,
    F: Fn(watcher::Event<K>) -> Option<Event> + Send,
{
    let mut stream = std::pin::pin!(stream.take_until(shutdown.cancelled_owned()));

    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => {
                if let Some(event) = translate(event) {
                    queue.add(event);
                }
            }
            Err(e) => warn!(%kind, error = %e, "watch error, backing off"),
        }
    }

    debug!(%kind, "watch loop stopped");
}

/// Every applied Intent is (re)queued; deletion is left to garbage collection
fn intent_event(event: watcher::Event<Intent>) -> Option<Event> {
    match event {
        watcher::Event::Apply(intent) | watcher::Event::InitApply(intent) => {
            debug!(intent = %intent.name_any(), namespace = ?intent.namespace(), "intent observed");
            Some(Event::IntentAdded(Arc::new(intent)))
        }
        watcher::Event::Delete(intent) => {
            debug!(
                intent = %intent.name_any(),
                "intent deleted, owned jobs are garbage collected"
            );
            None
        }
        watcher::Event::Init | watcher::Event::InitDone => None,
    }
}

fn job_event<L>(event: watcher::Event<Job>, lookup: L) -> Option<Event>
where
    L: Fn(&str, &str) -> Option<Arc<Intent>>,
{
    match event {
        watcher::Event::Apply(job) => completion_trigger(&job, false, lookup),
        watcher::Event::InitApply(job) => completion_trigger(&job, true, lookup),
        watcher::Event::Delete(_) | watcher::Event::Init | watcher::Event::InitDone => None,
    }
}

/// Completion check for a parent Job that just reached a terminal phase.
///
/// `initial` marks Jobs seen in the initial listing: succeeded ones still
/// trigger (fan-out may have been interrupted), failed ones do not.
fn completion_trigger<L>(job: &Job, initial: bool, lookup: L) -> Option<Event>
where
    L: Fn(&str, &str) -> Option<Arc<Intent>>,
{
    let intent_name = parent_intent_name(job)?;
    let phase = JobPhase::of(job);
    if !phase.is_terminal() {
        return None;
    }

    let namespace = job.namespace()?;
    if initial && phase == JobPhase::Failed {
        debug!(job = %intent_name, %namespace, "parent job failed before startup, ignoring");
        return None;
    }
    let Some(intent) = lookup(&namespace, &intent_name) else {
        debug!(job = %intent_name, %namespace, "owning intent not cached, ignoring job update");
        return None;
    };

    debug!(job = %intent_name, %namespace, %phase, "parent job finished");
    Some(Event::completion_check(
        ObjectRef::new(&intent_name).within(&namespace),
        intent,
    ))
}
