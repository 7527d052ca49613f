//! End-to-end controller flow over an in-memory cluster
//!
//! These tests drive the real worker pool and work queue. The API server and
//! the reflector caches are replaced by in-memory Intent and Job tables, so
//! Jobs created by a worker are visible to the next existence check, exactly
//! as they would be once the watch delivers them. Deleting an Intent also
//! removes the Jobs it owns, standing in for garbage collection.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use kube::ResourceExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use intent_operator::controller::{
    Context, Controller, ControllerConfig, IntentCache, JobCache, JobClient,
};
use intent_operator::crd::{Intent, IntentSpec};
use intent_operator::event::Event;
use intent_operator::queue::WorkQueue;
use intent_operator::Error;

// =============================================================================
// Test Fixtures
// =============================================================================

/// Intents and Jobs keyed by (namespace, name), plus call counters
#[derive(Default)]
struct FakeCluster {
    intents: Mutex<BTreeMap<(String, String), Arc<Intent>>>,
    jobs: Mutex<BTreeMap<(String, String), Job>>,
    creates: Mutex<u32>,
    job_lookups: Mutex<u32>,
}

impl FakeCluster {
    fn apply_intent(&self, intent: Arc<Intent>) {
        let key = (intent.namespace().unwrap_or_default(), intent.name_any());
        self.intents.lock().insert(key, intent);
    }

    /// Delete an Intent and garbage collect the Jobs it owns
    fn delete_intent(&self, namespace: &str, name: &str) {
        let Some(intent) = self
            .intents
            .lock()
            .remove(&(namespace.to_string(), name.to_string()))
        else {
            return;
        };
        let uid = intent.uid();
        self.jobs.lock().retain(|_, job| {
            !job.owner_references()
                .iter()
                .any(|o| Some(&o.uid) == uid.as_ref())
        });
    }

    fn job_lookups(&self) -> u32 {
        *self.job_lookups.lock()
    }

    fn job(&self, namespace: &str, name: &str) -> Option<Job> {
        self.jobs
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn names(&self) -> Vec<String> {
        self.jobs.lock().keys().map(|(_, name)| name.clone()).collect()
    }

    fn creates(&self) -> u32 {
        *self.creates.lock()
    }

    /// Simulate the Job controller finishing a Job
    fn finish(&self, namespace: &str, name: &str, succeeded: bool) {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .get_mut(&(namespace.to_string(), name.to_string()))
            .expect("job to finish must exist");
        job.status = Some(if succeeded {
            JobStatus {
                succeeded: Some(1),
                ..Default::default()
            }
        } else {
            JobStatus {
                failed: Some(1),
                ..Default::default()
            }
        });
    }
}

#[async_trait]
impl JobClient for FakeCluster {
    async fn create(&self, job: &Job) -> Result<Job, Error> {
        *self.creates.lock() += 1;
        let key = (job.namespace().unwrap_or_default(), job.name_any());
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&key) {
            return Err(Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: format!("jobs.batch \"{}\" already exists", key.1),
                reason: "AlreadyExists".to_string(),
                code: 409,
            })));
        }
        jobs.insert(key, job.clone());
        Ok(job.clone())
    }
}

impl JobCache for FakeCluster {
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<Job>>, Error> {
        *self.job_lookups.lock() += 1;
        Ok(self.job(namespace, name).map(Arc::new))
    }
}

impl IntentCache for FakeCluster {
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<Intent>>, Error> {
        Ok(self
            .intents
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}

fn intent(name: &str, message: &str, force_failure: bool) -> Arc<Intent> {
    intent_with_uid(name, message, force_failure, &format!("{name}-uid"))
}

fn intent_with_uid(name: &str, message: &str, force_failure: bool, uid: &str) -> Arc<Intent> {
    let mut intent = Intent::new(
        name,
        IntentSpec {
            message: message.to_string(),
            force_failure,
        },
    );
    intent.metadata.namespace = Some("default".to_string());
    intent.metadata.uid = Some(uid.to_string());
    Arc::new(intent)
}

struct Harness {
    cluster: Arc<FakeCluster>,
    queue: WorkQueue<Event>,
    shutdown: CancellationToken,
    controller: tokio::task::JoinHandle<()>,
}

impl Harness {
    fn start() -> Self {
        let cluster = Arc::new(FakeCluster::default());
        let queue = WorkQueue::with_default_rate_limiter();
        let shutdown = CancellationToken::new();
        let config = ControllerConfig::default();

        let ctx = Context::new(
            cluster.clone(),
            cluster.clone(),
            cluster.clone(),
            config.clone(),
        );
        let controller = tokio::spawn(
            Controller::new(queue.clone(), Arc::new(ctx), config).run(shutdown.clone()),
        );

        Self {
            cluster,
            queue,
            shutdown,
            controller,
        }
    }

    /// Store the Intent and deliver its watch event
    fn apply(&self, intent: Arc<Intent>) {
        self.cluster.apply_intent(intent.clone());
        self.queue.add(Event::IntentAdded(intent));
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.controller.await.expect("controller task panicked");
    }
}

/// Let the workers run; with paused time this also fires delayed requeues
async fn settle(duration: Duration) {
    tokio::time::sleep(duration).await;
}

fn command(job: &Job) -> Vec<String> {
    job.spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.containers.first())
        .and_then(|c| c.command.clone())
        .unwrap_or_default()
}

// =============================================================================
// Stories
// =============================================================================

/// Story: a user creates Intent `greet` with message "hi"
///
/// Expected behavior:
/// - a Job `greet` running `echo hi` appears in `default`
/// - nothing else is created while it runs
/// - once it succeeds, `dependent-job-0..4` appear, each owned by `greet`
#[tokio::test(start_paused = true)]
async fn story_intent_runs_job_then_fans_out_dependents() {
    let harness = Harness::start();
    harness.apply(intent("greet", "hi", false));

    settle(Duration::from_millis(100)).await;
    let parent = harness
        .cluster
        .job("default", "greet")
        .expect("parent job created");
    assert_eq!(command(&parent), vec!["echo", "hi"]);

    // Still running: the completion check keeps re-checking without fanning out
    settle(Duration::from_secs(20)).await;
    assert_eq!(harness.cluster.names(), vec!["greet"]);

    harness.cluster.finish("default", "greet", true);
    settle(Duration::from_secs(10)).await;

    let mut dependents: Vec<String> = harness
        .cluster
        .names()
        .into_iter()
        .filter(|n| n != "greet")
        .collect();
    dependents.sort();
    assert_eq!(
        dependents,
        vec![
            "dependent-job-0",
            "dependent-job-1",
            "dependent-job-2",
            "dependent-job-3",
            "dependent-job-4"
        ]
    );
    for name in &dependents {
        let job = harness.cluster.job("default", name).unwrap();
        let owner = &job.owner_references()[0];
        assert_eq!(owner.name, "greet");
        assert_eq!(owner.kind, "Intent");
        assert_eq!(owner.controller, Some(true));
        assert_eq!(command(&job), vec!["echo", "hi"]);
    }
    assert_eq!(harness.cluster.creates(), 6);

    harness.stop().await;
}

/// Story: the same Intent is observed repeatedly (resyncs, restarts)
///
/// Expected behavior: exactly one parent Job is ever created.
#[tokio::test(start_paused = true)]
async fn story_repeated_intent_events_create_one_job() {
    let harness = Harness::start();
    let greet = intent("greet", "hi", false);

    harness.apply(greet.clone());
    harness.apply(greet.clone());
    settle(Duration::from_millis(100)).await;
    harness.apply(greet);
    settle(Duration::from_millis(100)).await;

    assert_eq!(harness.cluster.names(), vec!["greet"]);
    assert_eq!(harness.cluster.creates(), 1);

    harness.stop().await;
}

/// Story: an Intent with `forceFailure` set
///
/// Expected behavior: the parent Job fails and no dependents are created,
/// no matter how long the controller keeps running.
#[tokio::test(start_paused = true)]
async fn story_failed_parent_never_fans_out() {
    let harness = Harness::start();
    harness.apply(intent("boom", "unused", true));

    settle(Duration::from_millis(100)).await;
    let parent = harness.cluster.job("default", "boom").expect("parent job");
    assert_eq!(command(&parent), vec!["sh", "-c", "exit 1"]);

    harness.cluster.finish("default", "boom", false);
    settle(Duration::from_secs(60)).await;

    assert_eq!(harness.cluster.names(), vec!["boom"]);
    assert_eq!(harness.cluster.creates(), 1);
    assert!(harness.queue.is_empty());

    harness.stop().await;
}

/// Story: an Intent is deleted while its parent Job is still running
///
/// Expected behavior: garbage collection removes the Job, the pending
/// completion check ends, and the controller goes quiet.
#[tokio::test(start_paused = true)]
async fn story_deleted_intent_stops_completion_checks() {
    let harness = Harness::start();
    harness.apply(intent("greet", "hi", false));

    settle(Duration::from_millis(100)).await;
    assert!(harness.cluster.job("default", "greet").is_some());

    harness.cluster.delete_intent("default", "greet");
    settle(Duration::from_secs(10)).await;
    let lookups = harness.cluster.job_lookups();

    settle(Duration::from_secs(6 * 60 * 60)).await;
    assert_eq!(harness.cluster.job_lookups(), lookups);
    assert!(harness.cluster.names().is_empty());
    assert!(harness.queue.is_empty());

    harness.stop().await;
}

/// Story: an Intent is deleted mid-run and recreated under the same name
///
/// Expected behavior: the new Intent gets its own parent Job, and when it
/// succeeds every dependent is owned by the new Intent, not the deleted one.
#[tokio::test(start_paused = true)]
async fn story_recreated_intent_fans_out_under_its_own_uid() {
    let harness = Harness::start();
    harness.apply(intent_with_uid("greet", "hi", false, "first-uid"));
    settle(Duration::from_millis(100)).await;

    harness.cluster.delete_intent("default", "greet");
    harness.apply(intent_with_uid("greet", "again", false, "second-uid"));
    settle(Duration::from_millis(100)).await;

    let parent = harness
        .cluster
        .job("default", "greet")
        .expect("parent job recreated");
    assert_eq!(parent.owner_references()[0].uid, "second-uid");
    assert_eq!(command(&parent), vec!["echo", "again"]);

    harness.cluster.finish("default", "greet", true);
    settle(Duration::from_secs(20)).await;

    let dependents: Vec<Job> = harness
        .cluster
        .names()
        .into_iter()
        .filter(|n| n != "greet")
        .filter_map(|n| harness.cluster.job("default", &n))
        .collect();
    assert_eq!(dependents.len(), 5);
    for job in &dependents {
        assert_eq!(job.owner_references()[0].uid, "second-uid");
        assert_eq!(command(job), vec!["echo", "again"]);
    }

    harness.stop().await;
}

/// Story: a recreated Intent finds the old Job still cached
///
/// Expected behavior: it waits for garbage collection rather than adopting
/// the old Job, then creates its own.
#[tokio::test(start_paused = true)]
async fn story_recreated_intent_waits_for_old_job_removal() {
    let harness = Harness::start();
    harness.apply(intent_with_uid("greet", "hi", false, "first-uid"));
    settle(Duration::from_millis(100)).await;

    // Replace the Intent without collecting its Job yet
    harness.apply(intent_with_uid("greet", "again", false, "second-uid"));
    settle(Duration::from_secs(20)).await;

    let parent = harness.cluster.job("default", "greet").unwrap();
    assert_eq!(parent.owner_references()[0].uid, "first-uid");
    assert_eq!(harness.cluster.creates(), 1);

    // Garbage collection catches up
    harness.cluster.jobs.lock().clear();
    settle(Duration::from_secs(20)).await;

    let parent = harness.cluster.job("default", "greet").expect("new parent job");
    assert_eq!(parent.owner_references()[0].uid, "second-uid");
    assert_eq!(harness.cluster.creates(), 2);

    harness.stop().await;
}
