//! Events carried by the work queue
//!
//! The queue only ever holds two kinds of work, so events are a closed enum
//! rather than an untyped payload. Each event derives a [`QueueKey`] from the
//! namespace and name of the object it refers to; the key drives both
//! deduplication and retry bookkeeping in [`crate::queue::WorkQueue`].

use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::batch::v1::Job;
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;

use crate::crd::Intent;
use crate::queue::Keyed;

/// Work item processed by the dispatcher
#[derive(Clone, Debug)]
pub enum Event {
    /// An Intent was observed; ensure its parent Job exists
    IntentAdded(Arc<Intent>),
    /// Check whether a parent Job has finished and fan out on success
    JobCompletionCheck {
        /// The parent Job being tracked
        job: ObjectRef<Job>,
        /// Intent that owns the Job and its dependents
        intent: Arc<Intent>,
    },
}

/// Discriminates keys of different event kinds that share a name
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Key of an [`Event::IntentAdded`]
    Intent,
    /// Key of an [`Event::JobCompletionCheck`]
    JobCompletion,
}

/// Dedup and retry key for an [`Event`]
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueueKey {
    /// Event kind
    pub kind: EventKind,
    /// Namespace of the referenced object (empty if cluster scoped)
    pub namespace: String,
    /// Name of the referenced object
    pub name: String,
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            EventKind::Intent => "intent",
            EventKind::JobCompletion => "job-completion",
        };
        write!(f, "{kind}:{}/{}", self.namespace, self.name)
    }
}

impl Event {
    /// Completion check for `job`, owned by `intent`
    pub fn completion_check(job: ObjectRef<Job>, intent: Arc<Intent>) -> Self {
        Self::JobCompletionCheck { job, intent }
    }

    /// The Intent this event ultimately serves
    pub fn intent(&self) -> &Intent {
        match self {
            Self::IntentAdded(intent) | Self::JobCompletionCheck { intent, .. } => intent,
        }
    }
}

impl Keyed for Event {
    type Key = QueueKey;

    fn key(&self) -> QueueKey {
        match self {
            Self::IntentAdded(intent) => QueueKey {
                kind: EventKind::Intent,
                namespace: intent.namespace().unwrap_or_default(),
                name: intent.name_any(),
            },
            Self::JobCompletionCheck { job, .. } => QueueKey {
                kind: EventKind::JobCompletion,
                namespace: job.namespace.clone().unwrap_or_default(),
                name: job.name.clone(),
            },
        }
    }
}
