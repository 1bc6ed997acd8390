//! Background task registry
//!
//! A task is registered before its resource exists, so a failure while
//! acquiring the resource still leaves a record behind. Status moves from
//! RUNNING to exactly one terminal state; terminal records are frozen.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::reclaim::{ReclaimError, Reclaimable};

/// What kind of resource a task tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Shell,
    Browser,
    Agent,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Shell => write!(f, "shell"),
            TaskKind::Browser => write!(f, "browser"),
            TaskKind::Agent => write!(f, "agent"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Running,
    Completed,
    Error,
    Terminated,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Error,
        TaskStatus::Terminated,
    ];

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Running => write!(f, "RUNNING"),
            TaskStatus::Completed => write!(f, "COMPLETED"),
            TaskStatus::Error => write!(f, "ERROR"),
            TaskStatus::Terminated => write!(f, "TERMINATED"),
        }
    }
}

/// Record of one tracked resource
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundTask {
    pub id: Uuid,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub metadata: Map<String, Value>,
}

/// Outcome of a cleanup pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub terminated: usize,
    pub errored: usize,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.terminated + self.errored
    }
}

struct ReclaimTarget {
    id: Uuid,
    kind: TaskKind,
    lingering: bool,
    reclaimer: Option<Arc<dyn Reclaimable>>,
}

struct TaskEntry {
    task: BackgroundTask,
    reclaimer: Option<Arc<dyn Reclaimable>>,
}

impl TaskEntry {
    /// RUNNING, or terminal on record while its resource is still alive
    fn needs_reclaim(&self) -> bool {
        self.task.status == TaskStatus::Running
            || self.reclaimer.as_ref().is_some_and(|r| r.is_alive())
    }
}

/// Shared, cloneable registry of background tasks
#[derive(Clone, Default)]
pub struct TaskRegistry {
    inner: Arc<Mutex<HashMap<Uuid, TaskEntry>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Uuid, TaskEntry>> {
        // a panicking reclaimer must not take the registry down with it
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a new RUNNING task and return its fresh id
    pub fn register(&self, kind: TaskKind, metadata: Value) -> Uuid {
        let id = Uuid::new_v4();
        let task = BackgroundTask {
            id,
            kind,
            status: TaskStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            metadata: into_object(metadata),
        };

        debug!(task_id = %id, "◆ TASK REGISTERED: {}", kind);
        self.entries().insert(
            id,
            TaskEntry {
                task,
                reclaimer: None,
            },
        );
        id
    }

    /// Attach the handle cleanup uses to reclaim a running task
    pub fn attach(&self, id: Uuid, reclaimer: Arc<dyn Reclaimable>) -> bool {
        match self.entries().get_mut(&id) {
            Some(entry) if !entry.task.status.is_terminal() => {
                entry.reclaimer = Some(reclaimer);
                true
            }
            _ => false,
        }
    }

    /// Move a task to `status`, merging `patch` into its metadata.
    ///
    /// Returns false when the task is unknown or already terminal; terminal
    /// records are never rewritten.
    pub fn update_status(&self, id: Uuid, status: TaskStatus, patch: Value) -> bool {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(&id) else {
            warn!(task_id = %id, "◆ STATUS UPDATE FOR UNKNOWN TASK");
            return false;
        };

        if entry.task.status.is_terminal() {
            debug!(
                task_id = %id,
                "status update to {} ignored, task already {}", status, entry.task.status
            );
            return false;
        }

        for (key, value) in into_object(patch) {
            entry.task.metadata.insert(key, value);
        }
        entry.task.status = status;

        if status.is_terminal() {
            entry.task.end_time = Some(Utc::now());
            if !entry.reclaimer.as_ref().is_some_and(|r| r.is_alive()) {
                entry.reclaimer = None;
            }
            info!(task_id = %id, "◆ TASK {}: {}", status, entry.task.kind);
        }
        true
    }

    /// Drop the reclaim handle once the resource is known to be gone
    pub fn release(&self, id: Uuid) {
        if let Some(entry) = self.entries().get_mut(&id) {
            entry.reclaimer = None;
        }
    }

    pub fn get(&self, id: Uuid) -> Option<BackgroundTask> {
        self.entries().get(&id).map(|entry| entry.task.clone())
    }

    /// Tasks ordered by start time, optionally filtered by status
    pub fn get_tasks(&self, status: Option<TaskStatus>) -> Vec<BackgroundTask> {
        let mut tasks: Vec<BackgroundTask> = self
            .entries()
            .values()
            .filter(|entry| status.map_or(true, |s| entry.task.status == s))
            .map(|entry| entry.task.clone())
            .collect();
        tasks.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)));
        tasks
    }

    pub fn running_count(&self) -> usize {
        self.entries()
            .values()
            .filter(|entry| entry.task.status == TaskStatus::Running)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Reclaim every RUNNING task, plus terminal ones whose resource is
    /// still alive.
    ///
    /// Each reclaim runs on its own spawned task so a failure or panic in one
    /// branch never prevents the others from finishing. Successful branches
    /// end TERMINATED, failed ones ERROR. Records that were already terminal
    /// keep their status.
    pub async fn cleanup(&self) -> CleanupReport {
        let targets: Vec<ReclaimTarget> = self
            .entries()
            .values()
            .filter(|entry| entry.needs_reclaim())
            .map(|entry| ReclaimTarget {
                id: entry.task.id,
                kind: entry.task.kind,
                lingering: entry.task.status.is_terminal(),
                reclaimer: entry.reclaimer.clone(),
            })
            .collect();

        if targets.is_empty() {
            return CleanupReport::default();
        }

        let mut groups: BTreeMap<TaskKind, usize> = BTreeMap::new();
        for target in &targets {
            *groups.entry(target.kind).or_default() += 1;
        }
        let summary: Vec<String> = groups
            .iter()
            .map(|(kind, count)| format!("{} {}", count, kind))
            .collect();
        info!("◆ CLEANUP: RECLAIMING {}", summary.join(", "));

        let (ids, branches): (Vec<(Uuid, bool)>, Vec<_>) = targets
            .into_iter()
            .map(|target| {
                let reclaimer = target.reclaimer;
                let branch = tokio::spawn(async move {
                    match reclaimer {
                        Some(reclaimer) => reclaimer.reclaim().await,
                        None => Ok(()),
                    }
                });
                ((target.id, target.lingering), branch)
            })
            .unzip();

        // a task that ended on its own while being reclaimed is not counted
        let mut report = CleanupReport::default();
        for ((id, lingering), joined) in ids.into_iter().zip(join_all(branches).await) {
            let outcome = match joined {
                Ok(result) => result,
                Err(e) => Err(ReclaimError::Panicked(e.to_string())),
            };

            match outcome {
                Ok(()) => {
                    let updated = self.update_status(
                        id,
                        TaskStatus::Terminated,
                        json!({ "reclaimed": true }),
                    );
                    if updated || lingering {
                        report.terminated += 1;
                    }
                }
                Err(e) => {
                    warn!(task_id = %id, "◆ RECLAIM FAILED: {}", e);
                    let updated =
                        self.update_status(id, TaskStatus::Error, json!({ "error": e.to_string() }));
                    if updated || lingering {
                        report.errored += 1;
                    }
                }
            }
        }

        info!(
            "◆ CLEANUP COMPLETE: {} TERMINATED, {} ERRORED",
            report.terminated, report.errored
        );
        report
    }

    /// Synchronous last-resort teardown for process exit
    pub fn force_kill_all(&self) {
        let reclaimers: Vec<Arc<dyn Reclaimable>> = self
            .entries()
            .values()
            .filter(|entry| entry.needs_reclaim())
            .filter_map(|entry| entry.reclaimer.clone())
            .collect();

        if !reclaimers.is_empty() {
            warn!("◆ FORCE KILLING {} TASKS", reclaimers.len());
        }
        for reclaimer in reclaimers {
            reclaimer.force_kill();
        }
    }
}

fn into_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}
