//! Durable state synchronization.
//!
//! Layout below the store root, one subtree per framework:
//!
//! ```text
//! /<framework>/framework-id      framework ID from the last subscription
//! /<framework>/tasks/<task-id>   JSON snapshot of a launched task
//! /<framework>/taskDefs/<name>   {"name", "instances"} after scaling
//! ```
//!
//! Handlers only queue [`StoreOp`]s; [`TaskStore::apply`] performs them.
//! Writes are fire-and-forget: failures are logged and the periodic
//! reconciliation repairs whatever was lost.

use std::collections::HashSet;
use std::sync::Arc;

use berth_id::{compare_task_ids, strip_serial, TaskId};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::error::SchedulerResult;
use crate::state::{Notice, SchedulerState};
use crate::store::DurableStore;
use crate::task::{Task, TaskDefinition};

/// A store write queued by a handler.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    SaveTask(Box<Task>),
    DeleteTask(TaskId),
    SaveTaskDef { name: String, instances: u32 },
    SaveFrameworkId(String),
}

impl StoreOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SaveTask(_) => "save_task",
            Self::DeleteTask(_) => "delete_task",
            Self::SaveTaskDef { .. } => "save_task_def",
            Self::SaveFrameworkId(_) => "save_framework_id",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TaskDefRecord {
    name: String,
    instances: u32,
}

/// What recovery did with one stored task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Matched a pending task, which took over the stored launch.
    Adopted,
    /// Another record for an already recovered name.
    Duplicated,
    /// Matched, but the stored task is no longer live.
    Purged,
    /// Unmatched persistent task kept as launched.
    Persistent,
    /// Unmatched task queued for killing.
    Killed,
}

/// Names recovered so far in one recovery pass.
#[derive(Debug, Default)]
pub struct RecoveryPass {
    loaded: HashSet<String>,
}

/// Counts from one recovery pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryStats {
    pub records: usize,
    /// Records without data or with data that does not parse.
    pub discarded: usize,
    pub adopted: usize,
    pub duplicated: usize,
    pub purged: usize,
    pub persistent: usize,
    pub killed: usize,
}

impl RecoveryStats {
    fn record(&mut self, action: RecoveryAction) {
        match action {
            RecoveryAction::Adopted => self.adopted += 1,
            RecoveryAction::Duplicated => self.duplicated += 1,
            RecoveryAction::Purged => self.purged += 1,
            RecoveryAction::Persistent => self.persistent += 1,
            RecoveryAction::Killed => self.killed += 1,
        }
    }
}

/// Task persistence for one framework.
#[derive(Clone)]
pub struct TaskStore {
    store: Arc<dyn DurableStore>,
    root: String,
}

impl TaskStore {
    pub fn new(store: Arc<dyn DurableStore>, framework_name: &str) -> Self {
        Self {
            store,
            root: format!("/{}", framework_name),
        }
    }

    fn tasks_path(&self) -> String {
        format!("{}/tasks", self.root)
    }

    fn task_path(&self, task_id: &str) -> String {
        format!("{}/tasks/{}", self.root, task_id)
    }

    fn task_def_path(&self, name: &str) -> String {
        format!("{}/taskDefs/{}", self.root, name.replace('/', "_"))
    }

    fn framework_id_path(&self) -> String {
        format!("{}/framework-id", self.root)
    }

    async fn write(&self, path: &str, data: &[u8]) -> SchedulerResult<()> {
        self.store.mkdir_if_absent(path).await?;
        self.store.set_data(path, data).await?;
        Ok(())
    }

    /// Store a snapshot of a launched task.
    pub async fn save_task(&self, task: &Task) -> SchedulerResult<()> {
        let Some(task_id) = &task.task_id else {
            warn!(task = %task.name, "Not saving task without an ID");
            return Ok(());
        };
        let data = serde_json::to_vec(task)?;
        self.write(&self.task_path(task_id.as_str()), &data).await?;
        debug!(task_id = %task_id, "Saved task");
        Ok(())
    }

    /// Remove a stored task. Missing tasks are not an error.
    pub async fn delete_task(&self, task_id: &str) -> SchedulerResult<()> {
        match self.store.delete(&self.task_path(task_id)).await {
            Ok(()) => {
                debug!(task_id, "Deleted task");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save_task_def(&self, name: &str, instances: u32) -> SchedulerResult<()> {
        let record = TaskDefRecord {
            name: name.to_string(),
            instances,
        };
        let data = serde_json::to_vec(&record)?;
        self.write(&self.task_def_path(name), &data).await?;
        debug!(task_type = %name, instances, "Saved task definition");
        Ok(())
    }

    /// Override configured instance counts with the stored ones.
    #[instrument(skip(self, definitions))]
    pub async fn load_task_defs(&self, definitions: &mut [TaskDefinition]) -> SchedulerResult<()> {
        for definition in definitions.iter_mut() {
            let path = self.task_def_path(&definition.name);
            let data = match self.store.get_data(&path).await {
                Ok(Some(data)) => data,
                Ok(None) => continue,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            };
            match serde_json::from_slice::<TaskDefRecord>(&data) {
                Ok(record) => {
                    debug!(
                        task_type = %definition.name,
                        instances = record.instances,
                        "Loaded stored instance count"
                    );
                    definition.instances = record.instances;
                }
                Err(e) => warn!(task_type = %definition.name, error = %e, "Ignoring unreadable task definition"),
            }
        }
        Ok(())
    }

    pub async fn save_framework_id(&self, framework_id: &str) -> SchedulerResult<()> {
        self.write(&self.framework_id_path(), framework_id.as_bytes())
            .await
    }

    pub async fn load_framework_id(&self) -> SchedulerResult<Option<String>> {
        match self.store.get_data(&self.framework_id_path()).await {
            Ok(data) => Ok(data
                .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_string())
                .filter(|id| !id.is_empty())),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Perform a queued write, logging failures.
    pub async fn apply(&self, op: StoreOp) {
        let kind = op.name();
        let result = match &op {
            StoreOp::SaveTask(task) => self.save_task(task).await,
            StoreOp::DeleteTask(task_id) => self.delete_task(task_id.as_str()).await,
            StoreOp::SaveTaskDef { name, instances } => self.save_task_def(name, *instances).await,
            StoreOp::SaveFrameworkId(id) => self.save_framework_id(id).await,
        };
        if let Err(e) = result {
            error!(op = kind, error = %e, "Store write failed");
        }
    }

    async fn discard(&self, task_id: &str) {
        if let Err(e) = self.delete_task(task_id).await {
            error!(task_id, error = %e, "Could not delete stored task");
        }
    }

    /// Load stored tasks into freshly created state.
    ///
    /// Records are processed one at a time in task-ID order. Signals
    /// [`Notice::Ready`] once every record has been handled, including when
    /// the store cannot be read.
    #[instrument(skip(self, state), fields(root = %self.root))]
    pub async fn recover(&self, state: &mut SchedulerState) -> SchedulerResult<RecoveryStats> {
        let mut stats = RecoveryStats::default();

        let mut children = match self.store.get_children(&self.tasks_path()).await {
            Ok(children) => children,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => {
                error!(error = %e, "Could not load task information");
                state.notify(Notice::Ready);
                return Ok(stats);
            }
        };
        children.sort_by(|a, b| compare_task_ids(a, b));

        let mut pass = RecoveryPass::default();
        for child in children {
            stats.records += 1;
            let data = match self.store.get_data(&self.task_path(&child)).await {
                Ok(Some(data)) => data,
                Ok(None) => {
                    warn!(task_id = %child, "Stored task has no data");
                    stats.discarded += 1;
                    self.discard(&child).await;
                    continue;
                }
                Err(e) => {
                    error!(task_id = %child, error = %e, "Could not load task");
                    continue;
                }
            };

            let mut record: Task = match serde_json::from_slice(&data) {
                Ok(record) => record,
                Err(e) => {
                    warn!(task_id = %child, error = %e, "Discarding unreadable task");
                    stats.discarded += 1;
                    self.discard(&child).await;
                    continue;
                }
            };
            if record.task_id.is_none() {
                record.task_id = child.parse().ok();
            }

            let action = state.restore_task(record, &mut pass);
            debug!(task_id = %child, ?action, "Recovered task");
            stats.record(action);
        }

        for op in state.drain_writes() {
            self.apply(op).await;
        }

        info!(
            records = stats.records,
            adopted = stats.adopted,
            killed = stats.killed,
            pending = state.pending.len(),
            "Recovered tasks"
        );
        state.notify(Notice::Ready);
        Ok(stats)
    }
}

impl SchedulerState {
    /// Route one stored task during recovery.
    ///
    /// Matching order: exact name against pending, then by task type when the
    /// name was not recovered yet, then as a duplicate of an already
    /// recovered task with the same name. Two types whose names only differ
    /// in a numeric suffix can be confused by the type match.
    pub fn restore_task(&mut self, record: Task, pass: &mut RecoveryPass) -> RecoveryAction {
        let seen = pass.loaded.contains(&record.name);
        let exact = self.pending.iter().position(|t| t.name == record.name);
        let matched = match exact {
            Some(index) => Some((index, false)),
            None if !seen => self
                .pending
                .iter()
                .position(|t| strip_serial(&t.name) == strip_serial(&record.name))
                .map(|index| (index, true)),
            None => None,
        };

        if let Some((index, renamed)) = matched {
            if !record.is_live() {
                return self.discard_record(record);
            }
            let mut task = self.pending.remove(index);
            if renamed {
                debug!(from = %task.name, to = %record.name, "Recovered task under stored name");
                task.name = record.name.clone();
            }
            task.adopt(&record);
            pass.loaded.insert(record.name.clone());
            self.admit(task);
            return RecoveryAction::Adopted;
        }

        let template = if seen {
            self.launched.iter().find(|t| t.name == record.name).cloned()
        } else {
            None
        };
        if let Some(mut duplicate) = template {
            if !record.is_live() {
                return self.discard_record(record);
            }
            duplicate.adopt(&record);
            self.admit(duplicate);
            return RecoveryAction::Duplicated;
        }

        if record.spec.persistent {
            return self.keep_persistent(record);
        }

        info!(task = %record.name, task_id = ?record.task_id, "Marking stored task to be killed");
        self.kill.push(record);
        RecoveryAction::Killed
    }

    fn admit(&mut self, task: Task) {
        if let Some(task_id) = &task.task_id {
            self.reconcile.push(task_id.clone());
        }
        self.placement.record(&task);
        self.launched.push(task);
    }

    /// Drop a stored task that is no longer live, unless it is persistent.
    fn discard_record(&mut self, record: Task) -> RecoveryAction {
        if record.spec.persistent {
            return self.keep_persistent(record);
        }
        self.purge_record(&record);
        RecoveryAction::Purged
    }

    fn keep_persistent(&mut self, record: Task) -> RecoveryAction {
        debug!(task = %record.name, "Keeping persistent task");
        self.placement.record(&record);
        self.launched.push(record);
        RecoveryAction::Persistent
    }

    fn purge_record(&mut self, record: &Task) {
        debug!(task = %record.name, "Purging stale stored task");
        if let Some(task_id) = &record.task_id {
            self.persist(StoreOp::DeleteTask(task_id.clone()));
        }
    }
}
