//! Scheduler state shared by all handlers.

use std::collections::HashSet;
use std::time::Duration;

use berth_events::{Call, TaskState};
use berth_id::TaskId;
use tracing::debug;

use crate::error::SchedulerResult;
use crate::placement::PlacementMaps;
use crate::restart::RestartTracker;
use crate::sync::StoreOp;
use crate::task::{expand_definitions, normalize_definitions, Task, TaskDefinition};

/// Default restart-state set.
pub const DEFAULT_RESTART_STATES: [TaskState; 3] =
    [TaskState::Failed, TaskState::Lost, TaskState::Error];

/// Default time a restart waits for its replacement to run.
pub const DEFAULT_RESTART_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Scheduling behaviour switches.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Prefix of every task ID. Contains no spaces.
    pub framework_name: String,
    pub user: String,
    /// Statuses that send a launched task back to pending.
    pub restart_states: HashSet<TaskState>,
    pub kill_unknown_tasks: bool,
    pub serial_numbered_tasks: bool,
    pub static_ports: bool,
    /// Queue store writes. Off when running without a durable store.
    pub use_store: bool,
    /// Host the scheduler itself runs on.
    pub scheduler_host: String,
    pub restart_timeout: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            framework_name: "berth".to_string(),
            user: "root".to_string(),
            restart_states: DEFAULT_RESTART_STATES.into_iter().collect(),
            kill_unknown_tasks: false,
            serial_numbered_tasks: true,
            static_ports: false,
            use_store: false,
            scheduler_host: "localhost".to_string(),
            restart_timeout: DEFAULT_RESTART_TIMEOUT,
        }
    }
}

/// Something the scheduler reports to its embedder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Recovery finished; offers may be matched.
    Ready,
    Subscribed { framework_id: String },
    /// First status seen for a task, or it moved from staging to running.
    TaskLaunched { name: String, task_id: TaskId },
    TaskEnded { task_id: TaskId, state: TaskState },
    TaskRestarted { name: String },
    RollingRestartFinished { restarted: usize },
}

/// All task collections and caches, owned by one scheduling loop.
///
/// Each task instance lives in exactly one of `pending`, `launched` or
/// `kill`. `reconcile` only names launched tasks awaiting reconciliation.
#[derive(Debug)]
pub struct SchedulerState {
    pub options: SchedulerOptions,
    /// Task types, normalized.
    pub definitions: Vec<TaskDefinition>,
    /// Desired but not yet placed, in priority order.
    pub pending: Vec<Task>,
    pub launched: Vec<Task>,
    pub reconcile: Vec<TaskId>,
    /// Recovered tasks nobody wants any more.
    pub kill: Vec<Task>,
    pub placement: PlacementMaps,
    pub framework_id: Option<String>,
    pub restarts: RestartTracker,
    calls: Vec<Call>,
    writes: Vec<StoreOp>,
    notices: Vec<Notice>,
}

impl SchedulerState {
    /// Create state with every configured instance pending.
    pub fn new(
        options: SchedulerOptions,
        mut definitions: Vec<TaskDefinition>,
    ) -> SchedulerResult<Self> {
        normalize_definitions(&mut definitions)?;
        let pending = expand_definitions(&definitions);
        debug!(
            task_types = definitions.len(),
            pending = pending.len(),
            "Expanded task definitions"
        );

        Ok(Self {
            options,
            definitions,
            pending,
            launched: Vec::new(),
            reconcile: Vec::new(),
            kill: Vec::new(),
            placement: PlacementMaps::default(),
            framework_id: None,
            restarts: RestartTracker::default(),
            calls: Vec::new(),
            writes: Vec::new(),
            notices: Vec::new(),
        })
    }

    /// Definition of the task type called `type_name`.
    pub fn definition(&self, type_name: &str) -> Option<&TaskDefinition> {
        self.definitions.iter().find(|d| d.name == type_name)
    }

    /// Position of a launched task by ID.
    pub fn launched_position(&self, task_id: &TaskId) -> Option<usize> {
        self.launched
            .iter()
            .position(|t| t.task_id.as_ref() == Some(task_id))
    }

    pub fn find_launched(&self, task_id: &TaskId) -> Option<&Task> {
        self.launched_position(task_id).map(|i| &self.launched[i])
    }

    /// Queue a call to the resource manager.
    pub fn call(&mut self, call: Call) {
        self.calls.push(call);
    }

    /// Queue a store write. Dropped when persistence is off.
    pub fn persist(&mut self, op: StoreOp) {
        if self.options.use_store {
            self.writes.push(op);
        }
    }

    pub fn notify(&mut self, notice: Notice) {
        self.notices.push(notice);
    }

    /// Queue a kill for a task and forget its stored record.
    pub fn kill_call(&mut self, task_id: TaskId, agent_id: Option<String>) {
        self.persist(StoreOp::DeleteTask(task_id.clone()));
        self.call(Call::Kill { task_id, agent_id });
    }

    pub fn drain_calls(&mut self) -> Vec<Call> {
        std::mem::take(&mut self.calls)
    }

    pub fn drain_writes(&mut self) -> Vec<StoreOp> {
        std::mem::take(&mut self.writes)
    }

    pub fn drain_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    /// Record the framework ID assigned on subscription.
    pub fn subscribed(&mut self, framework_id: &str) {
        if self.framework_id.as_deref() != Some(framework_id) {
            self.framework_id = Some(framework_id.to_string());
            self.persist(StoreOp::SaveFrameworkId(framework_id.to_string()));
        }
        self.notify(Notice::Subscribed {
            framework_id: framework_id.to_string(),
        });
    }

    /// Checks that no task ID is tracked twice and no pending name repeats.
    pub fn is_consistent(&self) -> bool {
        let mut seen = HashSet::new();
        let unique_ids = self
            .launched
            .iter()
            .chain(self.pending.iter())
            .chain(self.kill.iter())
            .filter_map(|t| t.task_id.as_ref())
            .all(|id| seen.insert(id));
        let mut names = HashSet::new();
        unique_ids && self.pending.iter().all(|t| names.insert(t.name.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_expands_definitions() {
        let mut web = TaskDefinition::new("web");
        web.instances = 3;
        let state = SchedulerState::new(SchedulerOptions::default(), vec![web]).unwrap();
        assert_eq!(state.pending.len(), 3);
        assert_eq!(state.definitions[0].priority, Some(1));
        assert!(state.is_consistent());
    }

    #[test]
    fn test_persist_respects_use_store() {
        let mut state = SchedulerState::new(SchedulerOptions::default(), Vec::new()).unwrap();
        state.persist(StoreOp::SaveFrameworkId("fw".to_string()));
        assert!(state.drain_writes().is_empty());

        state.options.use_store = true;
        state.persist(StoreOp::SaveFrameworkId("fw".to_string()));
        assert_eq!(state.drain_writes().len(), 1);
    }

    #[test]
    fn test_subscribed_persists_once() {
        let options = SchedulerOptions {
            use_store: true,
            ..SchedulerOptions::default()
        };
        let mut state = SchedulerState::new(options, Vec::new()).unwrap();
        state.subscribed("fw-1");
        state.subscribed("fw-1");
        assert_eq!(state.drain_writes().len(), 1);
        assert_eq!(state.drain_notices().len(), 2);
        assert_eq!(state.framework_id.as_deref(), Some("fw-1"));
    }

    #[test]
    fn test_default_restart_states() {
        let options = SchedulerOptions::default();
        assert!(options.restart_states.contains(&TaskState::Failed));
        assert!(!options.restart_states.contains(&TaskState::Killed));
    }
}
