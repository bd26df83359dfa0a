//! Task lifecycle transitions.
//!
//! - status updates: restart, remove or refresh launched tasks
//! - scaling: add serial-numbered instances or retire surplus ones
//! - kills requested through the task API
//! - periodic sync: reconcile launched tasks and kill orphans

use std::collections::BTreeSet;

use berth_events::{Call, ReconcileTask, TaskState, TaskStatus};
use berth_id::{serial_of, with_serial, TaskId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::state::{Notice, SchedulerState};
use crate::sync::StoreOp;
use crate::task::{RuntimeInfo, Task};

/// Counts for one task type.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TaskTypeStats {
    /// Launched instances not marked for removal.
    pub running: usize,
    pub pending: usize,
    /// Serials held by launched or pending instances.
    pub serials: BTreeSet<u64>,
    pub leader_serials: BTreeSet<u64>,
}

/// What a scale request changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleOutcome {
    Unchanged,
    Added(Vec<String>),
    /// Removed from pending, and killed while launched.
    Removed {
        pending: Vec<String>,
        killed: Vec<TaskId>,
    },
}

/// Operations exposed to the task API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Scale { task_type: String, instances: u32 },
    Kill { task_id: TaskId },
    KillAll,
    KillType { task_type: String },
    Restart { task_id: TaskId },
    RollingRestart,
}

impl SchedulerState {
    // =========================================================================
    // Status updates
    // =========================================================================

    /// Apply a status update from the resource manager.
    pub fn handle_status(&mut self, status: &TaskStatus) {
        let position = self.launched_position(&status.task_id);
        let restartable = self.options.restart_states.contains(&status.state);

        match position {
            Some(index) if restartable => self.restart_failed(index, status),
            Some(index) => {
                if matches!(status.state, TaskState::Killed | TaskState::Finished)
                    || self.launched[index].do_not_restart()
                {
                    self.remove_ended(index, status);
                } else {
                    self.refresh_runtime(index, status);
                }
            }
            None => self.handle_unknown(status),
        }

        if let (Some(uuid), Some(agent_id)) = (&status.uuid, &status.agent_id) {
            self.call(Call::Acknowledge {
                agent_id: agent_id.clone(),
                task_id: status.task_id.clone(),
                uuid: uuid.clone(),
            });
        }
    }

    fn restart_failed(&mut self, index: usize, status: &TaskStatus) {
        let mut task = self.launched.remove(index);
        self.placement.forget(&task);
        self.persist(StoreOp::DeleteTask(status.task_id.clone()));
        self.notify(Notice::TaskEnded {
            task_id: status.task_id.clone(),
            state: status.state,
        });

        if task.do_not_restart() {
            info!(task = %task.name, state = %status.state, "Task ended, not restarting");
            return;
        }

        info!(task = %task.name, state = %status.state, "Task ended, restarting");
        task.cleanup();
        self.pending.push(task);
    }

    fn remove_ended(&mut self, index: usize, status: &TaskStatus) {
        let task = self.launched.remove(index);
        info!(task = %task.name, state = %status.state, "Task removed");
        self.placement.forget(&task);
        self.persist(StoreOp::DeleteTask(status.task_id.clone()));
        self.notify(Notice::TaskEnded {
            task_id: status.task_id.clone(),
            state: status.state,
        });
    }

    fn refresh_runtime(&mut self, index: usize, status: &TaskStatus) {
        let task = &mut self.launched[index];
        let previous = task.runtime.take();
        let previous_state = previous.as_ref().map(|r| r.state);

        let runtime = match previous {
            Some(prev) => RuntimeInfo {
                agent_id: status.agent_id.clone().unwrap_or(prev.agent_id),
                executor_id: status.executor_id.clone().or(prev.executor_id),
                state: status.state,
                healthy: status.healthy.or(prev.healthy),
                ..prev
            },
            None => {
                let mut runtime = RuntimeInfo::staging(
                    status.agent_id.as_deref().unwrap_or_default(),
                    Default::default(),
                    task.spec.resources.clone(),
                );
                runtime.state = status.state;
                runtime.executor_id = status.executor_id.clone();
                runtime.healthy = status.healthy;
                runtime.task_version = task.spec.task_version.clone();
                runtime
            }
        };
        task.runtime = Some(runtime);

        let started = match previous_state {
            None => true,
            Some(TaskState::Staging | TaskState::Starting) => status.state == TaskState::Running,
            Some(_) => false,
        };
        let name = task.name.clone();
        let snapshot = task.clone();

        debug!(task = %name, state = %status.state, "Task status updated");
        if started {
            self.notify(Notice::TaskLaunched {
                name,
                task_id: status.task_id.clone(),
            });
        }
        self.persist(StoreOp::SaveTask(Box::new(snapshot)));
    }

    fn handle_unknown(&mut self, status: &TaskStatus) {
        if !status.is_reconciliation() {
            debug!(task_id = %status.task_id, state = %status.state, "Update for untracked task");
            return;
        }

        if self.options.kill_unknown_tasks && status.state == TaskState::Running {
            warn!(task_id = %status.task_id, "Killing unknown task");
            self.kill_call(status.task_id.clone(), status.agent_id.clone());
            self.notify(Notice::TaskEnded {
                task_id: status.task_id.clone(),
                state: status.state,
            });
        } else if status.state != TaskState::Running {
            debug!(task_id = %status.task_id, "Purging unknown task");
            self.persist(StoreOp::DeleteTask(status.task_id.clone()));
        }
    }

    // =========================================================================
    // Scaling
    // =========================================================================

    /// Counts for `type_name`.
    pub fn type_stats(&self, type_name: &str) -> TaskTypeStats {
        let mut stats = TaskTypeStats::default();
        for task in self.launched.iter().filter(|t| t.spec.name == type_name) {
            let serial = serial_of(&task.name);
            if let Some(serial) = serial {
                stats.serials.insert(serial);
            }
            if task.do_not_restart() {
                continue;
            }
            stats.running += 1;
            if let (Some(serial), true) = (serial, task.is_leader()) {
                stats.leader_serials.insert(serial);
            }
        }
        for task in self.pending.iter().filter(|t| t.spec.name == type_name) {
            stats.pending += 1;
            if let Some(serial) = serial_of(&task.name) {
                stats.serials.insert(serial);
            }
        }
        stats
    }

    /// Scale `type_name` to `instances` running or pending instances.
    pub fn scale_to(&mut self, type_name: &str, instances: u32) -> SchedulerResult<ScaleOutcome> {
        let definition = self
            .definition(type_name)
            .ok_or_else(|| SchedulerError::UnknownTaskType(type_name.to_string()))?;
        if !definition.allow_scaling {
            return Err(SchedulerError::ScalingNotAllowed(type_name.to_string()));
        }
        if instances < definition.instances_minimum {
            return Err(SchedulerError::BelowMinimum {
                name: type_name.to_string(),
                requested: instances,
                minimum: definition.instances_minimum,
            });
        }

        let stats = self.type_stats(type_name);
        let current = stats.running + stats.pending;
        let target = instances as usize;
        if target == current {
            return Ok(ScaleOutcome::Unchanged);
        }

        if let Some(definition) = self.definitions.iter_mut().find(|d| d.name == type_name) {
            definition.instances = instances;
        }
        self.persist(StoreOp::SaveTaskDef {
            name: type_name.to_string(),
            instances,
        });

        if target > current {
            Ok(ScaleOutcome::Added(self.scale_up(type_name, target - current, &stats)))
        } else {
            Ok(self.scale_down(type_name, current - target))
        }
    }

    fn scale_up(&mut self, type_name: &str, count: usize, stats: &TaskTypeStats) -> Vec<String> {
        let Some(definition) = self.definition(type_name).cloned() else {
            return Vec::new();
        };

        let mut added = Vec::with_capacity(count);
        let mut serial = 1;
        while added.len() < count {
            if !stats.serials.contains(&serial) {
                let name = with_serial(type_name, serial);
                self.pending.push(Task::new(&definition, name.clone()));
                added.push(name);
            }
            serial += 1;
        }
        info!(task_type = %type_name, added = ?added, "Scaled up");
        added
    }

    fn scale_down(&mut self, type_name: &str, count: usize) -> ScaleOutcome {
        let mut pending = Vec::new();
        while pending.len() < count {
            let Some(index) = self.pending.iter().rposition(|t| t.spec.name == type_name) else {
                break;
            };
            pending.push(self.pending.remove(index).name);
        }

        let mut victims: Vec<(bool, u64, TaskId)> = self
            .launched
            .iter()
            .filter(|t| t.spec.name == type_name && !t.do_not_restart())
            .filter_map(|t| {
                let id = t.task_id.clone()?;
                Some((t.is_leader(), serial_of(&t.name).unwrap_or(0), id))
            })
            .collect();
        // Non-leaders first, highest serial first.
        victims.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

        let killed: Vec<TaskId> = victims
            .into_iter()
            .take(count - pending.len())
            .map(|(_, _, id)| id)
            .collect();
        for id in &killed {
            if let Some(index) = self.launched_position(id) {
                self.retire(index);
            }
        }

        info!(task_type = %type_name, pending = ?pending, killed = killed.len(), "Scaled down");
        ScaleOutcome::Removed { pending, killed }
    }

    // =========================================================================
    // Kills
    // =========================================================================

    /// Mark a launched task as not restartable and ask for it to be killed.
    fn retire(&mut self, index: usize) {
        let task = &mut self.launched[index];
        if let Some(runtime) = task.runtime.as_mut() {
            runtime.do_not_restart = true;
        }
        let snapshot = task.clone();
        let agent_id = task.agent_id().map(str::to_string);
        self.persist(StoreOp::SaveTask(Box::new(snapshot.clone())));
        if let Some(task_id) = snapshot.task_id {
            self.call(Call::Kill { task_id, agent_id });
        }
    }

    /// Kill one launched task of a scalable type.
    pub fn kill_task(&mut self, task_id: &TaskId) -> SchedulerResult<()> {
        let index = self
            .launched_position(task_id)
            .ok_or_else(|| SchedulerError::TaskNotRunning(task_id.to_string()))?;
        if !self.launched[index].spec.allow_scaling {
            return Err(SchedulerError::NotScaleable(task_id.to_string()));
        }
        info!(task_id = %task_id, "Killing task");
        self.retire(index);
        Ok(())
    }

    /// Kill every launched task. Returns how many kills were sent.
    pub fn kill_all(&mut self) -> usize {
        let count = self.launched.len();
        for index in 0..count {
            self.retire(index);
        }
        info!(count, "Killing all tasks");
        count
    }

    /// Kill every launched task of `type_name`.
    pub fn kill_all_of_type(&mut self, type_name: &str) -> SchedulerResult<usize> {
        if self.definition(type_name).is_none() {
            return Err(SchedulerError::UnknownTaskType(type_name.to_string()));
        }
        let indices: Vec<usize> = self
            .launched
            .iter()
            .enumerate()
            .filter(|(_, t)| t.spec.name == type_name)
            .map(|(i, _)| i)
            .collect();
        for index in &indices {
            self.retire(*index);
        }
        info!(task_type = %type_name, count = indices.len(), "Killing tasks of type");
        Ok(indices.len())
    }

    /// Run a command from the task API.
    pub fn apply_command(&mut self, command: Command) -> SchedulerResult<()> {
        match command {
            Command::Scale {
                task_type,
                instances,
            } => self.scale_to(&task_type, instances).map(|_| ()),
            Command::Kill { task_id } => self.kill_task(&task_id),
            Command::KillAll => {
                self.kill_all();
                Ok(())
            }
            Command::KillType { task_type } => self.kill_all_of_type(&task_type).map(|_| ()),
            Command::Restart { task_id } => {
                self.restart_task(&task_id);
                Ok(())
            }
            Command::RollingRestart => {
                let order = self.rolling_restart_order();
                self.rolling_restart(order);
                Ok(())
            }
        }
    }

    // =========================================================================
    // Sync
    // =========================================================================

    /// Reconcile tracked tasks and kill orphans.
    pub fn sync(&mut self) {
        let mut tasks: Vec<ReconcileTask> = Vec::new();

        for task_id in std::mem::take(&mut self.reconcile) {
            match self.find_launched(&task_id).and_then(Task::agent_id) {
                Some(agent_id) => {
                    let agent_id = Some(agent_id.to_string());
                    tasks.push(ReconcileTask { task_id, agent_id });
                }
                None => {
                    debug!(task_id = %task_id, "Dropping reconcile entry without agent");
                    self.persist(StoreOp::DeleteTask(task_id));
                }
            }
        }

        for task in &self.launched {
            let (Some(task_id), Some(agent_id)) = (&task.task_id, task.agent_id()) else {
                continue;
            };
            if tasks.iter().all(|t| &t.task_id != task_id) {
                tasks.push(ReconcileTask {
                    task_id: task_id.clone(),
                    agent_id: Some(agent_id.to_string()),
                });
            }
        }

        for task in std::mem::take(&mut self.kill) {
            if let Some(task_id) = task.task_id.clone() {
                info!(task_id = %task_id, "Killing orphaned task");
                self.kill_call(task_id, task.agent_id().map(str::to_string));
            }
        }

        debug!(tasks = tasks.len(), "Reconciling tasks");
        if !tasks.is_empty() {
            self.call(Call::Reconcile { tasks });
        }
        if self.options.use_store {
            self.call(Call::Reconcile { tasks: Vec::new() });
        }
    }
}
