//! Individual and rolling restarts.
//!
//! A restart keeps the original task running until a clone of it reaches
//! RUNNING. The original is marked `do_not_restart` up front so its eventual
//! kill is final. Progress is checked on the scheduler tick through
//! [`SchedulerState::poll_restarts`]; nothing here owns a timer.

use std::collections::VecDeque;
use std::time::Instant;

use berth_events::Call;
use berth_id::TaskId;
use tracing::{debug, info, warn};

use crate::state::{Notice, SchedulerState};
use crate::sync::StoreOp;
use crate::task::Task;

/// Result of a restart request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    Started,
    /// The task is not launched.
    NotFound,
    /// The task's type has no definition.
    UnknownType,
    /// The task is already being replaced.
    InProgress,
}

/// A restart waiting for its clone.
#[derive(Debug, Clone)]
struct RestartWatch {
    original: TaskId,
    original_agent: Option<String>,
    name: String,
    rolling: bool,
    /// Set on the first poll after the restart starts.
    deadline: Option<Instant>,
}

/// Restarts in flight.
#[derive(Debug, Default)]
pub struct RestartTracker {
    watches: Vec<RestartWatch>,
    rolling: VecDeque<TaskId>,
    rolling_active: bool,
    rolling_restarted: usize,
}

impl RestartTracker {
    /// Number of restarts waiting for their clone.
    pub fn in_flight(&self) -> usize {
        self.watches.len()
    }

    pub fn is_rolling(&self) -> bool {
        self.rolling_active
    }
}

impl SchedulerState {
    /// Start replacing a launched task with a fresh clone.
    pub fn restart_task(&mut self, task_id: &TaskId) -> RestartOutcome {
        self.start_restart(task_id, false)
    }

    fn start_restart(&mut self, task_id: &TaskId, rolling: bool) -> RestartOutcome {
        let Some(index) = self.launched_position(task_id) else {
            debug!(task_id = %task_id, "Cannot restart task that is not launched");
            return RestartOutcome::NotFound;
        };
        if self.launched[index].do_not_restart()
            || self.restarts.watches.iter().any(|w| &w.original == task_id)
        {
            debug!(task_id = %task_id, "Task is already being restarted");
            return RestartOutcome::InProgress;
        }
        let type_name = self.launched[index].spec.name.clone();
        let Some(definition) = self.definition(&type_name).cloned() else {
            debug!(task_id = %task_id, task_type = %type_name, "Cannot restart task of unknown type");
            return RestartOutcome::UnknownType;
        };

        let original = &mut self.launched[index];
        if let Some(runtime) = original.runtime.as_mut() {
            runtime.do_not_restart = true;
        }
        let name = original.name.clone();
        let watch = RestartWatch {
            original: task_id.clone(),
            original_agent: original.agent_id().map(str::to_string),
            name: name.clone(),
            rolling,
            deadline: None,
        };
        let snapshot = original.clone();
        self.persist(StoreOp::SaveTask(Box::new(snapshot)));

        info!(task_id = %task_id, task = %name, rolling, "Restarting task");
        self.pending.push(Task::new(&definition, name));
        self.restarts.watches.push(watch);
        RestartOutcome::Started
    }

    /// Launched tasks eligible for a rolling restart, non-leaders first.
    pub fn rolling_restart_order(&self) -> Vec<TaskId> {
        let mut candidates: Vec<&Task> = self
            .launched
            .iter()
            .filter(|t| t.spec.allow_scaling && !t.do_not_restart())
            .collect();
        candidates.sort_by_key(|t| t.is_leader());
        candidates
            .into_iter()
            .filter_map(|t| t.task_id.clone())
            .collect()
    }

    /// Restart `order` one task at a time.
    pub fn rolling_restart(&mut self, order: Vec<TaskId>) {
        info!(tasks = order.len(), "Starting rolling restart");
        self.restarts.rolling = order.into();
        self.restarts.rolling_active = true;
        self.restarts.rolling_restarted = 0;
        self.advance_rolling();
    }

    fn advance_rolling(&mut self) {
        while let Some(task_id) = self.restarts.rolling.pop_front() {
            if self.start_restart(&task_id, true) == RestartOutcome::Started {
                return;
            }
        }
        let restarted = self.restarts.rolling_restarted;
        self.restarts.rolling_active = false;
        info!(restarted, "Rolling restart finished");
        self.notify(Notice::RollingRestartFinished { restarted });
    }

    /// Check restarts in flight against the launched tasks.
    ///
    /// A clone that does not reach RUNNING within the restart timeout is
    /// given up on and the original keeps running. A clone still waiting for
    /// an offer at that point is withdrawn.
    pub fn poll_restarts(&mut self, now: Instant) {
        let timeout = self.options.restart_timeout;
        let watches = std::mem::take(&mut self.restarts.watches);
        let mut remaining = Vec::with_capacity(watches.len());
        let mut advance = false;

        for mut watch in watches {
            let clone = self.launched.iter().find(|t| {
                t.name == watch.name
                    && t.task_id.as_ref() != Some(&watch.original)
                    && !t.do_not_restart()
            });
            let launched = clone.is_some();
            let running = clone.is_some_and(Task::is_running);

            if running {
                debug!(task = %watch.name, "Restarted clone is running");
                self.call(Call::Kill {
                    task_id: watch.original.clone(),
                    agent_id: watch.original_agent.clone(),
                });
                if watch.rolling {
                    self.restarts.rolling_restarted += 1;
                    advance = true;
                } else {
                    self.notify(Notice::TaskRestarted {
                        name: watch.name.clone(),
                    });
                }
                continue;
            }

            match watch.deadline {
                None => {
                    watch.deadline = Some(now + timeout);
                    remaining.push(watch);
                }
                Some(deadline) if now >= deadline => {
                    warn!(task = %watch.name, launched, "Restarted clone did not reach running in time");
                    if !launched {
                        self.withdraw_clone(&watch);
                    }
                    advance |= watch.rolling;
                }
                Some(_) => remaining.push(watch),
            }
        }

        self.restarts.watches = remaining;
        if advance && self.restarts.rolling_active {
            self.advance_rolling();
        }
    }

    /// Drop a clone that never launched and let the original restart normally
    /// again.
    fn withdraw_clone(&mut self, watch: &RestartWatch) {
        if let Some(index) = self.pending.iter().rposition(|t| t.name == watch.name) {
            self.pending.remove(index);
        }
        let Some(index) = self.launched_position(&watch.original) else {
            return;
        };
        let original = &mut self.launched[index];
        if let Some(runtime) = original.runtime.as_mut() {
            runtime.do_not_restart = false;
        }
        let snapshot = original.clone();
        self.persist(StoreOp::SaveTask(Box::new(snapshot)));
    }
}
