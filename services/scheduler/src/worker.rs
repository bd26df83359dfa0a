//! Scheduling loop.
//!
//! One task owns the [`SchedulerState`]. It runs in a loop:
//! 1. Wait for an inbound event, a command, the restart tick or the sync timer
//! 2. Apply it to the state through the handler table
//! 3. Flush queued calls to the resource manager, store writes to the
//!    durable store and notices to the log
//!
//! Because every mutation happens on this task, no two offers are ever
//! matched concurrently.

use std::sync::Arc;
use std::time::Duration;

use berth_events::Event;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::error::SchedulerResult;
use crate::handlers::HandlerTable;
use crate::lifecycle::Command;
use crate::state::{Notice, SchedulerState};
use crate::sync::TaskStore;
use crate::transport::ResourceManager;

/// Timing of the scheduling loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often restarts in flight are checked.
    pub tick_interval: Duration,

    /// How often tasks are reconciled with the resource manager.
    pub sync_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(1000),
            sync_interval: Duration::from_secs(30),
        }
    }
}

/// Something for the scheduling loop to process.
#[derive(Debug, Clone)]
pub enum Input {
    Event(Event),
    Command(Command),
}

/// Owns the scheduler state and drives it from inputs and timers.
pub struct SchedulerWorker {
    state: SchedulerState,
    handlers: HandlerTable,
    transport: Arc<dyn ResourceManager>,
    store: Option<TaskStore>,
    notices: Option<mpsc::UnboundedSender<Notice>>,
    config: WorkerConfig,
}

impl SchedulerWorker {
    pub fn new(
        state: SchedulerState,
        transport: Arc<dyn ResourceManager>,
        store: Option<TaskStore>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            state,
            handlers: HandlerTable::new(),
            transport,
            store,
            notices: None,
            config,
        }
    }

    /// Use `handlers` instead of the defaults.
    pub fn with_handlers(mut self, handlers: HandlerTable) -> Self {
        self.handlers = handlers;
        self
    }

    /// Forward every notice to `sender` as well as the log.
    pub fn with_notices(mut self, sender: mpsc::UnboundedSender<Notice>) -> Self {
        self.notices = Some(sender);
        self
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    /// Load stored tasks and the framework ID before the first offer.
    #[instrument(skip(self))]
    pub async fn recover(&mut self) -> SchedulerResult<()> {
        match &self.store {
            Some(store) => {
                if let Some(framework_id) = store.load_framework_id().await? {
                    info!(framework_id = %framework_id, "Loaded framework ID");
                    self.state.framework_id = Some(framework_id);
                }
                store.recover(&mut self.state).await?;
            }
            None => self.state.notify(Notice::Ready),
        }
        self.flush().await;
        Ok(())
    }

    /// Run until shutdown is signalled or the input channel closes.
    ///
    /// Returns the final state.
    #[instrument(skip_all, name = "scheduler_worker")]
    pub async fn run(
        mut self,
        mut inputs: mpsc::Receiver<Input>,
        mut shutdown: watch::Receiver<bool>,
    ) -> SchedulerState {
        info!(
            pending = self.state.pending.len(),
            launched = self.state.launched.len(),
            "Starting scheduler worker"
        );

        let start = Instant::now();
        let mut tick =
            tokio::time::interval_at(start + self.config.tick_interval, self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sync =
            tokio::time::interval_at(start + self.config.sync_interval, self.config.sync_interval);
        sync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received, stopping scheduler worker");
                        break;
                    }
                }
                input = inputs.recv() => match input {
                    Some(input) => self.handle_input(input),
                    None => {
                        info!("Input closed, stopping scheduler worker");
                        break;
                    }
                },
                _ = tick.tick() => {
                    self.state.poll_restarts(Instant::now().into_std());
                }
                _ = sync.tick() => {
                    debug!("Running periodic sync");
                    self.state.sync();
                }
            }
            self.flush().await;
        }

        self.flush().await;
        self.state
    }

    fn handle_input(&mut self, input: Input) {
        match input {
            Input::Event(event) => {
                debug!(kind = %event.kind(), "Handling event");
                self.handlers.dispatch(&mut self.state, &event);
            }
            Input::Command(command) => {
                debug!(?command, "Handling command");
                if let Err(e) = self.state.apply_command(command) {
                    warn!(error = %e, "Command rejected");
                }
            }
        }
    }

    /// Send queued calls, apply queued store writes and publish notices.
    pub async fn flush(&mut self) {
        for call in self.state.drain_calls() {
            let name = call.name();
            if let Err(e) = self.transport.send(call).await {
                error!(call = name, error = %e, "Failed to send call");
            }
        }

        let writes = self.state.drain_writes();
        if let Some(store) = &self.store {
            for op in writes {
                store.apply(op).await;
            }
        }

        for notice in self.state.drain_notices() {
            log_notice(&notice);
            if let Some(sender) = &self.notices {
                // Receiver gone means nobody is listening any more.
                let _ = sender.send(notice);
            }
        }
    }
}

fn log_notice(notice: &Notice) {
    match notice {
        Notice::Ready => info!("Scheduler ready"),
        Notice::Subscribed { framework_id } => {
            info!(framework_id = %framework_id, "Framework subscribed")
        }
        Notice::TaskLaunched { name, task_id } => {
            info!(task = %name, task_id = %task_id, "Task launched")
        }
        Notice::TaskEnded { task_id, state } => {
            info!(task_id = %task_id, state = %state, "Task ended")
        }
        Notice::TaskRestarted { name } => info!(task = %name, "Task restarted"),
        Notice::RollingRestartFinished { restarted } => {
            info!(restarted, "Rolling restart finished")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SchedulerOptions;
    use crate::store::{DurableStore, MemoryStore};
    use crate::task::TaskDefinition;
    use crate::transport::RecordingTransport;
    use berth_events::{resource_names, Call, Offer, Resource};

    fn config() -> WorkerConfig {
        WorkerConfig {
            tick_interval: Duration::from_secs(3600),
            sync_interval: Duration::from_secs(3600),
        }
    }

    fn web_state(options: SchedulerOptions) -> SchedulerState {
        let mut web = TaskDefinition::new("web");
        web.resources.cpus = 1.0;
        web.resources.mem = 128.0;
        SchedulerState::new(options, vec![web]).unwrap()
    }

    fn offer() -> Offer {
        Offer {
            id: "o1".to_string(),
            agent_id: "agent-1".to_string(),
            hostname: "host-1".to_string(),
            ip: Some("10.0.0.1".to_string()),
            resources: vec![
                Resource::scalar(resource_names::CPUS, 2.0),
                Resource::scalar(resource_names::MEM, 512.0),
            ],
            attributes: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_offer_flushes_accept_and_persists() {
        let transport = Arc::new(RecordingTransport::new());
        let memory = Arc::new(MemoryStore::new());
        let store = TaskStore::new(memory.clone(), "berth");
        let options = SchedulerOptions {
            use_store: true,
            ..SchedulerOptions::default()
        };
        let (notice_tx, mut notice_rx) = mpsc::unbounded_channel();
        let mut worker = SchedulerWorker::new(
            web_state(options),
            transport.clone(),
            Some(store),
            config(),
        )
        .with_notices(notice_tx);
        worker.recover().await.unwrap();
        assert_eq!(notice_rx.recv().await, Some(Notice::Ready));

        let (input_tx, input_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        input_tx
            .send(Input::Event(Event::Offers {
                offers: vec![offer()],
            }))
            .await
            .unwrap();
        drop(input_tx);

        let state = worker.run(input_rx, shutdown_rx).await;

        assert_eq!(state.launched.len(), 1);
        let sent = transport.sent().await;
        assert!(matches!(sent.as_slice(), [Call::Accept { .. }]));
        assert_eq!(memory.get_children("/berth/tasks").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_does_not_stop_worker() {
        let transport = Arc::new(RecordingTransport::failing());
        let worker = SchedulerWorker::new(
            web_state(SchedulerOptions::default()),
            transport.clone(),
            None,
            config(),
        );
        let (input_tx, input_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        input_tx
            .send(Input::Event(Event::Offers {
                offers: vec![offer()],
            }))
            .await
            .unwrap();
        input_tx
            .send(Input::Command(Command::KillAll))
            .await
            .unwrap();
        drop(input_tx);

        let state = worker.run(input_rx, shutdown_rx).await;
        assert_eq!(state.launched.len(), 1);
        assert!(state.launched[0].do_not_restart());
    }

    #[tokio::test]
    async fn test_stops_on_shutdown() {
        let worker = SchedulerWorker::new(
            web_state(SchedulerOptions::default()),
            Arc::new(RecordingTransport::new()),
            None,
            config(),
        );
        let (_input_tx, input_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(worker.run(input_rx, shutdown_rx));
        shutdown_tx.send(true).unwrap();

        let state = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.pending.len(), 1);
    }
}
