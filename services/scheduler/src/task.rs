//! Task type definitions and task instances.
//!
//! A [`TaskDefinition`] is the template configured for one task type. It is
//! expanded into [`Task`] instances named `<type>-<serial>`, each owning an
//! independent copy of the definition so that per-launch mutations (such as
//! injected environment variables) never leak back into the template.

use berth_events::{CommandInfo, ContainerInfo, EnvVar, HealthCheck, Label, TaskState};
use berth_id::{with_serial, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SchedulerError, SchedulerResult};

// =============================================================================
// Definitions
// =============================================================================

/// Resource demand of one task instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskResources {
    pub cpus: f64,
    pub mem: f64,
    pub disk: f64,
    /// Total number of ports, static ports included.
    pub ports: u64,
    /// Fixed ports, honoured only when static ports are enabled.
    pub static_ports: Vec<u64>,
    /// Lowest port dynamic allocation may pick.
    pub minimum_port: Option<u64>,
}

/// HTTP health check bound to one of the task's assigned ports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    pub path: String,
    /// Index into the assigned ports.
    #[serde(default)]
    pub port_index: usize,
    #[serde(default = "default_interval")]
    pub interval_seconds: f64,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: f64,
    #[serde(default = "default_grace_period")]
    pub grace_period_seconds: f64,
    #[serde(default = "default_consecutive_failures")]
    pub consecutive_failures: u32,
}

fn default_interval() -> f64 {
    10.0
}

fn default_timeout() -> f64 {
    20.0
}

fn default_grace_period() -> f64 {
    10.0
}

fn default_consecutive_failures() -> u32 {
    3
}

impl HealthCheckSpec {
    /// Resolve the check against the ports assigned at launch.
    pub fn bind(&self, ports: &[u64]) -> Option<HealthCheck> {
        let port = *ports.get(self.port_index)?;
        Some(HealthCheck {
            port,
            path: self.path.clone(),
            interval_seconds: self.interval_seconds,
            timeout_seconds: self.timeout_seconds,
            grace_period_seconds: self.grace_period_seconds,
            consecutive_failures: self.consecutive_failures,
        })
    }
}

fn default_instances() -> u32 {
    1
}

/// Template for one task type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub name: String,
    /// Lower runs first. Defaults to declaration order.
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default = "default_instances")]
    pub instances: u32,
    #[serde(default = "default_instances")]
    pub instances_minimum: u32,
    #[serde(default)]
    pub allow_scaling: bool,
    #[serde(default)]
    pub resources: TaskResources,
    #[serde(default)]
    pub command: Option<CommandInfo>,
    #[serde(default)]
    pub container: Option<ContainerInfo>,
    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,
    #[serde(default)]
    pub labels: Vec<Label>,
    /// Never place on the scheduler's own host.
    #[serde(default)]
    pub no_colocation: bool,
    /// Never place two instances of this type on one host.
    #[serde(default)]
    pub no_inner_colocation: bool,
    /// Spread instances evenly across availability zones.
    #[serde(default)]
    pub az_aware: bool,
    /// Keep recovered instances even without a matching pending task.
    #[serde(default)]
    pub persistent: bool,
    #[serde(default)]
    pub task_version: Option<String>,
}

impl TaskDefinition {
    /// A definition with defaults for everything but the name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: None,
            instances: 1,
            instances_minimum: 1,
            allow_scaling: false,
            resources: TaskResources::default(),
            command: None,
            container: None,
            health_check: None,
            labels: Vec::new(),
            no_colocation: false,
            no_inner_colocation: false,
            az_aware: false,
            persistent: false,
            task_version: None,
        }
    }

    fn validate(&self) -> SchedulerResult<()> {
        let invalid = |reason: &str| SchedulerError::InvalidDefinition {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.is_empty() {
            return Err(invalid("name cannot be empty"));
        }
        if self.name.contains('.') {
            return Err(invalid("name cannot contain '.'"));
        }
        // Task IDs carry the name with its first '/' replaced.
        if self.name.matches('/').count() > 1 {
            return Err(invalid("name cannot contain more than one '/'"));
        }
        let statics = self.resources.static_ports.len() as u64;
        if statics > 0 && self.resources.ports < statics {
            return Err(invalid("ports must cover every static port"));
        }
        Ok(())
    }
}

/// Validate definitions, assign default priorities and sort static ports.
pub fn normalize_definitions(definitions: &mut [TaskDefinition]) -> SchedulerResult<()> {
    for (index, definition) in definitions.iter_mut().enumerate() {
        definition.validate()?;
        definition.priority.get_or_insert(index as u32 + 1);
        definition.resources.static_ports.sort_unstable();
    }
    Ok(())
}

/// Expand normalized definitions into `instances` serial-numbered tasks each,
/// in priority order.
pub fn expand_definitions(definitions: &[TaskDefinition]) -> Vec<Task> {
    let mut tasks: Vec<Task> = definitions
        .iter()
        .flat_map(|definition| {
            (1..=u64::from(definition.instances))
                .map(move |serial| Task::new(definition, with_serial(&definition.name, serial)))
        })
        .collect();
    sort_by_priority(&mut tasks);
    tasks
}

/// Sort tasks by (priority, name).
pub fn sort_by_priority(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| (a.spec.priority, &a.name).cmp(&(b.spec.priority, &b.name)));
}

// =============================================================================
// Instances
// =============================================================================

/// Network identity of a launched task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub hostname: String,
    pub ip: String,
    pub ports: Vec<u64>,
}

/// Launch and status details of a task, present once it is launched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub agent_id: String,
    #[serde(default)]
    pub executor_id: Option<String>,
    pub state: TaskState,
    pub start_time: DateTime<Utc>,
    /// Resources the task was launched with.
    #[serde(default)]
    pub resources: Option<TaskResources>,
    #[serde(default)]
    pub network: Network,
    /// Set when the task is being removed on purpose.
    #[serde(default)]
    pub do_not_restart: bool,
    #[serde(default)]
    pub leader: bool,
    #[serde(default)]
    pub healthy: Option<bool>,
    #[serde(default)]
    pub task_version: Option<String>,
}

impl RuntimeInfo {
    /// Runtime info of a task that was just accepted onto an agent.
    pub fn staging(agent_id: &str, network: Network, resources: TaskResources) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            executor_id: None,
            state: TaskState::Staging,
            start_time: Utc::now(),
            resources: Some(resources),
            network,
            do_not_restart: false,
            leader: false,
            healthy: None,
            task_version: None,
        }
    }
}

/// One instance of a task type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// `<type>-<serial>`.
    pub name: String,
    /// Private copy of the type definition.
    pub spec: TaskDefinition,
    #[serde(default)]
    pub task_id: Option<TaskId>,
    /// Name reported to the resource manager.
    #[serde(default)]
    pub launch_name: Option<String>,
    #[serde(default)]
    pub is_submitted: bool,
    #[serde(default)]
    pub runtime: Option<RuntimeInfo>,
    /// Availability zone of the agent the task was placed on.
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub health_check: Option<HealthCheck>,
}

impl Task {
    /// A fresh, unsubmitted instance of `definition`.
    pub fn new(definition: &TaskDefinition, name: String) -> Self {
        Self {
            name,
            spec: definition.clone(),
            task_id: None,
            launch_name: None,
            is_submitted: false,
            runtime: None,
            zone: None,
            health_check: None,
        }
    }

    pub fn state(&self) -> Option<TaskState> {
        self.runtime.as_ref().map(|r| r.state)
    }

    pub fn is_running(&self) -> bool {
        self.state() == Some(TaskState::Running)
    }

    pub fn agent_id(&self) -> Option<&str> {
        self.runtime
            .as_ref()
            .map(|r| r.agent_id.as_str())
            .filter(|id| !id.is_empty())
    }

    pub fn do_not_restart(&self) -> bool {
        self.runtime.as_ref().is_some_and(|r| r.do_not_restart)
    }

    pub fn is_leader(&self) -> bool {
        self.runtime.as_ref().is_some_and(|r| r.leader)
    }

    /// Host IP the task runs on.
    pub fn host_ip(&self) -> Option<&str> {
        self.runtime
            .as_ref()
            .map(|r| r.network.ip.as_str())
            .filter(|ip| !ip.is_empty())
    }

    /// True if the record describes a task the resource manager may still run.
    pub fn is_live(&self) -> bool {
        self.agent_id().is_some()
            && matches!(self.state(), Some(TaskState::Running | TaskState::Staging))
    }

    /// Environment of the task's command, created on first use.
    pub fn environment_mut(&mut self) -> &mut Vec<EnvVar> {
        &mut self
            .spec
            .command
            .get_or_insert_with(CommandInfo::default)
            .environment
    }

    pub fn environment(&self) -> &[EnvVar] {
        self.spec
            .command
            .as_ref()
            .map(|c| c.environment.as_slice())
            .unwrap_or(&[])
    }

    /// Strip everything a launch attempt added, returning the task to its
    /// unsubmitted form.
    pub fn cleanup(&mut self) {
        self.task_id = None;
        self.launch_name = None;
        self.runtime = None;
        self.zone = None;
        self.health_check = None;
        self.is_submitted = false;
        if let Some(command) = self.spec.command.as_mut() {
            command.environment.retain(|var| !is_injected_env(&var.name));
        }
    }

    /// Take over the launch details of a recovered record.
    pub fn adopt(&mut self, record: &Task) {
        self.task_id = record.task_id.clone();
        self.launch_name = record.launch_name.clone();
        self.runtime = record.runtime.clone();
        self.zone = record.zone.clone();
        self.health_check = record.health_check.clone();
        self.is_submitted = true;

        let injected: Vec<EnvVar> = record
            .environment()
            .iter()
            .filter(|var| is_injected_env(&var.name))
            .cloned()
            .collect();
        if !injected.is_empty() {
            let environment = self.environment_mut();
            environment.retain(|var| !is_injected_env(&var.name));
            environment.extend(injected);
        }
    }
}

/// `HOST` and `PORT<n>` are set by the scheduler at launch.
pub fn is_injected_env(name: &str) -> bool {
    if name == "HOST" {
        return true;
    }
    name.strip_prefix("PORT")
        .is_some_and(|index| !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn definition(name: &str, instances: u32, priority: Option<u32>) -> TaskDefinition {
        TaskDefinition {
            instances,
            priority,
            ..TaskDefinition::new(name)
        }
    }

    fn names(tasks: &[Task]) -> Vec<&str> {
        tasks.iter().map(|t| t.name.as_str()).collect()
    }

    #[test]
    fn test_expand_names_and_order() {
        let mut defs = vec![
            definition("task2", 1, None),
            definition("task1", 2, None),
            definition("task0", 1, Some(5)),
        ];
        normalize_definitions(&mut defs).unwrap();
        let tasks = expand_definitions(&defs);
        assert_eq!(names(&tasks), vec!["task2-1", "task1-1", "task1-2", "task0-1"]);
    }

    #[test]
    fn test_priority_ties_broken_by_name() {
        let mut defs = vec![definition("b", 1, Some(1)), definition("a", 1, Some(1))];
        normalize_definitions(&mut defs).unwrap();
        let tasks = expand_definitions(&defs);
        assert_eq!(names(&tasks), vec!["a-1", "b-1"]);
    }

    #[test]
    fn test_sort_is_idempotent() {
        let mut defs = vec![
            definition("web", 3, Some(2)),
            definition("db", 2, Some(1)),
            definition("cache", 2, Some(2)),
        ];
        normalize_definitions(&mut defs).unwrap();
        let mut once = expand_definitions(&defs);
        sort_by_priority(&mut once);
        let mut twice = once.clone();
        sort_by_priority(&mut twice);
        assert_eq!(names(&once), names(&twice));
    }

    #[test]
    fn test_static_ports_sorted_and_validated() {
        let mut def = definition("edge", 1, None);
        def.resources.ports = 2;
        def.resources.static_ports = vec![9000, 8000];
        let mut defs = vec![def.clone()];
        normalize_definitions(&mut defs).unwrap();
        assert_eq!(defs[0].resources.static_ports, vec![8000, 9000]);

        def.resources.ports = 1;
        let err = normalize_definitions(&mut [def]).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidDefinition { .. }));
    }

    #[test]
    fn test_rejects_dotted_name() {
        let err = normalize_definitions(&mut [definition("a.b", 1, None)]).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidDefinition { .. }));
    }

    #[test]
    fn test_slashes_in_name() {
        let mut single = [definition("team/web", 1, None)];
        normalize_definitions(&mut single).unwrap();
        let id = TaskId::generate("berth", &expand_definitions(&single)[0].name);
        assert_eq!(id.as_str().parse::<TaskId>(), Ok(id.clone()));

        let err = normalize_definitions(&mut [definition("a/b/c", 1, None)]).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidDefinition { .. }));
    }

    #[test]
    fn test_instances_own_their_environment() {
        let mut def = definition("web", 2, None);
        def.command = Some(CommandInfo::default());
        let mut tasks = expand_definitions(&[def.clone()]);
        tasks[0].environment_mut().push(EnvVar::new("HOST", "10.0.0.1"));
        assert!(tasks[1].environment().is_empty());
        assert!(def.command.unwrap().environment.is_empty());
    }

    #[rstest]
    #[case("HOST", true)]
    #[case("PORT0", true)]
    #[case("PORT12", true)]
    #[case("PORT", false)]
    #[case("HOST1", false)]
    #[case("1HOST", false)]
    #[case(" PORT2", false)]
    #[case("PORT3a21", false)]
    fn test_is_injected_env(#[case] name: &str, #[case] injected: bool) {
        assert_eq!(is_injected_env(name), injected);
    }

    #[test]
    fn test_cleanup_strips_launch_fields() {
        let mut task = Task::new(&TaskDefinition::new("web"), "web-1".to_string());
        let names = [
            "HOST", "PORT0", "PORT12", "PORT", "HOST1", "1HOST", " PORT2", "PORT3a21", "APP_ENV",
            "PORTS",
        ];
        for name in names {
            task.environment_mut().push(EnvVar::new(name, "x"));
        }
        task.task_id = Some(TaskId::generate("fw", "web-1"));
        task.launch_name = Some("web-1".to_string());
        task.is_submitted = true;
        task.runtime = Some(RuntimeInfo::staging("a1", Network::default(), TaskResources::default()));

        task.cleanup();

        assert_eq!(task.environment().len(), 7);
        assert!(task.task_id.is_none());
        assert!(task.runtime.is_none());
        assert!(task.launch_name.is_none());
        assert!(!task.is_submitted);
    }

    #[test]
    fn test_adopt_copies_runtime_and_injected_env() {
        let def = TaskDefinition::new("web");
        let mut record = Task::new(&def, "web-1".to_string());
        record.task_id = Some(TaskId::generate("fw", "web-1"));
        record.runtime = Some(RuntimeInfo::staging("a1", Network::default(), TaskResources::default()));
        record.environment_mut().push(EnvVar::new("PORT0", "31000"));
        record.environment_mut().push(EnvVar::new("OTHER", "y"));

        let mut task = Task::new(&def, "web-1".to_string());
        task.adopt(&record);

        assert!(task.is_submitted);
        assert_eq!(task.task_id, record.task_id);
        assert_eq!(task.agent_id(), Some("a1"));
        assert_eq!(task.environment(), &[EnvVar::new("PORT0", "31000")]);
    }

    #[test]
    fn test_is_live() {
        let mut task = Task::new(&TaskDefinition::new("web"), "web-1".to_string());
        assert!(!task.is_live());
        task.runtime = Some(RuntimeInfo::staging("a1", Network::default(), TaskResources::default()));
        assert!(task.is_live());
        if let Some(runtime) = task.runtime.as_mut() {
            runtime.state = TaskState::Failed;
        }
        assert!(!task.is_live());
    }

    #[test]
    fn test_health_check_bind() {
        let spec = HealthCheckSpec {
            path: "/health".to_string(),
            port_index: 1,
            interval_seconds: 5.0,
            timeout_seconds: 2.0,
            grace_period_seconds: 1.0,
            consecutive_failures: 3,
        };
        assert_eq!(spec.bind(&[8000, 8001]).unwrap().port, 8001);
        assert!(spec.bind(&[8000]).is_none());
    }
}
