//! Configuration for the scheduler.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use berth_events::TaskState;

use crate::state::{SchedulerOptions, DEFAULT_RESTART_STATES};
use crate::task::TaskDefinition;
use crate::worker::WorkerConfig;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Framework name, prefix of every task ID.
    pub framework_name: String,

    /// User tasks run as.
    pub user: String,

    /// JSON file holding the task type definitions.
    pub tasks_file: Option<PathBuf>,

    pub restart_states: HashSet<TaskState>,

    pub kill_unknown_tasks: bool,

    pub serial_numbered_tasks: bool,

    pub static_ports: bool,

    /// Root of the durable store. Without it nothing is persisted.
    pub store_dir: Option<PathBuf>,

    /// Host the scheduler runs on.
    pub scheduler_host: String,

    pub restart_timeout: Duration,

    pub tick_interval: Duration,

    pub sync_interval: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Load configuration through `var`, which looks up one variable.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let framework_name = var("BERTH_FRAMEWORK_NAME")
            .unwrap_or_else(|| "berth".to_string())
            .replace(' ', "-");

        let user = var("BERTH_USER").unwrap_or_else(|| "root".to_string());

        let tasks_file = var("BERTH_TASKS_FILE").map(PathBuf::from);

        let restart_states = match var("BERTH_RESTART_STATES") {
            Some(raw) => parse_states(&raw)?,
            None => DEFAULT_RESTART_STATES.into_iter().collect(),
        };

        let kill_unknown_tasks = parse_flag(&var, "BERTH_KILL_UNKNOWN_TASKS", false)?;
        let serial_numbered_tasks = parse_flag(&var, "BERTH_SERIAL_NUMBERED_TASKS", true)?;
        let static_ports = parse_flag(&var, "BERTH_STATIC_PORTS", false)?;

        let store_dir = var("BERTH_STORE_DIR").map(PathBuf::from);

        let scheduler_host = var("BERTH_SCHEDULER_HOST")
            .or_else(|| var("HOSTNAME"))
            .unwrap_or_else(|| "localhost".to_string());

        let restart_timeout =
            Duration::from_millis(parse_number(&var, "BERTH_RESTART_TIMEOUT_MS", 10_000)?);
        let tick_interval =
            Duration::from_millis(parse_number(&var, "BERTH_TICK_INTERVAL_MS", 1_000)?);
        let sync_interval =
            Duration::from_secs(parse_number(&var, "BERTH_SYNC_INTERVAL_SECS", 30)?);

        let log_level = var("BERTH_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            framework_name,
            user,
            tasks_file,
            restart_states,
            kill_unknown_tasks,
            serial_numbered_tasks,
            static_ports,
            store_dir,
            scheduler_host,
            restart_timeout,
            tick_interval,
            sync_interval,
            log_level,
        })
    }

    /// Read the task type definitions, if a tasks file is configured.
    pub fn load_definitions(&self) -> Result<Vec<TaskDefinition>> {
        let Some(path) = &self.tasks_file else {
            return Ok(Vec::new());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read tasks file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse tasks file {}", path.display()))
    }

    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            framework_name: self.framework_name.clone(),
            user: self.user.clone(),
            restart_states: self.restart_states.clone(),
            kill_unknown_tasks: self.kill_unknown_tasks,
            serial_numbered_tasks: self.serial_numbered_tasks,
            static_ports: self.static_ports,
            use_store: self.store_dir.is_some(),
            scheduler_host: self.scheduler_host.clone(),
            restart_timeout: self.restart_timeout,
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            tick_interval: self.tick_interval,
            sync_interval: self.sync_interval,
        }
    }
}

fn parse_states(raw: &str) -> Result<HashSet<TaskState>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<TaskState>()
                .with_context(|| format!("invalid restart state '{}'", s))
        })
        .collect()
}

fn parse_flag(var: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> Result<bool> {
    match var(key) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => anyhow::bail!("{} must be a boolean, got '{}'", key, raw),
        },
        None => Ok(default),
    }
}

fn parse_number(var: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<u64> {
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a number, got '{}'", key, raw)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_vars(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.framework_name, "berth");
        assert_eq!(config.user, "root");
        assert_eq!(config.scheduler_host, "localhost");
        assert!(config.serial_numbered_tasks);
        assert!(!config.static_ports);
        assert!(config.store_dir.is_none());
        assert_eq!(config.restart_timeout, Duration::from_millis(10_000));
        assert_eq!(config.sync_interval, Duration::from_secs(30));
        assert!(!config.scheduler_options().use_store);
        assert!(config.restart_states.contains(&TaskState::Lost));
        assert!(config.load_definitions().unwrap().is_empty());
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("BERTH_FRAMEWORK_NAME", "my framework"),
            ("BERTH_RESTART_STATES", "TASK_FAILED, TASK_KILLED"),
            ("BERTH_KILL_UNKNOWN_TASKS", "true"),
            ("BERTH_STORE_DIR", "/var/lib/berth"),
            ("HOSTNAME", "node-7"),
            ("BERTH_TICK_INTERVAL_MS", "250"),
        ])
        .unwrap();
        assert_eq!(config.framework_name, "my-framework");
        assert_eq!(
            config.restart_states,
            HashSet::from([TaskState::Failed, TaskState::Killed])
        );
        assert!(config.kill_unknown_tasks);
        assert_eq!(config.scheduler_host, "node-7");
        assert_eq!(config.worker_config().tick_interval, Duration::from_millis(250));
        assert!(config.scheduler_options().use_store);
    }

    #[test]
    fn test_invalid_values() {
        assert!(config(&[("BERTH_RESTART_STATES", "TASK_BOGUS")]).is_err());
        assert!(config(&[("BERTH_STATIC_PORTS", "maybe")]).is_err());
        assert!(config(&[("BERTH_SYNC_INTERVAL_SECS", "soon")]).is_err());
    }

    #[test]
    fn test_load_definitions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(
            &path,
            r#"[{"name": "web", "instances": 2, "resources": {"cpus": 0.5, "mem": 64}},
                {"name": "db", "persistent": true}]"#,
        )
        .unwrap();
        let config = config(&[("BERTH_TASKS_FILE", path.to_str().unwrap())]).unwrap();

        let definitions = config.load_definitions().unwrap();
        assert_eq!(definitions.len(), 2);
        assert_eq!(definitions[0].instances, 2);
        assert_eq!(definitions[0].resources.cpus, 0.5);
        assert!(definitions[1].persistent);
        assert_eq!(definitions[1].instances, 1);
    }
}
