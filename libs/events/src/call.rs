//! Calls sent to the resource manager and the launch specs they carry.

use berth_id::TaskId;
use serde::{Deserialize, Serialize};

use crate::offer::Resource;

// =============================================================================
// Calls
// =============================================================================

/// An outbound call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Call {
    Accept {
        offer_ids: Vec<String>,
        operations: Vec<Operation>,
    },
    Decline {
        offer_ids: Vec<String>,
    },
    DeclineInverseOffers {
        inverse_offer_ids: Vec<String>,
    },
    Kill {
        task_id: TaskId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
    },
    /// Explicit reconciliation; an empty list asks about every task.
    Reconcile {
        tasks: Vec<ReconcileTask>,
    },
    Acknowledge {
        agent_id: String,
        task_id: TaskId,
        uuid: String,
    },
}

impl Call {
    /// Wire name of the call.
    pub fn name(&self) -> &'static str {
        match self {
            Call::Accept { .. } => "ACCEPT",
            Call::Decline { .. } => "DECLINE",
            Call::DeclineInverseOffers { .. } => "DECLINE_INVERSE_OFFERS",
            Call::Kill { .. } => "KILL",
            Call::Reconcile { .. } => "RECONCILE",
            Call::Acknowledge { .. } => "ACKNOWLEDGE",
        }
    }

    /// Accept `offer_id` launching `tasks`.
    pub fn launch(offer_id: &str, tasks: Vec<TaskInfo>) -> Self {
        Call::Accept {
            offer_ids: vec![offer_id.to_string()],
            operations: vec![Operation::Launch { task_infos: tasks }],
        }
    }

    pub fn decline(offer_id: &str) -> Self {
        Call::Decline {
            offer_ids: vec![offer_id.to_string()],
        }
    }
}

/// Operation applied to accepted offers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Launch { task_infos: Vec<TaskInfo> },
}

/// A task whose state should be re-reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileTask {
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

// =============================================================================
// Launch Specs
// =============================================================================

/// Everything the resource manager needs to start one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub name: String,
    pub task_id: TaskId,
    pub agent_id: String,
    pub resources: Vec<Resource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
}

/// Environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default = "default_shell")]
    pub shell: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uris: Vec<String>,
    #[serde(default)]
    pub environment: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

fn default_shell() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkMode {
    #[default]
    Host,
    Bridge,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_port: u64,
    pub container_port: u64,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub key: String,
    pub value: String,
}

/// Container image and networking.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub image: String,
    #[serde(default)]
    pub network: NetworkMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub port_mappings: Vec<PortMapping>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub force_pull_image: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
}

/// HTTP health check bound to a concrete port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub port: u64,
    pub path: String,
    pub interval_seconds: f64,
    pub timeout_seconds: f64,
    pub grace_period_seconds: f64,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub key: String,
    pub value: String,
}
