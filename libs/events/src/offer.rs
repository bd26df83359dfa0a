//! Resource offers.

use berth_ports::{PortPool, PortRange};
use serde::{Deserialize, Serialize};

/// Agent attribute naming the availability zone of an offer.
pub const ZONE_ATTRIBUTE: &str = "instance_az";

/// Resource names understood by the scheduler.
pub mod resource_names {
    pub const CPUS: &str = "cpus";
    pub const MEM: &str = "mem";
    pub const DISK: &str = "disk";
    pub const PORTS: &str = "ports";
}

/// Typed value of a resource or attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Value {
    Scalar { scalar: f64 },
    Ranges { ranges: Vec<PortRange> },
    Set { items: Vec<String> },
    Text { text: String },
}

/// A named resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    #[serde(flatten)]
    pub value: Value,
}

impl Resource {
    pub fn scalar(name: &str, value: f64) -> Self {
        Self {
            name: name.to_string(),
            value: Value::Scalar { scalar: value },
        }
    }

    pub fn ranges(name: &str, ranges: Vec<PortRange>) -> Self {
        Self {
            name: name.to_string(),
            value: Value::Ranges { ranges },
        }
    }
}

/// A named agent attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    #[serde(flatten)]
    pub value: Value,
}

impl Attribute {
    pub fn text(name: &str, text: &str) -> Self {
        Self {
            name: name.to_string(),
            value: Value::Text {
                text: text.to_string(),
            },
        }
    }
}

/// Resources on one agent, valid for a single matching attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: String,
    pub agent_id: String,
    pub hostname: String,
    /// Agent IP address; falls back to the hostname when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default)]
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
}

impl Offer {
    /// Sum of all scalar resources called `name`.
    pub fn scalar(&self, name: &str) -> f64 {
        self.resources
            .iter()
            .filter(|r| r.name == name)
            .filter_map(|r| match r.value {
                Value::Scalar { scalar } => Some(scalar),
                _ => None,
            })
            .sum()
    }

    /// All offered port ranges in arrival order, cut off at the highest valid
    /// port.
    pub fn port_pool(&self) -> PortPool {
        let ranges = self
            .resources
            .iter()
            .filter(|r| r.name == resource_names::PORTS)
            .filter_map(|r| match &r.value {
                Value::Ranges { ranges } => Some(ranges.iter()),
                _ => None,
            })
            .flatten()
            .filter_map(PortRange::clamped);
        PortPool::from_ranges(ranges)
    }

    /// Text value of the attribute called `name`.
    pub fn attribute_text(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .filter(|a| a.name == name)
            .find_map(|a| match &a.value {
                Value::Text { text } => Some(text.as_str()),
                _ => None,
            })
    }

    /// Availability zone of the offering agent.
    pub fn zone(&self) -> Option<&str> {
        self.attribute_text(ZONE_ATTRIBUTE)
    }

    /// Address tasks on this agent are reachable at.
    pub fn address(&self) -> &str {
        self.ip.as_deref().unwrap_or(&self.hostname)
    }
}

/// Request to give resources back ahead of maintenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InverseOffer {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}
