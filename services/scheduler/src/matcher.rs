//! Offer matching.
//!
//! Each offer is matched against the pending tasks in priority order. Tasks
//! that fit are given ports, checked against placement constraints and
//! launched together in one accept call. An offer that launches nothing is
//! declined.
//!
//! Matching is transactional: state is only updated once the whole offer has
//! been evaluated, so a failure part-way through leaves every task pending.

use berth_events::{
    resource_names, Call, EnvVar, NetworkMode, Offer, Resource, TaskInfo,
};
use berth_id::{launch_name, TaskId};
use berth_ports::{PortError, PortPool, PortRange, PortRequest};
use tracing::{debug, error, info, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::placement::{allows_zone, rejects_colocation};
use crate::state::SchedulerState;
use crate::sync::StoreOp;
use crate::task::{Network, RuntimeInfo, Task, TaskResources};

/// Resources of one offer still unclaimed while matching.
#[derive(Debug, Clone, PartialEq)]
pub struct OfferResources {
    pub cpus: f64,
    pub mem: f64,
    pub disk: f64,
    pub ports: PortPool,
}

impl OfferResources {
    pub fn from_offer(offer: &Offer) -> Self {
        Self {
            cpus: offer.scalar(resource_names::CPUS),
            mem: offer.scalar(resource_names::MEM),
            disk: offer.scalar(resource_names::DISK),
            ports: offer.port_pool(),
        }
    }

    /// True if `demand` fits in what is left.
    ///
    /// With static ports enabled only the static ports are counted against
    /// the pool; the allocator reports any remaining shortfall.
    pub fn fits(&self, demand: &TaskResources, static_ports: bool) -> bool {
        let port_demand = if static_ports && !demand.static_ports.is_empty() {
            demand.static_ports.len() as u64
        } else {
            demand.ports
        };
        demand.cpus <= self.cpus
            && demand.mem <= self.mem
            && demand.disk <= self.disk
            && port_demand <= self.ports.available()
    }

    fn reserve(&mut self, demand: &TaskResources) {
        self.cpus -= demand.cpus;
        self.mem -= demand.mem;
        self.disk -= demand.disk;
    }
}

/// Outcome of matching one offer.
#[derive(Debug, Clone)]
pub struct OfferMatch {
    pub launches: Vec<TaskInfo>,
    /// Names of the tasks moved from pending to launched.
    pub consumed: Vec<String>,
    pub residual: OfferResources,
}

fn port_request(demand: &TaskResources, static_ports: bool) -> PortRequest {
    let request = if static_ports && !demand.static_ports.is_empty() {
        let dynamic = demand
            .ports
            .saturating_sub(demand.static_ports.len() as u64);
        PortRequest::fixed(demand.static_ports.clone()).with_dynamic(dynamic)
    } else {
        PortRequest::dynamic(demand.ports)
    };
    request.with_minimum(demand.minimum_port)
}

impl SchedulerState {
    /// Match one offer and queue the resulting accept or decline.
    pub fn handle_offer(&mut self, offer: &Offer) {
        if self.pending.is_empty() {
            debug!(offer_id = %offer.id, "No pending tasks, declining offer");
            self.call(Call::decline(&offer.id));
            return;
        }

        match self.match_offer(offer) {
            Ok(matched) if !matched.launches.is_empty() => {
                info!(
                    offer_id = %offer.id,
                    agent_id = %offer.agent_id,
                    tasks = ?matched.consumed,
                    "Launching tasks"
                );
                self.call(Call::launch(&offer.id, matched.launches));
            }
            Ok(_) => {
                debug!(offer_id = %offer.id, "No pending task fits offer, declining");
                self.call(Call::decline(&offer.id));
            }
            Err(e) => {
                error!(offer_id = %offer.id, error = %e, "Failed to match offer, declining");
                self.call(Call::decline(&offer.id));
            }
        }
    }

    /// Match pending tasks against `offer` and move the placed ones to
    /// launched.
    ///
    /// Resources claimed by a task that is then rejected by placement are
    /// not returned to the offer.
    pub fn match_offer(&mut self, offer: &Offer) -> SchedulerResult<OfferMatch> {
        if offer.agent_id.is_empty() {
            return Err(SchedulerError::InvalidOffer {
                offer_id: offer.id.clone(),
                reason: "missing agent ID".to_string(),
            });
        }

        let static_ports = self.options.static_ports;
        let mut resources = OfferResources::from_offer(offer);
        let mut maps = self.placement.clone();
        let mut accepted: Vec<(usize, Task)> = Vec::new();
        let mut launches = Vec::new();

        for (index, task) in self.pending.iter().enumerate() {
            let demand = &task.spec.resources;
            if !resources.fits(demand, static_ports) {
                continue;
            }
            resources.reserve(demand);

            let ports = match resources.ports.allocate(&port_request(demand, static_ports)) {
                Ok(ports) => ports,
                Err(e @ (PortError::Exhausted { .. } | PortError::StaticUnavailable { .. })) => {
                    warn!(task = %task.name, offer_id = %offer.id, error = %e, "Couldn't find enough ports");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let (candidate, info) = self.prepare_launch(task, offer, ports);
            let rejected = rejects_colocation(
                &candidate,
                &offer.hostname,
                offer.address(),
                &self.options.scheduler_host,
                &maps,
            ) || !allows_zone(&candidate, offer.zone(), &maps);
            if rejected {
                debug!(task = %candidate.name, offer_id = %offer.id, "Placement rejected");
                continue;
            }

            maps.record(&candidate);
            launches.push(info);
            accepted.push((index, candidate));
        }

        self.placement = maps;
        for (index, _) in accepted.iter().rev() {
            self.pending.remove(*index);
        }
        let mut consumed = Vec::with_capacity(accepted.len());
        for (_, task) in accepted {
            consumed.push(task.name.clone());
            self.persist(StoreOp::SaveTask(Box::new(task.clone())));
            self.launched.push(task);
        }

        Ok(OfferMatch {
            launches,
            consumed,
            residual: resources,
        })
    }

    /// Copy of `task` stamped for launch on `offer`, and its launch spec.
    fn prepare_launch(&self, task: &Task, offer: &Offer, ports: Vec<u64>) -> (Task, TaskInfo) {
        let options = &self.options;
        let mut candidate = task.clone();

        let environment = candidate.environment_mut();
        for (index, port) in ports.iter().enumerate() {
            environment.push(EnvVar::new(format!("PORT{}", index), port.to_string()));
        }
        environment.push(EnvVar::new("HOST", offer.address()));

        if let Some(command) = candidate.spec.command.as_mut() {
            command.user.get_or_insert_with(|| options.user.clone());
        }

        if let Some(container) = candidate.spec.container.as_mut() {
            if container.network == NetworkMode::Bridge && !container.port_mappings.is_empty() {
                if container.port_mappings.len() == ports.len() {
                    for (mapping, port) in container.port_mappings.iter_mut().zip(&ports) {
                        mapping.host_port = *port;
                    }
                } else {
                    debug!(task = %task.name, "Port mapping count does not match assigned ports");
                }
            }
        }

        let task_id = TaskId::generate(&options.framework_name, &candidate.name);
        let name = launch_name(&candidate.name, options.serial_numbered_tasks);
        let health_check = candidate
            .spec
            .health_check
            .as_ref()
            .and_then(|check| check.bind(&ports));

        let mut resources = vec![
            Resource::scalar(resource_names::CPUS, candidate.spec.resources.cpus),
            Resource::scalar(resource_names::MEM, candidate.spec.resources.mem),
        ];
        if candidate.spec.resources.disk > 0.0 {
            resources.push(Resource::scalar(
                resource_names::DISK,
                candidate.spec.resources.disk,
            ));
        }
        if !ports.is_empty() {
            resources.push(Resource::ranges(
                resource_names::PORTS,
                ports.iter().copied().map(PortRange::single).collect(),
            ));
        }

        let info = TaskInfo {
            name: name.clone(),
            task_id: task_id.clone(),
            agent_id: offer.agent_id.clone(),
            resources,
            command: candidate.spec.command.clone(),
            container: candidate.spec.container.clone(),
            health_check: health_check.clone(),
            labels: candidate.spec.labels.clone(),
        };

        let network = Network {
            hostname: offer.hostname.clone(),
            ip: offer.address().to_string(),
            ports,
        };
        let mut runtime =
            RuntimeInfo::staging(&offer.agent_id, network, candidate.spec.resources.clone());
        runtime.task_version = candidate.spec.task_version.clone();

        candidate.task_id = Some(task_id);
        candidate.launch_name = Some(name);
        candidate.health_check = health_check;
        candidate.is_submitted = true;
        candidate.runtime = Some(runtime);
        candidate.zone = offer.zone().map(str::to_string);

        (candidate, info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SchedulerOptions;
    use crate::task::{HealthCheckSpec, TaskDefinition};
    use berth_events::{Attribute, ContainerInfo, PortMapping, TaskState, Value};

    fn offer(id: &str, host: &str, cpus: f64, mem: f64, ports: &[(u64, u64)]) -> Offer {
        let mut resources = vec![
            Resource::scalar("cpus", cpus),
            Resource::scalar("mem", mem),
        ];
        if !ports.is_empty() {
            resources.push(Resource::ranges(
                "ports",
                ports
                    .iter()
                    .map(|(b, e)| PortRange { begin: *b, end: *e })
                    .collect(),
            ));
        }
        Offer {
            id: id.to_string(),
            agent_id: format!("agent-{}", host),
            hostname: host.to_string(),
            ip: Some(format!("10.0.0.{}", host.len())),
            resources,
            attributes: Vec::new(),
        }
    }

    fn definition(name: &str, cpus: f64, ports: u64) -> TaskDefinition {
        let mut def = TaskDefinition::new(name);
        def.resources.cpus = cpus;
        def.resources.mem = 64.0;
        def.resources.ports = ports;
        def
    }

    fn state(options: SchedulerOptions, definitions: Vec<TaskDefinition>) -> SchedulerState {
        SchedulerState::new(options, definitions).unwrap()
    }

    fn launched_infos(call: &Call) -> &[TaskInfo] {
        match call {
            Call::Accept { operations, .. } => match &operations[0] {
                berth_events::Operation::Launch { task_infos } => task_infos,
            },
            other => panic!("expected accept, got {:?}", other),
        }
    }

    #[test]
    fn test_declines_without_pending_tasks() {
        let mut state = state(SchedulerOptions::default(), Vec::new());
        state.handle_offer(&offer("o1", "h1", 4.0, 1024.0, &[]));
        assert_eq!(state.drain_calls(), vec![Call::decline("o1")]);
    }

    #[test]
    fn test_launches_in_priority_order_within_capacity() {
        let mut low = definition("low", 0.6, 0);
        low.priority = Some(2);
        let mut high = definition("high", 0.6, 0);
        high.priority = Some(1);
        let mut state = state(SchedulerOptions::default(), vec![low, high]);

        state.handle_offer(&offer("o1", "h1", 1.0, 1024.0, &[]));

        let calls = state.drain_calls();
        assert_eq!(calls.len(), 1);
        let infos = launched_infos(&calls[0]);
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].name, "high-1");
        assert_eq!(state.launched[0].name, "high-1");
        assert_eq!(state.pending.len(), 1);
        assert_eq!(state.pending[0].name, "low-1");
    }

    #[test]
    fn test_launch_stamps_task() {
        let mut def = definition("web", 0.5, 2);
        def.health_check = Some(HealthCheckSpec {
            path: "/health".to_string(),
            port_index: 1,
            interval_seconds: 10.0,
            timeout_seconds: 20.0,
            grace_period_seconds: 10.0,
            consecutive_failures: 3,
        });
        let mut state = state(SchedulerOptions::default(), vec![def]);
        let offer = offer("o1", "h1", 1.0, 1024.0, &[(31000, 31009)]);

        let matched = state.match_offer(&offer).unwrap();

        assert_eq!(matched.consumed, vec!["web-1".to_string()]);
        assert_eq!(matched.residual.ports.available(), 8);
        let task = &state.launched[0];
        let runtime = task.runtime.as_ref().unwrap();
        assert_eq!(runtime.state, TaskState::Staging);
        assert_eq!(runtime.agent_id, "agent-h1");
        assert_eq!(runtime.network.ports, vec![31000, 31001]);
        assert_eq!(runtime.network.ip, "10.0.0.2");
        assert!(task.is_submitted);
        assert_eq!(task.launch_name.as_deref(), Some("web-1"));
        assert!(task
            .task_id
            .as_ref()
            .unwrap()
            .as_str()
            .starts_with("berth.web-1."));
        assert_eq!(
            task.environment(),
            &[
                EnvVar::new("PORT0", "31000"),
                EnvVar::new("PORT1", "31001"),
                EnvVar::new("HOST", "10.0.0.2"),
            ]
        );

        let info = &matched.launches[0];
        assert_eq!(info.health_check.as_ref().unwrap().port, 31001);
        assert!(info.resources.iter().any(|r| r.name == "ports"
            && r.value
                == Value::Ranges {
                    ranges: vec![PortRange::single(31000), PortRange::single(31001)]
                }));
        assert!(!info.resources.iter().any(|r| r.name == "disk"));
        assert_eq!(info.command.as_ref().unwrap().user.as_deref(), Some("root"));
    }

    #[test]
    fn test_port_shortfall_leaves_task_pending() {
        let mut state = state(SchedulerOptions::default(), vec![definition("web", 0.1, 3)]);
        state.handle_offer(&offer("o1", "h1", 1.0, 1024.0, &[(31000, 31001)]));
        assert_eq!(state.drain_calls(), vec![Call::decline("o1")]);
        assert_eq!(state.pending.len(), 1);
        assert!(state.launched.is_empty());
    }

    #[test]
    fn test_minimum_port_respected() {
        let mut def = definition("web", 0.1, 1);
        def.resources.minimum_port = Some(31005);
        let mut state = state(SchedulerOptions::default(), vec![def]);
        state
            .match_offer(&offer("o1", "h1", 1.0, 1024.0, &[(31000, 31009)]))
            .unwrap();
        assert_eq!(state.launched[0].runtime.as_ref().unwrap().network.ports, vec![31005]);
    }

    #[test]
    fn test_static_ports_when_enabled() {
        let mut def = definition("edge", 0.1, 3);
        def.resources.static_ports = vec![8082, 8081];
        let options = SchedulerOptions {
            static_ports: true,
            ..SchedulerOptions::default()
        };
        let mut state = state(options, vec![def]);
        state
            .match_offer(&offer("o1", "h1", 1.0, 1024.0, &[(8080, 8090)]))
            .unwrap();
        assert_eq!(
            state.launched[0].runtime.as_ref().unwrap().network.ports,
            vec![8081, 8082, 8080]
        );
    }

    #[test]
    fn test_static_ports_ignored_when_disabled() {
        let mut def = definition("edge", 0.1, 1);
        def.resources.static_ports = vec![8085];
        let mut state = state(SchedulerOptions::default(), vec![def]);
        state
            .match_offer(&offer("o1", "h1", 1.0, 1024.0, &[(8080, 8090)]))
            .unwrap();
        assert_eq!(state.launched[0].runtime.as_ref().unwrap().network.ports, vec![8080]);
    }

    #[test]
    fn test_inner_colocation_within_one_offer() {
        let mut def = definition("db", 0.1, 0);
        def.instances = 2;
        def.no_inner_colocation = true;
        let mut state = state(SchedulerOptions::default(), vec![def]);

        let matched = state.match_offer(&offer("o1", "h1", 4.0, 1024.0, &[])).unwrap();
        assert_eq!(matched.consumed, vec!["db-1".to_string()]);
        assert_eq!(state.pending[0].name, "db-2");
        assert_eq!(state.placement.locations("db").len(), 1);

        let matched = state.match_offer(&offer("o2", "h22", 4.0, 1024.0, &[])).unwrap();
        assert_eq!(matched.consumed, vec!["db-2".to_string()]);
        assert_eq!(state.placement.locations("db").len(), 2);
    }

    #[test]
    fn test_rejected_task_keeps_resources_claimed() {
        let mut first = definition("master", 0.6, 0);
        first.no_colocation = true;
        first.priority = Some(1);
        let mut second = definition("worker", 0.6, 0);
        second.priority = Some(2);
        let options = SchedulerOptions {
            scheduler_host: "h1".to_string(),
            ..SchedulerOptions::default()
        };
        let mut state = state(options, vec![first, second]);

        state.handle_offer(&offer("o1", "h1", 1.0, 1024.0, &[]));

        assert_eq!(state.drain_calls(), vec![Call::decline("o1")]);
        assert_eq!(state.pending.len(), 2);
        assert!(state.pending.iter().all(|t| t.task_id.is_none()));
    }

    #[test]
    fn test_zone_attribute_recorded() {
        let mut def = definition("web", 0.1, 0);
        def.az_aware = true;
        let mut state = state(SchedulerOptions::default(), vec![def]);
        let mut zoned = offer("o1", "h1", 1.0, 1024.0, &[]);
        zoned.attributes.push(Attribute::text("instance_az", "eu-1a"));

        state.match_offer(&zoned).unwrap();

        assert_eq!(state.launched[0].zone.as_deref(), Some("eu-1a"));
        assert_eq!(state.placement.zones("web"), &["eu-1a".to_string()]);
    }

    #[test]
    fn test_zone_aware_task_needs_zone_attribute() {
        let mut def = definition("web", 0.1, 0);
        def.az_aware = true;
        let mut state = state(SchedulerOptions::default(), vec![def]);
        state.handle_offer(&offer("o1", "h1", 1.0, 1024.0, &[]));
        assert_eq!(state.drain_calls(), vec![Call::decline("o1")]);
    }

    #[test]
    fn test_bridge_port_mappings_rewritten() {
        let mut def = definition("web", 0.1, 2);
        def.container = Some(ContainerInfo {
            image: "web:1".to_string(),
            network: NetworkMode::Bridge,
            port_mappings: vec![
                PortMapping {
                    host_port: 0,
                    container_port: 80,
                    protocol: "tcp".to_string(),
                },
                PortMapping {
                    host_port: 0,
                    container_port: 443,
                    protocol: "tcp".to_string(),
                },
            ],
            ..ContainerInfo::default()
        });
        let mut state = state(SchedulerOptions::default(), vec![def]);
        let matched = state
            .match_offer(&offer("o1", "h1", 1.0, 1024.0, &[(5000, 5010)]))
            .unwrap();
        let container = matched.launches[0].container.as_ref().unwrap();
        let host_ports: Vec<u64> = container.port_mappings.iter().map(|m| m.host_port).collect();
        assert_eq!(host_ports, vec![5000, 5001]);
    }

    #[test]
    fn test_serial_stripped_from_launch_name() {
        let options = SchedulerOptions {
            serial_numbered_tasks: false,
            ..SchedulerOptions::default()
        };
        let mut state = state(options, vec![definition("web", 0.1, 0)]);
        let matched = state.match_offer(&offer("o1", "h1", 1.0, 1024.0, &[])).unwrap();
        assert_eq!(matched.launches[0].name, "web");
        assert_eq!(state.launched[0].name, "web-1");
    }

    #[test]
    fn test_invalid_offer_is_declined_without_changes() {
        let mut state = state(SchedulerOptions::default(), vec![definition("web", 0.1, 0)]);
        let mut bad = offer("o1", "h1", 1.0, 1024.0, &[]);
        bad.agent_id.clear();
        state.handle_offer(&bad);
        assert_eq!(state.drain_calls(), vec![Call::decline("o1")]);
        assert_eq!(state.pending.len(), 1);
    }

    #[test]
    fn test_launch_persists_when_store_enabled() {
        let options = SchedulerOptions {
            use_store: true,
            ..SchedulerOptions::default()
        };
        let mut state = state(options, vec![definition("web", 0.1, 0)]);
        state.match_offer(&offer("o1", "h1", 1.0, 1024.0, &[])).unwrap();
        let writes = state.drain_writes();
        assert_eq!(writes.len(), 1);
        assert!(matches!(&writes[0], StoreOp::SaveTask(task) if task.name == "web-1"));
    }
}
