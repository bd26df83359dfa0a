//! Placement constraints.
//!
//! Two caches record where instances of each task type run:
//! - host IPs, for types that must not share a host
//! - availability zones, for types spread across zones
//!
//! Both are keyed by task type name and only hold entries for types with the
//! matching constraint. They can be rebuilt from the launched tasks at any
//! time.

use std::collections::{HashMap, HashSet};

use crate::task::Task;

/// Host and zone occupancy per task type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlacementMaps {
    locations: HashMap<String, Vec<String>>,
    zones: HashMap<String, Vec<String>>,
}

impl PlacementMaps {
    /// Rebuild both maps from placed tasks.
    pub fn rebuild<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut maps = Self::default();
        for task in tasks {
            maps.record(task);
        }
        maps
    }

    /// Host IPs occupied by instances of `type_name`.
    pub fn locations(&self, type_name: &str) -> &[String] {
        self.locations
            .get(type_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// One zone entry per placed instance of `type_name`.
    pub fn zones(&self, type_name: &str) -> &[String] {
        self.zones.get(type_name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Add a placed task.
    pub fn record(&mut self, task: &Task) {
        let key = &task.spec.name;
        if task.spec.no_inner_colocation {
            if let Some(ip) = task.host_ip() {
                self.locations
                    .entry(key.clone())
                    .or_default()
                    .push(ip.to_string());
            }
        }
        if task.spec.az_aware {
            if let Some(zone) = &task.zone {
                self.zones.entry(key.clone()).or_default().push(zone.clone());
            }
        }
    }

    /// Remove a task that is no longer placed.
    pub fn forget(&mut self, task: &Task) {
        let key = task.spec.name.as_str();
        if task.spec.no_inner_colocation {
            if let (Some(ip), Some(list)) = (task.host_ip(), self.locations.get_mut(key)) {
                list.retain(|entry| entry != ip);
                if list.is_empty() {
                    self.locations.remove(key);
                }
            }
        }
        if task.spec.az_aware {
            if let (Some(zone), Some(list)) = (&task.zone, self.zones.get_mut(key)) {
                if let Some(position) = list.iter().position(|entry| entry == zone) {
                    list.remove(position);
                }
                if list.is_empty() {
                    self.zones.remove(key);
                }
            }
        }
    }
}

/// True if placing `task` on the offered host is forbidden.
///
/// `noColocation` keeps a task off the scheduler's own host;
/// `noInnerColocation` keeps instances of one type on distinct hosts.
pub fn rejects_colocation(
    task: &Task,
    offer_host: &str,
    offer_ip: &str,
    scheduler_host: &str,
    maps: &PlacementMaps,
) -> bool {
    if task.spec.no_colocation && (offer_host == scheduler_host || offer_ip == scheduler_host) {
        return true;
    }
    task.spec.no_inner_colocation
        && maps
            .locations(&task.spec.name)
            .iter()
            .any(|ip| ip == offer_ip)
}

/// True if placing `task` in `offer_zone` keeps its type evenly spread over
/// the zones seen so far.
pub fn allows_zone(task: &Task, offer_zone: Option<&str>, maps: &PlacementMaps) -> bool {
    if !task.spec.az_aware {
        return true;
    }
    let Some(zone) = offer_zone else {
        return false;
    };

    let placed = maps.zones(&task.spec.name);
    if placed.is_empty() {
        return true;
    }
    let distinct: HashSet<&str> = placed.iter().map(String::as_str).collect();
    if distinct.len() == 1 {
        return !distinct.contains(zone);
    }

    // occupancy(zone) / placed <= 1 / distinct
    let here = placed.iter().filter(|entry| *entry == zone).count();
    here * distinct.len() <= placed.len()
}
