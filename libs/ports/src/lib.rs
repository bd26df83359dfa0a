//! Port allocation for resource offers.
//!
//! An offer advertises its free ports as a list of closed ranges. This
//! library provides:
//! - `PortRange`, a closed `[begin, end]` interval
//! - `PortPool`, the disjoint ranges still unassigned in one offer
//! - `PortPool::allocate`, which carves static and dynamic ports out of the
//!   pool and pushes the unused pieces back

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Port allocation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PortError {
    /// A range whose end lies below its beginning.
    #[error("invalid port range: [{begin}, {end}]")]
    InvalidRange { begin: u64, end: u64 },

    /// The same static port was requested twice.
    #[error("static port {0} requested more than once")]
    DuplicateStatic(u64),

    /// Some static ports are not free in the pool. The pool is left unchanged.
    #[error("static ports unavailable: {missing:?}")]
    StaticUnavailable { missing: Vec<u64> },

    /// The pool ran out before every dynamic port was assigned.
    #[error("port pool exhausted: {missing} of {requested} dynamic ports unassigned")]
    Exhausted { requested: u64, missing: u64 },
}

// ============================================================================
// Ranges
// ============================================================================

/// Highest valid port number.
pub const MAX_PORT: u64 = 65_535;

/// A closed interval of ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRange {
    pub begin: u64,
    pub end: u64,
}

impl PortRange {
    /// Create a range, rejecting `end < begin` and ports above [`MAX_PORT`].
    pub fn new(begin: u64, end: u64) -> Result<Self, PortError> {
        if end < begin || end > MAX_PORT {
            return Err(PortError::InvalidRange { begin, end });
        }
        Ok(Self { begin, end })
    }

    /// A range holding exactly one port.
    pub fn single(port: u64) -> Self {
        Self {
            begin: port,
            end: port,
        }
    }

    /// Number of ports in the range.
    pub fn len(&self) -> u64 {
        (self.end - self.begin).saturating_add(1)
    }

    /// The part of the range at or below [`MAX_PORT`], if any.
    pub fn clamped(&self) -> Option<Self> {
        (self.begin <= MAX_PORT).then(|| Self {
            begin: self.begin,
            end: self.end.min(MAX_PORT),
        })
    }

    /// Ranges always hold at least one port.
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, port: u64) -> bool {
        self.begin <= port && port <= self.end
    }

    /// Pieces of this range left after removing `ports`, which must be
    /// sorted ascending and contained in the range.
    fn split_around(&self, ports: &[u64]) -> Vec<PortRange> {
        let mut pieces = Vec::with_capacity(ports.len() + 1);
        let mut cursor = Some(self.begin);
        for &port in ports {
            if let Some(start) = cursor {
                if port > start {
                    pieces.push(PortRange {
                        begin: start,
                        end: port - 1,
                    });
                }
            }
            cursor = port.checked_add(1);
        }
        if let Some(start) = cursor {
            if start <= self.end {
                pieces.push(PortRange {
                    begin: start,
                    end: self.end,
                });
            }
        }
        pieces
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}-{}]", self.begin, self.end)
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Ports wanted by one task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortRequest {
    /// Fixed ports, assigned first and in this order.
    pub static_ports: Vec<u64>,

    /// Number of ports chosen by the allocator.
    pub dynamic: u64,

    /// Lowest port the allocator may choose for dynamic ports.
    pub minimum: Option<u64>,
}

impl PortRequest {
    /// Request `count` dynamic ports.
    pub fn dynamic(count: u64) -> Self {
        Self {
            dynamic: count,
            ..Self::default()
        }
    }

    /// Request exactly `ports`.
    pub fn fixed(ports: Vec<u64>) -> Self {
        Self {
            static_ports: ports,
            ..Self::default()
        }
    }

    /// Set the dynamic port floor.
    pub fn with_minimum(mut self, minimum: Option<u64>) -> Self {
        self.minimum = minimum;
        self
    }

    /// Add dynamic ports to the request.
    pub fn with_dynamic(mut self, count: u64) -> Self {
        self.dynamic = count;
        self
    }

    /// Total number of ports the request assigns.
    pub fn total(&self) -> u64 {
        self.static_ports.len() as u64 + self.dynamic
    }

    fn validate(&self) -> Result<(), PortError> {
        let mut seen = self.static_ports.clone();
        seen.sort_unstable();
        if let Some(pair) = seen.windows(2).find(|w| w[0] == w[1]) {
            return Err(PortError::DuplicateStatic(pair[0]));
        }
        Ok(())
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Unassigned ports of one offer as an ordered list of disjoint ranges.
///
/// Ranges keep their arrival order; pieces produced by allocation are
/// appended at the back. Adjacent ranges are never coalesced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortPool {
    ranges: VecDeque<PortRange>,
}

impl PortPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pool from offered ranges.
    pub fn from_ranges(ranges: impl IntoIterator<Item = PortRange>) -> Self {
        let pool = Self {
            ranges: ranges.into_iter().collect(),
        };
        debug_assert!(pool.is_disjoint(), "offered port ranges overlap");
        pool
    }

    /// Append a range at the back of the pool.
    pub fn push(&mut self, range: PortRange) {
        self.ranges.push_back(range);
        debug_assert!(self.is_disjoint(), "port range {} overlaps pool", range);
    }

    /// Ranges in pool order.
    pub fn ranges(&self) -> impl Iterator<Item = &PortRange> {
        self.ranges.iter()
    }

    /// Total number of free ports.
    pub fn available(&self) -> u64 {
        self.ranges
            .iter()
            .map(PortRange::len)
            .fold(0, u64::saturating_add)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Assign the ports of `request`.
    ///
    /// Static ports come first in request order, followed by dynamic ports in
    /// the order they were taken. If a static port is missing the pool is
    /// restored and nothing is assigned. If the dynamic demand cannot be met
    /// the ports already taken stay consumed and `Exhausted` is returned.
    pub fn allocate(&mut self, request: &PortRequest) -> Result<Vec<u64>, PortError> {
        request.validate()?;

        let mut assigned = Vec::with_capacity(request.total() as usize);
        if !request.static_ports.is_empty() {
            self.take_static(&request.static_ports)?;
            assigned.extend_from_slice(&request.static_ports);
        }

        let dynamic = self.take_dynamic(request.dynamic, request.minimum.unwrap_or(0));
        let missing = request.dynamic - dynamic.len() as u64;
        assigned.extend(dynamic);

        debug_assert!(self.is_disjoint(), "port pool overlaps after allocation");
        if missing > 0 {
            return Err(PortError::Exhausted {
                requested: request.dynamic,
                missing,
            });
        }
        Ok(assigned)
    }

    fn take_static(&mut self, wanted: &[u64]) -> Result<(), PortError> {
        let mut found = vec![false; wanted.len()];
        let mut remaining = wanted.len();
        let mut scanned = Vec::new();
        let mut residual = Vec::new();

        while remaining > 0 {
            let Some(range) = self.ranges.pop_front() else {
                break;
            };
            scanned.push(range);

            let mut hits = Vec::new();
            for (port, hit) in wanted.iter().zip(found.iter_mut()) {
                if !*hit && range.contains(*port) {
                    *hit = true;
                    remaining -= 1;
                    hits.push(*port);
                }
            }

            if hits.is_empty() {
                residual.push(range);
            } else {
                hits.sort_unstable();
                residual.extend(range.split_around(&hits));
            }
        }

        if remaining > 0 {
            for range in scanned.into_iter().rev() {
                self.ranges.push_front(range);
            }
            let missing = wanted
                .iter()
                .zip(&found)
                .filter(|(_, hit)| !**hit)
                .map(|(port, _)| *port)
                .collect();
            return Err(PortError::StaticUnavailable { missing });
        }

        self.ranges.extend(residual);
        Ok(())
    }

    fn take_dynamic(&mut self, count: u64, floor: u64) -> Vec<u64> {
        let mut assigned = Vec::new();
        let mut needed = count;

        // Each range is visited once so ranges below the floor cannot cycle.
        for range in std::mem::take(&mut self.ranges) {
            if needed == 0 || range.end < floor {
                self.ranges.push_back(range);
                continue;
            }

            let start = range.begin.max(floor);
            let take = needed.min((range.end - start).saturating_add(1));
            let last = start + (take - 1);
            assigned.extend(start..=last);
            needed -= take;

            if start > range.begin {
                self.ranges.push_back(PortRange {
                    begin: range.begin,
                    end: start - 1,
                });
            }
            if last < range.end {
                self.ranges.push_back(PortRange {
                    begin: last + 1,
                    end: range.end,
                });
            }
        }

        assigned
    }

    fn is_disjoint(&self) -> bool {
        let mut sorted: Vec<&PortRange> = self.ranges.iter().collect();
        sorted.sort_by_key(|r| r.begin);
        sorted.windows(2).all(|w| w[0].end < w[1].begin)
    }
}
