//! berth scheduler library.
//!
//! This crate primarily ships a `berth-scheduler` binary, but exposes its
//! scheduling core as a library for integration testing and embedding.
//!
//! Event flow:
//! - resource manager events are dispatched through a [`handlers::HandlerTable`]
//! - handlers mutate a single [`state::SchedulerState`] without doing I/O
//! - the [`worker::SchedulerWorker`] flushes queued calls, store writes and
//!   notices after every event

pub mod config;
pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod matcher;
pub mod placement;
pub mod restart;
pub mod state;
pub mod store;
pub mod sync;
pub mod task;
pub mod transport;
pub mod worker;

pub use error::{SchedulerError, SchedulerResult};
pub use state::{Notice, SchedulerOptions, SchedulerState};
