//! # berth-id
//!
//! Task identity for the berth scheduler.
//!
//! ## Naming
//!
//! - A task type is a user-chosen label, e.g. `web`
//! - A task instance carries a numeric serial suffix: `web-1`, `web-2`
//! - A launched instance gets a task ID: `{framework}.{instance}.{uuid}`
//!
//! Examples:
//! - `berth.web-3.6f1c2f0e-1d7e-4c1b-9a6b-0c0f6b5b2d11`
//! - `berth.indexer_eu-12.1b4f8c77-52c9-4c0c-8f0e-2a6d2f1e9b30`
//!
//! Task IDs sort by instance type name first and then by serial, compared
//! numerically, so `web-9` orders before `web-11`.

mod error;
mod serial;
mod task_id;

pub use error::IdError;
pub use serial::{launch_name, serial_of, split_serial, strip_serial, with_serial};
pub use task_id::{compare_task_ids, TaskId};
