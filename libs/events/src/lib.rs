//! # berth-events
//!
//! Messages exchanged with the cluster resource manager.
//!
//! ## Directions
//!
//! - [`Event`]: pushed by the resource manager (offers, status updates, ...)
//! - [`Call`]: sent by the scheduler (accept, decline, kill, reconcile, ...)
//!
//! ## Encoding
//!
//! Both directions are internally tagged JSON objects keyed by `type`, e.g.
//! `{"type":"UPDATE","status":{...}}`. The transport that carries them is
//! outside this crate.

mod call;
mod error;
mod event;
mod offer;
mod status;

pub use call::*;
pub use error::EventError;
pub use event::*;
pub use offer::*;
pub use status::*;
