//! Event handler dispatch.
//!
//! Every [`EventKind`] has a default handler. Embedders may replace the
//! handler of any kind; an override takes precedence over the default.
//! Handlers mutate the state and queue calls but never perform I/O.

use std::collections::HashMap;

use berth_events::{Call, Event, EventKind};
use tracing::{debug, error, info, warn};

use crate::state::SchedulerState;

/// A handler for one event kind.
pub type Handler = Box<dyn Fn(&mut SchedulerState, &Event) + Send + Sync>;

/// Registry of handler overrides.
#[derive(Default)]
pub struct HandlerTable {
    overrides: HashMap<EventKind, Handler>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the handler for `kind`.
    pub fn with_override<F>(mut self, kind: EventKind, handler: F) -> Self
    where
        F: Fn(&mut SchedulerState, &Event) + Send + Sync + 'static,
    {
        self.overrides.insert(kind, Box::new(handler));
        self
    }

    pub fn is_overridden(&self, kind: EventKind) -> bool {
        self.overrides.contains_key(&kind)
    }

    /// Run the handler for `event`.
    pub fn dispatch(&self, state: &mut SchedulerState, event: &Event) {
        let kind = event.kind();
        match self.overrides.get(&kind) {
            Some(handler) => {
                debug!(kind = %kind, "Dispatching to override");
                handler(state, event);
            }
            None => default_handler(state, event),
        }
    }
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<&str> = self.overrides.keys().map(|k| k.as_str()).collect();
        f.debug_struct("HandlerTable")
            .field("overrides", &kinds)
            .finish()
    }
}

/// Built-in behaviour for every event kind.
pub fn default_handler(state: &mut SchedulerState, event: &Event) {
    match event {
        Event::Subscribed {
            framework_id,
            heartbeat_interval_seconds,
        } => {
            info!(
                framework_id = %framework_id,
                heartbeat_interval_seconds = ?heartbeat_interval_seconds,
                "Subscribed"
            );
            state.subscribed(framework_id);
        }
        Event::Offers { offers } => {
            debug!(count = offers.len(), "Received offers");
            for offer in offers {
                state.handle_offer(offer);
            }
        }
        Event::InverseOffers { inverse_offers } => {
            let inverse_offer_ids: Vec<String> =
                inverse_offers.iter().map(|o| o.id.clone()).collect();
            debug!(count = inverse_offer_ids.len(), "Declining inverse offers");
            if !inverse_offer_ids.is_empty() {
                state.call(Call::DeclineInverseOffers { inverse_offer_ids });
            }
        }
        Event::Rescind { offer_id } => {
            debug!(offer_id = %offer_id, "Offer rescinded");
        }
        Event::RescindInverseOffer { inverse_offer_id } => {
            debug!(inverse_offer_id = %inverse_offer_id, "Inverse offer rescinded");
        }
        Event::Update { status } => state.handle_status(status),
        Event::Message {
            agent_id,
            executor_id,
            data,
        } => {
            debug!(agent_id = %agent_id, executor_id = ?executor_id, bytes = data.len(), "Executor message");
        }
        Event::Failure {
            agent_id,
            executor_id,
            status,
        } => {
            warn!(
                agent_id = ?agent_id,
                executor_id = ?executor_id,
                status = ?status,
                "Agent or executor failure"
            );
        }
        Event::Error { message } => {
            error!(message = %message, "Resource manager error");
        }
        Event::Heartbeat => debug!("Heartbeat"),
    }
}
