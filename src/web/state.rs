//! Shared state for the HTTP API. Handles are injected by the process
//! entry point; handlers never construct clients of their own.

use std::sync::Arc;

use crate::event_store::EventStore;
use crate::events::EventBuilder;
use crate::orchestration::Dispatcher;
use crate::registry::TemplateStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EventStore>,
    pub templates: Arc<dyn TemplateStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub events: EventBuilder,
}

impl AppState {
    pub fn new(
        store: Arc<dyn EventStore>,
        templates: Arc<dyn TemplateStore>,
        dispatcher: Arc<Dispatcher>,
        events: EventBuilder,
    ) -> Self {
        Self {
            store,
            templates,
            dispatcher,
            events,
        }
    }
}
