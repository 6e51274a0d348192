//! In-memory event store used by integration tests and local development.
//! Mirrors the Postgres implementation's ordering rules: append order is the
//! tiebreak within equal timestamps.

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;
use crate::events::{EntityType, Event, EventType};

use super::{EventCursor, EventPage, EventStore, PagedEvent};

#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    log: RwLock<Vec<Event>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of appended events. Test helper for idempotence checks.
    pub fn len(&self) -> usize {
        self.log.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.read().is_empty()
    }

    /// Snapshot of the full log in append order. Test helper.
    pub fn all_events(&self) -> Vec<Event> {
        self.log.read().clone()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, event: Event) -> Result<()> {
        self.log.write().push(event);
        Ok(())
    }

    async fn events_for_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Vec<Event>> {
        let log = self.log.read();
        Ok(log
            .iter()
            .filter(|e| e.entity_type == entity_type && e.entity_id == entity_id)
            .cloned()
            .collect())
    }

    async fn latest_event_for_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<Event>> {
        let log = self.log.read();
        Ok(log
            .iter()
            .rev()
            .find(|e| e.entity_type == entity_type && e.entity_id == entity_id)
            .cloned())
    }

    async fn latest_event_of_type_for_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        event_type: EventType,
    ) -> Result<Option<Event>> {
        let log = self.log.read();
        Ok(log
            .iter()
            .rev()
            .find(|e| {
                e.entity_type == entity_type
                    && e.entity_id == entity_id
                    && e.event_type() == event_type
            })
            .cloned())
    }

    async fn events_of_type(
        &self,
        event_type: EventType,
        limit: usize,
        before: Option<EventCursor>,
    ) -> Result<EventPage> {
        let log = self.log.read();

        // Newest first; append index is the sequence.
        let mut matching: Vec<(i64, &Event)> = log
            .iter()
            .enumerate()
            .filter(|(_, e)| e.event_type() == event_type)
            .map(|(i, e)| (i as i64, e))
            .collect();
        matching.reverse();

        let filtered = matching.into_iter().filter(|(seq, e)| match before {
            Some(cursor) => {
                (e.timestamp, *seq) < (cursor.timestamp, cursor.sequence)
            }
            None => true,
        });

        let page: Vec<PagedEvent> = filtered
            .take(limit + 1)
            .map(|(seq, e)| PagedEvent {
                cursor: EventCursor {
                    timestamp: e.timestamp,
                    sequence: seq,
                },
                event: e.clone(),
            })
            .collect();

        let has_more = page.len() > limit;
        let mut events = page;
        events.truncate(limit);
        let next = if has_more {
            events.last().map(|p| p.cursor)
        } else {
            None
        };

        Ok(EventPage { events, next })
    }
}
