//! # Event Store
//!
//! Append-only, tenant-scoped storage for domain events, queryable under the
//! access patterns the rest of the system needs:
//!
//! - all events for one entity, in append order;
//! - the single latest event for one entity (status and lease reads);
//! - the latest event of one type for an entity (e.g. the current
//!   `Job Saved` snapshot);
//! - events of one type across entities, newest first, cursor-paginated
//!   (job listings).
//!
//! Consistency contract: reads scoped to a single entity observe every event
//! appended before the read began. Cross-entity [`EventStore::events_of_type`]
//! queries may lag and callers must tolerate that.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::events::{EntityType, Event, EventType};

pub use memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;

/// Position in a newest-first type-scoped listing. Timestamp plus the
/// store's insertion sequence, so ties are broken deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCursor {
    pub timestamp: DateTime<Utc>,
    pub sequence: i64,
}

/// One event of a type-scoped listing, paired with the cursor that resumes
/// the listing immediately after it.
#[derive(Debug, Clone)]
pub struct PagedEvent {
    pub cursor: EventCursor,
    pub event: Event,
}

/// One page of a newest-first type-scoped listing.
#[derive(Debug, Clone)]
pub struct EventPage {
    pub events: Vec<PagedEvent>,
    /// Cursor for the next (older) page, absent on the last page.
    pub next: Option<EventCursor>,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append one immutable event. Events are never updated or deleted.
    async fn append(&self, event: Event) -> Result<()>;

    /// Every event for the entity, oldest first.
    async fn events_for_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Vec<Event>>;

    /// The most recent event for the entity, if any.
    async fn latest_event_for_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<Event>>;

    /// The most recent event of one type for the entity, if any.
    async fn latest_event_of_type_for_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        event_type: EventType,
    ) -> Result<Option<Event>>;

    /// Events of one type across all entities, newest first.
    async fn events_of_type(&self, event_type: EventType, limit: usize, before: Option<EventCursor>)
        -> Result<EventPage>;
}
