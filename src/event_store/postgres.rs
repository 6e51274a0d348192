//! Postgres-backed event store (sqlx).
//!
//! One `jobflow_events` table holds every event; a BIGSERIAL `sequence`
//! column captures insertion order and breaks timestamp ties. The secondary
//! access patterns (by entity, by event type) are plain indexes over the
//! same rows, so they cannot diverge from the append order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::{JobflowError, Result};
use crate::events::{EntityType, Event, EventContext, EventPayload, EventType};

use super::{EventCursor, EventPage, EventStore, PagedEvent};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS jobflow_events (
    sequence    BIGSERIAL PRIMARY KEY,
    event_id    UUID NOT NULL UNIQUE,
    tenant_id   TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id   TEXT NOT NULL,
    event_type  TEXT NOT NULL,
    occurred_at TIMESTAMPTZ NOT NULL,
    context     JSONB NOT NULL,
    properties  JSONB NOT NULL,
    received_at TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

const CREATE_ENTITY_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS jobflow_events_by_entity
    ON jobflow_events (tenant_id, entity_type, entity_id, occurred_at, sequence)
"#;

const CREATE_TYPE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS jobflow_events_by_type
    ON jobflow_events (tenant_id, event_type, occurred_at DESC, sequence DESC)
"#;

const CREATE_ENTITY_TYPE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS jobflow_events_by_entity_and_type
    ON jobflow_events (tenant_id, entity_type, entity_id, event_type, occurred_at DESC, sequence DESC)
"#;

#[derive(sqlx::FromRow)]
struct EventRow {
    sequence: i64,
    event_id: Uuid,
    tenant_id: String,
    entity_type: String,
    entity_id: String,
    event_type: String,
    occurred_at: DateTime<Utc>,
    context: serde_json::Value,
    properties: serde_json::Value,
}

impl EventRow {
    fn into_event(self) -> Result<Event> {
        let entity_type: EntityType = self
            .entity_type
            .parse()
            .map_err(JobflowError::EventStoreError)?;

        // Rebuild the adjacently-tagged payload from the split columns.
        let payload: EventPayload = serde_json::from_value(serde_json::json!({
            "eventType": self.event_type,
            "properties": self.properties,
        }))
        .map_err(|e| {
            JobflowError::EventStoreError(format!(
                "corrupt payload for event {}: {e}",
                self.event_id
            ))
        })?;

        let context: EventContext = serde_json::from_value(self.context).map_err(|e| {
            JobflowError::EventStoreError(format!(
                "corrupt context for event {}: {e}",
                self.event_id
            ))
        })?;

        Ok(Event {
            event_id: self.event_id,
            tenant_id: self.tenant_id,
            entity_type,
            entity_id: self.entity_id,
            timestamp: self.occurred_at,
            context,
            payload,
        })
    }
}

/// Tenant-scoped event store over a shared connection pool.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
    tenant_id: String,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool, tenant_id: impl Into<String>) -> Self {
        Self {
            pool,
            tenant_id: tenant_id.into(),
        }
    }

    /// Create the events table and its indexes if they do not exist.
    pub async fn migrate(&self) -> Result<()> {
        for statement in [
            CREATE_TABLE,
            CREATE_ENTITY_INDEX,
            CREATE_TYPE_INDEX,
            CREATE_ENTITY_TYPE_INDEX,
        ] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    JobflowError::EventStoreError(format!("migration failed: {e}"))
                })?;
        }
        debug!("Event store schema ready");
        Ok(())
    }

    fn store_error(operation: &str, e: sqlx::Error) -> JobflowError {
        error!(operation = operation, error = %e, "Event store query failed");
        JobflowError::EventStoreError(format!("{operation} failed: {e}"))
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn append(&self, event: Event) -> Result<()> {
        let properties = serde_json::to_value(&event.payload)
            .map_err(|e| JobflowError::EventStoreError(format!("serialize payload: {e}")))?;
        // Adjacent tagging wraps the fields; store only the inner object.
        let properties = properties
            .get("properties")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let context = serde_json::to_value(&event.context)
            .map_err(|e| JobflowError::EventStoreError(format!("serialize context: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO jobflow_events
                (event_id, tenant_id, entity_type, entity_id, event_type, occurred_at, context, properties)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(event.event_id)
        .bind(&self.tenant_id)
        .bind(event.entity_type.to_string())
        .bind(&event.entity_id)
        .bind(event.event_type().as_str())
        .bind(event.timestamp)
        .bind(context)
        .bind(properties)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::store_error("append", e))?;

        Ok(())
    }

    async fn events_for_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Vec<Event>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT sequence, event_id, tenant_id, entity_type, entity_id,
                   event_type, occurred_at, context, properties
            FROM jobflow_events
            WHERE tenant_id = $1 AND entity_type = $2 AND entity_id = $3
            ORDER BY occurred_at ASC, sequence ASC
            "#,
        )
        .bind(&self.tenant_id)
        .bind(entity_type.to_string())
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Self::store_error("events_for_entity", e))?;

        rows.into_iter().map(EventRow::into_event).collect()
    }

    async fn latest_event_for_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<Event>> {
        let row: Option<EventRow> = sqlx::query_as(
            r#"
            SELECT sequence, event_id, tenant_id, entity_type, entity_id,
                   event_type, occurred_at, context, properties
            FROM jobflow_events
            WHERE tenant_id = $1 AND entity_type = $2 AND entity_id = $3
            ORDER BY occurred_at DESC, sequence DESC
            LIMIT 1
            "#,
        )
        .bind(&self.tenant_id)
        .bind(entity_type.to_string())
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Self::store_error("latest_event_for_entity", e))?;

        row.map(EventRow::into_event).transpose()
    }

    async fn latest_event_of_type_for_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        event_type: EventType,
    ) -> Result<Option<Event>> {
        let row: Option<EventRow> = sqlx::query_as(
            r#"
            SELECT sequence, event_id, tenant_id, entity_type, entity_id,
                   event_type, occurred_at, context, properties
            FROM jobflow_events
            WHERE tenant_id = $1 AND entity_type = $2 AND entity_id = $3 AND event_type = $4
            ORDER BY occurred_at DESC, sequence DESC
            LIMIT 1
            "#,
        )
        .bind(&self.tenant_id)
        .bind(entity_type.to_string())
        .bind(entity_id)
        .bind(event_type.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Self::store_error("latest_event_of_type_for_entity", e))?;

        row.map(EventRow::into_event).transpose()
    }

    async fn events_of_type(
        &self,
        event_type: EventType,
        limit: usize,
        before: Option<EventCursor>,
    ) -> Result<EventPage> {
        // Fetch one extra row to learn whether another page exists.
        let fetch = (limit + 1) as i64;

        let rows: Vec<EventRow> = match before {
            Some(cursor) => {
                sqlx::query_as(
                    r#"
                    SELECT sequence, event_id, tenant_id, entity_type, entity_id,
                           event_type, occurred_at, context, properties
                    FROM jobflow_events
                    WHERE tenant_id = $1 AND event_type = $2
                      AND (occurred_at, sequence) < ($3, $4)
                    ORDER BY occurred_at DESC, sequence DESC
                    LIMIT $5
                    "#,
                )
                .bind(&self.tenant_id)
                .bind(event_type.as_str())
                .bind(cursor.timestamp)
                .bind(cursor.sequence)
                .bind(fetch)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as(
                    r#"
                    SELECT sequence, event_id, tenant_id, entity_type, entity_id,
                           event_type, occurred_at, context, properties
                    FROM jobflow_events
                    WHERE tenant_id = $1 AND event_type = $2
                    ORDER BY occurred_at DESC, sequence DESC
                    LIMIT $3
                    "#,
                )
                .bind(&self.tenant_id)
                .bind(event_type.as_str())
                .bind(fetch)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| Self::store_error("events_of_type", e))?;

        let has_more = rows.len() > limit;
        let rows: Vec<EventRow> = rows.into_iter().take(limit).collect();
        let next = if has_more {
            rows.last().map(|r| EventCursor {
                timestamp: r.occurred_at,
                sequence: r.sequence,
            })
        } else {
            None
        };

        let events = rows
            .into_iter()
            .map(|row| {
                let cursor = EventCursor {
                    timestamp: row.occurred_at,
                    sequence: row.sequence,
                };
                Ok(PagedEvent {
                    cursor,
                    event: row.into_event()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(EventPage { events, next })
    }
}
