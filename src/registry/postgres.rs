//! Postgres template store (sqlx), tenant-scoped like the event store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::{JobflowError, Result};
use crate::models::TaskTemplate;

use super::TemplateStore;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS jobflow_task_templates (
    tenant_id       TEXT NOT NULL,
    name            TEXT NOT NULL,
    description     TEXT NOT NULL,
    tag             TEXT NOT NULL,
    requires_review BOOLEAN NOT NULL DEFAULT FALSE,
    repo            TEXT,
    created_at      TIMESTAMPTZ NOT NULL,
    updated_at      TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (tenant_id, name)
)
"#;

#[derive(sqlx::FromRow)]
struct TemplateRow {
    name: String,
    description: String,
    tag: String,
    requires_review: bool,
    repo: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<TemplateRow> for TaskTemplate {
    fn from(row: TemplateRow) -> Self {
        Self {
            name: row.name,
            description: row.description,
            tag: row.tag,
            requires_review: row.requires_review,
            repo: row.repo,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PostgresTemplateStore {
    pool: PgPool,
    tenant_id: String,
}

impl PostgresTemplateStore {
    pub fn new(pool: PgPool, tenant_id: impl Into<String>) -> Self {
        Self {
            pool,
            tenant_id: tenant_id.into(),
        }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(CREATE_TABLE)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                JobflowError::ConfigurationError(format!("template migration failed: {e}"))
            })?;
        Ok(())
    }
}

#[async_trait]
impl TemplateStore for PostgresTemplateStore {
    async fn upsert(&self, template: TaskTemplate) -> Result<TaskTemplate> {
        let row: TemplateRow = sqlx::query_as(
            r#"
            INSERT INTO jobflow_task_templates
                (tenant_id, name, description, tag, requires_review, repo, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            ON CONFLICT (tenant_id, name) DO UPDATE SET
                description     = EXCLUDED.description,
                tag             = EXCLUDED.tag,
                requires_review = EXCLUDED.requires_review,
                repo            = EXCLUDED.repo,
                updated_at      = EXCLUDED.updated_at
            RETURNING name, description, tag, requires_review, repo, created_at, updated_at
            "#,
        )
        .bind(&self.tenant_id)
        .bind(&template.name)
        .bind(&template.description)
        .bind(&template.tag)
        .bind(template.requires_review)
        .bind(&template.repo)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| JobflowError::EventStoreError(format!("template upsert failed: {e}")))?;

        Ok(row.into())
    }

    async fn get(&self, name: &str) -> Result<Option<TaskTemplate>> {
        let row: Option<TemplateRow> = sqlx::query_as(
            r#"
            SELECT name, description, tag, requires_review, repo, created_at, updated_at
            FROM jobflow_task_templates
            WHERE tenant_id = $1 AND name = $2
            "#,
        )
        .bind(&self.tenant_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| JobflowError::EventStoreError(format!("template lookup failed: {e}")))?;

        Ok(row.map(Into::into))
    }

    async fn list(&self) -> Result<Vec<TaskTemplate>> {
        let rows: Vec<TemplateRow> = sqlx::query_as(
            r#"
            SELECT name, description, tag, requires_review, repo, created_at, updated_at
            FROM jobflow_task_templates
            WHERE tenant_id = $1
            ORDER BY name
            "#,
        )
        .bind(&self.tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| JobflowError::EventStoreError(format!("template listing failed: {e}")))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}
