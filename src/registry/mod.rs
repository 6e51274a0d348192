//! # Template Registry
//!
//! Reusable task templates, upserted by name through the write API.
//! Templates are configuration rather than history, so they live in their
//! own table instead of the event log.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::TaskTemplate;

pub use memory::InMemoryTemplateStore;
pub use postgres::PostgresTemplateStore;

#[async_trait]
pub trait TemplateStore: Send + Sync {
    /// Insert or update a template by name. `created_at` survives updates;
    /// `updated_at` always moves.
    async fn upsert(&self, template: TaskTemplate) -> Result<TaskTemplate>;

    async fn get(&self, name: &str) -> Result<Option<TaskTemplate>>;

    /// All templates, sorted by name.
    async fn list(&self) -> Result<Vec<TaskTemplate>>;
}
