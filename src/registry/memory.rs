//! In-memory template store for tests and local development.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;
use crate::models::TaskTemplate;

use super::TemplateStore;

#[derive(Debug, Default)]
pub struct InMemoryTemplateStore {
    templates: RwLock<BTreeMap<String, TaskTemplate>>,
}

impl InMemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TemplateStore for InMemoryTemplateStore {
    async fn upsert(&self, mut template: TaskTemplate) -> Result<TaskTemplate> {
        let mut templates = self.templates.write();
        if let Some(existing) = templates.get(&template.name) {
            template.created_at = existing.created_at;
        }
        templates.insert(template.name.clone(), template.clone());
        Ok(template)
    }

    async fn get(&self, name: &str) -> Result<Option<TaskTemplate>> {
        Ok(self.templates.read().get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<TaskTemplate>> {
        Ok(self.templates.read().values().cloned().collect())
    }
}
