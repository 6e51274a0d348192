pub mod health;
pub mod jobs;
pub mod task_definitions;
