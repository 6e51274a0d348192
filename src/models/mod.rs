//! Domain model types shared across the orchestration engine.

pub mod task;
pub mod template;

pub use task::TaskDefinition;
pub use template::TaskTemplate;
