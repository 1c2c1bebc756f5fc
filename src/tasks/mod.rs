// dbvault/src/tasks/mod.rs
pub mod error_callback;
pub mod manager;
pub mod orchestrator;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;

pub use error_callback::ErrorCallback;
pub use manager::TasksManager;
pub use orchestrator::{TaskOrchestrator, WorkflowHandle};
pub use registry::{HandleRegistry, TaskHandle};
