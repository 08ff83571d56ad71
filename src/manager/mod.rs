pub mod classifier;
pub mod registry;
pub mod store;
pub mod task_manager;
