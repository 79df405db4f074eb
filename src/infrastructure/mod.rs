// Infrastructure module - background task, timing and callback utilities
pub mod backoff;
pub(crate) mod callback;
pub mod task_manager;

pub use backoff::Backoff;
pub(crate) use callback::invoke_guarded;
pub use task_manager::TaskManager;
