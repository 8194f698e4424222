pub mod notify;
pub mod reconciler;
pub mod registry;
pub mod session;
pub mod task_poller;
pub mod usage;
