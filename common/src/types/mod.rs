pub mod instance;
pub mod plan;
pub mod session;
pub mod subscriber;
pub mod usage;
