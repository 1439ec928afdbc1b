mod broker;
mod manager;
mod partition;

pub use manager::OffsetManager;
pub use partition::{ErrorStream, PartitionOffsetManager};
