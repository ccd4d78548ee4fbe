mod dispatch;
mod heap;
mod kv;
mod stats;

pub use dispatch::Worker;
pub use heap::Heap;
pub use kv::KvStore;
pub use stats::{format_stats, GhostCounter, StatsBroadcaster};
