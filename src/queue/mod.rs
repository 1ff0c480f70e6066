//! Durable retry queue, independent of cache versioning.

mod store;

pub use store::{next_key, QueueStore};
