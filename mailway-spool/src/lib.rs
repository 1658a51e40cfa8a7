//! Durable envelope storage behind the queue: the [`QueueStorage`]
//! capability the scheduler consumes, plus the in-memory reference
//! backend.

pub mod error;
pub mod memory;
pub mod store;

pub use error::{SpoolError, SpoolResult};
pub use memory::MemoryStorage;
pub use store::QueueStorage;
