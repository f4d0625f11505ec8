//! In-memory backends.

pub mod bus;
pub mod quota;
pub mod store;

pub use bus::MemoryMessageBus;
pub use quota::MemoryQuotaCounter;
pub use store::MemoryStore;
