//! Redis backends.

pub mod client;
pub mod operations;
pub mod quota;
pub mod streams;

pub use client::RedisClient;
pub use operations::RedisStore;
pub use quota::RedisQuotaCounter;
pub use streams::RedisStreamBus;
