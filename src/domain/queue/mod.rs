//! Durable priority queue for delivery jobs.

mod backend;
mod memory_backend;
mod redis_backend;

pub use backend::{
    DeliveryJob, EnqueueOptions, FailedJob, JobOutcome, JobQueue, QueueCounts, QueueError,
};
pub use memory_backend::MemoryQueue;
pub use redis_backend::RedisQueue;
