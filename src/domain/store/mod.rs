//! Persistent notification store.

mod backend;
mod memory;
mod postgres;

pub use backend::{
    DispatchStats, HourlyBucket, LogWithContext, NotificationStore, StoreError,
};
pub use memory::MemoryStore;
pub use postgres::PostgresStore;
