//! Redis broker infrastructure.

mod pool;

pub use pool::{BrokerPoolError, RedisPool};
