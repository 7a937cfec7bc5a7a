//! PostgreSQL infrastructure.

mod pool;

pub use pool::{PostgresPool, PostgresPoolError};
