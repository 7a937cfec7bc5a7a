//! Redis connection management for the durable queue broker.
//!
//! A single multiplexed connection is shared by all workers; the redis crate
//! multiplexes pipelined commands over it. Reconnection is lazy: a failed
//! command drops the cached connection and the next caller re-establishes it.

use redis::aio::MultiplexedConnection;
use redis::Client;
use tokio::sync::RwLock;

use crate::config::RedisConfig;

/// Error type for broker connection operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerPoolError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Connection not available: {0}")]
    ConnectionUnavailable(String),
}

/// Shared Redis connection for queue commands.
pub struct RedisPool {
    client: Client,

    /// Cached multiplexed connection, shared across tasks
    connection: RwLock<Option<MultiplexedConnection>>,
}

impl RedisPool {
    pub fn new(config: &RedisConfig) -> Result<Self, BrokerPoolError> {
        let client = Client::open(config.url())?;

        Ok(Self {
            client,
            connection: RwLock::new(None),
        })
    }

    /// Get the shared connection, establishing it on first use.
    pub async fn get_connection(&self) -> Result<MultiplexedConnection, BrokerPoolError> {
        {
            let conn = self.connection.read().await;
            if let Some(ref c) = *conn {
                return Ok(c.clone());
            }
        }

        self.connect().await
    }

    async fn connect(&self) -> Result<MultiplexedConnection, BrokerPoolError> {
        let mut guard = self.connection.write().await;

        // Another task may have connected while we waited for the lock
        if let Some(ref c) = *guard {
            return Ok(c.clone());
        }

        match self.client.get_multiplexed_tokio_connection().await {
            Ok(conn) => {
                *guard = Some(conn.clone());
                tracing::info!("Redis broker connection established");
                Ok(conn)
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to connect to Redis broker");
                Err(BrokerPoolError::Redis(e))
            }
        }
    }

    /// Drop the cached connection so the next caller reconnects.
    pub async fn invalidate(&self) {
        let mut guard = self.connection.write().await;
        *guard = None;
    }

    /// Broker connectivity probe.
    pub async fn ping(&self) -> Result<(), BrokerPoolError> {
        let mut conn = self.get_connection().await?;
        let result: Result<String, redis::RedisError> =
            redis::cmd("PING").query_async(&mut conn).await;

        match result {
            Ok(reply) if reply == "PONG" => Ok(()),
            Ok(reply) => Err(BrokerPoolError::ConnectionUnavailable(format!(
                "unexpected PING reply: {}",
                reply
            ))),
            Err(e) => {
                // A dead multiplexed connection stays dead; drop it so the
                // next caller reconnects.
                self.invalidate().await;
                Err(BrokerPoolError::Redis(e))
            }
        }
    }

    /// Release the cached connection.
    pub async fn close(&self) {
        let mut guard = self.connection.write().await;
        *guard = None;
        tracing::info!("Redis broker connection closed");
    }
}
