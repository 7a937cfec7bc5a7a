//! PostgreSQL connection pool for the notification store.

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;

use crate::config::DatabaseConfig;

/// Errors that can occur with the PostgreSQL pool.
#[derive(Debug, Error)]
pub enum PostgresPoolError {
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// PostgreSQL connection pool shared by the store and analytics reads.
pub struct PostgresPool {
    pool: PgPool,

    /// Database URL kept for masked logging
    database_url: String,
}

impl PostgresPool {
    pub async fn new(config: &DatabaseConfig) -> Result<Self, PostgresPoolError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .connect(&config.url)
            .await?;

        tracing::info!(
            pool_size = config.pool_size,
            "PostgreSQL connection pool created"
        );

        Ok(Self {
            pool,
            database_url: config.url.clone(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Connectivity probe used at process boot.
    pub async fn ping(&self) -> Result<(), PostgresPoolError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Database URL with the password masked for safe logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(colon_pos) = self.database_url[..at_pos].rfind(':') {
                let prefix = &self.database_url[..colon_pos + 1];
                let suffix = &self.database_url[at_pos..];
                return format!("{}***{}", prefix, suffix);
            }
        }
        self.database_url.clone()
    }

    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("PostgreSQL connection pool closed");
    }
}

impl Clone for PostgresPool {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            database_url: self.database_url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_url_masking_hides_password() {
        fn mask_url(url: &str) -> String {
            if let Some(at_pos) = url.find('@') {
                if let Some(colon_pos) = url[..at_pos].rfind(':') {
                    let prefix = &url[..colon_pos + 1];
                    let suffix = &url[at_pos..];
                    return format!("{}***{}", prefix, suffix);
                }
            }
            url.to_string()
        }

        let masked = mask_url("postgres://courier:hunter2@db:5432/courier");
        assert!(masked.contains("***"));
        assert!(!masked.contains("hunter2"));

        let no_password = "postgres://localhost:5432/courier";
        assert_eq!(mask_url(no_password), no_password);
    }
}
