// Infrastructure layer (shared components)
pub mod infrastructure;
pub use infrastructure::postgres;
pub use infrastructure::redis;

// Domain layer (business logic)
pub mod domain;
pub use domain::analytics;
pub use domain::channel;
pub use domain::dispatch;
pub use domain::notification;
pub use domain::queue;
pub use domain::retry;
pub use domain::store;
pub use domain::template;

// Application layer
pub mod api;
pub mod server;

// Supporting modules
pub mod config;
pub mod error;
pub mod metrics;
pub mod ratelimit;
pub mod tasks;
