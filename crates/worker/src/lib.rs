//! The courier worker process: queues, pipelines and housekeeping wired over
//! Redis and Postgres.

pub mod config;
pub mod shutdown;

pub use config::{ConfigError, WorkerConfig};
