//! Typed jobs and their handlers.
//!
//! Each queue owns a closed set of job kinds, expressed as one enum per queue.
//! The enum is serialised adjacently tagged (`{"name": .., "data": ..}`) so the
//! variant name doubles as the stored job name, and the worker dispatches by
//! decoding back into the enum and matching exhaustively.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};

use crate::types::JobId;

/// A family of jobs bound to one queue.
///
/// Implementors must be enums annotated with
/// `#[serde(tag = "name", content = "data")]`.
pub trait QueueJob: Serialize + DeserializeOwned + Send + Sync + std::fmt::Debug + 'static {
    /// Queue this job family is consumed from.
    const QUEUE: &'static str;

    /// Stored job name (the variant name).
    fn name(&self) -> &'static str;
}

/// Split a typed job into the `(name, data)` pair a backend stores.
pub fn encode<J: QueueJob>(job: &J) -> Result<(String, JsonValue), serde_json::Error> {
    let data = match serde_json::to_value(job)? {
        JsonValue::Object(mut map) => map.remove("data").unwrap_or(JsonValue::Null),
        other => other,
    };
    Ok((job.name().to_string(), data))
}

/// Rebuild a typed job from a stored `(name, data)` pair.
pub fn decode<J: QueueJob>(name: &str, data: &JsonValue) -> Result<J, serde_json::Error> {
    let mut map = Map::new();
    map.insert("name".to_string(), JsonValue::String(name.to_string()));
    if !data.is_null() {
        map.insert("data".to_string(), data.clone());
    }
    serde_json::from_value(JsonValue::Object(map))
}

/// Metadata about the job being handled.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub id: JobId,
    pub queue: String,
    pub name: String,
    /// Failed attempts before this run.
    pub attempts_made: u32,
    pub max_attempts: u32,
}

/// Handler outcome other than success.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Retry according to the job's attempts/backoff.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),

    /// Fail without further attempts.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// Put the job back into the delayed set without consuming an attempt.
    #[error("deferred for {0:?}")]
    Deferred(Duration),
}

impl JobError {
    pub fn retry(err: impl Into<anyhow::Error>) -> Self {
        Self::Failed(err.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }
}

/// Executes one job family.
#[async_trait]
pub trait JobHandler<J: QueueJob>: Send + Sync + 'static {
    async fn handle(&self, job: J, ctx: JobContext) -> Result<(), JobError>;
}
