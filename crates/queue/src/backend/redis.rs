//! Redis-backed queue backend (feature `redis`).
//!
//! Layout per queue, under `{prefix}:{queue}`:
//! - `:jobs` hash of job id to JSON [`JobRecord`]
//! - `:waiting`, `:delayed`, `:active`, `:completed`, `:failed` sorted sets of job ids
//! - `:paused` flag key
//! - `:repeat` hash of repeat key to JSON [`RepeatableJob`]
//!
//! State transitions are computed in Rust on a freshly read record and then
//! written with a compare-and-set script that only applies if the stored JSON is
//! still the one that was read. A lost race is retried from a fresh read, so two
//! workers can never both move the same job out of a state.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde_json::Value as JsonValue;
use tracing::instrument;

use courier_core::{Clock, SystemClock};

use super::{BackendError, QueueBackend};
use crate::types::{
    ClaimedJob, FailOutcome, JobCounts, JobId, JobLock, JobOptions, JobRecord, JobState, LockToken,
    RepeatSpec, RepeatableJob, StalledOutcome, StalledReport,
};

const MAX_CAS_RETRIES: usize = 16;
const SCAN_BATCH: isize = 200;

const TRANSITION_LUA: &str = r#"
local cur = redis.call('HGET', KEYS[1], ARGV[1]) or ''
if cur ~= ARGV[2] then return 0 end
redis.call('ZREM', KEYS[2], ARGV[1])
if ARGV[3] == '' then
  redis.call('HDEL', KEYS[1], ARGV[1])
else
  redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
  redis.call('ZADD', KEYS[3], ARGV[4], ARGV[1])
end
return 1
"#;

const PURGE_LUA: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, id in ipairs(ids) do
  redis.call('ZREM', KEYS[2], id)
  redis.call('HDEL', KEYS[1], id)
end
return #ids
"#;

const REPEAT_CAS_LUA: &str = r#"
local cur = redis.call('HGET', KEYS[1], ARGV[1]) or ''
if cur ~= ARGV[2] then return 0 end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
return 1
"#;

impl From<redis::RedisError> for BackendError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
            BackendError::Unavailable(e.to_string())
        } else {
            BackendError::Command(e.to_string())
        }
    }
}

struct Keys {
    base: String,
}

impl Keys {
    fn new(prefix: &str, queue: &str) -> Self {
        Self {
            base: format!("{prefix}:{queue}"),
        }
    }

    fn jobs(&self) -> String {
        format!("{}:jobs", self.base)
    }

    fn state(&self, state: JobState) -> String {
        format!("{}:{}", self.base, state.as_str())
    }

    fn paused(&self) -> String {
        format!("{}:paused", self.base)
    }

    fn repeat(&self) -> String {
        format!("{}:repeat", self.base)
    }
}

/// Sorted-set score of a record in its current state index.
fn score(job: &JobRecord) -> i64 {
    let at = match job.state {
        JobState::Waiting | JobState::Delayed => Some(job.run_at),
        JobState::Active => job.processed_on,
        JobState::Completed | JobState::Failed => job.finished_on,
    };
    at.unwrap_or(job.created_at).timestamp_millis()
}

/// Inclusive `ZRANGE` window for the next page of a listing, given how many
/// ids were scanned and how many records were kept so far.
fn page_bounds(scanned: usize, kept: usize, limit: usize) -> Option<(isize, isize)> {
    let wanted = limit.saturating_sub(kept);
    if wanted == 0 {
        return None;
    }
    let start = isize::try_from(scanned).ok()?;
    let len = isize::try_from(wanted).unwrap_or(SCAN_BATCH).min(SCAN_BATCH);
    Some((start, start + len - 1))
}

/// A record together with the exact JSON it was read from.
struct Loaded {
    raw: String,
    job: JobRecord,
}

/// Redis queue backend over a shared [`ConnectionManager`].
pub struct RedisBackend {
    conn: ConnectionManager,
    prefix: String,
    clock: Arc<dyn Clock>,
    transition: redis::Script,
    purge: redis::Script,
    repeat_cas: redis::Script,
    closed: AtomicBool,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend").field("prefix", &self.prefix).finish()
    }
}

impl RedisBackend {
    /// Open a managed connection to `redis_url`. Keys are namespaced by `prefix`.
    pub async fn connect(redis_url: &str, prefix: impl Into<String>) -> Result<Self, BackendError> {
        let client = redis::Client::open(redis_url).map_err(|e| BackendError::Unavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::from_connection(conn, prefix, Arc::new(SystemClock)))
    }

    pub fn from_connection(conn: ConnectionManager, prefix: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            clock,
            transition: redis::Script::new(TRANSITION_LUA),
            purge: redis::Script::new(PURGE_LUA),
            repeat_cas: redis::Script::new(REPEAT_CAS_LUA),
            closed: AtomicBool::new(false),
        }
    }

    fn conn(&self) -> Result<ConnectionManager, BackendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BackendError::Closed);
        }
        Ok(self.conn.clone())
    }

    fn keys(&self, queue: &str) -> Keys {
        Keys::new(&self.prefix, queue)
    }

    async fn load(&self, keys: &Keys, id: &JobId) -> Result<Option<Loaded>, BackendError> {
        let mut conn = self.conn()?;
        let raw: Option<String> = conn.hget(keys.jobs(), id.as_str()).await?;
        match raw {
            Some(raw) => {
                let job = serde_json::from_str(&raw)?;
                Ok(Some(Loaded { raw, job }))
            }
            None => Ok(None),
        }
    }

    /// Compare-and-set a record. `before` is what was read (None for a new
    /// record), `after` the new value (None deletes). Returns false on a lost race.
    async fn swap(
        &self,
        keys: &Keys,
        id: &JobId,
        before: Option<&Loaded>,
        after: Option<&JobRecord>,
    ) -> Result<bool, BackendError> {
        let mut conn = self.conn()?;
        let expected = before.map(|l| l.raw.as_str()).unwrap_or("");
        let (json, new_index, new_score) = match after {
            Some(job) => (serde_json::to_string(job)?, keys.state(job.state), score(job)),
            None => (String::new(), keys.state(JobState::Waiting), 0),
        };
        let old_index = match before {
            Some(l) => keys.state(l.job.state),
            None => new_index.clone(),
        };

        let applied: i64 = self
            .transition
            .key(keys.jobs())
            .key(old_index)
            .key(new_index)
            .arg(id.as_str())
            .arg(expected)
            .arg(json)
            .arg(new_score)
            .invoke_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    /// Read-modify-write loop for a single record.
    ///
    /// `f` sees the current record and returns `None` to leave it alone, or the
    /// new value plus a result.
    async fn update<T>(
        &self,
        keys: &Keys,
        id: &JobId,
        mut f: impl FnMut(&mut JobRecord) -> Result<Option<T>, BackendError> + Send,
    ) -> Result<Option<T>, BackendError>
    where
        T: Send,
    {
        for _ in 0..MAX_CAS_RETRIES {
            let Some(loaded) = self.load(keys, id).await? else {
                return Ok(None);
            };
            let mut job = loaded.job.clone();
            let Some(out) = f(&mut job)? else {
                return Ok(None);
            };
            if self.swap(keys, id, Some(&loaded), Some(&job)).await? {
                return Ok(Some(out));
            }
        }
        Err(BackendError::Command(format!("too much contention on job {id}")))
    }

    async fn settle<T: Send>(
        &self,
        queue: &str,
        id: &JobId,
        token: LockToken,
        mut f: impl FnMut(&mut JobRecord, DateTime<Utc>) -> T + Send,
    ) -> Result<T, BackendError> {
        let keys = self.keys(queue);
        let now = self.clock.now();
        let mut mismatch = false;
        let out = self
            .update(&keys, id, |job| {
                if !job.holds_lease(token) {
                    mismatch = true;
                    return Ok(None);
                }
                Ok(Some(f(job, now)))
            })
            .await?;

        match out {
            Some(out) => {
                self.trim(&keys, id).await?;
                Ok(out)
            }
            None if mismatch => Err(BackendError::LockMismatch(id.clone())),
            None => Err(BackendError::NotFound(id.clone())),
        }
    }

    /// Enforce the finished-job retention of the job just settled.
    async fn trim(&self, keys: &Keys, id: &JobId) -> Result<(), BackendError> {
        let Some(loaded) = self.load(keys, id).await? else {
            return Ok(());
        };
        let keep = match loaded.job.state {
            JobState::Completed => loaded.job.opts.keep_completed,
            JobState::Failed => loaded.job.opts.keep_failed,
            _ => return Ok(()),
        };
        let index = keys.state(loaded.job.state);
        let mut conn = self.conn()?;
        let size: usize = conn.zcard(&index).await?;
        if size > keep {
            let _: i64 = self
                .purge
                .key(keys.jobs())
                .key(index)
                .arg("+inf")
                .arg(size - keep)
                .invoke_async(&mut conn)
                .await?;
        }
        Ok(())
    }

    async fn promote_delayed(&self, keys: &Keys, now: DateTime<Utc>) -> Result<(), BackendError> {
        let mut conn = self.conn()?;
        let due: Vec<String> = conn
            .zrangebyscore_limit(keys.state(JobState::Delayed), "-inf", now.timestamp_millis(), 0, SCAN_BATCH)
            .await?;
        for id in due {
            let id = JobId::custom(id);
            self.update(keys, &id, |job| {
                if job.state != JobState::Delayed || !job.is_ready(now) {
                    return Ok(None);
                }
                job.state = JobState::Waiting;
                Ok(Some(()))
            })
            .await?;
        }
        Ok(())
    }

    async fn materialise_repeatables(&self, queue: &str, keys: &Keys, now: DateTime<Utc>) -> Result<(), BackendError> {
        let mut conn = self.conn()?;
        let all: HashMap<String, String> = conn.hgetall(keys.repeat()).await?;
        for (key, raw) in all {
            let mut rep: RepeatableJob = serde_json::from_str(&raw)?;
            if rep.next_run > now {
                continue;
            }
            let occurrence = rep.occurrence_id();
            let name = rep.name.clone();
            let data = rep.data.clone();
            let mut opts = rep.opts.clone();
            rep.advance(now);

            let applied: i64 = self
                .repeat_cas
                .key(keys.repeat())
                .arg(&key)
                .arg(&raw)
                .arg(serde_json::to_string(&rep)?)
                .invoke_async(&mut conn)
                .await?;
            if applied == 0 {
                // Another claimer materialised this tick.
                continue;
            }

            opts.job_id = Some(occurrence);
            opts.delay = Duration::ZERO;
            let mut job = JobRecord::new(queue, &name, data, opts, now);
            job.repeat_key = Some(key);
            self.insert_deduplicated(keys, job).await?;
        }
        Ok(())
    }

    async fn insert_deduplicated(&self, keys: &Keys, job: JobRecord) -> Result<JobId, BackendError> {
        let id = job.id.clone();
        for _ in 0..MAX_CAS_RETRIES {
            let existing = self.load(keys, &id).await?;
            if let Some(existing) = &existing {
                if !existing.job.state.is_finished() {
                    return Ok(id);
                }
            }
            if self.swap(keys, &id, existing.as_ref(), Some(&job)).await? {
                return Ok(id);
            }
        }
        Err(BackendError::Command(format!("too much contention on job {id}")))
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    async fn ping(&self) -> Result<(), BackendError> {
        let mut conn = self.conn()?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    #[instrument(skip(self, data, opts), fields(queue = %queue, name = %name))]
    async fn add(
        &self,
        queue: &str,
        name: &str,
        data: JsonValue,
        opts: JobOptions,
    ) -> Result<JobId, BackendError> {
        let job = JobRecord::new(queue, name, data, opts, self.clock.now());
        self.insert_deduplicated(&self.keys(queue), job).await
    }

    async fn claim(&self, queue: &str, lock_for: Duration) -> Result<Option<ClaimedJob>, BackendError> {
        let keys = self.keys(queue);
        let now = self.clock.now();
        self.promote_delayed(&keys, now).await?;

        let mut conn = self.conn()?;
        let paused: bool = conn.exists(keys.paused()).await?;
        if paused {
            return Ok(None);
        }
        self.materialise_repeatables(queue, &keys, now).await?;

        for _ in 0..MAX_CAS_RETRIES {
            let head: Vec<String> = conn.zrange(keys.state(JobState::Waiting), 0, 0).await?;
            let Some(id) = head.into_iter().next() else {
                return Ok(None);
            };
            let id = JobId::custom(id);
            let Some(loaded) = self.load(&keys, &id).await? else {
                let _: i64 = conn.zrem(keys.state(JobState::Waiting), id.as_str()).await?;
                continue;
            };
            if loaded.job.state != JobState::Waiting {
                let _: i64 = conn.zrem(keys.state(JobState::Waiting), id.as_str()).await?;
                continue;
            }

            let mut job = loaded.job.clone();
            let token = job.mark_active(now, lock_for);
            if self.swap(&keys, &id, Some(&loaded), Some(&job)).await? {
                return Ok(Some(ClaimedJob { job, token }));
            }
        }
        Ok(None)
    }

    async fn extend_lock(
        &self,
        queue: &str,
        id: &JobId,
        token: LockToken,
        lock_for: Duration,
    ) -> Result<bool, BackendError> {
        let now = self.clock.now();
        let extended = self
            .update(&self.keys(queue), id, |job| {
                if !job.holds_lease(token) {
                    return Ok(None);
                }
                job.lock = Some(JobLock {
                    token,
                    expires_at: now + chrono::Duration::from_std(lock_for).unwrap_or_default(),
                });
                Ok(Some(()))
            })
            .await?;
        Ok(extended.is_some())
    }

    async fn complete(&self, queue: &str, id: &JobId, token: LockToken) -> Result<(), BackendError> {
        self.settle(queue, id, token, |job, now| job.mark_completed(now)).await
    }

    async fn fail(
        &self,
        queue: &str,
        id: &JobId,
        token: LockToken,
        reason: &str,
        retry: bool,
    ) -> Result<FailOutcome, BackendError> {
        self.settle(queue, id, token, |job, now| job.mark_failed(reason.to_string(), retry, now))
            .await
    }

    async fn defer(
        &self,
        queue: &str,
        id: &JobId,
        token: LockToken,
        delay: Duration,
    ) -> Result<(), BackendError> {
        self.settle(queue, id, token, |job, now| job.mark_deferred(delay, now)).await
    }

    async fn get(&self, queue: &str, id: &JobId) -> Result<Option<JobRecord>, BackendError> {
        Ok(self.load(&self.keys(queue), id).await?.map(|l| l.job))
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts, BackendError> {
        let keys = self.keys(queue);
        let mut conn = self.conn()?;
        Ok(JobCounts {
            waiting: conn.zcard(keys.state(JobState::Waiting)).await?,
            delayed: conn.zcard(keys.state(JobState::Delayed)).await?,
            active: conn.zcard(keys.state(JobState::Active)).await?,
            completed: conn.zcard(keys.state(JobState::Completed)).await?,
            failed: conn.zcard(keys.state(JobState::Failed)).await?,
            paused: conn.exists(keys.paused()).await?,
        })
    }

    async fn list(
        &self,
        queue: &str,
        states: &[JobState],
        limit: usize,
    ) -> Result<Vec<JobRecord>, BackendError> {
        let keys = self.keys(queue);
        let mut conn = self.conn()?;
        let mut result = Vec::new();
        // At most `limit` records are decoded per state.
        for state in states {
            let index = keys.state(*state);
            let mut offset = 0;
            let mut taken = 0;
            while let Some((start, stop)) = page_bounds(offset, taken, limit) {
                let ids: Vec<String> = conn.zrange(&index, start, stop).await?;
                if ids.is_empty() {
                    break;
                }
                let full_page = ids.len() as isize == stop - start + 1;
                offset += ids.len();
                let raws: Vec<Option<String>> = redis::cmd("HMGET")
                    .arg(keys.jobs())
                    .arg(&ids)
                    .query_async(&mut conn)
                    .await?;
                for raw in raws.into_iter().flatten() {
                    result.push(serde_json::from_str::<JobRecord>(&raw)?);
                    taken += 1;
                }
                if !full_page {
                    break;
                }
            }
        }
        result.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        result.truncate(limit);
        Ok(result)
    }

    async fn remove(&self, queue: &str, id: &JobId) -> Result<bool, BackendError> {
        let keys = self.keys(queue);
        for _ in 0..MAX_CAS_RETRIES {
            let Some(loaded) = self.load(&keys, id).await? else {
                return Ok(false);
            };
            if self.swap(&keys, id, Some(&loaded), None).await? {
                return Ok(true);
            }
        }
        Err(BackendError::Command(format!("too much contention on job {id}")))
    }

    async fn move_to_waiting(&self, queue: &str, id: &JobId) -> Result<bool, BackendError> {
        let now = self.clock.now();
        let moved = self
            .update(&self.keys(queue), id, |job| {
                if !matches!(job.state, JobState::Active | JobState::Delayed) {
                    return Ok(None);
                }
                job.state = JobState::Waiting;
                job.run_at = now;
                job.lock = None;
                Ok(Some(()))
            })
            .await?;
        Ok(moved.is_some())
    }

    async fn change_delay(&self, queue: &str, id: &JobId, delay: Duration) -> Result<bool, BackendError> {
        let now = self.clock.now();
        let changed = self
            .update(&self.keys(queue), id, |job| {
                if !matches!(job.state, JobState::Waiting | JobState::Delayed) {
                    return Ok(None);
                }
                job.mark_deferred(delay, now);
                Ok(Some(()))
            })
            .await?;
        Ok(changed.is_some())
    }

    async fn clean(
        &self,
        queue: &str,
        state: JobState,
        grace: Duration,
        limit: usize,
    ) -> Result<usize, BackendError> {
        if !state.is_finished() {
            return Err(BackendError::Command(format!(
                "clean only supports finished states, got {}",
                state.as_str()
            )));
        }
        let keys = self.keys(queue);
        let cutoff = self.clock.now() - chrono::Duration::from_std(grace).unwrap_or_default();
        let mut conn = self.conn()?;
        let removed: usize = self
            .purge
            .key(keys.jobs())
            .key(keys.state(state))
            .arg(cutoff.timestamp_millis())
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn recover_stalled(&self, queue: &str, max_stalled: u32) -> Result<StalledReport, BackendError> {
        let keys = self.keys(queue);
        let now = self.clock.now();
        let mut conn = self.conn()?;
        let active: Vec<String> = conn.zrange(keys.state(JobState::Active), 0, -1).await?;

        let mut report = StalledReport::default();
        for id in active {
            let id = JobId::custom(id);
            let outcome = self
                .update(&keys, &id, |job| {
                    let lapsed = job.state == JobState::Active && job.lock.is_none_or(|l| l.expires_at <= now);
                    if !lapsed {
                        return Ok(None);
                    }
                    Ok(Some(job.mark_stalled(max_stalled, now)))
                })
                .await?;
            match outcome {
                Some(StalledOutcome::Requeued) => report.requeued.push(id),
                Some(StalledOutcome::Failed) => {
                    self.trim(&keys, &id).await?;
                    report.failed.push(id);
                }
                None => {}
            }
        }
        Ok(report)
    }

    async fn pause(&self, queue: &str) -> Result<(), BackendError> {
        let mut conn = self.conn()?;
        let _: () = conn.set(self.keys(queue).paused(), 1).await?;
        Ok(())
    }

    async fn resume(&self, queue: &str) -> Result<(), BackendError> {
        let mut conn = self.conn()?;
        let _: i64 = conn.del(self.keys(queue).paused()).await?;
        Ok(())
    }

    async fn add_repeatable(&self, queue: &str, spec: RepeatSpec) -> Result<String, BackendError> {
        let rep = RepeatableJob::from_spec(spec, self.clock.now());
        let mut conn = self.conn()?;
        let _: i64 = conn
            .hset(self.keys(queue).repeat(), &rep.key, serde_json::to_string(&rep)?)
            .await?;
        Ok(rep.key)
    }

    async fn repeatables(&self, queue: &str) -> Result<Vec<RepeatableJob>, BackendError> {
        let mut conn = self.conn()?;
        let all: HashMap<String, String> = conn.hgetall(self.keys(queue).repeat()).await?;
        let mut reps = all
            .into_iter()
            .map(|(_, raw)| serde_json::from_str::<RepeatableJob>(&raw))
            .collect::<Result<Vec<_>, _>>()?;
        reps.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(reps)
    }

    async fn remove_repeatable(&self, queue: &str, key: &str) -> Result<bool, BackendError> {
        let mut conn = self.conn()?;
        let removed: i64 = conn.hdel(self.keys(queue).repeat(), key).await?;
        Ok(removed > 0)
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_per_queue() {
        let keys = Keys::new("courier", "campaign");
        assert_eq!(keys.jobs(), "courier:campaign:jobs");
        assert_eq!(keys.state(JobState::Delayed), "courier:campaign:delayed");
        assert_eq!(keys.paused(), "courier:campaign:paused");
        assert_eq!(keys.repeat(), "courier:campaign:repeat");
    }

    #[test]
    fn score_follows_state() {
        let now = Utc::now();
        let mut job = JobRecord::new("q", "T", serde_json::json!({}), JobOptions::default(), now);
        assert_eq!(score(&job), now.timestamp_millis());

        let later = now + chrono::Duration::seconds(5);
        job.mark_active(later, Duration::from_secs(30));
        assert_eq!(score(&job), later.timestamp_millis());
    }

    #[test]
    fn listing_pages_stop_at_the_limit() {
        assert_eq!(page_bounds(0, 0, 0), None);
        assert_eq!(page_bounds(0, 0, 10), Some((0, 9)));
        assert_eq!(page_bounds(0, 0, 100_000), Some((0, SCAN_BATCH - 1)));
        assert_eq!(page_bounds(200, 200, 100_000), Some((200, 399)));
        // Vanished ids advance the offset without counting toward the limit.
        assert_eq!(page_bounds(12, 9, 10), Some((12, 12)));
        assert_eq!(page_bounds(15, 10, 10), None);
    }

    #[test]
    fn connection_errors_map_to_unavailable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: BackendError = redis::RedisError::from(io).into();
        assert!(err.is_connection_error());
    }
}
