use std::{marker::PhantomData, sync::Arc, time::Duration};

use async_trait::async_trait;
use bq_redis_support::RedisPool;
use bq_shutdown::GracefulShutdownConsumer;
use redis::AsyncCommands;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{event, Level};

use crate::delay::DelayTimer;
use crate::dispatch;
use crate::error::{Error, Result};
use crate::events::{EventHub, QueueEvent};
use crate::job::{Codec, Job, JobOpts, JsonCodec};
use crate::keys::KeyNamer;
use crate::lock::{LockRenewer, LOCK_TTL};
use crate::notify::Subscription;
use crate::scripts::Scripts;

/// A job handler. `Output` is serialized to JSON for the `Completed` event;
/// handlers that don't care about a return value use `()`.
#[async_trait]
pub trait Handler<T>: Send + Sync {
    async fn handle(&self, job: &Job<T>) -> anyhow::Result<Option<serde_json::Value>>;
}

/// Controls the dispatch loop started by [`Queue::run`].
#[derive(Clone, Copy, Debug, Default)]
pub struct RunOptions {
    /// When true, one job runs at a time on the dispatch task itself. When
    /// false (the default), every dispatched job is spawned onto its own
    /// task with no concurrency cap.
    pub force_sequential_processing: bool,
}

/// A snapshot of every container's size at once (supplements `count()`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
    pub paused: u64,
}

struct QueueInner<C> {
    pool: RedisPool,
    keys: KeyNamer,
    scripts: Scripts,
    events: EventHub,
    codec: C,
    dispatch_task: std::sync::Mutex<Option<(oneshot::Sender<()>, JoinHandle<()>)>>,
    delay_timer: std::sync::Mutex<Option<DelayTimer>>,
}

/// The queue façade: producers call `add`/`retry`/`remove` and the query
/// methods; consumers call `run` to start processing.
///
/// Generic over the payload type `T` and a [`Codec`] `C` (default
/// [`JsonCodec`]), so a caller can plug in a non-JSON wire format.
pub struct Queue<T, C = JsonCodec> {
    inner: Arc<QueueInner<C>>,
    _payload: PhantomData<fn() -> T>,
}

impl<T, C> Clone for Queue<T, C> {
    fn clone(&self) -> Self {
        Queue {
            inner: self.inner.clone(),
            _payload: PhantomData,
        }
    }
}

impl<T> Queue<T, JsonCodec>
where
    T: Send + Sync + 'static,
{
    pub fn new(pool: RedisPool, name: impl Into<String>) -> Self {
        Queue::with_codec(pool, name, JsonCodec)
    }
}

impl<T, C> Queue<T, C>
where
    T: Send + Sync + 'static,
    C: Codec<T> + Clone + Send + Sync + 'static,
{
    pub fn with_codec(pool: RedisPool, name: impl Into<String>, codec: C) -> Self {
        Queue {
            inner: Arc::new(QueueInner {
                pool,
                keys: KeyNamer::new(name),
                scripts: Scripts::new(),
                events: EventHub::new(),
                codec,
                dispatch_task: std::sync::Mutex::new(None),
                delay_timer: std::sync::Mutex::new(None),
            }),
            _payload: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        self.inner.keys.name()
    }

    pub fn events(&self) -> &EventHub {
        &self.inner.events
    }

    pub(crate) fn emit(&self, event: QueueEvent) {
        self.inner.events.emit(event);
    }

    pub(crate) fn redis_client(&self) -> &redis::Client {
        self.inner.pool.client()
    }

    pub(crate) fn delayed_channel_name(&self) -> String {
        self.inner.keys.delayed_channel()
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.inner.pool.get().await.map_err(Error::from)
    }

    // -- producer-facing API ----------------------------------------------

    pub async fn add(&self, data: &T, opts: Option<JobOpts>) -> Result<u64> {
        let opts = opts.unwrap_or_default();
        let encoded_data = self.inner.codec.encode(data)?;
        let encoded_opts = opts.encode()?;

        let timestamp = opts
            .timestamp_ms()?
            .unwrap_or_else(crate::now_ms);
        let delay = opts.delay_ms()?;
        let lifo = opts.is_lifo();

        let mut conn = self.conn().await?;

        let (id, subscribers): (u64, i64) = self
            .inner
            .scripts
            .add
            .key(self.inner.keys.id())
            .key(self.inner.keys.wait())
            .key(self.inner.keys.delayed())
            .key(self.inner.keys.jobs_channel())
            .key(self.inner.keys.delayed_channel())
            .key(self.inner.keys.paused())
            .key(self.inner.keys.meta_paused())
            .arg(self.inner.keys.job_hash_prefix())
            .arg(encoded_data)
            .arg(encoded_opts)
            .arg(0u32)
            .arg(timestamp)
            .arg(delay.map(|d| d.to_string()).unwrap_or_default())
            .arg(if lifo { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;

        if subscribers < 1 {
            return Err(Error::NoSubscribers);
        }

        event!(Level::DEBUG, queue = self.name(), job_id = id, "Added job");
        Ok(id)
    }

    pub async fn get_job(&self, job_id: u64) -> Result<Option<Job<T>>> {
        self.fetch_job(job_id).await
    }

    pub async fn progress(&self, job_id: u64, value: u32) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("HSET")
            .arg(self.inner.keys.job_hash(job_id))
            .arg("progress")
            .arg(value)
            .query_async(&mut conn)
            .await?;
        self.emit(QueueEvent::Progress {
            job_id,
            progress: value,
        });
        Ok(())
    }

    pub async fn retry(&self, job_id: u64) -> Result<()> {
        let job = self
            .fetch_job(job_id)
            .await?
            .ok_or(Error::NotFound(job_id))?;
        let mut conn = self.conn().await?;

        let subscribers: i64 = self
            .inner
            .scripts
            .retry
            .key(self.inner.keys.failed())
            .key(self.inner.keys.wait())
            .key(self.inner.keys.jobs_channel())
            .arg(job_id)
            .arg(if job.is_lifo() { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;

        if subscribers < 1 {
            return Err(Error::NoSubscribers);
        }

        Ok(())
    }

    /// Retries a failed job back into `delayed` rather than straight onto
    /// `wait`, for callers implementing their own retry backoff.
    pub async fn retry_with_delay(&self, job_id: u64, delay: Duration) -> Result<()> {
        let mut conn = self.conn().await?;
        let run_at = crate::now_ms() + delay.as_millis() as i64;

        redis::pipe()
            .atomic()
            .srem(self.inner.keys.failed(), job_id)
            .zadd(self.inner.keys.delayed(), job_id, run_at)
            .publish(self.inner.keys.delayed_channel(), run_at)
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    pub async fn remove(&self, job_id: u64) -> Result<()> {
        let mut conn = self.conn().await?;
        self.inner
            .scripts
            .remove
            .key(self.inner.keys.completed())
            .key(self.inner.keys.failed())
            .key(self.inner.keys.wait())
            .key(self.inner.keys.paused())
            .key(self.inner.keys.active())
            .key(self.inner.keys.delayed())
            .key(self.inner.keys.job_hash(job_id))
            .arg(job_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn pause(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        self.inner
            .scripts
            .pause_resume
            .run(&self.inner.keys, &mut conn, true)
            .await?;
        self.emit(QueueEvent::Paused);
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        self.inner
            .scripts
            .pause_resume
            .run(&self.inner.keys, &mut conn, false)
            .await?;
        self.emit(QueueEvent::Resumed);
        Ok(())
    }

    pub async fn count(&self) -> Result<u64> {
        let mut conn = self.conn().await?;
        let (wait_len, paused_len, delayed_len): (u64, u64, u64) = redis::pipe()
            .llen(self.inner.keys.wait())
            .llen(self.inner.keys.paused())
            .zcard(self.inner.keys.delayed())
            .query_async(&mut conn)
            .await?;

        Ok(wait_len.max(paused_len) + delayed_len)
    }

    pub async fn job_counts(&self) -> Result<JobCounts> {
        let mut conn = self.conn().await?;
        let (waiting, active, delayed, completed, failed, paused): (u64, u64, u64, u64, u64, u64) =
            redis::pipe()
                .llen(self.inner.keys.wait())
                .llen(self.inner.keys.active())
                .zcard(self.inner.keys.delayed())
                .scard(self.inner.keys.completed())
                .scard(self.inner.keys.failed())
                .llen(self.inner.keys.paused())
                .query_async(&mut conn)
                .await?;

        Ok(JobCounts {
            waiting,
            active,
            delayed,
            completed,
            failed,
            paused,
        })
    }

    pub async fn empty(&self) -> Result<()> {
        let mut conn = self.conn().await?;

        let mut ids: Vec<String> = conn.lrange(self.inner.keys.wait(), 0, -1).await?;
        let mut paused_ids: Vec<String> = conn.lrange(self.inner.keys.paused(), 0, -1).await?;
        let delayed_ids: Vec<String> = conn.zrange(self.inner.keys.delayed(), 0, -1).await?;
        ids.append(&mut paused_ids);
        ids.extend(delayed_ids);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(self.inner.keys.wait())
            .del(self.inner.keys.paused())
            .del(self.inner.keys.meta_paused())
            .del(self.inner.keys.delayed());

        for id in &ids {
            pipe.del(self.inner.keys.job_hash(id.parse::<u64>()?));
        }

        pipe.query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn get_waiting(&self) -> Result<Vec<u64>> {
        self.list_ids(self.inner.keys.wait()).await
    }

    pub async fn get_active(&self) -> Result<Vec<u64>> {
        self.list_ids(self.inner.keys.active()).await
    }

    pub async fn get_completed(&self) -> Result<Vec<u64>> {
        self.set_ids(self.inner.keys.completed()).await
    }

    pub async fn get_failed(&self) -> Result<Vec<u64>> {
        self.set_ids(self.inner.keys.failed()).await
    }

    pub async fn get_delayed(&self) -> Result<Vec<u64>> {
        self.zset_ids(self.inner.keys.delayed()).await
    }

    async fn list_ids(&self, key: String) -> Result<Vec<u64>> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn.lrange(key, 0, -1).await?;
        ids.into_iter()
            .map(|s| s.parse().map_err(Error::from))
            .collect()
    }

    async fn set_ids(&self, key: String) -> Result<Vec<u64>> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn.smembers(key).await?;
        ids.into_iter()
            .map(|s| s.parse().map_err(Error::from))
            .collect()
    }

    async fn zset_ids(&self, key: String) -> Result<Vec<u64>> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn.zrange(key, 0, -1).await?;
        ids.into_iter()
            .map(|s| s.parse().map_err(Error::from))
            .collect()
    }

    // -- consumer-facing API ---------------------------------------------

    /// Starts the dispatch loop and delay timer. A no-op if already running.
    pub fn run<H>(&self, handler: H, shutdown: GracefulShutdownConsumer, options: RunOptions)
    where
        H: Handler<T> + Clone + Send + Sync + 'static,
    {
        {
            let mut guard = self.inner.dispatch_task.lock().unwrap();
            if guard.is_some() {
                return;
            }
            let (closer_tx, closer_rx) = oneshot::channel();
            let task = dispatch::spawn_dispatch_loop(
                self.clone(),
                handler,
                shutdown,
                closer_rx,
                options.force_sequential_processing,
            );
            *guard = Some((closer_tx, task));
        }

        let mut delay_guard = self.inner.delay_timer.lock().unwrap();
        if delay_guard.is_none() {
            *delay_guard = Some(DelayTimer::spawn(self.clone()));
        }
    }

    /// Stops the dispatch loop and delay timer, waiting for both to exit.
    pub async fn stop(&self) {
        let dispatch = self.inner.dispatch_task.lock().unwrap().take();
        if let Some((closer, task)) = dispatch {
            let _ = closer.send(());
            let _ = task.await;
        }

        let timer = self.inner.delay_timer.lock().unwrap().take();
        if let Some(timer) = timer {
            timer.stop().await;
        }
    }

    // -- internals shared with dispatch/lock/delay/stalled ----------------

    pub(crate) async fn run_one<H>(self, job_id: u64, worker_token: String, handler: H)
    where
        H: Handler<T>,
    {
        let job = match self.fetch_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                event!(Level::WARN, job_id, queue = self.name(), "Dispatched job vanished before it could be loaded");
                return;
            }
            Err(e) => {
                event!(Level::ERROR, job_id, queue = self.name(), error = %e, "Failed to load dispatched job");
                return;
            }
        };

        if let Some(delay) = job.delay.filter(|d| *d > 0) {
            let run_at = job.timestamp + delay;
            if let Err(e) = self.move_to_delayed(job_id, run_at).await {
                event!(Level::ERROR, job_id, queue = self.name(), error = %e, "Failed to defer delayed job");
            }
            return;
        }

        if let Err(e) = self.take_lock(job_id, &worker_token, true).await {
            event!(Level::ERROR, job_id, queue = self.name(), error = %e, "Failed to take lock before running job");
            return;
        }

        let renewer = LockRenewer::spawn(self.clone(), job_id, worker_token.clone());
        let outcome = handler.handle(&job).await;
        renewer.stop().await;

        match outcome {
            Ok(result) => {
                if let Err(e) = self.move_to_completed(job_id).await {
                    event!(Level::ERROR, job_id, queue = self.name(), error = %e, "Failed to mark job completed");
                    return;
                }
                self.emit(QueueEvent::Completed { job_id, result });
            }
            Err(err) => {
                let message = err.to_string();
                if let Err(e) = self.move_to_failed(job_id, &message).await {
                    event!(Level::ERROR, job_id, queue = self.name(), error = %e, "Failed to mark job failed");
                }
                if let Err(e) = self.release_lock(job_id, &worker_token).await {
                    event!(Level::ERROR, job_id, queue = self.name(), error = %e, "Failed to release lock after handler failure");
                }
                self.emit(QueueEvent::Failed {
                    job_id,
                    error: message,
                });
            }
        }
    }

    pub(crate) async fn get_next_job(
        &self,
        notifications: Option<&mut Subscription>,
        timeout: Duration,
    ) -> Result<Option<u64>> {
        let mut conn = self.conn().await?;

        let popped: Option<String> = redis::cmd("RPOPLPUSH")
            .arg(self.inner.keys.wait())
            .arg(self.inner.keys.active())
            .query_async(&mut conn)
            .await?;

        if let Some(id) = popped {
            let job_id = id.parse::<u64>()?;
            self.emit(QueueEvent::NewJob { job_id });
            return Ok(Some(job_id));
        }

        drop(conn);
        self.emit(QueueEvent::Empty);

        match notifications {
            Some(notifications) => {
                notifications.wait(timeout).await;
            }
            None => tokio::time::sleep(timeout).await,
        }

        Ok(None)
    }

    pub(crate) async fn subscribe_new_job_notifications(&self) -> Result<Subscription> {
        Ok(Subscription::open(self.redis_client(), &self.inner.keys.jobs_channel()).await?)
    }

    pub(crate) async fn active_job_ids(&self) -> Result<Vec<u64>> {
        self.list_ids(self.inner.keys.active()).await
    }

    pub(crate) async fn is_completed(&self, job_id: u64) -> Result<bool> {
        let mut conn = self.conn().await?;
        let is_member: bool = conn.sismember(self.inner.keys.completed(), job_id).await?;
        Ok(is_member)
    }

    pub(crate) async fn take_lock(&self, job_id: u64, token: &str, renew: bool) -> Result<bool> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.inner.keys.lock(job_id))
            .arg(token)
            .arg("PX")
            .arg(LOCK_TTL.as_millis() as u64);
        if !renew {
            cmd.arg("NX");
        }

        let result: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(result.is_some())
    }

    pub(crate) async fn release_lock(&self, job_id: u64, token: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let deleted: i64 = self
            .inner
            .scripts
            .release_lock
            .key(self.inner.keys.lock(job_id))
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    pub(crate) async fn move_to_completed(&self, job_id: u64) -> Result<()> {
        let mut conn = self.conn().await?;
        redis::pipe()
            .atomic()
            .lrem(self.inner.keys.active(), 0, job_id)
            .sadd(self.inner.keys.completed(), job_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub(crate) async fn move_to_failed(&self, job_id: u64, error: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        redis::pipe()
            .atomic()
            .hset(self.inner.keys.job_hash(job_id), "stacktrace", error)
            .lrem(self.inner.keys.active(), 0, job_id)
            .sadd(self.inner.keys.failed(), job_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub(crate) async fn move_to_delayed(&self, job_id: u64, run_at_ms: i64) -> Result<()> {
        let mut conn = self.conn().await?;
        let score = run_at_ms.max(0);

        redis::pipe()
            .atomic()
            .lrem(self.inner.keys.active(), 0, job_id)
            .zadd(self.inner.keys.delayed(), job_id, score)
            .publish(self.inner.keys.delayed_channel(), score)
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    pub(crate) async fn run_delay_poll(&self) -> Result<Option<i64>> {
        let mut conn = self.conn().await?;
        let now = crate::now_ms();

        let next_score: Option<i64> = self
            .inner
            .scripts
            .delay_poll
            .key(self.inner.keys.delayed())
            .key(self.inner.keys.active())
            .key(self.inner.keys.wait())
            .key(self.inner.keys.jobs_channel())
            .arg(now)
            .arg(self.inner.keys.job_hash_prefix())
            .invoke_async(&mut conn)
            .await?;

        Ok(next_score)
    }

    pub(crate) async fn publish_delay_wake(&self, timestamp_ms: i64) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: i64 = redis::cmd("PUBLISH")
            .arg(self.inner.keys.delayed_channel())
            .arg(timestamp_ms)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn fetch_job(&self, job_id: u64) -> Result<Option<Job<T>>> {
        let mut conn = self.conn().await?;
        let (data, opts, progress, timestamp, delay, stacktrace): (
            Option<Vec<u8>>,
            Option<String>,
            Option<u32>,
            Option<i64>,
            Option<String>,
            Option<String>,
        ) = redis::cmd("HMGET")
            .arg(self.inner.keys.job_hash(job_id))
            .arg("data")
            .arg("opts")
            .arg("progress")
            .arg("timestamp")
            .arg("delay")
            .arg("stacktrace")
            .query_async(&mut conn)
            .await?;

        if data.is_none() && opts.is_none() && progress.is_none() && timestamp.is_none() {
            return Ok(None);
        }

        let data = data.ok_or(Error::MalformedJob(job_id, "data"))?;
        let opts_raw = opts.ok_or(Error::MalformedJob(job_id, "opts"))?;
        let progress = progress.ok_or(Error::MalformedJob(job_id, "progress"))?;
        let timestamp = timestamp.ok_or(Error::MalformedJob(job_id, "timestamp"))?;

        let decoded = self.inner.codec.decode(&data)?;
        let opts = JobOpts::decode(&opts_raw)?;
        let delay = parse_delay_field(delay);

        Ok(Some(Job {
            id: job_id,
            data: decoded,
            opts,
            progress,
            timestamp,
            delay,
            stacktrace,
        }))
    }
}

/// Interprets a job hash's raw `delay` field per spec §6: missing, the
/// literal string `"undefined"` (a quirk some peer writers leave behind),
/// or a numeric `0` all mean "no delay".
fn parse_delay_field(raw: Option<String>) -> Option<i64> {
    let raw = raw?;
    match raw.parse::<i64>() {
        Ok(0) => None,
        Ok(ms) => Some(ms),
        Err(_) => None,
    }
}

#[cfg(test)]
mod delay_field_tests {
    use super::parse_delay_field;

    #[test]
    fn absent_field_means_no_delay() {
        assert_eq!(parse_delay_field(None), None);
    }

    #[test]
    fn literal_undefined_means_no_delay() {
        assert_eq!(parse_delay_field(Some("undefined".to_string())), None);
    }

    #[test]
    fn zero_means_no_delay() {
        assert_eq!(parse_delay_field(Some("0".to_string())), None);
    }

    #[test]
    fn a_positive_value_is_kept() {
        assert_eq!(parse_delay_field(Some("1500".to_string())), Some(1500));
    }
}
