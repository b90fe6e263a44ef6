//! # TaskQueue
//!
//! The queue-substrate adapter: per-platform scheduling and locking state
//! kept in Redis. The relational task store remains the system of record;
//! everything in here is ephemeral coordination — the queue list, the
//! per-task detail hash, the TTL'd task lock and the failed-job list.
//!
//! Key space, per queue prefix:
//! `{prefix}:task_queue`, `{prefix}:task_info:{task_id}`,
//! `{prefix}:task_queue_lock:{task_id}`, `{prefix}:task_queue_failed`.

use std::collections::HashMap;
use std::time;

use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, ErrorKind, RedisError};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::retry::Retrier;
use crate::task::{ParseError, TaskDetail, TaskStatus};

/// Logical database holding all scheduling state.
const QUEUE_DB: i64 = 1;

/// Enumeration of errors for operations with TaskQueue.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: RedisError },
    #[error("{command} command failed with: {error}")]
    CommandError { command: String, error: RedisError },
    #[error(transparent)]
    ParseError(#[from] ParseError),
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Decide whether a Redis failure is worth replaying. Connection-level
/// trouble and server states that clear up on their own are retryable;
/// authentication problems and ordinary response errors are not.
pub fn is_retryable(error: &RedisError) -> bool {
    if error.kind() == ErrorKind::AuthenticationFailed {
        return false;
    }
    if error.is_connection_refusal() || error.is_timeout() || error.is_connection_dropped() {
        return true;
    }
    if error.is_io_error() {
        return true;
    }
    if matches!(
        error.kind(),
        ErrorKind::BusyLoadingError | ErrorKind::TryAgain
    ) {
        return true;
    }
    if matches!(error.code(), Some("LOADING" | "READONLY" | "OOM")) {
        return true;
    }
    let detail = error.to_string().to_lowercase();
    detail.contains("broken pipe")
        || detail.contains("connection reset")
        || detail.contains("max number of clients")
        || detail.contains("oom command not allowed")
        || detail.contains("loading redis is loading")
        || detail.contains("readonly you can't write")
}

/// Caches a multiplexed connection and rebuilds it on demand. This is the
/// single place the worker's Redis handle is ever replaced: the retrier's
/// reset hook calls `reset`, every operation calls `connection`.
struct ConnectionProvider {
    client: redis::Client,
    cached: Mutex<Option<MultiplexedConnection>>,
}

impl ConnectionProvider {
    fn new(url: &str) -> Result<Self, RedisError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            cached: Mutex::new(None),
        })
    }

    async fn connect(&self) -> Result<MultiplexedConnection, RedisError> {
        let mut connection = self.client.get_multiplexed_tokio_connection().await?;
        redis::cmd("SELECT")
            .arg(QUEUE_DB)
            .query_async::<_, ()>(&mut connection)
            .await?;
        Ok(connection)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, RedisError> {
        let mut cached = self.cached.lock().await;
        if let Some(connection) = cached.as_ref() {
            return Ok(connection.clone());
        }
        let connection = self.connect().await?;
        *cached = Some(connection.clone());
        Ok(connection)
    }

    /// Drop the stale handle and rebuild, re-selecting the logical database.
    async fn reset(&self) -> Result<(), RedisError> {
        let mut cached = self.cached.lock().await;
        *cached = None;
        *cached = Some(self.connect().await?);
        Ok(())
    }
}

/// Scheduling operations for one queue prefix. Every call runs under the
/// queue-substrate retry policy with the connection provider as its reset
/// hook.
pub struct TaskQueue {
    prefix: String,
    provider: ConnectionProvider,
    retrier: Retrier,
}

impl TaskQueue {
    pub fn new(prefix: &str, url: &str) -> QueueResult<Self> {
        Ok(Self {
            prefix: prefix.to_owned(),
            provider: ConnectionProvider::new(url)
                .map_err(|error| QueueError::ConnectionError { error })?,
            retrier: Retrier::build(3, time::Duration::from_secs(1)).provide(),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn queue_key(&self) -> String {
        format!("{}:task_queue", self.prefix)
    }

    pub fn detail_key(&self, task_id: &str) -> String {
        format!("{}:task_info:{}", self.prefix, task_id)
    }

    pub fn lock_key(&self, task_id: &str) -> String {
        format!("{}:task_queue_lock:{}", self.prefix, task_id)
    }

    pub fn failed_key(&self) -> String {
        format!("{}:task_queue_failed", self.prefix)
    }

    async fn with_retries<T, Op, Fut>(&self, command: &str, operation: Op) -> QueueResult<T>
    where
        Op: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, RedisError>>,
    {
        self.retrier
            .run_with_reset(operation, is_retryable, || self.provider.reset())
            .await
            .map_err(|error| QueueError::CommandError {
                command: command.to_owned(),
                error,
            })
    }

    /// Take the next task id from the tail of the queue, if any.
    pub async fn pop_task(&self) -> QueueResult<Option<String>> {
        let key = self.queue_key();
        self.with_retries("RPOP", || async {
            let mut connection = self.provider.connection().await?;
            connection.rpop::<_, Option<String>>(&key, None).await
        })
        .await
    }

    /// Set-if-absent with expiry. Returns whether we now own the task; a
    /// `false` means another worker holds the lease.
    pub async fn acquire_lock(&self, task_id: &str, ttl: time::Duration) -> QueueResult<bool> {
        let key = self.lock_key(task_id);
        let ttl_secs = ttl.as_secs().max(1);
        let acquired = self
            .with_retries("SET", || async {
                let mut connection = self.provider.connection().await?;
                redis::cmd("SET")
                    .arg(&key)
                    .arg("1")
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl_secs)
                    .query_async::<_, Option<String>>(&mut connection)
                    .await
            })
            .await?;
        Ok(acquired.is_some())
    }

    pub async fn release_lock(&self, task_id: &str) -> QueueResult<()> {
        let key = self.lock_key(task_id);
        self.with_retries("DEL", || async {
            let mut connection = self.provider.connection().await?;
            connection.del::<_, ()>(&key).await
        })
        .await
    }

    /// Atomically write the detail hash and push the task id onto the head
    /// of the queue. Runs as a single MULTI/EXEC pipeline so workers never
    /// observe a queued task without its detail.
    pub async fn publish(&self, task_id: &str, detail: &TaskDetail) -> QueueResult<()> {
        let detail_key = self.detail_key(task_id);
        let queue_key = self.queue_key();
        let fields = detail.to_fields();
        self.with_retries("MULTI", || async {
            let mut connection = self.provider.connection().await?;
            redis::pipe()
                .atomic()
                .hset_multiple(&detail_key, &fields)
                .ignore()
                .lpush(&queue_key, task_id)
                .ignore()
                .query_async::<_, ()>(&mut connection)
                .await
        })
        .await
    }

    /// Read the detail hash back; `None` when the key is gone.
    pub async fn read_detail(&self, task_id: &str) -> QueueResult<Option<TaskDetail>> {
        let key = self.detail_key(task_id);
        let hash = self
            .with_retries("HGETALL", || async {
                let mut connection = self.provider.connection().await?;
                connection.hgetall::<_, HashMap<String, String>>(&key).await
            })
            .await?;
        Ok(TaskDetail::from_hash(&hash)?)
    }

    /// Mirror a status change (and optional message) into the detail hash.
    pub async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        message: Option<&str>,
    ) -> QueueResult<()> {
        let key = self.detail_key(task_id);
        let status = status.to_string();
        self.with_retries("HSET", || async {
            let mut connection = self.provider.connection().await?;
            connection
                .hset::<_, _, _, ()>(&key, "status", &status)
                .await?;
            if let Some(message) = message {
                connection
                    .hset::<_, _, _, ()>(&key, "message", message)
                    .await?;
            }
            Ok(())
        })
        .await
    }

    /// Bump the whole-job retry counter, returning the new value.
    pub async fn increment_retry(&self, task_id: &str) -> QueueResult<u32> {
        let key = self.detail_key(task_id);
        let count = self
            .with_retries("HINCRBY", || async {
                let mut connection = self.provider.connection().await?;
                connection.hincr::<_, _, _, i64>(&key, "retry_count", 1).await
            })
            .await?;
        Ok(count.max(0) as u32)
    }

    /// Push the task id back onto the head of the queue for another pass.
    pub async fn requeue(&self, task_id: &str) -> QueueResult<()> {
        let key = self.queue_key();
        self.with_retries("LPUSH", || async {
            let mut connection = self.provider.connection().await?;
            connection.lpush::<_, _, ()>(&key, task_id).await
        })
        .await
    }

    /// Park a task that exhausted its retry budget. Terminal; nothing in
    /// the pipeline consumes this list.
    pub async fn push_failed(&self, task_id: &str) -> QueueResult<()> {
        let key = self.failed_key();
        self.with_retries("LPUSH", || async {
            let mut connection = self.provider.connection().await?;
            connection.lpush::<_, _, ()>(&key, task_id).await
        })
        .await
    }

    /// Remove the detail hash after a terminal completion.
    pub async fn delete_detail(&self, task_id: &str) -> QueueResult<()> {
        let key = self.detail_key(task_id);
        self.with_retries("DEL", || async {
            let mut connection = self.provider.connection().await?;
            connection.del::<_, ()>(&key).await
        })
        .await
    }
}
