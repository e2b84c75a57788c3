use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::Client;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use omniq_core::config::QueueConfig;
use omniq_core::errors::{OmniqError, OmniqResult};
use omniq_domain::{
    ExecutionError, NackOutcome, QueueStats, Task, TaskPriority, TaskQueue, TaskRegistry,
    TaskSubmission,
};

use crate::backoff::BackoffPolicy;
use crate::quota::{payload_bytes, QuotaTracker};

const DEAD_LETTER_KEEP: isize = 1_000;

fn redis_err(e: redis::RedisError) -> OmniqError {
    OmniqError::queue(e.to_string())
}

/// Broker-backed queue on Redis. Pending lanes are per-tenant lists, retries
/// wait in a sorted set scored by their ready time, and task documents live
/// under their own keys so lookups survive the task leaving a list.
pub struct RedisBrokerQueue {
    conn: ConnectionManager,
    namespace: String,
    registry: Arc<TaskRegistry>,
    quota: QuotaTracker,
    backoff: BackoffPolicy,
    retention_seconds: u64,
    poll_interval: Duration,
    /// Round-robin cursors, one per priority class.
    cursors: [AtomicUsize; 4],
    running: AtomicUsize,
}

impl RedisBrokerQueue {
    /// Connects and verifies the broker with a PING, bounded by the
    /// configured connect timeout.
    pub async fn connect(registry: Arc<TaskRegistry>, config: &QueueConfig) -> OmniqResult<Self> {
        let url = config
            .broker_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| OmniqError::config("queue.broker_url is not set"))?;
        let client = Client::open(url).map_err(redis_err)?;

        let connect_timeout = Duration::from_secs(config.connect_timeout_seconds);
        let mut conn = timeout(connect_timeout, client.get_connection_manager())
            .await
            .map_err(|_| {
                OmniqError::Timeout(format!(
                    "broker did not answer within {}s",
                    config.connect_timeout_seconds
                ))
            })?
            .map_err(redis_err)?;

        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        if pong != "PONG" {
            return Err(OmniqError::queue(format!(
                "unexpected PING response: {pong}"
            )));
        }
        debug!("connected to broker");

        Ok(Self {
            conn,
            namespace: config.namespace.clone(),
            registry,
            quota: QuotaTracker::new(config.max_payload_bytes, config.max_total_bytes),
            backoff: BackoffPolicy::new(config.retry_backoff_base_ms, config.retry_backoff_cap_ms),
            retention_seconds: config.retention_seconds,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            cursors: Default::default(),
            running: AtomicUsize::new(0),
        })
    }

    fn task_key(&self, id: &str) -> String {
        format!("{}:task:{id}", self.namespace)
    }

    fn lane_key(&self, priority: TaskPriority, tenant: &str) -> String {
        format!("{}:q:{priority}:{tenant}", self.namespace)
    }

    fn tenants_key(&self, priority: TaskPriority) -> String {
        format!("{}:tenants:{priority}", self.namespace)
    }

    fn delayed_key(&self) -> String {
        format!("{}:delayed", self.namespace)
    }

    fn stat_key(&self, name: &str) -> String {
        format!("{}:stats:{name}", self.namespace)
    }

    fn lane_cursor(&self, priority: TaskPriority) -> &AtomicUsize {
        &self.cursors[match priority {
            TaskPriority::Urgent => 0,
            TaskPriority::High => 1,
            TaskPriority::Medium => 2,
            TaskPriority::Low => 3,
        }]
    }

    async fn store_task(&self, conn: &mut ConnectionManager, task: &Task) -> OmniqResult<()> {
        let doc = serde_json::to_string(task)?;
        redis::cmd("SET")
            .arg(self.task_key(&task.id))
            .arg(doc)
            .query_async::<()>(conn)
            .await
            .map_err(redis_err)
    }

    /// Stores a terminal task document with the retention TTL.
    async fn store_terminal(&self, conn: &mut ConnectionManager, task: &Task) -> OmniqResult<()> {
        let doc = serde_json::to_string(task)?;
        if self.retention_seconds == 0 {
            redis::cmd("DEL")
                .arg(self.task_key(&task.id))
                .query_async::<()>(conn)
                .await
                .map_err(redis_err)
        } else {
            redis::cmd("SETEX")
                .arg(self.task_key(&task.id))
                .arg(self.retention_seconds)
                .arg(doc)
                .query_async::<()>(conn)
                .await
                .map_err(redis_err)
        }
    }

    async fn load_task(
        &self,
        conn: &mut ConnectionManager,
        id: &str,
    ) -> OmniqResult<Option<Task>> {
        let doc: Option<String> = redis::cmd("GET")
            .arg(self.task_key(id))
            .query_async(conn)
            .await
            .map_err(redis_err)?;
        match doc {
            Some(doc) => Ok(Some(serde_json::from_str(&doc)?)),
            None => Ok(None),
        }
    }

    /// Moves due retries from the delayed set back onto their lanes.
    async fn promote_due(&self, conn: &mut ConnectionManager) -> OmniqResult<()> {
        let now = Utc::now().timestamp_millis();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.delayed_key())
            .arg("-inf")
            .arg(now)
            .arg("LIMIT")
            .arg(0)
            .arg(100)
            .query_async(conn)
            .await
            .map_err(redis_err)?;

        for id in due {
            // only the caller that wins the removal re-queues the task
            let removed: i64 = redis::cmd("ZREM")
                .arg(self.delayed_key())
                .arg(&id)
                .query_async(conn)
                .await
                .map_err(redis_err)?;
            if removed == 0 {
                continue;
            }
            let Some(task) = self.load_task(conn, &id).await? else {
                warn!(task_id = %id, "delayed task document vanished, dropping");
                continue;
            };
            self.push_lane(conn, &task).await?;
        }
        Ok(())
    }

    async fn push_lane(&self, conn: &mut ConnectionManager, task: &Task) -> OmniqResult<()> {
        redis::pipe()
            .cmd("RPUSH")
            .arg(self.lane_key(task.priority, &task.tenant_id))
            .arg(&task.id)
            .ignore()
            .cmd("SADD")
            .arg(self.tenants_key(task.priority))
            .arg(&task.tenant_id)
            .ignore()
            .query_async::<()>(conn)
            .await
            .map_err(redis_err)
    }

    async fn lane_tenants(
        &self,
        conn: &mut ConnectionManager,
        priority: TaskPriority,
    ) -> OmniqResult<Vec<String>> {
        let mut tenants: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.tenants_key(priority))
            .query_async(conn)
            .await
            .map_err(redis_err)?;
        tenants.sort();
        Ok(tenants)
    }

    /// One non-blocking scan over the allowed lanes.
    async fn try_take(
        &self,
        conn: &mut ConnectionManager,
        tenant: Option<&str>,
        lanes: &[TaskPriority],
    ) -> OmniqResult<Option<Task>> {
        for priority in lanes {
            let tenants = match tenant {
                Some(t) => vec![t.to_string()],
                None => self.lane_tenants(conn, *priority).await?,
            };
            if tenants.is_empty() {
                continue;
            }
            let start = self.lane_cursor(*priority).fetch_add(1, Ordering::Relaxed);
            for offset in 0..tenants.len() {
                let t = &tenants[(start + offset) % tenants.len()];
                let id: Option<String> = redis::cmd("LPOP")
                    .arg(self.lane_key(*priority, t))
                    .query_async(conn)
                    .await
                    .map_err(redis_err)?;
                let Some(id) = id else { continue };
                let Some(mut task) = self.load_task(conn, &id).await? else {
                    warn!(task_id = %id, "queued task document vanished, dropping");
                    continue;
                };
                task.mark_running()?;
                self.store_task(conn, &task).await?;
                self.running.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    async fn incr_stat(&self, conn: &mut ConnectionManager, name: &str) -> OmniqResult<()> {
        redis::cmd("INCR")
            .arg(self.stat_key(name))
            .query_async::<()>(conn)
            .await
            .map_err(redis_err)
    }
}

#[async_trait]
impl TaskQueue for RedisBrokerQueue {
    async fn enqueue(&self, submission: TaskSubmission) -> OmniqResult<String> {
        if submission.tenant_id.is_empty() {
            return Err(OmniqError::validation("tenant_id cannot be empty"));
        }
        let definition = self.registry.definition(&submission.kind)?;
        let bytes = payload_bytes(&submission.payload);
        self.quota.reserve(bytes)?;

        let task = Task::new(
            submission,
            definition.timeout_seconds,
            definition.max_attempts,
        );
        let id = task.id.clone();

        let mut conn = self.conn.clone();
        let admitted: OmniqResult<()> = async {
            self.store_task(&mut conn, &task).await?;
            self.push_lane(&mut conn, &task).await
        }
        .await;
        if let Err(e) = admitted {
            self.quota.release(bytes);
            return Err(e);
        }

        debug!(task_id = %id, kind = %task.kind, tenant = %task.tenant_id,
               priority = %task.priority, "task admitted to broker queue");
        Ok(id)
    }

    async fn dequeue(
        &self,
        tenant: Option<&str>,
        lanes: &[TaskPriority],
        timeout: Duration,
    ) -> OmniqResult<Option<Task>> {
        let deadline = Instant::now() + timeout;
        let mut conn = self.conn.clone();
        loop {
            self.promote_due(&mut conn).await?;
            if let Some(task) = self.try_take(&mut conn, tenant, lanes).await? {
                return Ok(Some(task));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, task: &Task, result: serde_json::Value) -> OmniqResult<()> {
        let mut finished = task.clone();
        finished.mark_completed(result)?;

        let mut conn = self.conn.clone();
        self.store_terminal(&mut conn, &finished).await?;
        self.incr_stat(&mut conn, "completed").await?;
        self.running.fetch_sub(1, Ordering::Relaxed);
        self.quota.release(payload_bytes(&finished.payload));
        Ok(())
    }

    async fn nack(&self, task: &Task, error: ExecutionError) -> OmniqResult<NackOutcome> {
        let mut failed = task.clone();
        failed.mark_failed(error.clone())?;
        self.running.fetch_sub(1, Ordering::Relaxed);

        let mut conn = self.conn.clone();
        if error.is_transient() && failed.has_attempts_left() {
            let delay = self.backoff.delay(failed.attempt_count);
            failed.prepare_retry(delay)?;
            let ready_at = failed.ready_at;
            self.store_task(&mut conn, &failed).await?;
            redis::cmd("ZADD")
                .arg(self.delayed_key())
                .arg(ready_at.timestamp_millis())
                .arg(&failed.id)
                .query_async::<()>(&mut conn)
                .await
                .map_err(redis_err)?;
            debug!(task_id = %failed.id, attempt = failed.attempt_count,
                   delay_ms = delay.num_milliseconds(), "task scheduled for retry");
            return Ok(NackOutcome::Retried { ready_at });
        }

        failed.mark_dead_letter()?;
        warn!(task_id = %failed.id, kind = %failed.kind, attempts = failed.attempt_count,
              error = %error, "task dead-lettered");
        self.store_terminal(&mut conn, &failed).await?;
        redis::pipe()
            .cmd("RPUSH")
            .arg(format!("{}:dead", self.namespace))
            .arg(&failed.id)
            .ignore()
            .cmd("LTRIM")
            .arg(format!("{}:dead", self.namespace))
            .arg(-DEAD_LETTER_KEEP)
            .arg(-1)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(redis_err)?;
        self.incr_stat(&mut conn, "dead_lettered").await?;
        self.quota.release(payload_bytes(&failed.payload));
        Ok(NackOutcome::DeadLettered)
    }

    async fn get_task(&self, id: &str) -> OmniqResult<Option<Task>> {
        let mut conn = self.conn.clone();
        self.load_task(&mut conn, id).await
    }

    async fn depth(&self, priority: TaskPriority) -> OmniqResult<usize> {
        let mut conn = self.conn.clone();
        let mut total = 0usize;
        for tenant in self.lane_tenants(&mut conn, priority).await? {
            let len: usize = redis::cmd("LLEN")
                .arg(self.lane_key(priority, &tenant))
                .query_async(&mut conn)
                .await
                .map_err(redis_err)?;
            total += len;
        }
        Ok(total)
    }

    async fn tenant_depth(&self, tenant: &str) -> OmniqResult<usize> {
        let mut conn = self.conn.clone();
        let mut total = 0usize;
        for priority in TaskPriority::DESCENDING {
            let len: usize = redis::cmd("LLEN")
                .arg(self.lane_key(priority, tenant))
                .query_async(&mut conn)
                .await
                .map_err(redis_err)?;
            total += len;
        }
        Ok(total)
    }

    async fn stats(&self) -> OmniqResult<QueueStats> {
        let mut conn = self.conn.clone();
        let mut stats = QueueStats {
            backend: self.backend_name().to_string(),
            running: self.running.load(Ordering::Relaxed),
            used_bytes: self.quota.used_bytes(),
            ..Default::default()
        };
        for priority in TaskPriority::DESCENDING {
            let mut class_total = 0usize;
            for tenant in self.lane_tenants(&mut conn, priority).await? {
                let len: usize = redis::cmd("LLEN")
                    .arg(self.lane_key(priority, &tenant))
                    .query_async(&mut conn)
                    .await
                    .map_err(redis_err)?;
                class_total += len;
                if len > 0 {
                    *stats.pending_by_tenant.entry(tenant).or_insert(0) += len;
                }
            }
            stats.pending_by_priority.insert(priority, class_total);
        }
        for (name, slot) in [
            ("completed", &mut stats.completed),
            ("dead_lettered", &mut stats.dead_lettered),
        ] {
            let value: Option<u64> = redis::cmd("GET")
                .arg(self.stat_key(name))
                .query_async(&mut conn)
                .await
                .map_err(redis_err)?;
            *slot = value.unwrap_or(0);
        }
        Ok(stats)
    }

    fn backend_name(&self) -> &'static str {
        "broker"
    }
}
