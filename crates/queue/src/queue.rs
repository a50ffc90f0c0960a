//! Persistent, per-recipient FIFO with priority, TTL, retries, and
//! request/response correlation (spec §4.5). Backed by `rusqlite` under
//! WAL journaling, same pooling idiom as `sa-sessions`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use sa_domain::config::QueueConfig;
use sa_domain::error::{Error, Result};
use sa_domain::model::Payload;
use sa_domain::trace::TraceEvent;

use crate::message::{QueueMessage, QueueStatus};

type Pool = r2d2::Pool<SqliteConnectionManager>;

/// Durable per-recipient message queue. Construct once per process and
/// share via `Arc`.
pub struct MessageQueue {
    pool: Pool,
    visibility_timeout: Duration,
    default_max_retries: u32,
    rpc_waiters: Mutex<HashMap<String, Arc<Notify>>>,
    rpc_responses: Mutex<HashMap<String, Payload>>,
    ack_waiters: Mutex<HashMap<String, Arc<Notify>>>,
}

impl MessageQueue {
    pub fn new(config: &QueueConfig) -> Result<Arc<Self>> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent).map_err(Error::Io)?;
        }
        let manager = SqliteConnectionManager::file(&config.db_path)
            .with_init(|conn| conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;"));
        let pool = r2d2::Pool::builder()
            .max_size(config.pool_size)
            .build(manager)
            .map_err(|e| Error::persistence("opening queue store pool", e))?;
        {
            let conn = pool
                .get()
                .map_err(|e| Error::persistence("acquiring queue store connection", e))?;
            apply_schema(&conn)?;
        }
        Ok(Arc::new(Self {
            pool,
            visibility_timeout: Duration::from_secs(config.visibility_timeout_secs),
            default_max_retries: config.default_max_retries,
            rpc_waiters: Mutex::new(HashMap::new()),
            rpc_responses: Mutex::new(HashMap::new()),
            ack_waiters: Mutex::new(HashMap::new()),
        }))
    }

    /// In-memory queue: no file ever touches disk. Handy for tests and
    /// for embedding a queue in a process that never restarts.
    pub fn new_in_memory(visibility_timeout: Duration, default_max_retries: u32) -> Result<Arc<Self>> {
        let manager = SqliteConnectionManager::memory();
        let pool = r2d2::Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| Error::persistence("opening in-memory queue store pool", e))?;
        {
            let conn = pool
                .get()
                .map_err(|e| Error::persistence("acquiring queue store connection", e))?;
            apply_schema(&conn)?;
        }
        Ok(Arc::new(Self {
            pool,
            visibility_timeout,
            default_max_retries,
            rpc_waiters: Mutex::new(HashMap::new()),
            rpc_responses: Mutex::new(HashMap::new()),
            ack_waiters: Mutex::new(HashMap::new()),
        }))
    }

    /// Retry budget applied by callers that don't set an explicit
    /// `max_retries` on the `QueueMessage` they enqueue.
    pub fn default_max_retries(&self) -> u32 {
        self.default_max_retries
    }

    pub fn spawn_sweep_task(self: &Arc<Self>, cancel: CancellationToken, interval: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => queue.sweep(),
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    /// Requeue `InFlight` rows whose visibility timer elapsed, incrementing
    /// `attempt` (or dead-lettering past `max_retries`).
    pub fn sweep(&self) {
        let conn = match self.pool.get() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "queue sweep: failed to acquire connection");
                return;
            }
        };
        let now = Utc::now().to_rfc3339();
        let mut stmt = match conn.prepare(
            "SELECT id, attempt, max_retries FROM queue_messages
             WHERE status = 'in_flight' AND visibility_deadline IS NOT NULL AND visibility_deadline <= ?1",
        ) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "queue sweep: failed to prepare query");
                return;
            }
        };
        let rows: Vec<(String, u32, u32)> = match stmt
            .query_map(params![now], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .and_then(Iterator::collect)
        {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "queue sweep: failed to read rows");
                return;
            }
        };
        for (id, attempt, max_retries) in rows {
            let next_attempt = attempt + 1;
            if next_attempt > max_retries {
                let _ = conn.execute(
                    "UPDATE queue_messages SET status = 'dead', attempt = ?2 WHERE id = ?1",
                    params![id, next_attempt],
                );
            } else {
                let _ = conn.execute(
                    "UPDATE queue_messages SET status = 'pending', attempt = ?2, visibility_deadline = NULL WHERE id = ?1",
                    params![id, next_attempt],
                );
                TraceEvent::QueueRedelivered {
                    message_id: id,
                    reason: "visibility timeout elapsed".to_string(),
                }
                .emit();
            }
        }
    }

    pub async fn enqueue(&self, ctx: CancellationToken, msg: QueueMessage) -> Result<()> {
        if let Some(correlation_id) = msg.in_reply_to.clone() {
            let waiter = self.rpc_waiters.lock().remove(&correlation_id);
            return match waiter {
                Some(waiter) => {
                    self.rpc_responses.lock().insert(correlation_id, msg.payload);
                    waiter.notify_one();
                    Ok(())
                }
                // No registered waiter: either the correlation id was never
                // ours, or `send_and_receive` already timed out and cleaned
                // up. Either way the reply is stale — discard it instead of
                // persisting it as an ordinary pending message for `to_agent`.
                None => Ok(()),
            };
        }

        let pool = self.pool.clone();
        let message_id = msg.id.clone();
        let to_agent = msg.to_agent.clone();
        let priority = msg.priority;
        run_blocking(ctx, move || {
            let conn = pool
                .get()
                .map_err(|e| Error::persistence("acquiring queue store connection", e))?;
            let payload_json = serde_json::to_string(&msg.payload)
                .map_err(|e| Error::Other(format!("serializing queue payload: {e}")))?;
            let metadata_json = serde_json::to_string(&msg.metadata)
                .map_err(|e| Error::Other(format!("serializing queue metadata: {e}")))?;
            conn.execute(
                "INSERT INTO queue_messages
                 (id, from_agent, to_agent, message_type, payload_json, metadata_json, priority,
                  enqueued_at, expires_at, max_retries, attempt, status, in_reply_to, visibility_deadline)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, 'pending', ?11, NULL)",
                params![
                    msg.id,
                    msg.from_agent,
                    msg.to_agent,
                    msg.message_type,
                    payload_json,
                    metadata_json,
                    msg.priority,
                    msg.enqueued_at.to_rfc3339(),
                    msg.expires_at.map(|e| e.to_rfc3339()),
                    msg.max_retries,
                    msg.in_reply_to,
                ],
            )
            .map_err(|e| Error::persistence("enqueueing message", e))?;
            Ok(())
        })
        .await?;

        TraceEvent::QueueEnqueued {
            message_id,
            recipient: to_agent,
            priority,
        }
        .emit();
        Ok(())
    }

    /// Non-blocking: `None` when the queue is empty or holds only
    /// future-dated/expired messages. Selection: highest priority, then
    /// earliest `enqueued_at`.
    pub async fn dequeue(&self, ctx: CancellationToken, agent_id: &str) -> Result<Option<QueueMessage>> {
        let pool = self.pool.clone();
        let agent_id = agent_id.to_string();
        let visibility_timeout = self.visibility_timeout;
        let message = run_blocking(ctx, move || {
            let conn = pool
                .get()
                .map_err(|e| Error::persistence("acquiring queue store connection", e))?;
            let now = Utc::now();
            let now_str = now.to_rfc3339();

            conn.execute(
                "UPDATE queue_messages SET status = 'dead'
                 WHERE status = 'pending' AND expires_at IS NOT NULL AND expires_at <= ?1",
                params![now_str],
            )
            .map_err(|e| Error::persistence("expiring stale queue messages", e))?;

            let row = conn
                .query_row(
                    "SELECT id, from_agent, to_agent, message_type, payload_json, metadata_json, priority,
                            enqueued_at, expires_at, max_retries, attempt, in_reply_to
                     FROM queue_messages
                     WHERE to_agent = ?1 AND status = 'pending'
                       AND (expires_at IS NULL OR expires_at > ?2)
                     ORDER BY priority DESC, enqueued_at ASC
                     LIMIT 1",
                    params![agent_id, now_str],
                    row_to_fields,
                )
                .optional()
                .map_err(|e| Error::persistence("selecting next queue message", e))?;

            let Some(fields) = row else { return Ok(None) };
            let deadline = now + chrono::Duration::from_std(visibility_timeout).unwrap_or_default();
            conn.execute(
                "UPDATE queue_messages SET status = 'in_flight', visibility_deadline = ?2 WHERE id = ?1",
                params![fields.0, deadline.to_rfc3339()],
            )
            .map_err(|e| Error::persistence("marking queue message in-flight", e))?;

            let message = fields_to_message(fields, QueueStatus::InFlight)?;
            Ok(Some(message))
        })
        .await?;

        if let Some(message) = &message {
            TraceEvent::QueueDequeued {
                message_id: message.id.clone(),
                recipient: message.to_agent.clone(),
                attempt: message.attempt,
            }
            .emit();
        }
        Ok(message)
    }

    pub async fn acknowledge(&self, ctx: CancellationToken, msg_id: &str) -> Result<()> {
        let pool = self.pool.clone();
        let id = msg_id.to_string();
        run_blocking(ctx, move || {
            let conn = pool
                .get()
                .map_err(|e| Error::persistence("acquiring queue store connection", e))?;
            let updated = conn
                .execute(
                    "UPDATE queue_messages SET status = 'acked' WHERE id = ?1",
                    params![id],
                )
                .map_err(|e| Error::persistence("acknowledging queue message", e))?;
            if updated == 0 {
                return Err(Error::NotFound(format!("queue message {id}")));
            }
            Ok(())
        })
        .await?;

        if let Some(waiter) = self.ack_waiters.lock().remove(msg_id) {
            waiter.notify_one();
        }
        TraceEvent::QueueAcked {
            message_id: msg_id.to_string(),
        }
        .emit();
        Ok(())
    }

    pub async fn nack(&self, ctx: CancellationToken, msg_id: &str) -> Result<()> {
        let pool = self.pool.clone();
        let id = msg_id.to_string();
        let (retry_count, dead) = run_blocking(ctx, move || {
            let conn = pool
                .get()
                .map_err(|e| Error::persistence("acquiring queue store connection", e))?;
            let (attempt, max_retries): (u32, u32) = conn
                .query_row(
                    "SELECT attempt, max_retries FROM queue_messages WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(|e| Error::persistence("reading queue message for nack", e))?
                .ok_or_else(|| Error::NotFound(format!("queue message {id}")))?;

            let next_attempt = attempt + 1;
            let dead = next_attempt > max_retries;
            let status = if dead { "dead" } else { "pending" };
            conn.execute(
                "UPDATE queue_messages SET status = ?2, attempt = ?3, visibility_deadline = NULL WHERE id = ?1",
                params![id, status, next_attempt],
            )
            .map_err(|e| Error::persistence("nacking queue message", e))?;
            Ok((next_attempt, dead))
        })
        .await?;

        TraceEvent::QueueNacked {
            message_id: msg_id.to_string(),
            retry_count,
            dead_lettered: dead,
        }
        .emit();
        Ok(())
    }

    pub async fn get_queue_depth(&self, ctx: CancellationToken, agent_id: &str) -> Result<u64> {
        let pool = self.pool.clone();
        let agent_id = agent_id.to_string();
        run_blocking(ctx, move || {
            let conn = pool
                .get()
                .map_err(|e| Error::persistence("acquiring queue store connection", e))?;
            let depth: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM queue_messages WHERE to_agent = ?1 AND status IN ('pending', 'in_flight')",
                    params![agent_id],
                    |row| row.get(0),
                )
                .map_err(|e| Error::persistence("counting queue depth", e))?;
            Ok(depth as u64)
        })
        .await
    }

    /// Attach a unique correlation id to an outbound message, register a
    /// waiter, enqueue, and await the first response whose `in_reply_to`
    /// matches — or return `Timeout`.
    pub async fn send_and_receive(
        &self,
        ctx: CancellationToken,
        from_agent: &str,
        to_agent: &str,
        message_type: &str,
        payload: Payload,
        metadata: HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Payload> {
        let correlation_id = sa_domain::ids::generate_message_id();
        let notify = Arc::new(Notify::new());
        self.rpc_waiters.lock().insert(correlation_id.clone(), Arc::clone(&notify));

        let now = Utc::now();
        let msg = QueueMessage {
            id: correlation_id.clone(),
            from_agent: from_agent.to_string(),
            to_agent: to_agent.to_string(),
            message_type: message_type.to_string(),
            payload,
            metadata,
            priority: 5,
            enqueued_at: now,
            expires_at: Some(now + chrono::Duration::from_std(timeout).unwrap_or_default()),
            max_retries: 0,
            attempt: 0,
            status: QueueStatus::Pending,
            in_reply_to: None,
        };

        if let Err(e) = self.enqueue(ctx.clone(), msg).await {
            self.rpc_waiters.lock().remove(&correlation_id);
            return Err(e);
        }

        let result = tokio::select! {
            _ = notify.notified() => {
                self.rpc_responses.lock().remove(&correlation_id)
                    .ok_or_else(|| Error::Other("RPC waiter notified without a stored response".to_string()))
            }
            _ = tokio::time::sleep(timeout) => {
                Err(Error::Timeout(format!("no response to {correlation_id} within {timeout:?}")))
            }
            _ = ctx.cancelled() => {
                Err(Error::Cancelled("send_and_receive cancelled".to_string()))
            }
        };

        self.rpc_waiters.lock().remove(&correlation_id);
        result
    }

    /// Resolved per spec §9's open question: a direct waiter instead of
    /// polling queue depth. `timeout` and `ctx` cancellation race
    /// independently, as in `send_and_receive`, so callers can tell "no ack
    /// within `timeout`" (`Error::Timeout`) apart from "the caller cancelled
    /// `ctx`" (`Error::Cancelled`) instead of both surfacing identically.
    pub async fn wait_for_ack(&self, ctx: CancellationToken, msg_id: &str, timeout: Duration) -> Result<()> {
        if self.is_acked(ctx.clone(), msg_id).await? {
            return Ok(());
        }
        let notify = {
            let mut waiters = self.ack_waiters.lock();
            Arc::clone(waiters.entry(msg_id.to_string()).or_insert_with(|| Arc::new(Notify::new())))
        };
        let result = tokio::select! {
            _ = notify.notified() => Ok(()),
            _ = tokio::time::sleep(timeout) => {
                Err(Error::Timeout(format!("{msg_id} was not acknowledged within {timeout:?}")))
            }
            _ = ctx.cancelled() => {
                Err(Error::Cancelled("wait_for_ack cancelled".to_string()))
            }
        };
        self.ack_waiters.lock().remove(msg_id);
        result
    }

    async fn is_acked(&self, ctx: CancellationToken, msg_id: &str) -> Result<bool> {
        let pool = self.pool.clone();
        let id = msg_id.to_string();
        run_blocking(ctx, move || {
            let conn = pool
                .get()
                .map_err(|e| Error::persistence("acquiring queue store connection", e))?;
            let status: Option<String> = conn
                .query_row(
                    "SELECT status FROM queue_messages WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| Error::persistence("checking queue message status", e))?;
            Ok(status.as_deref() == Some("acked"))
        })
        .await
    }
}

type RowFields = (
    String,
    String,
    String,
    String,
    String,
    String,
    u8,
    String,
    Option<String>,
    u32,
    u32,
    Option<String>,
);

fn row_to_fields(row: &rusqlite::Row) -> rusqlite::Result<RowFields> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
    ))
}

fn fields_to_message(fields: RowFields, status: QueueStatus) -> Result<QueueMessage> {
    let (id, from_agent, to_agent, message_type, payload_json, metadata_json, priority, enqueued_at, expires_at, max_retries, attempt, in_reply_to) = fields;
    let payload: Payload = serde_json::from_str(&payload_json)
        .map_err(|e| Error::Other(format!("deserializing queue payload: {e}")))?;
    let metadata: HashMap<String, String> = serde_json::from_str(&metadata_json)
        .map_err(|e| Error::Other(format!("deserializing queue metadata: {e}")))?;
    Ok(QueueMessage {
        id,
        from_agent,
        to_agent,
        message_type,
        payload,
        metadata,
        priority,
        enqueued_at: parse_timestamp(&enqueued_at)?,
        expires_at: expires_at.map(|s| parse_timestamp(&s)).transpose()?,
        max_retries,
        attempt,
        status,
        in_reply_to,
    })
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Other(format!("parsing stored timestamp {raw}: {e}")))
}

fn apply_schema(conn: &rusqlite::Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS queue_messages (
            id TEXT PRIMARY KEY,
            from_agent TEXT NOT NULL,
            to_agent TEXT NOT NULL,
            message_type TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            metadata_json TEXT NOT NULL,
            priority INTEGER NOT NULL,
            enqueued_at TEXT NOT NULL,
            expires_at TEXT,
            max_retries INTEGER NOT NULL,
            attempt INTEGER NOT NULL,
            status TEXT NOT NULL,
            in_reply_to TEXT,
            visibility_deadline TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_queue_recipient_status
            ON queue_messages(to_agent, status, priority, enqueued_at);",
    )
    .map_err(|e| Error::persistence("applying queue store schema", e))
}

async fn run_blocking<T, F>(ctx: CancellationToken, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::select! {
        res = tokio::task::spawn_blocking(f) => {
            res.map_err(|e| Error::persistence("queue store blocking task panicked", e))?
        }
        _ = ctx.cancelled() => Err(Error::Cancelled("queue store operation cancelled".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::model::PayloadMetadata;

    fn ctx() -> CancellationToken {
        CancellationToken::new()
    }

    fn queue() -> Arc<MessageQueue> {
        MessageQueue::new_in_memory(Duration::from_millis(200), 3).unwrap()
    }

    fn msg(id: &str, to: &str, priority: u8, enqueued_at: DateTime<Utc>) -> QueueMessage {
        QueueMessage {
            id: id.to_string(),
            from_agent: "sender".to_string(),
            to_agent: to.to_string(),
            message_type: "tool_result".to_string(),
            payload: Payload::Inline {
                bytes: vec![1, 2, 3],
                metadata: PayloadMetadata::default(),
            },
            metadata: HashMap::new(),
            priority,
            enqueued_at,
            expires_at: None,
            max_retries: 3,
            attempt: 0,
            status: QueueStatus::Pending,
            in_reply_to: None,
        }
    }

    #[tokio::test]
    async fn dequeue_returns_none_when_empty() {
        let q = queue();
        assert!(q.dequeue(ctx(), "X").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn queue_priority_then_fifo_within_priority() {
        let q = queue();
        let t0 = Utc::now();
        q.enqueue(ctx(), msg("m1", "X", 0, t0)).await.unwrap();
        q.enqueue(ctx(), msg("m2", "X", 5, t0 + chrono::Duration::milliseconds(1)))
            .await
            .unwrap();
        q.enqueue(ctx(), msg("m3", "X", 0, t0 + chrono::Duration::milliseconds(2)))
            .await
            .unwrap();

        let first = q.dequeue(ctx(), "X").await.unwrap().unwrap();
        let second = q.dequeue(ctx(), "X").await.unwrap().unwrap();
        let third = q.dequeue(ctx(), "X").await.unwrap().unwrap();
        assert_eq!(first.id, "m2");
        assert_eq!(second.id, "m1");
        assert_eq!(third.id, "m3");
    }

    #[tokio::test]
    async fn acknowledge_transitions_to_acked() {
        let q = queue();
        q.enqueue(ctx(), msg("m1", "X", 0, Utc::now())).await.unwrap();
        q.dequeue(ctx(), "X").await.unwrap();
        q.acknowledge(ctx(), "m1").await.unwrap();
        assert!(q.is_acked(ctx(), "m1").await.unwrap());
    }

    #[tokio::test]
    async fn nack_restores_pending_until_retries_exhausted() {
        let q = queue();
        let mut m = msg("m1", "X", 0, Utc::now());
        m.max_retries = 1;
        q.enqueue(ctx(), m).await.unwrap();

        q.dequeue(ctx(), "X").await.unwrap();
        q.nack(ctx(), "m1").await.unwrap();
        let redelivered = q.dequeue(ctx(), "X").await.unwrap();
        assert!(redelivered.is_some());

        q.nack(ctx(), "m1").await.unwrap();
        assert!(q.dequeue(ctx(), "X").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_pending_messages_are_skipped_and_dead_lettered() {
        let q = queue();
        let mut m = msg("m1", "X", 0, Utc::now() - chrono::Duration::seconds(10));
        m.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        q.enqueue(ctx(), m).await.unwrap();
        assert!(q.dequeue(ctx(), "X").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn send_and_receive_times_out_without_a_responder() {
        let q = queue();
        let start = std::time::Instant::now();
        let result = q
            .send_and_receive(
                ctx(),
                "a",
                "b",
                "rpc",
                Payload::Inline {
                    bytes: vec![],
                    metadata: PayloadMetadata::default(),
                },
                HashMap::new(),
                Duration::from_millis(100),
            )
            .await;
        let elapsed = start.elapsed();
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(elapsed >= Duration::from_millis(90) && elapsed < Duration::from_millis(300));
    }

    #[tokio::test]
    async fn a_reply_to_an_unknown_correlation_id_is_discarded_not_persisted() {
        let q = queue();
        q.enqueue(
            ctx(),
            QueueMessage {
                id: "late-reply".to_string(),
                from_agent: "b".to_string(),
                to_agent: "a".to_string(),
                message_type: "rpc".to_string(),
                payload: Payload::Inline {
                    bytes: b"too late".to_vec(),
                    metadata: PayloadMetadata::default(),
                },
                metadata: HashMap::new(),
                priority: 5,
                enqueued_at: Utc::now(),
                expires_at: None,
                max_retries: 0,
                attempt: 0,
                status: QueueStatus::Pending,
                in_reply_to: Some("no-such-waiter".to_string()),
            },
        )
        .await
        .unwrap();

        assert!(q.dequeue(ctx(), "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn send_and_receive_resolves_on_matching_reply() {
        let q = queue();
        let q2 = Arc::clone(&q);

        let responder = tokio::spawn(async move {
            loop {
                if let Some(req) = q2.dequeue(ctx(), "b").await.unwrap() {
                    let reply = QueueMessage {
                        id: "reply-1".to_string(),
                        from_agent: "b".to_string(),
                        to_agent: "a".to_string(),
                        message_type: "rpc".to_string(),
                        payload: Payload::Inline {
                            bytes: b"pong".to_vec(),
                            metadata: PayloadMetadata::default(),
                        },
                        metadata: HashMap::new(),
                        priority: 5,
                        enqueued_at: Utc::now(),
                        expires_at: None,
                        max_retries: 0,
                        attempt: 0,
                        status: QueueStatus::Pending,
                        in_reply_to: Some(req.id),
                    };
                    q2.enqueue(ctx(), reply).await.unwrap();
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let response = q
            .send_and_receive(
                ctx(),
                "a",
                "b",
                "rpc",
                Payload::Inline {
                    bytes: b"ping".to_vec(),
                    metadata: PayloadMetadata::default(),
                },
                HashMap::new(),
                Duration::from_millis(500),
            )
            .await
            .unwrap();

        responder.await.unwrap();
        match response {
            Payload::Inline { bytes, .. } => assert_eq!(bytes, b"pong"),
            Payload::Reference { .. } => panic!("expected inline response"),
        }
    }

    #[tokio::test]
    async fn wait_for_ack_resolves_when_acknowledged() {
        let q = queue();
        q.enqueue(ctx(), msg("m1", "X", 0, Utc::now())).await.unwrap();
        q.dequeue(ctx(), "X").await.unwrap();

        let q2 = Arc::clone(&q);
        let waiter = tokio::spawn(async move {
            q2.wait_for_ack(ctx(), "m1", Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.acknowledge(ctx(), "m1").await.unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wait_for_ack_times_out_without_an_acknowledgement() {
        let q = queue();
        q.enqueue(ctx(), msg("m1", "X", 0, Utc::now())).await.unwrap();
        q.dequeue(ctx(), "X").await.unwrap();

        let result = q.wait_for_ack(ctx(), "m1", Duration::from_millis(20)).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn wait_for_ack_returns_cancelled_on_cancellation() {
        let q = queue();
        q.enqueue(ctx(), msg("m1", "X", 0, Utc::now())).await.unwrap();
        q.dequeue(ctx(), "X").await.unwrap();

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let q2 = Arc::clone(&q);
        let waiter = tokio::spawn(async move {
            q2.wait_for_ack(cancel_clone, "m1", Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        assert!(matches!(waiter.await.unwrap(), Err(Error::Cancelled(_))));
    }
}
