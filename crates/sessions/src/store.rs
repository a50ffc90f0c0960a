//! Durable, record-oriented store of sessions and messages (spec §4.3).
//! Backed by `rusqlite` under WAL journaling, pooled via `r2d2` for
//! multi-reader access; blocking calls are dispatched through
//! `tokio::task::spawn_blocking` so async call sites never block the
//! executor.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use tokio_util::sync::CancellationToken;

use sa_domain::config::SessionStoreConfig;
use sa_domain::error::{Error, Result};
use sa_domain::model::{Message, MessageRole, Session, SessionContext, SessionTotals, ToolCall};
use sa_domain::trace::TraceEvent;

type Pool = r2d2::Pool<SqliteConnectionManager>;
type DeletionHook = Box<dyn Fn(&str) + Send + Sync>;

/// Durable session/message store. Construct once per process and share via
/// `Arc`; the connection pool handles multi-reader concurrency, and SQLite
/// serializes writers per the usual WAL single-writer rule.
pub struct SessionStore {
    pool: Pool,
    deletion_hooks: Mutex<Vec<DeletionHook>>,
}

impl SessionStore {
    /// Open (and if necessary create) the database at `config.db_path`,
    /// enable WAL journaling, and idempotently apply the schema.
    pub fn new(config: &SessionStoreConfig) -> Result<Arc<Self>> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent).map_err(Error::Io)?;
        }

        let manager = SqliteConnectionManager::file(&config.db_path).with_init(|conn| {
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
        });
        let pool = r2d2::Pool::builder()
            .max_size(config.pool_size)
            .build(manager)
            .map_err(|e| Error::persistence("opening session store pool", e))?;

        {
            let conn = pool
                .get()
                .map_err(|e| Error::persistence("acquiring session store connection", e))?;
            apply_schema(&conn)?;
        }

        tracing::info!(path = %config.db_path.display(), "session store opened");

        Ok(Arc::new(Self {
            pool,
            deletion_hooks: Mutex::new(Vec::new()),
        }))
    }

    /// In-memory store: no file ever touches disk. Handy for tests and
    /// for embedding a session store in a process that never restarts.
    pub fn new_in_memory() -> Result<Arc<Self>> {
        let manager = SqliteConnectionManager::memory();
        let pool = r2d2::Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| Error::persistence("opening in-memory session store pool", e))?;
        {
            let conn = pool
                .get()
                .map_err(|e| Error::persistence("acquiring session store connection", e))?;
            apply_schema(&conn)?;
        }
        Ok(Arc::new(Self {
            pool,
            deletion_hooks: Mutex::new(Vec::new()),
        }))
    }

    /// Register a hook invoked synchronously, before `delete_session`
    /// returns, for every session it successfully deletes. The Reference
    /// Tracker registers here to guarantee references are unpinned before
    /// downstream queries observe the session's absence.
    pub fn register_deletion_hook(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        self.deletion_hooks.lock().push(Box::new(hook));
    }

    pub async fn save_session(&self, ctx: CancellationToken, session: &Session) -> Result<()> {
        let pool = self.pool.clone();
        let session = session.clone();
        run_blocking(ctx, move || {
            let conn = pool
                .get()
                .map_err(|e| Error::persistence("acquiring session store connection", e))?;

            if let Some(parent_id) = &session.parent_session_id {
                let exists: bool = conn
                    .query_row(
                        "SELECT EXISTS(SELECT 1 FROM sessions WHERE id = ?1)",
                        params![parent_id],
                        |row| row.get(0),
                    )
                    .map_err(|e| Error::persistence("checking parent session existence", e))?;
                if !exists {
                    return Err(Error::InvalidArgument(format!(
                        "parent_session_id {parent_id} does not refer to an existing session"
                    )));
                }
                if parent_id == &session.id {
                    return Err(Error::InvalidArgument(
                        "a session cannot be its own parent".to_string(),
                    ));
                }
            }

            let totals_json = serde_json::to_string(&session.totals)
                .map_err(|e| Error::Other(format!("serializing session totals: {e}")))?;
            let context_json = serde_json::to_string(&session.context)
                .map_err(|e| Error::Other(format!("serializing session context: {e}")))?;

            conn.execute(
                "INSERT INTO sessions (id, agent_id, parent_session_id, created_at, updated_at, totals_json, context_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    agent_id = excluded.agent_id,
                    updated_at = excluded.updated_at,
                    totals_json = excluded.totals_json,
                    context_json = excluded.context_json",
                params![
                    session.id,
                    session.agent_id,
                    session.parent_session_id,
                    session.created_at.to_rfc3339(),
                    session.updated_at.to_rfc3339(),
                    totals_json,
                    context_json,
                ],
            )
            .map_err(|e| Error::persistence("saving session", e))?;

            TraceEvent::SessionCreated {
                session_id: session.id.clone(),
                agent_id: session.agent_id.clone(),
                parent_session_id: session.parent_session_id.clone(),
            }
            .emit();

            Ok(())
        })
        .await
    }

    pub async fn load_session(&self, ctx: CancellationToken, session_id: &str) -> Result<Option<Session>> {
        let pool = self.pool.clone();
        let session_id = session_id.to_string();
        run_blocking(ctx, move || {
            let conn = pool
                .get()
                .map_err(|e| Error::persistence("acquiring session store connection", e))?;
            load_session_row(&conn, &session_id)
        })
        .await
    }

    pub async fn delete_session(&self, ctx: CancellationToken, session_id: &str) -> Result<()> {
        let pool = self.pool.clone();
        let sid = session_id.to_string();
        run_blocking(ctx, move || {
            let conn = pool
                .get()
                .map_err(|e| Error::persistence("acquiring session store connection", e))?;
            conn.execute("DELETE FROM messages WHERE session_id = ?1", params![sid])
                .map_err(|e| Error::persistence("deleting session messages", e))?;
            let deleted = conn
                .execute("DELETE FROM sessions WHERE id = ?1", params![sid])
                .map_err(|e| Error::persistence("deleting session", e))?;
            if deleted == 0 {
                return Err(Error::NotFound(format!("session {sid}")));
            }
            Ok(())
        })
        .await?;

        for hook in self.deletion_hooks.lock().iter() {
            hook(session_id);
        }
        TraceEvent::SessionDeleted {
            session_id: session_id.to_string(),
        }
        .emit();
        Ok(())
    }

    pub async fn load_agent_sessions(&self, ctx: CancellationToken, agent_id: &str) -> Result<Vec<String>> {
        let pool = self.pool.clone();
        let agent_id = agent_id.to_string();
        run_blocking(ctx, move || {
            let conn = pool
                .get()
                .map_err(|e| Error::persistence("acquiring session store connection", e))?;
            let mut stmt = conn
                .prepare("SELECT id FROM sessions WHERE agent_id = ?1 ORDER BY created_at ASC")
                .map_err(|e| Error::persistence("preparing agent session query", e))?;
            let ids = stmt
                .query_map(params![agent_id], |row| row.get::<_, String>(0))
                .map_err(|e| Error::persistence("querying agent sessions", e))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::persistence("reading agent sessions", e))?;
            Ok(ids)
        })
        .await
    }

    pub async fn append_message(&self, ctx: CancellationToken, message: &Message) -> Result<Message> {
        let pool = self.pool.clone();
        let mut message = message.clone();
        run_blocking(ctx, move || {
            let conn = pool
                .get()
                .map_err(|e| Error::persistence("acquiring session store connection", e))?;

            let tool_calls_json = serde_json::to_string(&message.tool_calls)
                .map_err(|e| Error::Other(format!("serializing tool calls: {e}")))?;

            conn.execute(
                "INSERT INTO messages (session_id, role, content, timestamp, token_count, cost, tool_calls_json, session_context)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    message.session_id,
                    role_to_str(message.role),
                    message.content,
                    message.timestamp.to_rfc3339(),
                    message.token_count,
                    message.cost,
                    tool_calls_json,
                    context_to_str(message.session_context),
                ],
            )
            .map_err(|e| Error::persistence("appending message", e))?;

            message.id = conn.last_insert_rowid();

            TraceEvent::MessageAppended {
                session_id: message.session_id.clone(),
                message_id: message.id,
                role: role_to_str(message.role).to_string(),
            }
            .emit();

            Ok(message)
        })
        .await
    }

    pub async fn load_messages(&self, ctx: CancellationToken, session_id: &str) -> Result<Vec<Message>> {
        let pool = self.pool.clone();
        let session_id = session_id.to_string();
        run_blocking(ctx, move || {
            let conn = pool
                .get()
                .map_err(|e| Error::persistence("acquiring session store connection", e))?;
            load_messages_for_session(&conn, &session_id)
        })
        .await
    }

    /// Messages of the parent session whose `session_context` is
    /// `Coordinator` or `Shared`, ordered by timestamp.
    pub async fn load_messages_from_parent_session(
        &self,
        ctx: CancellationToken,
        child_session_id: &str,
    ) -> Result<Vec<Message>> {
        let pool = self.pool.clone();
        let child_session_id = child_session_id.to_string();
        run_blocking(ctx, move || {
            let conn = pool
                .get()
                .map_err(|e| Error::persistence("acquiring session store connection", e))?;
            let Some(session) = load_session_row(&conn, &child_session_id)? else {
                return Err(Error::NotFound(format!("session {child_session_id}")));
            };
            let Some(parent_id) = session.parent_session_id else {
                return Ok(Vec::new());
            };
            let all = load_messages_for_session(&conn, &parent_id)?;
            Ok(all
                .into_iter()
                .filter(|m| m.session_context.crosses_session_boundary())
                .collect())
        })
        .await
    }

    /// For every session owned by `agent_id`: the union of (a) its parent's
    /// cross-boundary messages, (b) its own messages; merged ascending by
    /// timestamp across every owned session.
    pub async fn load_messages_for_agent(&self, ctx: CancellationToken, agent_id: &str) -> Result<Vec<Message>> {
        let pool = self.pool.clone();
        let agent_id = agent_id.to_string();
        run_blocking(ctx, move || {
            let conn = pool
                .get()
                .map_err(|e| Error::persistence("acquiring session store connection", e))?;

            let mut stmt = conn
                .prepare("SELECT id FROM sessions WHERE agent_id = ?1")
                .map_err(|e| Error::persistence("preparing agent session query", e))?;
            let session_ids: Vec<String> = stmt
                .query_map(params![agent_id], |row| row.get::<_, String>(0))
                .map_err(|e| Error::persistence("querying agent sessions", e))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::persistence("reading agent sessions", e))?;

            let mut combined = Vec::new();
            for session_id in session_ids {
                let Some(session) = load_session_row(&conn, &session_id)? else {
                    continue;
                };
                if let Some(parent_id) = &session.parent_session_id {
                    let parent_messages = load_messages_for_session(&conn, parent_id)?;
                    combined.extend(
                        parent_messages
                            .into_iter()
                            .filter(|m| m.session_context.crosses_session_boundary()),
                    );
                }
                combined.extend(load_messages_for_session(&conn, &session_id)?);
            }
            combined.sort_by_key(|m| m.timestamp);
            Ok(combined)
        })
        .await
    }
}

fn apply_schema(conn: &rusqlite::Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            agent_id TEXT NOT NULL,
            parent_session_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            totals_json TEXT NOT NULL,
            context_json TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_agent_id ON sessions(agent_id);
        CREATE INDEX IF NOT EXISTS idx_sessions_parent ON sessions(parent_session_id);

        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            token_count INTEGER NOT NULL,
            cost REAL NOT NULL,
            tool_calls_json TEXT NOT NULL,
            session_context TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_session_id ON messages(session_id);
        CREATE INDEX IF NOT EXISTS idx_messages_session_timestamp ON messages(session_id, timestamp);",
    )
    .map_err(|e| Error::persistence("applying session store schema", e))
}

fn load_session_row(conn: &rusqlite::Connection, session_id: &str) -> Result<Option<Session>> {
    conn.query_row(
        "SELECT id, agent_id, parent_session_id, created_at, updated_at, totals_json, context_json
         FROM sessions WHERE id = ?1",
        params![session_id],
        |row| {
            let id: String = row.get(0)?;
            let agent_id: String = row.get(1)?;
            let parent_session_id: Option<String> = row.get(2)?;
            let created_at: String = row.get(3)?;
            let updated_at: String = row.get(4)?;
            let totals_json: String = row.get(5)?;
            let context_json: String = row.get(6)?;
            Ok((id, agent_id, parent_session_id, created_at, updated_at, totals_json, context_json))
        },
    )
    .optional()
    .map_err(|e| Error::persistence("loading session", e))?
    .map(|(id, agent_id, parent_session_id, created_at, updated_at, totals_json, context_json)| {
        let totals: SessionTotals = serde_json::from_str(&totals_json)
            .map_err(|e| Error::Other(format!("deserializing session totals: {e}")))?;
        let context = serde_json::from_str(&context_json)
            .map_err(|e| Error::Other(format!("deserializing session context: {e}")))?;
        Ok(Session {
            id,
            agent_id,
            parent_session_id,
            created_at: parse_timestamp(&created_at)?,
            updated_at: parse_timestamp(&updated_at)?,
            totals,
            context,
        })
    })
    .transpose()
}

fn load_messages_for_session(conn: &rusqlite::Connection, session_id: &str) -> Result<Vec<Message>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, session_id, role, content, timestamp, token_count, cost, tool_calls_json, session_context
             FROM messages WHERE session_id = ?1 ORDER BY id ASC",
        )
        .map_err(|e| Error::persistence("preparing message query", e))?;

    let rows = stmt
        .query_map(params![session_id], |row| {
            let id: i64 = row.get(0)?;
            let session_id: String = row.get(1)?;
            let role: String = row.get(2)?;
            let content: String = row.get(3)?;
            let timestamp: String = row.get(4)?;
            let token_count: i64 = row.get(5)?;
            let cost: f64 = row.get(6)?;
            let tool_calls_json: String = row.get(7)?;
            let session_context: String = row.get(8)?;
            Ok((id, session_id, role, content, timestamp, token_count, cost, tool_calls_json, session_context))
        })
        .map_err(|e| Error::persistence("querying messages", e))?;

    let mut messages = Vec::new();
    for row in rows {
        let (id, session_id, role, content, timestamp, token_count, cost, tool_calls_json, session_context) =
            row.map_err(|e| Error::persistence("reading message row", e))?;
        let tool_calls: Vec<ToolCall> = serde_json::from_str(&tool_calls_json)
            .map_err(|e| Error::Other(format!("deserializing tool calls: {e}")))?;
        messages.push(Message {
            id,
            session_id,
            role: role_from_str(&role)?,
            content,
            timestamp: parse_timestamp(&timestamp)?,
            token_count: token_count as u64,
            cost,
            tool_calls,
            session_context: context_from_str(&session_context)?,
        });
    }
    Ok(messages)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Other(format!("parsing stored timestamp {raw}: {e}")))
}

fn role_to_str(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::Tool => "tool",
        MessageRole::System => "system",
    }
}

fn role_from_str(s: &str) -> Result<MessageRole> {
    match s {
        "user" => Ok(MessageRole::User),
        "assistant" => Ok(MessageRole::Assistant),
        "tool" => Ok(MessageRole::Tool),
        "system" => Ok(MessageRole::System),
        other => Err(Error::Other(format!("unknown stored message role {other}"))),
    }
}

fn context_to_str(ctx: SessionContext) -> &'static str {
    match ctx {
        SessionContext::Coordinator => "coordinator",
        SessionContext::Direct => "direct",
        SessionContext::Shared => "shared",
    }
}

fn context_from_str(s: &str) -> Result<SessionContext> {
    match s {
        "coordinator" => Ok(SessionContext::Coordinator),
        "direct" => Ok(SessionContext::Direct),
        "shared" => Ok(SessionContext::Shared),
        other => Err(Error::Other(format!("unknown stored session_context {other}"))),
    }
}

async fn run_blocking<T, F>(ctx: CancellationToken, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::select! {
        res = tokio::task::spawn_blocking(f) => {
            res.map_err(|e| Error::persistence("session store blocking task panicked", e))?
        }
        _ = ctx.cancelled() => Err(Error::Cancelled("session store operation cancelled".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::ids::generate_id;

    fn ctx() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn save_and_load_session_roundtrips() {
        let store = SessionStore::new_in_memory().unwrap();
        let session = Session::new(generate_id("sess"), "agent-1");
        store.save_session(ctx(), &session).await.unwrap();
        let loaded = store.load_session(ctx(), &session.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.agent_id, "agent-1");
    }

    #[tokio::test]
    async fn save_session_rejects_missing_parent() {
        let store = SessionStore::new_in_memory().unwrap();
        let session = Session::new("child", "agent-1").with_parent("does-not-exist");
        let result = store.save_session(ctx(), &session).await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn append_message_assigns_monotonic_ids_in_order() {
        let store = SessionStore::new_in_memory().unwrap();
        let session = Session::new("s1", "agent-1");
        store.save_session(ctx(), &session).await.unwrap();

        let m1 = Message::new("s1", MessageRole::User, "first", SessionContext::Direct);
        let m2 = Message::new("s1", MessageRole::Assistant, "second", SessionContext::Direct);
        let saved1 = store.append_message(ctx(), &m1).await.unwrap();
        let saved2 = store.append_message(ctx(), &m2).await.unwrap();
        assert!(saved2.id > saved1.id);

        let loaded = store.load_messages(ctx(), "s1").await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].content, "first");
        assert_eq!(loaded[1].content, "second");
    }

    #[tokio::test]
    async fn cross_session_filter_returns_only_coordinator_and_shared() {
        let store = SessionStore::new_in_memory().unwrap();
        let parent = Session::new("coord", "coordinator");
        store.save_session(ctx(), &parent).await.unwrap();
        let child = Session::new("sub", "analyzer").with_parent("coord");
        store.save_session(ctx(), &child).await.unwrap();

        store.append_message(ctx(), &Message::new("coord", MessageRole::Assistant, "analyze", SessionContext::Coordinator)).await.unwrap();
        store.append_message(ctx(), &Message::new("coord", MessageRole::Assistant, "internal", SessionContext::Direct)).await.unwrap();
        store.append_message(ctx(), &Message::new("coord", MessageRole::Assistant, "delegating", SessionContext::Shared)).await.unwrap();

        let visible = store.load_messages_from_parent_session(ctx(), "sub").await.unwrap();
        let contents: Vec<&str> = visible.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["analyze", "delegating"]);
    }

    #[tokio::test]
    async fn multi_sub_agent_isolation() {
        let store = SessionStore::new_in_memory().unwrap();
        store.save_session(ctx(), &Session::new("P", "coordinator")).await.unwrap();
        store.append_message(ctx(), &Message::new("P", MessageRole::Assistant, "M0", SessionContext::Shared)).await.unwrap();
        store.save_session(ctx(), &Session::new("A", "analyzer").with_parent("P")).await.unwrap();
        store.save_session(ctx(), &Session::new("V", "validator").with_parent("P")).await.unwrap();
        store.append_message(ctx(), &Message::new("A", MessageRole::Assistant, "A's", SessionContext::Direct)).await.unwrap();
        store.append_message(ctx(), &Message::new("V", MessageRole::Assistant, "V's", SessionContext::Direct)).await.unwrap();

        let analyzer_view = store.load_messages_for_agent(ctx(), "analyzer").await.unwrap();
        let validator_view = store.load_messages_for_agent(ctx(), "validator").await.unwrap();

        let analyzer_contents: Vec<&str> = analyzer_view.iter().map(|m| m.content.as_str()).collect();
        let validator_contents: Vec<&str> = validator_view.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(analyzer_contents, vec!["M0", "A's"]);
        assert_eq!(validator_contents, vec!["M0", "V's"]);
    }

    #[tokio::test]
    async fn deletion_hook_runs_before_delete_returns() {
        let store = SessionStore::new_in_memory().unwrap();
        store.save_session(ctx(), &Session::new("s1", "agent-1")).await.unwrap();

        let called = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let called_clone = Arc::clone(&called);
        store.register_deletion_hook(move |session_id| {
            assert_eq!(session_id, "s1");
            called_clone.store(true, std::sync::atomic::Ordering::SeqCst);
        });

        store.delete_session(ctx(), "s1").await.unwrap();
        assert!(called.load(std::sync::atomic::Ordering::SeqCst));
        assert!(store.load_session(ctx(), "s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_writers_preserve_per_session_order() {
        let store = SessionStore::new_in_memory().unwrap();
        for i in 0..50 {
            store.save_session(ctx(), &Session::new(format!("s{i}"), "agent-1")).await.unwrap();
        }

        let mut handles = Vec::new();
        for i in 0..50 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                for n in 0..10 {
                    store
                        .append_message(
                            ctx(),
                            &Message::new(format!("s{i}"), MessageRole::User, format!("m{n}"), SessionContext::Direct),
                        )
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut total = 0;
        for i in 0..50 {
            let messages = store.load_messages(ctx(), &format!("s{i}")).await.unwrap();
            assert_eq!(messages.len(), 10);
            for (n, m) in messages.iter().enumerate() {
                assert_eq!(m.content, format!("m{n}"));
            }
            total += messages.len();
        }
        assert_eq!(total, 500);
    }
}
