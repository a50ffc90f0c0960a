//! Process-resident façade over the Session Store (spec §4.4). Caches one
//! [`SessionHandle`] per session behind a reader-writer lock over the
//! session map; observer dispatch runs on a dedicated `tokio::task` fed by
//! an unbounded channel, the same "dispatch task fed by a channel, errors
//! logged and swallowed" shape the teacher uses for its provider
//! transports (`sa-memory::create_provider` callers never block on a
//! transport's internal retries).

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sa_contextpack::{Compressor, HeuristicCompressor};
use sa_domain::error::{Error, Result};
use sa_domain::model::{Message, Session};
use sa_sessions::SessionStore;

use crate::handle::SessionHandle;

/// Observer callback registered via [`Memory::register_observer`]. Invoked
/// with `(agent_id, session_id, message)` on every append to a session
/// owned by that agent.
pub type ObserverFn = Arc<dyn Fn(&str, &str, &Message) + Send + Sync>;

struct DispatchEvent {
    agent_id: String,
    session_id: String,
    message: Message,
}

pub struct Memory {
    store: Arc<SessionStore>,
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    observers: RwLock<HashMap<String, Vec<ObserverFn>>>,
    dispatch_tx: mpsc::UnboundedSender<DispatchEvent>,
    compressor: Arc<dyn Compressor>,
}

impl Memory {
    /// Build the façade over `store` and spawn its observer dispatch task.
    /// `cancel` stops the dispatch task when the process shuts down.
    /// `compressor` backs [`Memory::compact_session_view`]; the real
    /// conversation compressor is an external collaborator (spec §1), so
    /// `None` falls back to [`HeuristicCompressor`].
    pub fn new(
        store: Arc<SessionStore>,
        cancel: CancellationToken,
        compressor: Option<Arc<dyn Compressor>>,
    ) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<DispatchEvent>();
        let memory = Arc::new(Self {
            store,
            sessions: RwLock::new(HashMap::new()),
            observers: RwLock::new(HashMap::new()),
            dispatch_tx: tx,
            compressor: compressor.unwrap_or_else(|| Arc::new(HeuristicCompressor)),
        });

        let dispatch_observers = Arc::clone(&memory);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => {
                        let Some(event) = event else { break };
                        dispatch_observers.dispatch(event);
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });

        memory
    }

    fn dispatch(&self, event: DispatchEvent) {
        let observers = {
            let observers = self.observers.read();
            observers.get(&event.agent_id).cloned().unwrap_or_default()
        };
        for observer in observers {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                observer(&event.agent_id, &event.session_id, &event.message);
            }));
            if let Err(panic) = result {
                tracing::warn!(
                    agent_id = %event.agent_id,
                    session_id = %event.session_id,
                    ?panic,
                    "memory observer panicked; delivery swallowed"
                );
            }
        }
    }

    /// Register `observer` to be notified on every future append to a
    /// session owned by `agent_id`. Delivery is at-least-once per
    /// registration and never blocks the caller of `add_message`.
    pub fn register_observer(&self, agent_id: impl Into<String>, observer: ObserverFn) {
        self.observers
            .write()
            .entry(agent_id.into())
            .or_default()
            .push(observer);
    }

    /// Return the cached handle for `session_id`, creating and persisting
    /// a new session under `agent_id` if it doesn't exist yet.
    pub async fn get_or_create_session_with_agent(
        &self,
        ctx: CancellationToken,
        session_id: &str,
        agent_id: &str,
        parent_session_id: Option<&str>,
    ) -> Result<Arc<SessionHandle>> {
        if let Some(handle) = self.sessions.read().get(session_id).cloned() {
            return Ok(handle);
        }

        if let Some(session) = self.store.load_session(ctx.clone(), session_id).await? {
            let messages = self.store.load_messages(ctx, session_id).await?;
            let handle = Arc::new(SessionHandle::new(session, messages));
            self.sessions
                .write()
                .insert(session_id.to_string(), Arc::clone(&handle));
            return Ok(handle);
        }

        let mut session = Session::new(session_id, agent_id);
        if let Some(parent) = parent_session_id {
            session = session.with_parent(parent);
        }
        self.store.save_session(ctx, &session).await?;

        let handle = Arc::new(SessionHandle::new(session, Vec::new()));
        self.sessions
            .write()
            .insert(session_id.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    /// `get_or_create_session_with_agent` with `session_id` doubling as the
    /// owning agent id and no parent — the common case of a top-level
    /// session.
    pub async fn get_or_create_session(
        &self,
        ctx: CancellationToken,
        session_id: &str,
    ) -> Result<Arc<SessionHandle>> {
        self.get_or_create_session_with_agent(ctx, session_id, session_id, None)
            .await
    }

    /// Append `message` to the cached handle, persist it, then notify
    /// observers registered for the session's owning agent. Observer
    /// dispatch is asynchronous and never blocks this call.
    pub async fn add_message(&self, ctx: CancellationToken, message: Message) -> Result<Message> {
        let session_id = message.session_id.clone();
        let handle = self
            .sessions
            .read()
            .get(&session_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;

        let saved = self.store.append_message(ctx.clone(), &message).await?;
        let updated_session = handle.push(saved.clone(), saved.token_count, saved.cost);
        self.store.save_session(ctx, &updated_session).await?;

        let _ = self.dispatch_tx.send(DispatchEvent {
            agent_id: updated_session.agent_id,
            session_id,
            message: saved.clone(),
        });

        Ok(saved)
    }

    /// Snapshot of every session currently cached in this process.
    pub fn list_sessions(&self) -> Vec<Session> {
        self.sessions.read().values().map(|h| h.session()).collect()
    }

    pub fn count_sessions(&self) -> usize {
        self.sessions.read().len()
    }

    /// Run each cached message's content for `session_id` through the
    /// configured [`Compressor`], bounding it to roughly `target_chars`.
    /// Read-only: returns a compacted copy for feeding a context-limited
    /// caller (e.g. the chat capability) without touching stored history.
    pub fn compact_session_view(&self, session_id: &str, target_chars: usize) -> Result<Vec<Message>> {
        let handle = self
            .sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;

        Ok(handle
            .messages()
            .into_iter()
            .map(|mut message| {
                let (compacted, _) = self.compressor.compress(&message.content, target_chars);
                message.content = compacted;
                message
            })
            .collect())
    }

    /// Evict `session_id` from the cache and delete it from the store.
    pub async fn delete_session(&self, ctx: CancellationToken, session_id: &str) -> Result<()> {
        self.sessions.write().remove(session_id);
        self.store.delete_session(ctx, session_id).await
    }

    /// Delete every session currently cached in this process, both from
    /// the cache and from the underlying store.
    pub async fn clear_all(&self, ctx: CancellationToken) -> Result<()> {
        let ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        for id in ids {
            self.delete_session(ctx.clone(), &id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use sa_domain::model::{MessageRole, SessionContext};
    use sa_sessions::SessionStore;

    use super::*;

    fn ctx() -> CancellationToken {
        CancellationToken::new()
    }

    async fn memory() -> Arc<Memory> {
        let store = SessionStore::new_in_memory().unwrap();
        Memory::new(store, CancellationToken::new(), None)
    }

    #[tokio::test]
    async fn get_or_create_persists_on_first_call_and_caches_on_second() {
        let memory = memory().await;
        let first = memory.get_or_create_session(ctx(), "s1").await.unwrap();
        assert_eq!(first.session().agent_id, "s1");

        let second = memory.get_or_create_session(ctx(), "s1").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn add_message_appends_and_persists() {
        let memory = memory().await;
        memory
            .get_or_create_session_with_agent(ctx(), "s1", "agent-1", None)
            .await
            .unwrap();

        let msg = Message::new("s1", MessageRole::User, "hello", SessionContext::Direct);
        memory.add_message(ctx(), msg).await.unwrap();

        let handle = memory.get_or_create_session(ctx(), "s1").await.unwrap();
        assert_eq!(handle.messages().len(), 1);
        assert_eq!(handle.messages()[0].content, "hello");
    }

    #[tokio::test]
    async fn registered_observer_sees_every_append_for_its_agent() {
        let memory = memory().await;
        memory
            .get_or_create_session_with_agent(ctx(), "s1", "agent-1", None)
            .await
            .unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        memory.register_observer(
            "agent-1",
            Arc::new(move |agent_id: &str, session_id: &str, message: &Message| {
                assert_eq!(agent_id, "agent-1");
                assert_eq!(session_id, "s1");
                assert_eq!(message.content, "hi");
                seen_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        memory
            .add_message(
                ctx(),
                Message::new("s1", MessageRole::User, "hi", SessionContext::Direct),
            )
            .await
            .unwrap();

        for _ in 0..50 {
            if seen.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn delete_session_removes_from_cache_and_store() {
        let memory = memory().await;
        memory.get_or_create_session(ctx(), "s1").await.unwrap();
        memory.delete_session(ctx(), "s1").await.unwrap();
        assert_eq!(memory.count_sessions(), 0);

        let reloaded = memory.get_or_create_session(ctx(), "s1").await.unwrap();
        assert!(reloaded.messages().is_empty());
    }

    #[tokio::test]
    async fn clear_all_empties_the_cache() {
        let memory = memory().await;
        memory.get_or_create_session(ctx(), "s1").await.unwrap();
        memory.get_or_create_session(ctx(), "s2").await.unwrap();
        assert_eq!(memory.count_sessions(), 2);

        memory.clear_all(ctx()).await.unwrap();
        assert_eq!(memory.count_sessions(), 0);
    }

    #[tokio::test]
    async fn compact_session_view_truncates_without_touching_the_cache() {
        let memory = memory().await;
        memory
            .get_or_create_session_with_agent(ctx(), "s1", "agent-1", None)
            .await
            .unwrap();
        let long = "x".repeat(1000);
        memory
            .add_message(ctx(), Message::new("s1", MessageRole::User, &long, SessionContext::Direct))
            .await
            .unwrap();

        let compacted = memory.compact_session_view("s1", 10).unwrap();
        assert_eq!(compacted.len(), 1);
        assert!(compacted[0].content.len() < long.len());

        let handle = memory.get_or_create_session(ctx(), "s1").await.unwrap();
        assert_eq!(handle.messages()[0].content, long);
    }
}
