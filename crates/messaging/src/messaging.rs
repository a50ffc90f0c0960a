//! Agent Messaging Layer (spec §4.6): the agent-facing send/receive API
//! that decides inline-vs-reference per message, builds the wire
//! envelope, and routes through the Message Queue when durability or
//! correlation is needed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use sa_domain::error::{Error, Result};
use sa_domain::ids;
use sa_domain::model::{Payload, PayloadMetadata, ReferencePointer, ReferenceType};
use sa_domain::trace::TraceEvent;
use sa_protocol::CommunicationMessage;
use sa_queue::{MessageQueue, QueueMessage, QueueStatus};
use sa_shared_memory::{ReferenceTracker, SharedMemoryStore};

use crate::policy::CommunicationPolicy;

/// Per-agent messaging handle. `session_id` is the sender's own session,
/// used to pin any payload the policy decides to store by reference.
pub struct AgentMessaging {
    agent_id: String,
    session_id: String,
    queue: Option<Arc<MessageQueue>>,
    shared_memory: Arc<SharedMemoryStore>,
    reference_tracker: Arc<ReferenceTracker>,
    policy: CommunicationPolicy,
}

impl AgentMessaging {
    pub fn new(
        agent_id: impl Into<String>,
        session_id: impl Into<String>,
        queue: Option<Arc<MessageQueue>>,
        shared_memory: Arc<SharedMemoryStore>,
        reference_tracker: Arc<ReferenceTracker>,
        policy: CommunicationPolicy,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            session_id: session_id.into(),
            queue,
            shared_memory,
            reference_tracker,
            policy,
        }
    }

    fn build_payload(&self, message_type: &str, data: &[u8]) -> Result<Payload> {
        let metadata = PayloadMetadata {
            size_bytes: data.len(),
            content_type: Some("application/json".to_string()),
            ..Default::default()
        };

        if !self.policy.should_use_reference(message_type, data.len()) {
            return Ok(Payload::Inline {
                bytes: data.to_vec(),
                metadata,
            });
        }

        let reference_id = ids::generate_id("ref");
        self.shared_memory
            .store(&reference_id, data, metadata.content_type.clone(), HashMap::new(), None)?;
        self.reference_tracker
            .pin_for_session(&self.session_id, &reference_id)?;
        Ok(Payload::Reference {
            reference: ReferencePointer {
                id: reference_id,
                reference_type: ReferenceType::infer(message_type),
                storage_hint: Some(message_type.to_string()),
            },
            metadata,
        })
    }

    /// Build the envelope for `to_agent`/`message_type`/`data`. Does not
    /// enqueue — callers that need durability use `send_async` or one of
    /// the RPC variants.
    pub fn send(&self, to_agent: &str, message_type: &str, data: &[u8]) -> Result<CommunicationMessage> {
        let payload = self.build_payload(message_type, data)?;
        let policy = self.policy.get_policy(message_type);
        Ok(CommunicationMessage::new(
            ids::generate_message_id(),
            self.agent_id.clone(),
            to_agent,
            message_type,
            payload,
            policy,
        ))
    }

    fn queue(&self) -> Result<&Arc<MessageQueue>> {
        self.queue
            .as_ref()
            .ok_or_else(|| Error::QueueUnavailable("no message queue configured".to_string()))
    }

    /// As `send`, then enqueue. Returns the enqueued message's id.
    pub async fn send_async(
        &self,
        ctx: CancellationToken,
        to_agent: &str,
        message_type: &str,
        data: &[u8],
    ) -> Result<String> {
        let started = Instant::now();
        let envelope = self.send(to_agent, message_type, data)?;
        let inline = matches!(envelope.payload, Payload::Inline { .. });
        let queue = self.queue()?;
        let queued = QueueMessage {
            id: envelope.id.clone(),
            from_agent: envelope.from_agent.clone(),
            to_agent: envelope.to_agent.clone(),
            message_type: envelope.message_type.clone(),
            payload: envelope.payload.clone(),
            metadata: HashMap::new(),
            priority: envelope.policy.priority,
            enqueued_at: envelope.timestamp,
            expires_at: None,
            max_retries: queue.default_max_retries(),
            attempt: 0,
            status: QueueStatus::Pending,
            in_reply_to: None,
        };
        queue.enqueue(ctx, queued).await?;

        TraceEvent::MessageSent {
            message_id: envelope.id.clone(),
            sender: envelope.from_agent,
            recipient: envelope.to_agent,
            message_type: envelope.message_type,
            inline,
            duration_ms: started.elapsed().as_millis() as u64,
        }
        .emit();
        Ok(envelope.id)
    }

    /// As `send`, routed through the queue's RPC correlation; resolves a
    /// reference response through the shared memory store before
    /// returning.
    pub async fn send_and_receive(
        &self,
        ctx: CancellationToken,
        to_agent: &str,
        message_type: &str,
        data: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let payload = self.build_payload(message_type, data)?;
        let queue = self.queue()?;
        let response = queue
            .send_and_receive(
                ctx,
                &self.agent_id,
                to_agent,
                message_type,
                payload,
                HashMap::new(),
                timeout,
            )
            .await?;
        self.resolve(&response)
    }

    /// Enqueue, then block until the message reaches `Acked` or `timeout`
    /// elapses. Fails with `Timeout` on expiry, or `Cancelled` if `ctx` is
    /// cancelled first — `wait_for_ack` races the two independently, so the
    /// two causes surface as distinct errors instead of both looking like a
    /// timeout.
    pub async fn send_with_ack(
        &self,
        ctx: CancellationToken,
        to_agent: &str,
        message_type: &str,
        data: &[u8],
        timeout: Duration,
    ) -> Result<String> {
        let message_id = self.send_async(ctx.clone(), to_agent, message_type, data).await?;
        let queue = self.queue()?;
        queue.wait_for_ack(ctx, &message_id, timeout).await?;
        Ok(message_id)
    }

    /// Poll-dequeue with a 100ms cadence, honouring `ctx` cancellation.
    /// Returns `None` on timeout.
    pub async fn receive_with_timeout(
        &self,
        ctx: CancellationToken,
        timeout: Duration,
    ) -> Result<Option<QueueMessage>> {
        let queue = self.queue()?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(msg) = queue.dequeue(ctx.clone(), &self.agent_id).await? {
                return Ok(Some(msg));
            }
            if ctx.is_cancelled() || tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                _ = ctx.cancelled() => return Ok(None),
            }
        }
    }

    /// Dispatch on `msg`'s payload variant, resolving a reference through
    /// the shared memory store.
    pub fn receive(&self, msg: &QueueMessage) -> Result<Vec<u8>> {
        let resolved = self.resolve(&msg.payload)?;
        TraceEvent::MessageDelivered {
            message_id: msg.id.clone(),
            recipient: self.agent_id.clone(),
        }
        .emit();
        Ok(resolved)
    }

    fn resolve(&self, payload: &Payload) -> Result<Vec<u8>> {
        match payload {
            Payload::Inline { bytes, .. } => Ok(bytes.clone()),
            Payload::Reference { reference, .. } => self.shared_memory.get(&reference.id),
        }
    }
}
