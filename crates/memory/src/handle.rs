//! In-process cache entry for a single session: its metadata plus the
//! messages loaded so far. A per-session mutex serialises appends so two
//! concurrent `AddMessage` calls against the same session never interleave
//! (spec §4.4's "per-session mutex to preserve message ordering").

use parking_lot::Mutex;
use sa_domain::model::{Message, Session};

/// Cached view of a session. `messages` reflects history loaded lazily on
/// first access plus every append made through this process.
pub struct SessionHandle {
    state: Mutex<HandleState>,
}

struct HandleState {
    session: Session,
    messages: Vec<Message>,
}

impl SessionHandle {
    pub fn new(session: Session, messages: Vec<Message>) -> Self {
        Self {
            state: Mutex::new(HandleState { session, messages }),
        }
    }

    pub fn session(&self) -> Session {
        self.state.lock().session.clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.state.lock().messages.clone()
    }

    /// Append `message` to the cached view and record usage on the session
    /// totals. Returns the updated session snapshot for persistence.
    pub fn push(&self, message: Message, tokens: u64, cost: f64) -> Session {
        let mut state = self.state.lock();
        state.session.totals.record_usage(tokens, cost);
        state.session.updated_at = message.timestamp;
        state.messages.push(message);
        state.session.clone()
    }
}
