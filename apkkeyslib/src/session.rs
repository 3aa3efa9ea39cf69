//! Per-operator dialogue state and the store that holds it

use std::collections::HashMap;
use std::sync::Mutex;

use crate::data::{Field, FieldSet, OperatorId};
use crate::{log_error, Error, Result};

/// Identifies which dialogue an operator is walking through
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FlowKind {
    Generate,
    Sign,
}

/// State of one operator's in-progress dialogue. An operator with no session is idle.
#[derive(Clone, Debug)]
pub struct Session {
    pub flow: FlowKind,
    /// Field the next text message answers
    pub cursor: Field,
    pub fields: FieldSet,
}

impl Session {
    pub fn new(flow: FlowKind, cursor: Field) -> Self {
        Session {
            flow,
            cursor,
            fields: FieldSet::new(),
        }
    }
}

/// Storage for dialogue state keyed by operator. Implementations must keep operators isolated
/// from one another.
pub trait SessionStore: Send + Sync + 'static {
    fn get(&self, operator: OperatorId) -> Result<Option<Session>>;
    fn put(&self, operator: OperatorId, session: Session) -> Result<()>;
    fn clear(&self, operator: OperatorId) -> Result<()>;
}

/// [SessionStore] backed by an in-process map. State does not survive a restart.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<OperatorId, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of operators with an active dialogue
    pub fn len(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<OperatorId, Session>>> {
        self.sessions.lock().map_err(|e| {
            log_error(&format!("Session store lock poisoned: {e}"));
            Error::SessionStore
        })
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, operator: OperatorId) -> Result<Option<Session>> {
        Ok(self.lock()?.get(&operator).cloned())
    }

    fn put(&self, operator: OperatorId, session: Session) -> Result<()> {
        self.lock()?.insert(operator, session);
        Ok(())
    }

    fn clear(&self, operator: OperatorId) -> Result<()> {
        self.lock()?.remove(&operator);
        Ok(())
    }
}
