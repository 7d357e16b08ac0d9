use crate::database::models::Session;
use crate::error::ScanError;
use std::sync::Arc;
use tokio::sync::watch;

/// The session scans are currently attributed to.
#[derive(Clone)]
pub struct SessionContext {
    tx: Arc<watch::Sender<Option<Session>>>,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionContext {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> Option<Session> {
        self.tx.borrow().clone()
    }

    pub fn current_id(&self) -> Option<i64> {
        self.tx.borrow().as_ref().map(|session| session.id)
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.tx.subscribe()
    }

    /// Makes `session` current. Returns whether the selected session id changed.
    pub fn select(&self, session: Session) -> Result<bool, ScanError> {
        if !session.is_active() {
            return Err(ScanError::InactiveSession(session.id));
        }
        let changed = self.current_id() != Some(session.id);
        if changed {
            tracing::info!("Selected session {} ({})", session.id, session.name);
        }
        self.tx.send_replace(Some(session));
        Ok(changed)
    }

    pub fn clear(&self) {
        self.tx.send_replace(None);
    }

    /// The current session, if one is selected and still active.
    pub fn require_active(&self) -> Result<Session, ScanError> {
        match self.current() {
            Some(session) if session.is_active() => Ok(session),
            Some(session) => Err(ScanError::InactiveSession(session.id)),
            None => Err(ScanError::NoActiveSession),
        }
    }
}
