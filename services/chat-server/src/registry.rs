use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

/// Tracks live sessions and enforces the connection cap.
#[derive(Debug)]
pub struct SessionRegistry {
    max_sessions: usize,
    sessions: Mutex<HashMap<String, CancellationToken>>,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Arc<Self> {
        Arc::new(Self {
            max_sessions,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Admits a session unless the cap is reached. The session stays
    /// registered until the returned guard is dropped.
    pub fn admit(
        self: &Arc<Self>,
        session_id: &str,
        cancel: CancellationToken,
    ) -> Option<Admission> {
        let mut sessions = self.sessions();
        if sessions.len() >= self.max_sessions {
            return None;
        }
        sessions.insert(session_id.to_string(), cancel);
        Some(Admission {
            registry: self.clone(),
            session_id: session_id.to_string(),
        })
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions().len()
    }

    /// Signals every live session to close.
    pub fn close_all(&self) {
        for cancel in self.sessions().values() {
            cancel.cancel();
        }
    }
}

#[derive(Debug)]
pub struct Admission {
    registry: Arc<SessionRegistry>,
    session_id: String,
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.registry.sessions().remove(&self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_is_enforced_and_released_on_drop() {
        let registry = SessionRegistry::new(1);
        let first = registry.admit("a", CancellationToken::new()).unwrap();
        assert!(registry.admit("b", CancellationToken::new()).is_none());
        assert_eq!(registry.active_sessions(), 1);

        drop(first);
        assert_eq!(registry.active_sessions(), 0);
        assert!(registry.admit("b", CancellationToken::new()).is_some());
    }

    #[test]
    fn close_all_cancels_live_sessions() {
        let registry = SessionRegistry::new(4);
        let token = CancellationToken::new();
        let _admission = registry.admit("a", token.clone()).unwrap();
        registry.close_all();
        assert!(token.is_cancelled());
    }
}
