use serde::{Deserialize, Serialize};

use crate::ids::{SessionId, UserId};
use crate::mode::Mode;

/// Naming attempts after which a session stays unnamed for good.
pub const MAX_NAMING_ATTEMPTS: u32 = 3;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub mode: Mode,
    pub created_at: String,
    pub last_active_at: String,
    pub name: Option<String>,
    pub naming_attempts: u32,
}

impl SessionState {
    pub fn new(session_id: SessionId, user_id: UserId) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            session_id,
            user_id,
            mode: Mode::Quick,
            created_at: now.clone(),
            last_active_at: now,
            name: None,
            naming_attempts: 0,
        }
    }

    /// Whether the naming worker should still try to name this session.
    pub fn wants_name(&self) -> bool {
        self.name.is_none() && self.naming_attempts < MAX_NAMING_ATTEMPTS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_defaults() {
        let s = SessionState::new(SessionId::new(), UserId::from_raw("u1"));
        assert_eq!(s.mode, Mode::Quick);
        assert!(s.name.is_none());
        assert!(s.wants_name());
    }

    #[test]
    fn exhausted_attempts_stop_naming() {
        let mut s = SessionState::new(SessionId::new(), UserId::from_raw("u1"));
        s.naming_attempts = MAX_NAMING_ATTEMPTS;
        assert!(!s.wants_name());
        s.naming_attempts = 0;
        s.name = Some("Trip planning".into());
        assert!(!s.wants_name());
    }
}
