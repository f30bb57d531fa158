use tracing::{debug, instrument};

use switchboard_core::ids::{SessionId, UserId};
use switchboard_core::session::SessionState;
use switchboard_core::summarizer::Turn;
use switchboard_core::Mode;
use switchboard_store::sessions::SessionRepo;
use switchboard_store::turns::TurnRepo;
use switchboard_store::{Database, StoreError};

use crate::error::OrchestrationError;
use crate::naming::NamingScheduler;

/// Session lifecycle on top of the store: resolution, ownership, turns and
/// the hand-off to background naming.
#[derive(Clone)]
pub struct SessionCoordinator {
    sessions: SessionRepo,
    turns: TurnRepo,
    naming: Option<NamingScheduler>,
}

impl SessionCoordinator {
    pub fn new(db: Database, naming: Option<NamingScheduler>) -> Self {
        Self {
            sessions: SessionRepo::new(db.clone()),
            turns: TurnRepo::new(db),
            naming,
        }
    }

    /// Find or create the session a request belongs to.
    ///
    /// An empty id starts a new session. An unknown id is created under that
    /// id for `user_id`. A known id owned by someone else is rejected.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn resolve(&self, session_id: &str, user_id: &UserId) -> Result<SessionState, OrchestrationError> {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            let state = self.sessions.create(&SessionId::new(), user_id)?;
            debug!(session_id = %state.session_id, "new session");
            return Ok(state);
        }

        let id = SessionId::from_raw(session_id);
        let existing = match self.sessions.find(&id)? {
            Some(state) => state,
            None => match self.sessions.create(&id, user_id) {
                Ok(state) => return Ok(state),
                // lost a creation race; fall through to the ownership check
                Err(StoreError::Conflict(_)) => self.sessions.get(&id)?,
                Err(e) => return Err(e.into()),
            },
        };

        if &existing.user_id != user_id {
            return Err(OrchestrationError::SessionOwnership {
                session_id: id,
                user_id: user_id.clone(),
            });
        }
        self.sessions.touch(&id)?;
        Ok(self.sessions.get(&id)?)
    }

    pub fn get(&self, session_id: &SessionId) -> Result<SessionState, OrchestrationError> {
        self.sessions.get(session_id).map_err(|e| not_found(session_id, e))
    }

    /// Persist the mode for later requests that do not name one.
    pub fn update_mode(&self, session_id: &SessionId, mode: Mode) -> Result<(), OrchestrationError> {
        self.sessions
            .update_mode(session_id, mode)
            .map_err(|e| not_found(session_id, e))
    }

    pub fn list(&self, user_id: &UserId, limit: u32, offset: u32) -> Result<Vec<SessionState>, OrchestrationError> {
        Ok(self.sessions.list(user_id, limit, offset)?)
    }

    pub fn turns(&self, session_id: &SessionId, limit: u32) -> Result<Vec<Turn>, OrchestrationError> {
        Ok(self.turns.list(session_id, limit)?)
    }

    pub fn append_turn(&self, session_id: &SessionId, turn: &Turn) -> Result<(), OrchestrationError> {
        self.turns.append(session_id, turn)?;
        Ok(())
    }

    /// Queue a naming attempt. No-op when no summarizer is configured.
    pub fn schedule_naming(&self, session_id: &SessionId) {
        if let Some(naming) = &self.naming {
            naming.schedule(session_id.clone());
        }
    }
}

fn not_found(session_id: &SessionId, e: StoreError) -> OrchestrationError {
    match e {
        StoreError::NotFound(_) => OrchestrationError::SessionNotFound(session_id.clone()),
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> SessionCoordinator {
        SessionCoordinator::new(Database::in_memory().unwrap(), None)
    }

    #[test]
    fn empty_id_creates_session() {
        let c = coordinator();
        let user = UserId::from_raw("u1");
        let a = c.resolve("", &user).unwrap();
        let b = c.resolve("  ", &user).unwrap();
        assert_ne!(a.session_id, b.session_id);
        assert_eq!(a.mode, Mode::Quick);
    }

    #[test]
    fn known_id_is_resumed() {
        let c = coordinator();
        let user = UserId::from_raw("u1");
        let first = c.resolve("", &user).unwrap();
        c.update_mode(&first.session_id, Mode::Deep).unwrap();

        let again = c.resolve(first.session_id.as_str(), &user).unwrap();
        assert_eq!(again.session_id, first.session_id);
        assert_eq!(again.mode, Mode::Deep);
    }

    #[test]
    fn unknown_id_is_created_under_that_id() {
        let c = coordinator();
        let state = c.resolve("client-chosen", &UserId::from_raw("u1")).unwrap();
        assert_eq!(state.session_id.as_str(), "client-chosen");
    }

    #[test]
    fn foreign_session_is_rejected() {
        let c = coordinator();
        let owned = c.resolve("", &UserId::from_raw("alice")).unwrap();
        let err = c
            .resolve(owned.session_id.as_str(), &UserId::from_raw("bob"))
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::SessionOwnership { .. }));
    }

    #[test]
    fn missing_session_maps_to_not_found() {
        let c = coordinator();
        let missing = SessionId::from_raw("nope");
        assert!(matches!(c.get(&missing), Err(OrchestrationError::SessionNotFound(_))));
        assert!(matches!(
            c.update_mode(&missing, Mode::Deep),
            Err(OrchestrationError::SessionNotFound(_))
        ));
    }

    #[test]
    fn turns_round_trip_in_order() {
        let c = coordinator();
        let s = c.resolve("", &UserId::from_raw("u1")).unwrap();
        c.append_turn(&s.session_id, &Turn::user("hi there")).unwrap();
        c.append_turn(&s.session_id, &Turn::assistant("hello")).unwrap();
        let turns = c.turns(&s.session_id, 10).unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].content, "hello");
    }
}
