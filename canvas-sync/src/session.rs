//! Session and participant identity.

use uuid::Uuid;

/// A shared canvas instance. The id is chosen externally and never changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Session {
    pub session_id: String,
}

impl Session {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
        }
    }

    /// Whether an event stamped with `session_id` belongs here.
    pub fn owns(&self, session_id: &str) -> bool {
        self.session_id == session_id
    }
}

/// The running client instance.
///
/// `user_id` is generated once per process and only used to recognise our
/// own events when the broker echoes them back. It is not an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub user_id: String,
}

impl Participant {
    pub fn new() -> Self {
        Self {
            user_id: Uuid::new_v4().to_string(),
        }
    }

    /// Create with explicit user id (for testing)
    pub fn with_id(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    pub fn originated(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }
}

impl Default for Participant {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_ids_are_unique() {
        let a = Participant::new();
        let b = Participant::new();
        assert_ne!(a.user_id, b.user_id);
        assert!(Uuid::parse_str(&a.user_id).is_ok());
    }

    #[test]
    fn test_originated() {
        let me = Participant::with_id("u1");
        assert!(me.originated("u1"));
        assert!(!me.originated("u2"));
    }

    #[test]
    fn test_session_owns() {
        let session = Session::new("s1");
        assert!(session.owns("s1"));
        assert!(!session.owns("s2"));
    }
}
