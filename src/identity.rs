//! User identity passed along with every batch.
//!
//! How the id is generated and persisted across launches belongs to the
//! host; the manager only asks for the current value before each send.

use uuid::Uuid;

/// Supplies the opaque identifier of the current user.
pub trait UserIdentity: Send + Sync {
    fn user_id(&self) -> Uuid;
}

/// Always returns the same identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedUserId(Uuid);

impl FixedUserId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// A fresh random id, stable for the lifetime of this value.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl UserIdentity for FixedUserId {
    fn user_id(&self) -> Uuid {
        self.0
    }
}
