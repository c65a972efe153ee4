use std::sync::Mutex;

/// Supplies the signed-in user, if any. Transitions between identities drive
/// conversation loading and teardown in the controller; the controller is
/// told to re-check via [`sync_identity`](crate::ChatController::sync_identity).
pub trait IdentitySource: Send + Sync {
    fn current_user(&self) -> Option<String>;

    fn is_authenticated(&self) -> bool {
        self.current_user().is_some()
    }
}

/// Simple switchable identity, useful for clients that receive auth events
/// from elsewhere and for tests.
#[derive(Debug, Default)]
pub struct SharedIdentity {
    user: Mutex<Option<String>>,
}

impl SharedIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signed_in(user_id: &str) -> Self {
        Self {
            user: Mutex::new(Some(user_id.to_string())),
        }
    }

    pub fn sign_in(&self, user_id: &str) {
        *self.user.lock().unwrap() = Some(user_id.to_string());
    }

    pub fn sign_out(&self) {
        *self.user.lock().unwrap() = None;
    }
}

impl IdentitySource for SharedIdentity {
    fn current_user(&self) -> Option<String> {
        self.user.lock().unwrap().clone()
    }
}
