// src/auth.rs
//
// Collaborator interface for the login/registration side-feature. The
// real backing store is a pooled relational connection living outside this
// crate; the engine only sees the verify-or-register exchange.
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The pool had no free connection within its bounded wait.
    #[error("user store unavailable")]
    Unavailable,
    #[error("user store failure: {0}")]
    Backend(String),
}

pub trait UserStore: Send + Sync {
    /// With `is_login`, check the password of an existing user; otherwise
    /// register the name if it is still free. Returns whether the exchange
    /// succeeded. Implementations must give up with `Unavailable` instead
    /// of blocking indefinitely on an exhausted pool.
    fn verify(&self, username: &str, password: &str, is_login: bool) -> Result<bool, StoreError>;
}

/// In-process store for demos and tests.
pub struct MemoryStore {
    users: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            users: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_user(self, username: &str, password: &str) -> Self {
        self.users
            .lock()
            .unwrap()
            .insert(username.to_string(), password.to_string());
        self
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UserStore for MemoryStore {
    fn verify(&self, username: &str, password: &str, is_login: bool) -> Result<bool, StoreError> {
        if username.is_empty() || password.is_empty() {
            return Ok(false);
        }

        let mut users = self.users.lock().unwrap();
        if is_login {
            Ok(users.get(username).is_some_and(|pwd| pwd == password))
        } else if users.contains_key(username) {
            Ok(false)
        } else {
            users.insert(username.to_string(), password.to_string());
            Ok(true)
        }
    }
}
