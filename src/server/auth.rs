//! Credential checks for SASL PLAIN.

use dashmap::DashMap;

/// Verifies a username/password pair. Implementations must not block for
/// long: they run on the connection's driver task.
pub trait AuthenticationService: Send + Sync {
    fn authenticate(&self, username: &str, password: &str) -> bool;
}

/// Fixed user table, for tests and embedded deployments.
#[derive(Debug, Default)]
pub struct InMemoryAuthenticationService {
    users: DashMap<String, String>,
}

impl InMemoryAuthenticationService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.add_user(username, password);
        self
    }

    pub fn add_user(&self, username: impl Into<String>, password: impl Into<String>) {
        self.users.insert(username.into(), password.into());
    }

    pub fn remove_user(&self, username: &str) -> bool {
        self.users.remove(username).is_some()
    }
}

impl AuthenticationService for InMemoryAuthenticationService {
    fn authenticate(&self, username: &str, password: &str) -> bool {
        self.users
            .get(username)
            .is_some_and(|stored| stored.value() == password)
    }
}
