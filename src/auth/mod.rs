//! Authentication Module
//!
//! Static username/password verification from the `[auth]` config section.
//! Passwords are stored either in plaintext or as argon2 PHC strings.

use std::collections::HashMap;

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use tracing::{debug, warn};

use crate::config::AuthConfig;
use crate::hooks::Verifier;


/// Stored secret for one user
enum Credential {
    Plaintext(String),
    Argon2(String),
}

/// Verifier backed by a fixed user table
pub struct StaticCredentials {
    enabled: bool,
    allow_anonymous: bool,
    users: HashMap<String, Credential>,
}

impl StaticCredentials {
    /// Build from configuration. Users with neither secret are skipped;
    /// `Config::validate` rejects those before we get here.
    pub fn new(config: &AuthConfig) -> Self {
        let mut users = HashMap::new();

        for user in &config.users {
            let credential = match (&user.password, &user.password_hash) {
                (_, Some(hash)) => Credential::Argon2(hash.clone()),
                (Some(password), None) => Credential::Plaintext(password.clone()),
                (None, None) => continue,
            };
            users.insert(user.username.clone(), credential);
        }

        Self {
            enabled: config.enabled,
            allow_anonymous: config.allow_anonymous,
            users,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    fn check(credential: &Credential, password: &[u8]) -> bool {
        match credential {
            Credential::Plaintext(stored) => password == stored.as_bytes(),
            Credential::Argon2(hash) => match PasswordHash::new(hash) {
                Ok(parsed) => Argon2::default()
                    .verify_password(password, &parsed)
                    .is_ok(),
                Err(e) => {
                    warn!("unparseable password hash: {}", e);
                    false
                }
            },
        }
    }
}

impl Verifier for StaticCredentials {
    fn verify(&self, client_id: &str, username: Option<&str>, password: Option<&[u8]>) -> bool {
        if !self.enabled {
            return true;
        }

        let Some(username) = username else {
            debug!("anonymous connect from {}", client_id);
            return self.allow_anonymous;
        };

        match self.users.get(username) {
            Some(credential) => Self::check(credential, password.unwrap_or(&[])),
            None => {
                debug!("unknown user '{}' for client {}", username, client_id);
                false
            }
        }
    }
}
