//! Static user authentication from configuration.
//!
//! Supports plaintext passwords (for development) and argon2 hashes in PHC
//! string format (for production). Successful authentication yields the
//! user's ordered ACL, which becomes the session's ACL for its lifetime.

use ahash::AHashMap;
use argon2::{Argon2, PasswordHash, PasswordVerifier};

use super::AclRule;
use crate::config::Config;

/// A user entry with pre-processed credentials.
struct User {
    /// Plaintext password (if configured). Use only for development.
    password: Option<String>,
    /// Argon2 password hash in PHC string format.
    password_hash: Option<String>,
    /// Ordered allow/deny rules applied to this user's topics.
    acls: Vec<AclRule>,
}

/// Authenticator backed by the configured user list.
pub struct StaticAuth {
    users: AHashMap<String, User>,
    allow_anonymous: bool,
}

impl StaticAuth {
    pub fn new(config: &Config) -> Self {
        let mut users = AHashMap::with_capacity(config.users.len());

        for user in &config.users {
            let mut acls = Vec::with_capacity(user.acls.len());
            for rule in &user.acls {
                match AclRule::parse(rule) {
                    Some(parsed) => acls.push(parsed),
                    None => log::warn!("ignoring malformed acl rule for {}: {:?}", user.name, rule),
                }
            }
            users.insert(
                user.name.clone(),
                User {
                    password: user.password.clone(),
                    password_hash: user.password_hash.clone(),
                    acls,
                },
            );
        }

        Self {
            users,
            allow_anonymous: config.allow_anonymous,
        }
    }

    /// Authenticate a connecting client. `Some(acls)` admits the client with
    /// that ACL; `None` refuses the connection.
    pub fn authenticate(
        &self,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> Option<Vec<AclRule>> {
        let Some(username) = username else {
            // No credentials at all: anonymous clients get an empty ACL,
            // which allows every topic via the implicit-allow rule.
            return self.allow_anonymous.then(Vec::new);
        };

        let user = self.users.get(username)?;
        let password = password?;

        if self.verify_password(user, password) {
            Some(user.acls.clone())
        } else {
            None
        }
    }

    fn verify_password(&self, user: &User, password: &[u8]) -> bool {
        // An argon2 hash takes priority over any plaintext entry.
        if let Some(hash_str) = &user.password_hash {
            return verify_argon2(hash_str, password);
        }

        if let Some(stored) = &user.password {
            return password == stored.as_bytes();
        }

        false
    }
}

/// Verify a password against an argon2 hash in PHC string format.
fn verify_argon2(hash_str: &str, password: &[u8]) -> bool {
    let Ok(parsed_hash) = PasswordHash::new(hash_str) else {
        log::warn!("invalid argon2 hash format in config");
        return false;
    };

    Argon2::default()
        .verify_password(password, &parsed_hash)
        .is_ok()
}
