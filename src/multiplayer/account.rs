//! Username checks consulted during the handshake.

use rustc_hash::FxHashSet;

use crate::constants::MAX_USERNAME_LEN;
use crate::error::AccountError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub username: String,
}

/// Resolves a handshake username to an account.
pub trait AccountLookup: Send + Sync {
    fn lookup(&self, username: &str) -> Result<UserRecord, AccountError>;
}

/// 1 to 32 ASCII letters, digits or underscores.
pub fn validate_username(username: &str) -> Result<(), AccountError> {
    let valid = !username.is_empty()
        && username.len() <= MAX_USERNAME_LEN
        && username
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(AccountError::InvalidUsername(username.to_string()))
    }
}

/// Accepts any well-formed username.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenAccounts;

impl AccountLookup for OpenAccounts {
    fn lookup(&self, username: &str) -> Result<UserRecord, AccountError> {
        validate_username(username)?;
        Ok(UserRecord {
            username: username.to_string(),
        })
    }
}

/// Accepts only configured usernames, compared case-insensitively.
#[derive(Debug, Default, Clone)]
pub struct AllowList {
    names: FxHashSet<String>,
}

impl AllowList {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            names: names
                .into_iter()
                .map(|n| n.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl AccountLookup for AllowList {
    fn lookup(&self, username: &str) -> Result<UserRecord, AccountError> {
        validate_username(username)?;
        if self.names.contains(&username.to_ascii_lowercase()) {
            Ok(UserRecord {
                username: username.to_string(),
            })
        } else {
            Err(AccountError::NotFound(username.to_string()))
        }
    }
}
