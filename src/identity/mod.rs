//! Identity Module - Users that upload on behalf of a workspace
//!
//! A user is an opaque numeric id handed to us by the request boundary.
//! It never owns storage; it only names a quota account and is checked
//! against an authorization policy before any byte is accepted.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;
use std::sync::Arc;

/// Opaque user identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(i64);

impl UserId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().trim_end_matches('\0').parse().map(Self)
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Decides whether a user may upload at all
pub trait Authorizer: Send + Sync {
    fn is_authorized(&self, user: UserId) -> bool;
}

/// Fixed allow-list of user ids
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowListAuthorizer {
    allowed: Vec<UserId>,
}

impl AllowListAuthorizer {
    pub fn new(allowed: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }
}

impl Default for AllowListAuthorizer {
    fn default() -> Self {
        Self::new([UserId(1), UserId(2)])
    }
}

impl Authorizer for AllowListAuthorizer {
    fn is_authorized(&self, user: UserId) -> bool {
        self.allowed.contains(&user)
    }
}

/// A user together with the policy that vouches for it
#[derive(Clone)]
pub struct UserIdentity {
    id: UserId,
    authorizer: Arc<dyn Authorizer>,
}

impl UserIdentity {
    pub fn new(id: UserId, authorizer: Arc<dyn Authorizer>) -> Self {
        Self { id, authorizer }
    }

    pub fn id(&self) -> UserId {
        self.id
    }

    pub fn is_authorized(&self) -> bool {
        self.authorizer.is_authorized(self.id)
    }
}

impl fmt::Debug for UserIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserIdentity")
            .field("id", &self.id)
            .field("authorized", &self.is_authorized())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_allow_list() {
        let auth: Arc<dyn Authorizer> = Arc::new(AllowListAuthorizer::default());

        assert!(UserIdentity::new(UserId::new(1), auth.clone()).is_authorized());
        assert!(UserIdentity::new(UserId::new(2), auth.clone()).is_authorized());
        assert!(!UserIdentity::new(UserId::new(3), auth).is_authorized());
    }

    #[test]
    fn test_parse_form_value() {
        // Form fields may arrive padded with NUL bytes from a fixed buffer
        let id: UserId = "42\0\0\0".parse().unwrap();
        assert_eq!(id, UserId::new(42));
        assert!("abc".parse::<UserId>().is_err());
    }
}
