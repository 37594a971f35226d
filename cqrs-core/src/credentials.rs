//! The caller's identity and scopes, and the AND-of-OR scope matrix used to
//! enforce them.
//!
//! Authentication itself (password hashing, token issuance) is out of scope;
//! this only covers what a handler needs to decide whether a caller is
//! allowed to do what they're asking: an opaque user id plus the list of
//! scope strings that id was granted.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The authenticated caller's identity and granted scopes.
///
/// A blank `Credentials` (see [`Credentials::blank`]) represents an
/// unauthenticated caller — not `Option<Credentials>`, since most of the
/// pipeline (logging, guards) needs *some* value to operate on regardless of
/// whether a caller authenticated.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    user_id: Uuid,
    scopes: Vec<String>,
}

impl Credentials {
    /// Build credentials for an authenticated caller.
    ///
    /// The caller's own `user:<id>` scope is added automatically — every
    /// authenticated caller implicitly has it, so callers of this
    /// constructor never need to remember to include it themselves.
    #[must_use]
    pub fn new(user_id: Uuid, mut scopes: Vec<String>) -> Self {
        let user_scope = Self::user_scope_for(user_id);
        if !scopes.contains(&user_scope) {
            scopes.push(user_scope);
        }
        Self { user_id, scopes }
    }

    /// The sentinel representing no authenticated caller.
    #[must_use]
    pub fn blank() -> Self {
        Self {
            user_id: Uuid::nil(),
            scopes: Vec::new(),
        }
    }

    /// Whether this represents a real, authenticated caller.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.user_id != Uuid::nil()
    }

    #[must_use]
    pub const fn user_id(&self) -> Uuid {
        self.user_id
    }

    #[must_use]
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    /// Whether `user_id` matches the caller's own id.
    #[must_use]
    pub fn is_user(&self, user_id: Uuid) -> bool {
        self.user_id == user_id
    }

    fn user_scope_for(user_id: Uuid) -> String {
        format!("user:{user_id}")
    }
}

impl fmt::Display for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "Credentials({})", self.user_id)
        } else {
            write!(f, "Credentials(blank)")
        }
    }
}

/// Returned by [`enforce`] when a caller's scopes satisfy none of the
/// required groups.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("forbidden: caller does not hold a required scope group")]
pub struct Forbidden;

/// Enforce an AND-of-OR scope matrix against a caller's credentials.
///
/// `required_groups` is a list of scope groups; the caller passes if their
/// scopes satisfy **all** scopes within **any one** group (OR across groups,
/// AND within a group). An empty `required_groups` list always passes (no
/// requirement was stated); an empty group within the list can never be
/// satisfied by a caller who holds no scopes, but is otherwise vacuously true
/// the same way `required_groups` being empty is — both mean "nothing to
/// check" for that group.
///
/// # Errors
///
/// Returns [`Forbidden`] if no group is fully satisfied.
pub fn enforce(creds: &Credentials, required_groups: &[&[&str]]) -> Result<(), Forbidden> {
    if required_groups.is_empty() {
        return Ok(());
    }
    for group in required_groups {
        if group.iter().all(|required| {
            creds
                .scopes()
                .iter()
                .any(|held| scope_satisfies_scope(required, held))
        }) {
            return Ok(());
        }
    }
    Err(Forbidden)
}

/// Whether a held scope satisfies a required scope.
///
/// Two scopes match if they're identical, or if they name the same resource
/// and the held scope's action is the wildcard `*` (e.g. held `"orders:*"`
/// satisfies required `"orders:read"`).
fn scope_satisfies_scope(required: &str, held: &str) -> bool {
    if required == held {
        return true;
    }
    let (Some((req_resource, _)), Some((held_resource, held_action))) =
        (required.split_once(':'), held.split_once(':'))
    else {
        return false;
    };
    held_action == "*" && req_resource == held_resource
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> Uuid {
        Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap_or_default()
    }

    #[test]
    fn blank_credentials_are_invalid() {
        assert!(!Credentials::blank().is_valid());
    }

    #[test]
    fn new_credentials_gain_implicit_user_scope() {
        let creds = Credentials::new(user(), vec!["orders:read".to_string()]);
        assert!(creds.is_valid());
        assert!(creds.scopes().iter().any(|s| s == &format!("user:{}", user())));
        assert!(creds.scopes().iter().any(|s| s == "orders:read"));
    }

    #[test]
    fn new_credentials_does_not_duplicate_user_scope() {
        let user_scope = format!("user:{}", user());
        let creds = Credentials::new(user(), vec![user_scope.clone()]);
        assert_eq!(creds.scopes().iter().filter(|s| **s == user_scope).count(), 1);
    }

    #[test]
    fn scope_satisfies_scope_exact_match() {
        assert!(scope_satisfies_scope("orders:read", "orders:read"));
        assert!(!scope_satisfies_scope("orders:read", "orders:write"));
    }

    #[test]
    fn scope_satisfies_scope_wildcard() {
        assert!(scope_satisfies_scope("orders:read", "orders:*"));
        assert!(scope_satisfies_scope("orders:write", "orders:*"));
        assert!(!scope_satisfies_scope("payments:read", "orders:*"));
    }

    #[test]
    fn enforce_passes_with_no_requirements() {
        assert!(enforce(&Credentials::blank(), &[]).is_ok());
    }

    #[test]
    fn enforce_ors_across_groups() {
        let creds = Credentials::new(user(), vec!["orders:read".to_string()]);
        let result = enforce(&creds, &[&["payments:write"], &["orders:read"]]);
        assert!(result.is_ok());
    }

    #[test]
    fn enforce_ands_within_a_group() {
        let creds = Credentials::new(user(), vec!["orders:read".to_string()]);
        let result = enforce(&creds, &[&["orders:read", "orders:write"]]);
        assert!(result.is_err());
    }

    #[test]
    fn enforce_rejects_when_no_group_satisfied() {
        let creds = Credentials::new(user(), vec!["orders:read".to_string()]);
        let result = enforce(&creds, &[&["payments:write"]]);
        assert!(matches!(result, Err(Forbidden)));
    }

    #[test]
    fn enforce_wildcard_satisfies_group() {
        let creds = Credentials::new(user(), vec!["orders:*".to_string()]);
        let result = enforce(&creds, &[&["orders:read", "orders:write"]]);
        assert!(result.is_ok());
    }
}
