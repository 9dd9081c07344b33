use std::collections::{HashMap, HashSet};
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Caller identity attached to a command invocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authentication {
    pub user_id: String,
    pub groups: Vec<String>,
}

impl Authentication {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            groups: Vec::new(),
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }
}

/// Permission a command requires, e.g. `create` on `process_instance`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Permission {
    pub resource: &'static str,
    pub action: &'static str,
}

impl Permission {
    pub const fn new(resource: &'static str, action: &'static str) -> Self {
        Self { resource, action }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource, self.action)
    }
}

/// Decides whether an authenticated caller holds a permission.
///
/// Commands invoked without authentication (engine-internal work such as
/// job execution) are not checked.
pub trait AuthorizationProvider: Send + Sync + fmt::Debug {
    fn is_authorized(&self, authentication: &Authentication, permission: &Permission) -> bool;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl AuthorizationProvider for AllowAll {
    fn is_authorized(&self, _authentication: &Authentication, _permission: &Permission) -> bool {
        true
    }
}

/// Grants held per user or group.
#[derive(Debug, Default)]
pub struct StaticAuthorizations {
    grants: RwLock<HashMap<String, HashSet<Permission>>>,
}

impl StaticAuthorizations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant to a user id or group name.
    pub fn grant(&self, principal: impl Into<String>, permission: Permission) {
        self.grants
            .write()
            .entry(principal.into())
            .or_default()
            .insert(permission);
    }
}

impl AuthorizationProvider for StaticAuthorizations {
    fn is_authorized(&self, authentication: &Authentication, permission: &Permission) -> bool {
        let grants = self.grants.read();
        std::iter::once(&authentication.user_id)
            .chain(authentication.groups.iter())
            .any(|principal| {
                grants
                    .get(principal)
                    .is_some_and(|held| held.contains(permission))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: Permission = Permission::new("process_instance", "create");

    #[test]
    fn test_group_grant_applies_to_members() {
        let auth = StaticAuthorizations::new();
        auth.grant("clerks", START);

        assert!(auth.is_authorized(&Authentication::user("ann").with_group("clerks"), &START));
        assert!(!auth.is_authorized(&Authentication::user("bob"), &START));
    }
}
