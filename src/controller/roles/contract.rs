//! Live role model and its comparison with the declared configuration

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::crd::{PasswordState, RoleConfiguration};

/// Expiry of a role password as stored in the catalog
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoleExpiry {
    /// No `VALID UNTIL` set
    Unset,
    /// `VALID UNTIL 'infinity'`
    Infinity,
    /// `VALID UNTIL '-infinity'`, always expired
    Expired,
    At(DateTime<Utc>),
}

impl RoleExpiry {
    /// Unset and infinity both mean the password never expires
    pub fn is_unbounded(&self) -> bool {
        matches!(self, RoleExpiry::Unset | RoleExpiry::Infinity)
    }
}

impl From<Option<DateTime<Utc>>> for RoleExpiry {
    fn from(value: Option<DateTime<Utc>>) -> Self {
        value.map_or(RoleExpiry::Unset, RoleExpiry::At)
    }
}

/// A role as seen in (or destined for) the database catalog
#[derive(Clone, Debug, PartialEq)]
pub struct DatabaseRole {
    pub name: String,
    pub comment: String,
    pub superuser: bool,
    pub create_db: bool,
    pub create_role: bool,
    pub inherit: bool,
    pub login: bool,
    pub replication: bool,
    pub bypass_rls: bool,
    pub connection_limit: i64,
    pub valid_until: RoleExpiry,
    pub in_roles: Vec<String>,
    /// `xmin` of the catalog row; zero for roles not read from the database
    pub transaction_id: i64,
}

/// Grants and revokes needed to align role membership
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MembershipChanges {
    pub grant: Vec<String>,
    pub revoke: Vec<String>,
}

impl MembershipChanges {
    pub fn is_empty(&self) -> bool {
        self.grant.is_empty() && self.revoke.is_empty()
    }
}

impl DatabaseRole {
    /// The role a configuration asks for
    pub fn from_configuration(config: &RoleConfiguration) -> Self {
        Self {
            name: config.name.clone(),
            comment: config.comment.clone(),
            superuser: config.superuser,
            create_db: config.create_db,
            create_role: config.create_role,
            inherit: config.inherit(),
            login: config.login,
            replication: config.replication,
            bypass_rls: config.bypass_rls,
            connection_limit: config.connection_limit,
            valid_until: config.valid_until.into(),
            in_roles: config.in_roles.clone(),
            transaction_id: 0,
        }
    }

    /// Attribute and expiry equality; a mismatch needs `ALTER ROLE`
    pub fn is_equivalent_to(&self, other: &DatabaseRole) -> bool {
        self.has_same_attributes_as(other) && self.has_same_valid_until_as(other)
    }

    pub fn has_same_attributes_as(&self, other: &DatabaseRole) -> bool {
        self.name == other.name
            && self.superuser == other.superuser
            && self.create_db == other.create_db
            && self.create_role == other.create_role
            && self.inherit == other.inherit
            && self.login == other.login
            && self.replication == other.replication
            && self.bypass_rls == other.bypass_rls
            && self.connection_limit == other.connection_limit
    }

    pub fn has_same_valid_until_as(&self, other: &DatabaseRole) -> bool {
        match (self.valid_until, other.valid_until) {
            (RoleExpiry::At(a), RoleExpiry::At(b)) => a == b,
            (RoleExpiry::Expired, RoleExpiry::Expired) => true,
            (a, b) => a.is_unbounded() && b.is_unbounded(),
        }
    }

    /// Membership equality, ignoring order and duplicates
    pub fn is_in_same_roles_as(&self, other: &DatabaseRole) -> bool {
        self.membership() == other.membership()
    }

    pub fn has_same_comment_as(&self, other: &DatabaseRole) -> bool {
        self.comment == other.comment
    }

    fn membership(&self) -> BTreeSet<&str> {
        self.in_roles.iter().map(String::as_str).collect()
    }

    /// Statements needed to move `current` membership to this role's
    pub fn membership_changes(&self, current: &DatabaseRole) -> MembershipChanges {
        let desired = self.membership();
        let live = current.membership();
        MembershipChanges {
            grant: desired.difference(&live).map(|r| r.to_string()).collect(),
            revoke: live.difference(&desired).map(|r| r.to_string()).collect(),
        }
    }

    /// Whether the password must be written again.
    ///
    /// `self` is the live role. The password is current only when the stored
    /// state records both the latest secret version and the live row's
    /// transaction id; any other write to the row invalidates it.
    pub fn password_needs_updating(
        &self,
        stored: Option<&PasswordState>,
        latest_version: &str,
    ) -> bool {
        match stored {
            None => true,
            Some(state) => {
                state.resource_version != latest_version
                    || state.transaction_id != self.transaction_id
            }
        }
    }
}
