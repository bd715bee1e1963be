use std::{collections::BTreeSet, fmt, str::FromStr};

use secret::PasswordHash;
use serde::{Deserialize, Serialize};

/// A name did not match any known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

macro_rules! named_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal { $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            /// The lowercase name of this variant.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_ascii_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    _ => Err(UnknownVariant { kind: $kind, value: s.to_owned() }),
                }
            }
        }
    };
}

named_enum! {
    /// What a permission allows.
    Action, "action" {
        /// Read or pull.
        Read => "read",
        /// Create, update or push.
        Write => "write",
        /// Remove.
        Delete => "delete",
        /// Administer. Paired with [`Resource::System`] this grants everything.
        Admin => "admin",
    }
}

named_enum! {
    /// What a permission applies to.
    Resource, "resource" {
        /// The service as a whole.
        System => "system",
        /// Repositories, manifests and blobs.
        Registry => "registry",
        /// User accounts.
        User => "user",
        /// Groups.
        Group => "group",
        /// Roles.
        Role => "role",
    }
}

/// A single grant: an action on a resource, optionally narrowed to a target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Permission {
    /// The allowed action.
    pub action: Action,

    /// The resource the action applies to.
    pub resource: Resource,

    /// Optional target within the resource, recorded but not used for matching.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl Permission {
    /// The permission which passes every check.
    pub const SUPER_GRANT: Permission = Permission::new(Action::Admin, Resource::System);

    /// An unscoped permission.
    pub const fn new(action: Action, resource: Resource) -> Self {
        Self {
            action,
            resource,
            scope: None,
        }
    }

    /// Narrow this permission to a target.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Whether this is the (admin, system) super-grant.
    pub fn is_super_grant(&self) -> bool {
        self.action == Action::Admin && self.resource == Resource::System
    }

    /// Whether holding this permission satisfies a check for `requested`.
    pub fn grants(&self, requested: &Permission) -> bool {
        self.action == requested.action && self.resource == requested.resource
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.action, self.resource)?;
        if let Some(scope) = &self.scope {
            write!(f, ":{scope}")?;
        }
        Ok(())
    }
}

/// A named set of permissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    /// Role name
    pub name: String,

    /// Permissions held by the role.
    #[serde(default)]
    pub permissions: BTreeSet<Permission>,
}

impl Role {
    /// Whether this role satisfies a check for `requested`.
    pub fn allows(&self, requested: &Permission) -> bool {
        self.permissions
            .iter()
            .any(|held| held.is_super_grant() || held.grants(requested))
    }
}

/// A named set of roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Group name
    pub name: String,

    /// Names of the roles assigned to this group.
    #[serde(default)]
    pub roles: BTreeSet<String>,

    /// Free-form scope string describing what the group covers.
    #[serde(default)]
    pub scope: String,
}

/// A user account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User name, also the token subject.
    pub name: String,

    /// Names of the groups this user belongs to.
    #[serde(default)]
    pub groups: BTreeSet<String>,

    /// Salted credential hash.
    pub password: PasswordHash,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_names() {
        assert_eq!("READ".parse::<Action>().unwrap(), Action::Read);
        assert_eq!("registry".parse::<Resource>().unwrap(), Resource::Registry);
        let err = "fly".parse::<Action>().unwrap_err();
        assert_eq!(err.to_string(), "unknown action: fly");
    }

    #[test]
    fn super_grant_allows_anything() {
        let role = Role {
            name: "admin".into(),
            permissions: [Permission::SUPER_GRANT].into_iter().collect(),
        };

        for action in [Action::Read, Action::Write, Action::Delete, Action::Admin] {
            for resource in [
                Resource::System,
                Resource::Registry,
                Resource::User,
                Resource::Group,
                Resource::Role,
            ] {
                assert!(role.allows(&Permission::new(action, resource)));
            }
        }
    }

    #[test]
    fn exact_match_ignores_scope() {
        let role = Role {
            name: "reader".into(),
            permissions: [Permission::new(Action::Read, Resource::Registry).with_scope("library")]
                .into_iter()
                .collect(),
        };

        assert!(role.allows(&Permission::new(Action::Read, Resource::Registry)));
        assert!(!role.allows(&Permission::new(Action::Write, Resource::Registry)));
        assert!(!role.allows(&Permission::new(Action::Read, Resource::User)));
    }

    #[test]
    fn permission_serde() {
        let permission: Permission =
            serde_json::from_str(r#"{"action":"write","resource":"registry"}"#).unwrap();
        assert_eq!(permission, Permission::new(Action::Write, Resource::Registry));
        assert_eq!(permission.to_string(), "write:registry");
    }
}
