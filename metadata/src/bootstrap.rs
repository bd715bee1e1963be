use std::collections::BTreeSet;

use secret::PasswordHash;
use serde::Deserialize;

use crate::{Group, MetadataError, MetadataStore, Permission, Role, User};

/// Initial accounts and roles, usually read from the configuration file.
///
/// ```toml
/// [[bootstrap.roles]]
/// name = "anonymous"
/// permissions = [{ action = "read", resource = "registry" }]
///
/// [[bootstrap.groups]]
/// name = "admins"
/// roles = ["admin"]
///
/// [[bootstrap.users]]
/// name = "alice"
/// groups = ["admins"]
/// password = "sha256$<salt>$<hex>"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Bootstrap {
    /// Roles to create.
    #[serde(default)]
    pub roles: Vec<RoleSeed>,

    /// Groups to create.
    #[serde(default)]
    pub groups: Vec<GroupSeed>,

    /// Users to create.
    #[serde(default)]
    pub users: Vec<UserSeed>,
}

/// A role to create at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct RoleSeed {
    /// Role name
    pub name: String,
    /// Permissions held
    #[serde(default)]
    pub permissions: BTreeSet<Permission>,
}

/// A group to create at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupSeed {
    /// Group name
    pub name: String,
    /// Role names
    #[serde(default)]
    pub roles: BTreeSet<String>,
    /// Scope description
    #[serde(default)]
    pub scope: String,
}

/// A user to create at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct UserSeed {
    /// User name
    pub name: String,
    /// Group names
    #[serde(default)]
    pub groups: BTreeSet<String>,
    /// Stored credential hash
    pub password: PasswordHash,
}

impl Bootstrap {
    /// Write every seeded record into `store`, replacing records with the same name.
    #[tracing::instrument(skip_all)]
    pub async fn apply(&self, store: &dyn MetadataStore) -> Result<(), MetadataError> {
        for seed in &self.roles {
            store
                .put_role(Role {
                    name: seed.name.clone(),
                    permissions: seed.permissions.clone(),
                })
                .await?;
        }

        for seed in &self.groups {
            store
                .put_group(Group {
                    name: seed.name.clone(),
                    roles: seed.roles.clone(),
                    scope: seed.scope.clone(),
                })
                .await?;
        }

        for seed in &self.users {
            store
                .put_user(User {
                    name: seed.name.clone(),
                    groups: seed.groups.clone(),
                    password: seed.password.clone(),
                })
                .await?;
        }

        tracing::info!(
            roles = self.roles.len(),
            groups = self.groups.len(),
            users = self.users.len(),
            "Seeded metadata store"
        );
        Ok(())
    }
}
