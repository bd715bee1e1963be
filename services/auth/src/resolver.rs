use std::{fmt, sync::Arc, time::Duration};

use echocache::{Cache, Sweeper};
use metadata::{ANONYMOUS, ANONYMOUS_ROLE, MetadataError, MetadataStore, Permission};

/// Decides whether an identity holds a permission.
///
/// Decisions for named users are cached per (identity, permission) and only
/// forgotten when the whole cache is cleared, so a grant or revocation in the
/// metadata store may not be seen until the next clear. Anonymous decisions
/// always read the `anonymous` role directly.
///
/// Any failure to load a user, group or role denies.
#[derive(Clone)]
pub struct PermissionResolver {
    store: Arc<dyn MetadataStore>,
    cache: Cache<(String, Permission), bool>,
    sweeper: Option<Arc<Sweeper>>,
}

impl fmt::Debug for PermissionResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionResolver")
            .field("store", &self.store)
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl PermissionResolver {
    /// A resolver whose cache is only cleared by [`PermissionResolver::clear`].
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self {
            store,
            cache: Cache::new(),
            sweeper: None,
        }
    }

    /// Clear the decision cache every `period`, for as long as this resolver
    /// (or a clone of it) is alive.
    pub fn with_sweep(mut self, period: Duration) -> Self {
        self.sweeper = Some(Arc::new(self.cache.sweep_every(period)));
        self
    }

    /// The metadata store decisions are read from.
    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    /// Forget every cached decision.
    pub fn clear(&self) {
        self.cache.clear();
    }

    /// Number of cached decisions.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Whether `identity` holds `permission`.
    #[tracing::instrument(skip(self), fields(%permission))]
    pub async fn has_permission(&self, identity: &str, permission: &Permission) -> bool {
        if identity.is_empty() || identity == ANONYMOUS {
            return match self.store.role(ANONYMOUS_ROLE).await {
                Ok(role) => role.allows(permission),
                Err(error) => {
                    tracing::debug!(%error, "No anonymous role, denying");
                    false
                }
            };
        }

        let key = (identity.to_owned(), permission.clone());
        let store = Arc::clone(&self.store);
        let identity = identity.to_owned();
        let requested = permission.clone();
        let decision = self
            .cache
            .get_or_fill(key, move || {
                Box::pin(async move {
                    match resolve(store.as_ref(), &identity, &requested).await {
                        Ok(allowed) => Some(allowed),
                        Err(error) => {
                            tracing::warn!(%identity, %error, "Permission lookup failed, denying");
                            None
                        }
                    }
                })
            })
            .await;

        match decision {
            Ok(Some(allowed)) => allowed,
            Ok(None) => false,
            Err(error) => {
                tracing::warn!(%error, "Permission lookup was dropped, denying");
                false
            }
        }
    }
}

/// Walk user, groups and roles looking for a role which allows `permission`.
async fn resolve(
    store: &dyn MetadataStore,
    identity: &str,
    permission: &Permission,
) -> Result<bool, MetadataError> {
    let user = store.user(identity).await?;
    for group_name in &user.groups {
        let group = store.group(group_name).await?;
        for role_name in &group.roles {
            let role = store.role(role_name).await?;
            if role.allows(permission) {
                tracing::trace!(group = %group.name, role = %role.name, "Permission granted");
                return Ok(true);
            }
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use metadata::{
        Action, Group, ImageMetadata, MemoryMetadataStore, Resource, Role, User,
    };
    use secret::{PasswordHash, Secret};

    use super::*;

    fn all_permissions() -> Vec<Permission> {
        let mut permissions = Vec::new();
        for action in [Action::Read, Action::Write, Action::Delete, Action::Admin] {
            for resource in [
                Resource::System,
                Resource::Registry,
                Resource::User,
                Resource::Group,
                Resource::Role,
            ] {
                permissions.push(Permission::new(action, resource));
            }
        }
        permissions
    }

    async fn store_with(user: &str, group: &str, role: Role) -> Arc<MemoryMetadataStore> {
        let store = Arc::new(MemoryMetadataStore::new());
        store
            .put_user(User {
                name: user.into(),
                groups: [group.to_owned()].into_iter().collect(),
                password: PasswordHash::new(&Secret::from("pw")),
            })
            .await
            .unwrap();
        store
            .put_group(Group {
                name: group.into(),
                roles: [role.name.clone()].into_iter().collect(),
                scope: String::new(),
            })
            .await
            .unwrap();
        store.put_role(role).await.unwrap();
        store
    }

    #[tokio::test]
    async fn super_grant_passes_everything() {
        let role = Role {
            name: "admin".into(),
            permissions: [Permission::SUPER_GRANT].into_iter().collect(),
        };
        let store = store_with("root", "admins", role).await;
        let resolver = PermissionResolver::new(store);

        for permission in all_permissions() {
            assert!(resolver.has_permission("root", &permission).await);
        }
    }

    #[tokio::test]
    async fn exact_match_only() {
        let role = Role {
            name: "reader".into(),
            permissions: [Permission::new(Action::Read, Resource::Registry)]
                .into_iter()
                .collect(),
        };
        let store = store_with("alice", "readers", role).await;
        let resolver = PermissionResolver::new(store);

        assert!(
            resolver
                .has_permission("alice", &Permission::new(Action::Read, Resource::Registry))
                .await
        );
        assert!(
            !resolver
                .has_permission("alice", &Permission::new(Action::Write, Resource::Registry))
                .await
        );
    }

    #[tokio::test]
    async fn anonymous_without_role_is_denied() {
        let resolver = PermissionResolver::new(Arc::new(MemoryMetadataStore::new()));
        for permission in all_permissions() {
            assert!(!resolver.has_permission(ANONYMOUS, &permission).await);
            assert!(!resolver.has_permission("", &permission).await);
        }
        assert_eq!(resolver.cached(), 0);
    }

    #[tokio::test]
    async fn anonymous_role_is_read_directly() {
        let store = Arc::new(MemoryMetadataStore::new());
        let resolver = PermissionResolver::new(store.clone());
        let pull = Permission::new(Action::Read, Resource::Registry);
        assert!(!resolver.has_permission(ANONYMOUS, &pull).await);

        store
            .put_role(Role {
                name: ANONYMOUS_ROLE.into(),
                permissions: [pull.clone()].into_iter().collect(),
            })
            .await
            .unwrap();
        assert!(resolver.has_permission(ANONYMOUS, &pull).await);
    }

    #[tokio::test]
    async fn cached_decisions_are_stale_until_cleared() {
        let role = Role {
            name: "reader".into(),
            permissions: [Permission::new(Action::Read, Resource::Registry)]
                .into_iter()
                .collect(),
        };
        let store = store_with("alice", "readers", role).await;
        let resolver = PermissionResolver::new(store.clone());
        let push = Permission::new(Action::Write, Resource::Registry);

        assert!(!resolver.has_permission("alice", &push).await);

        store
            .put_role(Role {
                name: "reader".into(),
                permissions: [push.clone()].into_iter().collect(),
            })
            .await
            .unwrap();
        assert!(!resolver.has_permission("alice", &push).await);

        resolver.clear();
        assert!(resolver.has_permission("alice", &push).await);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_clears_cache() {
        let role = Role {
            name: "reader".into(),
            permissions: [Permission::new(Action::Read, Resource::Registry)]
                .into_iter()
                .collect(),
        };
        let store = store_with("alice", "readers", role).await;
        let resolver = PermissionResolver::new(store).with_sweep(Duration::from_secs(60));

        resolver
            .has_permission("alice", &Permission::new(Action::Read, Resource::Registry))
            .await;
        assert_eq!(resolver.cached(), 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(resolver.cached(), 0);
    }

    #[tokio::test]
    async fn missing_group_denies() {
        let store = Arc::new(MemoryMetadataStore::new());
        store
            .put_user(User {
                name: "bob".into(),
                groups: ["ghosts".to_owned()].into_iter().collect(),
                password: PasswordHash::new(&Secret::from("pw")),
            })
            .await
            .unwrap();
        let resolver = PermissionResolver::new(store);

        assert!(
            !resolver
                .has_permission("bob", &Permission::new(Action::Read, Resource::Registry))
                .await
        );
        assert!(
            !resolver
                .has_permission("nobody", &Permission::new(Action::Read, Resource::Registry))
                .await
        );
    }

    #[derive(Debug, Default)]
    struct FailingStore {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl MetadataStore for FailingStore {
        async fn user(&self, _: &str) -> Result<User, MetadataError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(MetadataError::Backend("connection refused".into()))
        }
        async fn put_user(&self, _: User) -> Result<(), MetadataError> {
            unimplemented!()
        }
        async fn delete_user(&self, _: &str) -> Result<(), MetadataError> {
            unimplemented!()
        }
        async fn group(&self, _: &str) -> Result<Group, MetadataError> {
            unimplemented!()
        }
        async fn put_group(&self, _: Group) -> Result<(), MetadataError> {
            unimplemented!()
        }
        async fn role(&self, _: &str) -> Result<Role, MetadataError> {
            Err(MetadataError::Backend("connection refused".into()))
        }
        async fn put_role(&self, _: Role) -> Result<(), MetadataError> {
            unimplemented!()
        }
        async fn image(&self, _: &str, _: &str) -> Result<ImageMetadata, MetadataError> {
            unimplemented!()
        }
        async fn image_by_tag(
            &self,
            _: &str,
            _: &str,
        ) -> Result<Option<ImageMetadata>, MetadataError> {
            unimplemented!()
        }
        async fn put_image(&self, _: ImageMetadata) -> Result<(), MetadataError> {
            unimplemented!()
        }
        async fn delete_image(&self, _: &str, _: &str) -> Result<(), MetadataError> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn backend_errors_deny_and_are_not_cached() {
        let store = Arc::new(FailingStore::default());
        let resolver = PermissionResolver::new(store.clone());
        let permission = Permission::new(Action::Read, Resource::Registry);

        assert!(!resolver.has_permission("alice", &permission).await);
        assert!(!resolver.has_permission("alice", &permission).await);
        assert!(!resolver.has_permission(ANONYMOUS, &permission).await);
        assert_eq!(resolver.cached(), 0);
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }
}
