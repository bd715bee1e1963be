use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use crate::{Group, ImageMetadata, MetadataError, Role, User};

/// Durable storage for accounts, roles and image records.
#[async_trait::async_trait]
pub trait MetadataStore: std::fmt::Debug + Send + Sync {
    /// Load a user by name.
    async fn user(&self, name: &str) -> Result<User, MetadataError>;

    /// Create or replace a user.
    async fn put_user(&self, user: User) -> Result<(), MetadataError>;

    /// Remove a user.
    async fn delete_user(&self, name: &str) -> Result<(), MetadataError>;

    /// Load a group by name.
    async fn group(&self, name: &str) -> Result<Group, MetadataError>;

    /// Create or replace a group.
    async fn put_group(&self, group: Group) -> Result<(), MetadataError>;

    /// Load a role by name.
    async fn role(&self, name: &str) -> Result<Role, MetadataError>;

    /// Create or replace a role.
    async fn put_role(&self, role: Role) -> Result<(), MetadataError>;

    /// Load the record for a manifest in a repository.
    async fn image(&self, repository: &str, digest: &str) -> Result<ImageMetadata, MetadataError>;

    /// Find the record in a repository whose tag set contains `tag`.
    async fn image_by_tag(
        &self,
        repository: &str,
        tag: &str,
    ) -> Result<Option<ImageMetadata>, MetadataError>;

    /// Create or replace an image record.
    async fn put_image(&self, image: ImageMetadata) -> Result<(), MetadataError>;

    /// Remove an image record. Removing a missing record is not an error.
    async fn delete_image(&self, repository: &str, digest: &str) -> Result<(), MetadataError>;
}

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<String, User>,
    groups: HashMap<String, Group>,
    roles: HashMap<String, Role>,
    images: BTreeMap<(String, String), ImageMetadata>,
}

/// A metadata store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    tables: RwLock<Tables>,
}

impl MemoryMetadataStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn user(&self, name: &str) -> Result<User, MetadataError> {
        self.tables
            .read()
            .users
            .get(name)
            .cloned()
            .ok_or_else(|| MetadataError::UserNotFound(name.to_owned()))
    }

    async fn put_user(&self, user: User) -> Result<(), MetadataError> {
        tracing::debug!(user = %user.name, "Storing user");
        self.tables.write().users.insert(user.name.clone(), user);
        Ok(())
    }

    async fn delete_user(&self, name: &str) -> Result<(), MetadataError> {
        self.tables
            .write()
            .users
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| MetadataError::UserNotFound(name.to_owned()))
    }

    async fn group(&self, name: &str) -> Result<Group, MetadataError> {
        self.tables
            .read()
            .groups
            .get(name)
            .cloned()
            .ok_or_else(|| MetadataError::GroupNotFound(name.to_owned()))
    }

    async fn put_group(&self, group: Group) -> Result<(), MetadataError> {
        self.tables.write().groups.insert(group.name.clone(), group);
        Ok(())
    }

    async fn role(&self, name: &str) -> Result<Role, MetadataError> {
        self.tables
            .read()
            .roles
            .get(name)
            .cloned()
            .ok_or_else(|| MetadataError::RoleNotFound(name.to_owned()))
    }

    async fn put_role(&self, role: Role) -> Result<(), MetadataError> {
        self.tables.write().roles.insert(role.name.clone(), role);
        Ok(())
    }

    async fn image(&self, repository: &str, digest: &str) -> Result<ImageMetadata, MetadataError> {
        self.tables
            .read()
            .images
            .get(&(repository.to_owned(), digest.to_owned()))
            .cloned()
            .ok_or_else(|| MetadataError::ImageNotFound {
                repository: repository.to_owned(),
                digest: digest.to_owned(),
            })
    }

    async fn image_by_tag(
        &self,
        repository: &str,
        tag: &str,
    ) -> Result<Option<ImageMetadata>, MetadataError> {
        let tables = self.tables.read();
        Ok(tables
            .images
            .values()
            .find(|image| image.repository == repository && image.tags.contains(tag))
            .cloned())
    }

    async fn put_image(&self, image: ImageMetadata) -> Result<(), MetadataError> {
        let key = (image.repository.clone(), image.digest.clone());
        self.tables.write().images.insert(key, image);
        Ok(())
    }

    async fn delete_image(&self, repository: &str, digest: &str) -> Result<(), MetadataError> {
        self.tables
            .write()
            .images
            .remove(&(repository.to_owned(), digest.to_owned()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use secret::{PasswordHash, Secret};

    use super::*;

    static_assertions::assert_obj_safe!(MetadataStore);

    #[tokio::test]
    async fn missing_rows_are_typed() {
        let store = MemoryMetadataStore::new();
        assert!(matches!(
            store.user("nobody").await,
            Err(MetadataError::UserNotFound(_))
        ));
        assert!(matches!(
            store.group("nobody").await,
            Err(MetadataError::GroupNotFound(_))
        ));
        assert!(matches!(
            store.role("nobody").await,
            Err(MetadataError::RoleNotFound(_))
        ));
    }

    #[tokio::test]
    async fn users_round_trip() {
        let store = MemoryMetadataStore::new();
        let user = User {
            name: "alice".into(),
            groups: ["devs".to_owned()].into_iter().collect(),
            password: PasswordHash::new(&Secret::from("pw")),
        };
        store.put_user(user.clone()).await.unwrap();
        assert_eq!(store.user("alice").await.unwrap(), user);

        store.delete_user("alice").await.unwrap();
        assert!(store.user("alice").await.is_err());
    }

    #[tokio::test]
    async fn images_by_repository_and_tag() {
        let store = MemoryMetadataStore::new();
        let mut image = ImageMetadata::new("app", "sha256:aa", "application/json", 10, "alice");
        image.tags.insert("v1".into());
        store.put_image(image.clone()).await.unwrap();

        let other = ImageMetadata::new("other", "sha256:aa", "application/json", 10, "bob");
        store.put_image(other).await.unwrap();

        assert_eq!(
            store.image_by_tag("app", "v1").await.unwrap().unwrap().digest,
            "sha256:aa"
        );
        assert!(store.image_by_tag("other", "v1").await.unwrap().is_none());

        store.delete_image("app", "sha256:aa").await.unwrap();
        assert!(store.image("app", "sha256:aa").await.is_err());
        assert!(store.image("other", "sha256:aa").await.is_ok());
    }
}
