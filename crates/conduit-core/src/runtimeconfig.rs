//! Store-backed runtime settings.
//!
//! Reading goes through a [`Resolver`], writing through a [`Mutator`]. An [`Entry`] names one
//! typed setting and does not care where it is stored, so the same entry can be resolved
//! globally or inside an organization by swapping the resolver.

use std::{fmt::Display, marker::PhantomData, str::FromStr, sync::Arc};

use async_trait::async_trait;
use uuid::Uuid;

use crate::store::{Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeConfigError {
    #[error("entry not found")]
    EntryNotFound,
    #[error("invalid value for {key:?}: {reason}")]
    Invalid { key: String, reason: String },
    #[error("{op} {key:?}: {source}")]
    Store {
        op: &'static str,
        key: String,
        source: StoreError,
    },
    #[error("runtime config is read only")]
    ReadOnly,
}

#[async_trait]
pub trait Resolver: Send + Sync {
    async fn get_runtime_config(&self, key: &str) -> Result<String, RuntimeConfigError>;
}

#[async_trait]
pub trait Mutator: Send + Sync {
    async fn upsert_runtime_config(&self, key: &str, value: &str) -> Result<(), RuntimeConfigError>;
    async fn delete_runtime_config(&self, key: &str) -> Result<(), RuntimeConfigError>;
}

/// Resolver and mutator over the unscoped store keyspace.
#[derive(Clone)]
pub struct StoreManager {
    store: Arc<dyn Store>,
}

impl StoreManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Narrows this manager to one organization's keyspace.
    pub fn scoped(&self, organization_id: Uuid) -> OrgScoped<Self> {
        OrgScoped::new(organization_id, self.clone())
    }
}

#[async_trait]
impl Resolver for StoreManager {
    async fn get_runtime_config(&self, key: &str) -> Result<String, RuntimeConfigError> {
        match self.store.runtime_config(key).await {
            Ok(v) => Ok(v),
            Err(StoreError::NotFound) => Err(RuntimeConfigError::EntryNotFound),
            Err(source) => Err(RuntimeConfigError::Store {
                op: "get",
                key: key.to_string(),
                source,
            }),
        }
    }
}

#[async_trait]
impl Mutator for StoreManager {
    async fn upsert_runtime_config(&self, key: &str, value: &str) -> Result<(), RuntimeConfigError> {
        self.store
            .upsert_runtime_config(key, value)
            .await
            .map_err(|source| RuntimeConfigError::Store {
                op: "upsert",
                key: key.to_string(),
                source,
            })
    }

    async fn delete_runtime_config(&self, key: &str) -> Result<(), RuntimeConfigError> {
        self.store
            .delete_runtime_config(key)
            .await
            .map_err(|source| RuntimeConfigError::Store {
                op: "delete",
                key: key.to_string(),
                source,
            })
    }
}

/// Prefixes every key with `organization:<id>:` before handing it to the inner manager.
#[derive(Clone)]
pub struct OrgScoped<M> {
    organization_id: Uuid,
    inner: M,
}

impl<M> OrgScoped<M> {
    pub fn new(organization_id: Uuid, inner: M) -> Self {
        Self {
            organization_id,
            inner,
        }
    }

    fn key(&self, key: &str) -> String {
        format!("organization:{}:{key}", self.organization_id)
    }
}

#[async_trait]
impl<M: Resolver> Resolver for OrgScoped<M> {
    async fn get_runtime_config(&self, key: &str) -> Result<String, RuntimeConfigError> {
        self.inner.get_runtime_config(&self.key(key)).await
    }
}

#[async_trait]
impl<M: Mutator> Mutator for OrgScoped<M> {
    async fn upsert_runtime_config(&self, key: &str, value: &str) -> Result<(), RuntimeConfigError> {
        self.inner.upsert_runtime_config(&self.key(key), value).await
    }

    async fn delete_runtime_config(&self, key: &str) -> Result<(), RuntimeConfigError> {
        self.inner.delete_runtime_config(&self.key(key)).await
    }
}

/// Resolves nothing and refuses writes. Used where runtime overrides are disabled.
pub struct NoopManager;

#[async_trait]
impl Resolver for NoopManager {
    async fn get_runtime_config(&self, _key: &str) -> Result<String, RuntimeConfigError> {
        Err(RuntimeConfigError::EntryNotFound)
    }
}

#[async_trait]
impl Mutator for NoopManager {
    async fn upsert_runtime_config(&self, _: &str, _: &str) -> Result<(), RuntimeConfigError> {
        Err(RuntimeConfigError::ReadOnly)
    }

    async fn delete_runtime_config(&self, _: &str) -> Result<(), RuntimeConfigError> {
        Err(RuntimeConfigError::ReadOnly)
    }
}

pub struct Entry<T> {
    key: String,
    _value: PhantomData<fn() -> T>,
}

impl<T> Entry<T>
where
    T: FromStr + Display,
    T::Err: Display,
{
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            _value: PhantomData,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn resolve(&self, resolver: &dyn Resolver) -> Result<T, RuntimeConfigError> {
        let raw = resolver.get_runtime_config(&self.key).await?;
        raw.parse::<T>().map_err(|e| RuntimeConfigError::Invalid {
            key: self.key.clone(),
            reason: e.to_string(),
        })
    }

    /// Resolves the entry, falling back to `default` when it is unset.
    pub async fn resolve_or(&self, resolver: &dyn Resolver, default: T) -> Result<T, RuntimeConfigError> {
        match self.resolve(resolver).await {
            Err(RuntimeConfigError::EntryNotFound) => Ok(default),
            other => other,
        }
    }

    pub async fn set_runtime_value(
        &self,
        mutator: &dyn Mutator,
        value: &T,
    ) -> Result<(), RuntimeConfigError> {
        mutator
            .upsert_runtime_config(&self.key, &value.to_string())
            .await
    }

    pub async fn unset_runtime_value(&self, mutator: &dyn Mutator) -> Result<(), RuntimeConfigError> {
        mutator.delete_runtime_config(&self.key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memstore::MemStore;

    #[tokio::test]
    async fn scoped_entries_do_not_leak_between_orgs() {
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let manager = StoreManager::new(store);
        let entry = Entry::<u64>::new("report_interval_ms");
        let org_a = manager.scoped(Uuid::new_v4());
        let org_b = manager.scoped(Uuid::new_v4());

        entry.set_runtime_value(&org_a, &42).await.unwrap();
        assert_eq!(entry.resolve(&org_a).await.unwrap(), 42);
        assert!(matches!(
            entry.resolve(&org_b).await,
            Err(RuntimeConfigError::EntryNotFound)
        ));
        assert!(matches!(
            entry.resolve(&manager).await,
            Err(RuntimeConfigError::EntryNotFound)
        ));

        entry.unset_runtime_value(&org_a).await.unwrap();
        assert_eq!(entry.resolve_or(&org_a, 7).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn unparsable_value_is_reported() {
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let manager = StoreManager::new(store);
        manager
            .upsert_runtime_config("flag", "maybe")
            .await
            .unwrap();
        let entry = Entry::<bool>::new("flag");
        assert!(matches!(
            entry.resolve(&manager).await,
            Err(RuntimeConfigError::Invalid { .. })
        ));
    }

    #[tokio::test]
    async fn noop_manager_is_read_only() {
        let entry = Entry::<String>::new("motd");
        assert!(matches!(
            entry.set_runtime_value(&NoopManager, &"hi".to_string()).await,
            Err(RuntimeConfigError::ReadOnly)
        ));
        assert_eq!(
            entry.resolve_or(&NoopManager, "default".to_string()).await.unwrap(),
            "default"
        );
    }
}
