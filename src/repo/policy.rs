//! Per-user policy storage and the default-tariff backup store C7 restores
//! from on spike exit. In-memory by default; a `sqlx`-backed Postgres
//! implementation behind the `db` feature, following `PgRepo`'s
//! connect-then-hand-out-repositories shape.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::{SavedTariff, UserPolicy};
use crate::spike::TariffBackupStore;

/// Per-user configuration/state storage consumed by every controller that
/// reads or mutates `UserPolicy`.
#[async_trait]
pub trait PolicyRepository: Send + Sync {
    async fn all(&self) -> anyhow::Result<Vec<UserPolicy>>;
    async fn get(&self, user_id: Uuid) -> anyhow::Result<Option<UserPolicy>>;
    async fn save(&self, policy: &UserPolicy) -> anyhow::Result<()>;
}

/// `RwLock<HashMap>` default, matching the teacher's in-process fallback
/// for deployments that don't enable the `db` feature.
#[derive(Default)]
pub struct InMemoryPolicyRepository {
    policies: RwLock<HashMap<Uuid, UserPolicy>>,
    saved_tariffs: RwLock<HashMap<Uuid, SavedTariff>>,
}

impl InMemoryPolicyRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PolicyRepository for InMemoryPolicyRepository {
    async fn all(&self) -> anyhow::Result<Vec<UserPolicy>> {
        Ok(self.policies.read().await.values().cloned().collect())
    }

    async fn get(&self, user_id: Uuid) -> anyhow::Result<Option<UserPolicy>> {
        Ok(self.policies.read().await.get(&user_id).cloned())
    }

    async fn save(&self, policy: &UserPolicy) -> anyhow::Result<()> {
        self.policies.write().await.insert(policy.user_id, policy.clone());
        Ok(())
    }
}

#[async_trait]
impl TariffBackupStore for InMemoryPolicyRepository {
    async fn default_for(&self, user_id: Uuid) -> anyhow::Result<Option<SavedTariff>> {
        Ok(self.saved_tariffs.read().await.get(&user_id).cloned())
    }

    async fn save_as_default(&self, user_id: Uuid, document: serde_json::Value) -> anyhow::Result<SavedTariff> {
        let saved = SavedTariff { id: Uuid::new_v4(), user_id, is_default: true, saved_at: Utc::now(), document };
        self.saved_tariffs.write().await.insert(user_id, saved.clone());
        Ok(saved)
    }
}

#[cfg(feature = "db")]
pub struct PostgresPolicyRepository {
    pool: sqlx::PgPool,
}

#[cfg(feature = "db")]
impl PostgresPolicyRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[cfg(feature = "db")]
#[async_trait]
impl PolicyRepository for PostgresPolicyRepository {
    async fn all(&self) -> anyhow::Result<Vec<UserPolicy>> {
        let rows = sqlx::query!("SELECT policy FROM user_policies")
            .fetch_all(&self.pool)
            .await
            .context("loading all user policies")?;
        rows.into_iter()
            .map(|row| serde_json::from_value(row.policy).context("decoding stored user policy"))
            .collect()
    }

    async fn get(&self, user_id: Uuid) -> anyhow::Result<Option<UserPolicy>> {
        let row = sqlx::query!("SELECT policy FROM user_policies WHERE user_id = $1", user_id)
            .fetch_optional(&self.pool)
            .await
            .context("loading user policy")?;
        row.map(|r| serde_json::from_value(r.policy).context("decoding stored user policy")).transpose()
    }

    async fn save(&self, policy: &UserPolicy) -> anyhow::Result<()> {
        let encoded = serde_json::to_value(policy).context("encoding user policy")?;
        sqlx::query!(
            r#"
            INSERT INTO user_policies (user_id, policy)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE SET policy = EXCLUDED.policy
            "#,
            policy.user_id,
            encoded
        )
        .execute(&self.pool)
        .await
        .context("saving user policy")?;
        Ok(())
    }
}

#[cfg(feature = "db")]
#[async_trait]
impl TariffBackupStore for PostgresPolicyRepository {
    async fn default_for(&self, user_id: Uuid) -> anyhow::Result<Option<SavedTariff>> {
        let row = sqlx::query!(
            "SELECT id, user_id, is_default, saved_at, document FROM saved_tariffs WHERE user_id = $1 AND is_default = true",
            user_id
        )
        .fetch_optional(&self.pool)
        .await
        .context("loading default saved tariff")?;
        Ok(row.map(|r| SavedTariff { id: r.id, user_id: r.user_id, is_default: r.is_default, saved_at: r.saved_at, document: r.document }))
    }

    async fn save_as_default(&self, user_id: Uuid, document: serde_json::Value) -> anyhow::Result<SavedTariff> {
        let saved = SavedTariff { id: Uuid::new_v4(), user_id, is_default: true, saved_at: Utc::now(), document };
        sqlx::query!(
            r#"
            INSERT INTO saved_tariffs (id, user_id, is_default, saved_at, document)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id) WHERE is_default
            DO UPDATE SET document = EXCLUDED.document, saved_at = EXCLUDED.saved_at
            "#,
            saved.id,
            saved.user_id,
            saved.is_default,
            saved.saved_at,
            saved.document
        )
        .execute(&self.pool)
        .await
        .context("saving default tariff backup")?;
        Ok(saved)
    }
}

/// Picks the Postgres-backed implementation when a pool is configured,
/// falling back to the in-memory store otherwise — one handle shared
/// across everything that needs both `PolicyRepository` and
/// `TariffBackupStore` (they're the same store).
#[cfg(feature = "db")]
pub fn shared_policy_store(pool: Option<sqlx::PgPool>) -> Arc<InMemoryStoreOrPostgres> {
    match pool {
        Some(pool) => Arc::new(InMemoryStoreOrPostgres::Postgres(PostgresPolicyRepository::new(pool))),
        None => Arc::new(InMemoryStoreOrPostgres::InMemory(InMemoryPolicyRepository::new())),
    }
}

#[cfg(not(feature = "db"))]
pub fn shared_policy_store() -> Arc<InMemoryStoreOrPostgres> {
    Arc::new(InMemoryStoreOrPostgres::InMemory(InMemoryPolicyRepository::new()))
}

/// Enum-dispatch wrapper so callers hold one `Arc` implementing both
/// traits regardless of which backend is active.
pub enum InMemoryStoreOrPostgres {
    InMemory(InMemoryPolicyRepository),
    #[cfg(feature = "db")]
    Postgres(PostgresPolicyRepository),
}

#[async_trait]
impl PolicyRepository for InMemoryStoreOrPostgres {
    async fn all(&self) -> anyhow::Result<Vec<UserPolicy>> {
        match self {
            Self::InMemory(r) => r.all().await,
            #[cfg(feature = "db")]
            Self::Postgres(r) => r.all().await,
        }
    }

    async fn get(&self, user_id: Uuid) -> anyhow::Result<Option<UserPolicy>> {
        match self {
            Self::InMemory(r) => r.get(user_id).await,
            #[cfg(feature = "db")]
            Self::Postgres(r) => r.get(user_id).await,
        }
    }

    async fn save(&self, policy: &UserPolicy) -> anyhow::Result<()> {
        match self {
            Self::InMemory(r) => r.save(policy).await,
            #[cfg(feature = "db")]
            Self::Postgres(r) => r.save(policy).await,
        }
    }
}

#[async_trait]
impl TariffBackupStore for InMemoryStoreOrPostgres {
    async fn default_for(&self, user_id: Uuid) -> anyhow::Result<Option<SavedTariff>> {
        match self {
            Self::InMemory(r) => r.default_for(user_id).await,
            #[cfg(feature = "db")]
            Self::Postgres(r) => r.default_for(user_id).await,
        }
    }

    async fn save_as_default(&self, user_id: Uuid, document: serde_json::Value) -> anyhow::Result<SavedTariff> {
        match self {
            Self::InMemory(r) => r.save_as_default(user_id, document).await,
            #[cfg(feature = "db")]
            Self::Postgres(r) => r.save_as_default(user_id, document).await,
        }
    }
}
