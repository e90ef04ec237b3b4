//! Workspace registry: allocates POSIX uid/gid per tenant, hashes the
//! workspace secret, and persists the record. The actual `run-as`
//! mechanics live in `vibe80_session::Isolator`; this module only owns
//! the `Workspace` entity's lifecycle.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::config::WorkspaceConfig;
use crate::error::{EngineError, Result};
use crate::model::Workspace;
use crate::storage::Storage;

fn workspace_key(workspace_id: &str) -> String {
    format!("workspace:{workspace_id}")
}

fn uid_allocation_key() -> &'static str {
    "workspace:uid_allocations"
}

fn roster_key() -> &'static str {
    "workspace:__roster__"
}

pub struct WorkspaceRegistry {
    storage: Arc<dyn Storage>,
    config: WorkspaceConfig,
    id_pattern: Regex,
}

impl WorkspaceRegistry {
    pub fn new(storage: Arc<dyn Storage>, config: WorkspaceConfig) -> Self {
        Self {
            storage,
            config,
            id_pattern: Regex::new(r"^w[0-9a-f]{24}$").expect("static regex"),
        }
    }

    pub fn validate_id(&self, workspace_id: &str) -> Result<()> {
        if workspace_id == "default" || self.id_pattern.is_match(workspace_id) {
            Ok(())
        } else {
            Err(EngineError::Validation(format!(
                "invalid workspaceId: {workspace_id}"
            )))
        }
    }

    /// SHA-256 hex digest of `secret`, salt-less per the data model.
    pub fn hash_secret(secret: &str) -> String {
        let digest = Sha256::digest(secret.as_bytes());
        hex::encode(digest)
    }

    /// Allocate a uid in `[uid_min, uid_max]` unique among already-recorded
    /// allocations (mono-user deployments never call this: the isolator
    /// collapses every identity to the process uid regardless).
    async fn allocate_uid(&self) -> Result<u32> {
        let allocations = self.storage.hgetall(uid_allocation_key()).await?;
        let taken: std::collections::HashSet<u32> = allocations
            .iter()
            .filter_map(|(_, v)| v.as_u64().map(|n| n as u32))
            .collect();

        for candidate in self.config.uid_min..=self.config.uid_max {
            if !taken.contains(&candidate) {
                return Ok(candidate);
            }
        }
        Err(EngineError::Other(anyhow::anyhow!(
            "uid space [{}, {}] exhausted",
            self.config.uid_min,
            self.config.uid_max
        )))
    }

    pub async fn create(&self, workspace_id: &str, secret: &str) -> Result<Workspace> {
        self.validate_id(workspace_id)?;

        let uid = self.allocate_uid().await?;
        let gid = uid;
        self.storage
            .hset(uid_allocation_key(), workspace_id, serde_json::json!(uid))
            .await?;

        let now = Utc::now();
        let workspace = Workspace {
            workspace_id: workspace_id.to_string(),
            uid,
            gid,
            providers: BTreeMap::new(),
            secret_hash: Self::hash_secret(secret),
            created_at: now,
            updated_at: now,
        };

        self.persist(&workspace).await?;
        self.storage
            .hset(roster_key(), workspace_id, serde_json::json!(true))
            .await?;
        info!(workspace_id, uid, "created workspace");
        Ok(workspace)
    }

    /// Every workspace id ever created, for the session GC sweep — the
    /// GC loop has no other way to enumerate tenants since the storage
    /// contract exposes no key scan.
    pub async fn list_ids(&self) -> Result<Vec<String>> {
        Ok(self
            .storage
            .hgetall(roster_key())
            .await?
            .into_iter()
            .map(|(id, _)| id)
            .collect())
    }

    pub async fn get(&self, workspace_id: &str) -> Result<Workspace> {
        self.validate_id(workspace_id)?;
        let value = self
            .storage
            .get(&workspace_key(workspace_id))
            .await?
            .ok_or_else(|| EngineError::not_found("workspace", workspace_id))?;
        Self::deserialize(value)
    }

    pub async fn rotate_secret(&self, workspace_id: &str, new_secret: &str) -> Result<Workspace> {
        let mut workspace = self.get(workspace_id).await?;
        workspace.secret_hash = Self::hash_secret(new_secret);
        workspace.updated_at = Utc::now();
        self.persist(&workspace).await?;
        Ok(workspace)
    }

    pub async fn destroy(&self, workspace_id: &str) -> Result<()> {
        self.validate_id(workspace_id)?;
        self.storage.delete(&workspace_key(workspace_id)).await?;
        self.storage.hdel(uid_allocation_key(), workspace_id).await?;
        self.storage.hdel(roster_key(), workspace_id).await?;
        info!(workspace_id, "destroyed workspace record");
        Ok(())
    }

    async fn persist(&self, workspace: &Workspace) -> Result<()> {
        let value = serde_json::to_value(workspace)
            .map_err(|e| EngineError::Storage(format!("serialize workspace: {e}")))?;
        self.storage
            .set(&workspace_key(&workspace.workspace_id), value)
            .await
    }

    fn deserialize(value: Value) -> Result<Workspace> {
        serde_json::from_value(value)
            .map_err(|e| EngineError::Storage(format!("corrupt workspace record: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeploymentModeConfig;
    use crate::storage::DashMapStorage;
    use std::path::PathBuf;

    fn test_config() -> WorkspaceConfig {
        WorkspaceConfig {
            root_directory: PathBuf::from("/var/lib/vibe80"),
            uid_min: 2000,
            uid_max: 2010,
            deployment_mode: DeploymentModeConfig::MultiUser,
        }
    }

    #[tokio::test]
    async fn create_allocates_unique_uids() {
        let registry = WorkspaceRegistry::new(Arc::new(DashMapStorage::new()), test_config());
        let w1 = registry.create("w000000000000000000000001", "s1").await.unwrap();
        let w2 = registry.create("w000000000000000000000002", "s2").await.unwrap();
        assert_ne!(w1.uid, w2.uid);
        assert!((2000..=2010).contains(&w1.uid));
    }

    #[tokio::test]
    async fn rejects_malformed_id() {
        let registry = WorkspaceRegistry::new(Arc::new(DashMapStorage::new()), test_config());
        let err = registry.create("not-a-valid-id", "s1").await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn list_ids_reflects_create_and_destroy() {
        let registry = WorkspaceRegistry::new(Arc::new(DashMapStorage::new()), test_config());
        registry.create("w000000000000000000000001", "s1").await.unwrap();
        registry.create("w000000000000000000000002", "s2").await.unwrap();
        let mut ids = registry.list_ids().await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["w000000000000000000000001", "w000000000000000000000002"]);

        registry.destroy("w000000000000000000000001").await.unwrap();
        assert_eq!(registry.list_ids().await.unwrap(), vec!["w000000000000000000000002"]);
    }

    #[test]
    fn secret_hash_is_saltless_sha256() {
        let hash = WorkspaceRegistry::hash_secret("hunter2");
        let expected = hex::encode(Sha256::digest(b"hunter2"));
        assert_eq!(hash, expected);
    }
}
