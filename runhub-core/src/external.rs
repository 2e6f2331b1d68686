//! Contracts for collaborators outside the dispatch core: the bot catalog,
//! the secrets vault, infrastructure power management and notification
//! delivery. Production wires real integrations; the bundled impls cover
//! tests and single-node deployments.

use crate::types::Runner;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use uuid::Uuid;

/// Compilation state of a bot version. Only COMPILED and PUBLISHED versions
/// are executable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BotVersionState {
    Draft,
    Compiled,
    Published,
}

/// The slice of a bot version the dispatch core consumes. The compiled plan
/// itself stays opaque — runners fetch it from `package_url` and verify
/// `plan_hash`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotVersion {
    pub bot_id: Uuid,
    pub version_id: Uuid,
    pub state: BotVersionState,
    pub plan_hash: String,
    pub package_url: String,
    #[serde(default)]
    pub total_steps: u32,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub default_timeout_seconds: Option<u32>,
}

impl BotVersion {
    pub fn is_executable(&self) -> bool {
        matches!(
            self.state,
            BotVersionState::Compiled | BotVersionState::Published
        ) && !self.plan_hash.is_empty()
    }
}

#[async_trait]
pub trait BotCatalog: Send + Sync {
    /// Resolve a bot version; `version_id = None` means "latest executable".
    async fn resolve(&self, bot_id: Uuid, version_id: Option<Uuid>) -> Result<Option<BotVersion>>;
}

/// Fixed catalog for tests and standalone deployments.
#[derive(Default)]
pub struct StaticCatalog {
    versions: RwLock<HashMap<Uuid, Vec<BotVersion>>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, version: BotVersion) {
        let mut versions = match self.versions.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        versions.entry(version.bot_id).or_default().push(version);
    }
}

#[async_trait]
impl BotCatalog for StaticCatalog {
    async fn resolve(&self, bot_id: Uuid, version_id: Option<Uuid>) -> Result<Option<BotVersion>> {
        let versions = self.versions.read().map_err(|_| anyhow!("catalog lock poisoned"))?;
        let Some(list) = versions.get(&bot_id) else {
            return Ok(None);
        };
        Ok(match version_id {
            Some(vid) => list.iter().find(|v| v.version_id == vid).cloned(),
            None => list.iter().rev().find(|v| v.is_executable()).cloned(),
        })
    }
}

#[async_trait]
pub trait SecretsResolver: Send + Sync {
    /// Resolve the secret bundle a plan needs, as `{name → value}`.
    async fn resolve(&self, tenant_id: Uuid, plan_hash: &str)
        -> Result<BTreeMap<String, String>>;
}

/// Resolver that returns an empty bundle.
pub struct NoSecrets;

#[async_trait]
impl SecretsResolver for NoSecrets {
    async fn resolve(
        &self,
        _tenant_id: Uuid,
        _plan_hash: &str,
    ) -> Result<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }
}

#[async_trait]
pub trait PowerManager: Send + Sync {
    /// Request power-on for an offline pinned runner (e.g. wake-on-LAN).
    /// Fire-and-forget; the queue entry stays put until the runner appears.
    async fn wake(&self, runner: &Runner) -> Result<()>;
}

pub struct NoopPower;

#[async_trait]
impl PowerManager for NoopPower {
    async fn wake(&self, _runner: &Runner) -> Result<()> {
        Ok(())
    }
}

/// A notification the core wants delivered; transport is external.
#[derive(Clone, Debug)]
pub struct NotificationIntent {
    pub tenant_id: Uuid,
    pub run_id: Uuid,
    pub kind: String,
    pub subject: String,
    pub body: String,
    pub recipients: Vec<String>,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, intent: NotificationIntent) -> Result<()>;
}

pub struct NoopNotifier;

#[async_trait]
impl NotificationSink for NoopNotifier {
    async fn notify(&self, _intent: NotificationIntent) -> Result<()> {
        Ok(())
    }
}
