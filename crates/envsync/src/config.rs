//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use envsync_perms::PoolConfig;
use envsync_sync::SyncConfig;

use crate::error::{ClientError, Result};

/// Configuration for the [`Client`](crate::Client).
///
/// Every field has a default, so a JSON document only needs the settings it
/// changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Crypto worker count. `None` uses the available parallelism.
    pub crypto_workers: Option<usize>,
    /// Lifetime of a new invite.
    pub invite_ttl: Duration,
    /// Lifetime of a new device grant.
    pub device_grant_ttl: Duration,
    /// Replay full changeset history on refresh and compare it to the
    /// decrypted env.
    pub verify_history: bool,
    /// Write pending edits and conflicts to the local store after every change.
    pub persist_pending: bool,
    /// Sync configuration.
    pub sync: SyncConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            crypto_workers: None,
            invite_ttl: Duration::from_secs(24 * 60 * 60),
            device_grant_ttl: Duration::from_secs(24 * 60 * 60),
            verify_history: true,
            persist_pending: true,
            sync: SyncConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Parse from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ClientError::Config(e.to_string()))
    }

    /// Crypto pool settings derived from this config.
    pub fn pool_config(&self) -> PoolConfig {
        let mut pool = PoolConfig::default();
        if let Some(workers) = self.crypto_workers {
            pool.workers = workers.max(1);
        }
        pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ClientConfig::from_json(r#"{"crypto_workers": 2, "persist_pending": false}"#).unwrap();
        assert_eq!(config.crypto_workers, Some(2));
        assert!(!config.persist_pending);
        assert!(config.verify_history);
        assert_eq!(config.invite_ttl, Duration::from_secs(86_400));
        assert_eq!(config.sync, SyncConfig::default());
        assert_eq!(config.pool_config().workers, 2);
    }

    #[test]
    fn test_zero_workers_clamped() {
        let config = ClientConfig {
            crypto_workers: Some(0),
            ..Default::default()
        };
        assert_eq!(config.pool_config().workers, 1);
    }

    #[test]
    fn test_bad_json_rejected() {
        assert!(ClientConfig::from_json(r#"{"invite_ttl": "soon"}"#).is_err());
    }
}
