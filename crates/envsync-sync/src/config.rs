//! Sync settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Limits applied to every exchange with the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Timeout for one fetch or submit round trip.
    pub fetch_timeout: Duration,
    /// Maximum envelopes carried by one update request.
    pub max_envelopes_per_request: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(30),
            max_envelopes_per_request: 10_000,
        }
    }
}

/// Run a server call under the configured timeout.
pub async fn with_timeout<T>(
    config: &SyncConfig,
    what: &str,
    call: impl std::future::Future<Output = crate::Result<T>>,
) -> crate::Result<T> {
    match tokio::time::timeout(config.fetch_timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(crate::SyncError::Timeout(format!(
            "{} did not complete within {:?}",
            what, config.fetch_timeout
        ))),
    }
}
