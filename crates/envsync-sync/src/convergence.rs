//! Convergence verification.
//!
//! Two replicas that hold the same changesets for a scope compute the same
//! state hash, so they can compare histories without exchanging plaintext.

use envsync_core::{action_bytes, Blake3Hash, Scope};

use crate::changeset::{ordered, Changeset};
use crate::error::Result;

/// Rolling Blake3 hash of a scope's history up to version `n`.
///
/// Algorithm:
/// 1. Sort and validate versions `1..=n`
/// 2. Seed the hasher with a domain tag and the scope text form
/// 3. For each changeset, absorb its version and canonical action bytes
pub fn version_state_hash(scope: &Scope, changesets: &[Changeset], n: u64) -> Result<Blake3Hash> {
    let sorted = ordered(scope, changesets)?;

    let mut hasher = blake3::Hasher::new();
    hasher.update(b"envsync-state-v0:");
    hasher.update(scope.to_string().as_bytes());

    for cs in sorted.iter().take(n as usize) {
        hasher.update(&cs.version.to_be_bytes());
        hasher.update(&(cs.actions.len() as u64).to_be_bytes());
        for action in &cs.actions {
            let bytes = action_bytes(scope, action)?;
            hasher.update(&(bytes.len() as u64).to_be_bytes());
            hasher.update(&bytes);
        }
    }

    Ok(hasher.finalize().into())
}

/// Result of convergence verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvergenceResult {
    /// Both replicas have identical history.
    Converged,
    /// One replica is behind the other.
    Behind { local: u64, remote: u64 },
    /// Same version, different history.
    Diverged { version: u64 },
}

impl ConvergenceResult {
    pub fn is_converged(&self) -> bool {
        matches!(self, ConvergenceResult::Converged)
    }
}

/// Compare a local history against a remote (version, hash) pair.
pub fn verify_convergence(
    scope: &Scope,
    local: &[Changeset],
    remote_version: u64,
    remote_hash: &Blake3Hash,
) -> Result<ConvergenceResult> {
    let local_version = local.len() as u64;
    if local_version != remote_version {
        return Ok(ConvergenceResult::Behind {
            local: local_version,
            remote: remote_version,
        });
    }
    let local_hash = version_state_hash(scope, local, local_version)?;
    if &local_hash != remote_hash {
        tracing::warn!(%scope, version = local_version, "replica histories diverged");
        return Ok(ConvergenceResult::Diverged {
            version: local_version,
        });
    }
    Ok(ConvergenceResult::Converged)
}
