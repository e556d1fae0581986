//! Session context: who is acting, with which keys, trusting which roots,
//! and at what time.
//!
//! Every resolver, calculator, and envelope call made by the client receives
//! these values explicitly; nothing is read from process globals.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use envsync_core::{now_millis, ObjectId, PublicKeyBundle, TrustedRoots};
use envsync_perms::PrivateKeyBundle;

/// Source of "now" in Unix milliseconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        now_millis()
    }
}

/// A manually driven clock for tests and simulations.
#[derive(Debug, Default)]
pub struct FixedClock(AtomicI64);

impl FixedClock {
    pub fn new(now: i64) -> Self {
        Self(AtomicI64::new(now))
    }

    pub fn set(&self, now: i64) {
        self.0.store(now, Ordering::SeqCst);
    }

    /// Move the clock forward by `millis`.
    pub fn advance(&self, millis: i64) {
        self.0.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// The acting keyholder and its private keys.
#[derive(Clone, Debug)]
pub struct Session {
    /// The device, CLI user, invite, or device grant this session acts as.
    pub keyholder_id: ObjectId,
    pub keys: Arc<PrivateKeyBundle>,
    /// Pinned root pubkeys every trust chain must end in.
    pub roots: TrustedRoots,
}

impl Session {
    pub fn new(keyholder_id: impl Into<ObjectId>, keys: PrivateKeyBundle, roots: TrustedRoots) -> Self {
        Self {
            keyholder_id: keyholder_id.into(),
            keys: Arc::new(keys),
            roots,
        }
    }

    /// A session from a handed-over key seed (invite or device grant
    /// acceptance, server envkeys).
    pub fn from_seed(keyholder_id: impl Into<ObjectId>, seed: &[u8; 32], roots: TrustedRoots) -> Self {
        Self::new(keyholder_id, PrivateKeyBundle::from_seed(seed), roots)
    }

    pub fn public_bundle(&self) -> PublicKeyBundle {
        self.keys.public_bundle()
    }
}
