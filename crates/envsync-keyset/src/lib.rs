//! # envsync keyset
//!
//! Which envelopes must exist, and what changes to reach that state.
//!
//! ## Key Types
//!
//! - [`KeysetCalculator`]: graph snapshot + time → required [`KeySet`]
//! - [`KeysetDelta`]: envelopes to seal and envelopes to delete
//!
//! ## Overview
//!
//! Every (recipient, scope, part) triple in the required keyset corresponds
//! to a permission the recipient holds on that scope. Diffing the current and
//! proposed keysets gives the minimal envelope work for any graph mutation,
//! and the same calculation scoped to one keyholder drives onboarding.
//!
//! [`KeySet`]: envsync_core::KeySet

pub mod diff;
pub mod requirements;

pub use diff::{delta_for_mutation, diff, onboarding_delta, KeysetDelta, MutationDelta, RecipientChange};
pub use requirements::{required_for_keyholder, required_keyset, KeysetCalculator};
