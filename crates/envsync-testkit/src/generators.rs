//! Proptest generators for property-based testing.

use proptest::prelude::*;

use envsync_core::{EnvCell, EnvMap, KeySet, KeyTriple, ObjectId, Part, Scope};
use envsync_sync::Changeset;

/// A short lowercase object id.
pub fn object_id() -> impl Strategy<Value = ObjectId> {
    "[a-z][a-z0-9-]{0,11}".prop_map(ObjectId::new)
}

/// An environment variable name.
pub fn env_key() -> impl Strategy<Value = String> {
    "[A-Z][A-Z0-9_]{0,15}".prop_map(String::from)
}

/// Any cell kind.
pub fn env_cell() -> impl Strategy<Value = EnvCell> {
    prop_oneof![
        4 => "[ -~]{0,24}".prop_map(EnvCell::Value),
        1 => Just(EnvCell::Empty),
        1 => Just(EnvCell::Undefined),
        1 => object_id().prop_map(EnvCell::Inherits),
    ]
}

/// An env of up to `max_len` keys.
pub fn env_map(max_len: usize) -> impl Strategy<Value = EnvMap> {
    prop::collection::btree_map(env_key(), env_cell(), 0..=max_len)
}

pub fn scope() -> impl Strategy<Value = Scope> {
    prop_oneof![
        object_id().prop_map(Scope::Environment),
        (object_id(), object_id()).prop_map(|(parent, user)| Scope::locals(parent, user)),
    ]
}

pub fn part() -> impl Strategy<Value = Part> {
    prop_oneof![
        Just(Part::Env),
        Just(Part::Meta),
        Just(Part::Inherits),
        object_id().prop_map(Part::Changeset),
        object_id().prop_map(Part::InheritanceOverride),
    ]
}

pub fn key_triple() -> impl Strategy<Value = KeyTriple> {
    (object_id(), scope(), part()).prop_map(|(recipient, scope, part)| KeyTriple::new(recipient, scope, part))
}

/// A keyset over a small id space, so generated sets overlap.
pub fn keyset(max_len: usize) -> impl Strategy<Value = KeySet> {
    let recipient = prop::sample::select(vec!["alice-laptop", "bob-laptop", "ci-server"]);
    let scope = prop::sample::select(vec!["development", "staging", "production"]);
    let part = prop_oneof![Just(Part::Env), Just(Part::Meta), Just(Part::Inherits)];
    prop::collection::vec((recipient, scope, part), 0..=max_len).prop_map(|triples| {
        triples
            .into_iter()
            .map(|(r, s, p)| KeyTriple::new(r, Scope::environment(s), p))
            .collect()
    })
}

/// Successive snapshots of one scope and the changesets between them.
#[derive(Debug, Clone)]
pub struct History {
    pub scope: Scope,
    /// `snapshots[n]` is the env at version `n`; `snapshots[0]` is empty.
    pub snapshots: Vec<EnvMap>,
    pub changesets: Vec<Changeset>,
}

impl Arbitrary for History {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (scope(), prop::collection::vec(env_map(8), 1..=6))
            .prop_map(|(scope, versions)| history_from_snapshots(scope, versions))
            .boxed()
    }
}

/// Build a history whose version `n` equals `versions[n - 1]`.
pub fn history_from_snapshots(scope: Scope, versions: Vec<EnvMap>) -> History {
    let mut snapshots = vec![EnvMap::new()];
    snapshots.extend(versions);
    let changesets = snapshots
        .windows(2)
        .enumerate()
        .map(|(i, pair)| {
            Changeset::between(
                scope.clone(),
                i as u64,
                &pair[0],
                &pair[1],
                ObjectId::new("generator"),
                i as i64,
            )
        })
        .collect();
    History {
        scope,
        snapshots,
        changesets,
    }
}
