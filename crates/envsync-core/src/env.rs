//! Environment contents: cells, maps, and the actions that change them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::ObjectId;

/// The value stored under one key of an environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum EnvCell {
    /// A concrete value.
    Value(String),
    /// Explicitly set to the empty string.
    Empty,
    /// Declared but intentionally unset.
    Undefined,
    /// Inherits its value from another environment.
    Inherits(ObjectId),
}

impl EnvCell {
    pub fn value(v: impl Into<String>) -> Self {
        EnvCell::Value(v.into())
    }

    /// The cell's kind without its value.
    pub fn meta(&self) -> CellMeta {
        match self {
            EnvCell::Value(_) => CellMeta::Value,
            EnvCell::Empty => CellMeta::Empty,
            EnvCell::Undefined => CellMeta::Undefined,
            EnvCell::Inherits(_) => CellMeta::Inherits,
        }
    }

    /// The source environment, for inheriting cells.
    pub fn inherits_from(&self) -> Option<&ObjectId> {
        match self {
            EnvCell::Inherits(id) => Some(id),
            _ => None,
        }
    }
}

/// A cell with its value stripped, as seen by `read_meta` holders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellMeta {
    Value,
    Empty,
    Undefined,
    Inherits,
}

/// Full environment contents.
pub type EnvMap = BTreeMap<String, EnvCell>;

/// Keys and cell kinds.
pub type MetaMap = BTreeMap<String, CellMeta>;

/// Which keys inherit from which environment.
pub type InheritsMap = BTreeMap<String, ObjectId>;

/// Strip every value from an env map.
pub fn meta_of(env: &EnvMap) -> MetaMap {
    env.iter().map(|(k, cell)| (k.clone(), cell.meta())).collect()
}

/// Extract inheritance pointers from an env map.
pub fn inherits_of(env: &EnvMap) -> InheritsMap {
    env.iter()
        .filter_map(|(k, cell)| cell.inherits_from().map(|src| (k.clone(), src.clone())))
        .collect()
}

/// One key's change inside a changeset. `None` means the key is absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeAction {
    pub key: String,
    pub previous: Option<EnvCell>,
    pub next: Option<EnvCell>,
}

impl ChangeAction {
    pub fn new(key: impl Into<String>, previous: Option<EnvCell>, next: Option<EnvCell>) -> Self {
        Self {
            key: key.into(),
            previous,
            next,
        }
    }

    /// Apply to a map. Removal when `next` is `None`.
    pub fn apply(&self, env: &mut EnvMap) {
        match &self.next {
            Some(cell) => {
                env.insert(self.key.clone(), cell.clone());
            }
            None => {
                env.remove(&self.key);
            }
        }
    }
}

/// Actions turning `before` into `after`, ordered by key.
pub fn diff_env(before: &EnvMap, after: &EnvMap) -> Vec<ChangeAction> {
    let mut actions = Vec::new();
    for (key, cell) in after {
        let prev = before.get(key);
        if prev != Some(cell) {
            actions.push(ChangeAction::new(key.clone(), prev.cloned(), Some(cell.clone())));
        }
    }
    for (key, cell) in before {
        if !after.contains_key(key) {
            actions.push(ChangeAction::new(key.clone(), Some(cell.clone()), None));
        }
    }
    actions.sort_by(|a, b| a.key.cmp(&b.key));
    actions
}
