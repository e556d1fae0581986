//! Golden test vectors for deterministic verification.
//!
//! Changeset actions are hashed into convergence state hashes and env cells
//! are stored as JSON inside encrypted blobs, so both encodings must match
//! byte for byte across replicas.

use envsync_core::canonical::ACTION_DOMAIN;
use envsync_core::{action_bytes, ChangeAction, EnvCell, Scope};

/// A canonical action encoding vector.
#[derive(Debug, Clone)]
pub struct ActionVector {
    pub name: &'static str,
    pub scope: &'static str,
    pub key: &'static str,
    pub previous: Option<EnvCell>,
    pub next: Option<EnvCell>,
    /// Expected CBOR after the domain tag (hex).
    pub expected_cbor: &'static str,
}

/// A JSON cell encoding vector.
#[derive(Debug, Clone)]
pub struct CellVector {
    pub cell: EnvCell,
    pub expected_json: &'static str,
}

pub fn action_vectors() -> Vec<ActionVector> {
    vec![
        ActionVector {
            name: "create value",
            scope: "development",
            key: "A",
            previous: None,
            next: Some(EnvCell::value("1")),
            expected_cbor: "a4006b646576656c6f706d656e7401614102f603a20000016131",
        },
        ActionVector {
            name: "remove value",
            scope: "development",
            key: "B",
            previous: Some(EnvCell::value("x")),
            next: None,
            expected_cbor: "a4006b646576656c6f706d656e7401614202a2000001617803f6",
        },
        ActionVector {
            name: "empty to inherits",
            scope: "development",
            key: "C",
            previous: Some(EnvCell::Empty),
            next: Some(EnvCell::Inherits("production".into())),
            expected_cbor: "a4006b646576656c6f706d656e7401614302a2000101f603a20003016a70726f64756374696f6e",
        },
        ActionVector {
            name: "declare undefined",
            scope: "development",
            key: "D",
            previous: None,
            next: Some(EnvCell::Undefined),
            expected_cbor: "a4006b646576656c6f706d656e7401614402f603a2000201f6",
        },
    ]
}

pub fn cell_vectors() -> Vec<CellVector> {
    vec![
        CellVector {
            cell: EnvCell::value("sk_test"),
            expected_json: r#"{"kind":"value","value":"sk_test"}"#,
        },
        CellVector {
            cell: EnvCell::Empty,
            expected_json: r#"{"kind":"empty"}"#,
        },
        CellVector {
            cell: EnvCell::Undefined,
            expected_json: r#"{"kind":"undefined"}"#,
        },
        CellVector {
            cell: EnvCell::Inherits("production".into()),
            expected_json: r#"{"kind":"inherits","value":"production"}"#,
        },
    ]
}

/// Canonical action bytes for a vector, domain tag included.
pub fn encode_action_vector(vector: &ActionVector) -> Vec<u8> {
    let action = ChangeAction::new(vector.key, vector.previous.clone(), vector.next.clone());
    action_bytes(&Scope::environment(vector.scope), &action).expect("vector cells are encodable")
}

/// Check every vector. Returns (name, passed, actual) for each.
pub fn verify_all_vectors() -> Vec<(String, bool, String)> {
    let mut results = Vec::new();
    for vector in action_vectors() {
        let bytes = encode_action_vector(&vector);
        let (domain, cbor) = bytes.split_at(ACTION_DOMAIN.len().min(bytes.len()));
        let actual = hex::encode(cbor);
        let passed = domain == ACTION_DOMAIN && actual == vector.expected_cbor;
        results.push((vector.name.to_string(), passed, actual));
    }
    for vector in cell_vectors() {
        let actual = serde_json::to_string(&vector.cell).unwrap_or_default();
        let passed = actual == vector.expected_json;
        results.push((format!("{:?}", vector.cell), passed, actual));
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_vectors_pass() {
        for (name, passed, actual) in verify_all_vectors() {
            assert!(passed, "{} encoded as {}", name, actual);
        }
    }

    #[test]
    fn test_cells_parse_back() {
        for vector in cell_vectors() {
            let parsed: EnvCell = serde_json::from_str(vector.expected_json).unwrap();
            assert_eq!(parsed, vector.cell);
        }
    }

    #[test]
    fn test_removal_differs_from_empty() {
        let removed = encode_action_vector(&action_vectors()[1]);
        let emptied = encode_action_vector(&ActionVector {
            next: Some(EnvCell::Empty),
            ..action_vectors()[1].clone()
        });
        assert_ne!(removed, emptied);
    }
}
