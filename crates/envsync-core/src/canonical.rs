//! Deterministic CBOR encoding for signed and hashed data.
//!
//! Maps use small integer keys, written in ascending order with definite
//! lengths and shortest-form integers, so the same input yields the same
//! bytes on every platform. Each signed structure is prefixed with a domain
//! separation tag so a signature over one kind of message can never be
//! replayed as another.

use ciborium::value::Value;

use crate::crypto::PublicKeyBundle;
use crate::env::{ChangeAction, EnvCell};
use crate::error::CoreError;
use crate::scope::Scope;
use crate::types::ObjectId;

/// Domain tag for keyholder pubkey signatures.
pub const PUBKEY_DOMAIN: &[u8] = b"envsync-pubkey-v0:";

/// Domain tag for changeset action hashing.
pub const ACTION_DOMAIN: &[u8] = b"envsync-action-v0:";

mod keys {
    pub const ID: u64 = 0;
    pub const SIGNING: u64 = 1;
    pub const ENCRYPTION: u64 = 2;

    pub const CELL_KIND: u64 = 0;
    pub const CELL_VALUE: u64 = 1;

    pub const ACTION_SCOPE: u64 = 0;
    pub const ACTION_KEY: u64 = 1;
    pub const ACTION_PREVIOUS: u64 = 2;
    pub const ACTION_NEXT: u64 = 3;
}

/// Bytes a signer signs to vouch for `keyholder_id` holding `bundle`.
pub fn pubkey_signing_bytes(keyholder_id: &ObjectId, bundle: &PublicKeyBundle) -> Vec<u8> {
    let value = Value::Map(vec![
        (int(keys::ID), Value::Text(keyholder_id.as_str().to_string())),
        (int(keys::SIGNING), Value::Bytes(bundle.signing.0.to_vec())),
        (int(keys::ENCRYPTION), Value::Bytes(bundle.encryption.0.to_vec())),
    ]);
    let mut buf = PUBKEY_DOMAIN.to_vec();
    encode_value_to(&mut buf, &value).expect("pubkey value uses supported CBOR types");
    buf
}

/// Canonical bytes of one changeset action within a scope.
pub fn action_bytes(scope: &Scope, action: &ChangeAction) -> Result<Vec<u8>, CoreError> {
    let value = Value::Map(vec![
        (int(keys::ACTION_SCOPE), Value::Text(scope.to_string())),
        (int(keys::ACTION_KEY), Value::Text(action.key.clone())),
        (int(keys::ACTION_PREVIOUS), cell_value(action.previous.as_ref())),
        (int(keys::ACTION_NEXT), cell_value(action.next.as_ref())),
    ]);
    let mut buf = ACTION_DOMAIN.to_vec();
    encode_value_to(&mut buf, &value)?;
    Ok(buf)
}

fn int(n: u64) -> Value {
    Value::Integer(n.into())
}

fn cell_value(cell: Option<&EnvCell>) -> Value {
    let (kind, payload) = match cell {
        None => return Value::Null,
        Some(EnvCell::Value(v)) => (0u64, Value::Text(v.clone())),
        Some(EnvCell::Empty) => (1, Value::Null),
        Some(EnvCell::Undefined) => (2, Value::Null),
        Some(EnvCell::Inherits(id)) => (3, Value::Text(id.as_str().to_string())),
    };
    Value::Map(vec![
        (int(keys::CELL_KIND), int(kind)),
        (int(keys::CELL_VALUE), payload),
    ])
}

fn encode_value_to(buf: &mut Vec<u8>, value: &Value) -> Result<(), CoreError> {
    match value {
        Value::Integer(i) => {
            let n: i128 = (*i).into();
            if n >= 0 {
                encode_uint(buf, 0, n as u64);
            } else {
                encode_uint(buf, 1, (-1 - n) as u64);
            }
        }
        Value::Bytes(b) => {
            encode_uint(buf, 2, b.len() as u64);
            buf.extend_from_slice(b);
        }
        Value::Text(s) => {
            encode_uint(buf, 3, s.len() as u64);
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Array(items) => {
            encode_uint(buf, 4, items.len() as u64);
            for item in items {
                encode_value_to(buf, item)?;
            }
        }
        Value::Map(entries) => {
            let mut pairs = Vec::with_capacity(entries.len());
            for (k, v) in entries {
                let mut key_buf = Vec::new();
                encode_value_to(&mut key_buf, k)?;
                pairs.push((key_buf, v));
            }
            pairs.sort_by(|a, b| a.0.cmp(&b.0));
            encode_uint(buf, 5, pairs.len() as u64);
            for (key_bytes, v) in pairs {
                buf.extend_from_slice(&key_bytes);
                encode_value_to(buf, v)?;
            }
        }
        Value::Bool(b) => buf.push(if *b { 0xf5 } else { 0xf4 }),
        Value::Null => buf.push(0xf6),
        other => {
            return Err(CoreError::EncodingError(format!(
                "unsupported canonical value: {:?}",
                other
            )))
        }
    }
    Ok(())
}

fn encode_uint(buf: &mut Vec<u8>, major: u8, n: u64) {
    let mt = major << 5;
    if n < 24 {
        buf.push(mt | (n as u8));
    } else if n <= 0xff {
        buf.push(mt | 24);
        buf.push(n as u8);
    } else if n <= 0xffff {
        buf.push(mt | 25);
        buf.extend_from_slice(&(n as u16).to_be_bytes());
    } else if n <= 0xffff_ffff {
        buf.push(mt | 26);
        buf.extend_from_slice(&(n as u32).to_be_bytes());
    } else {
        buf.push(mt | 27);
        buf.extend_from_slice(&n.to_be_bytes());
    }
}
