//! JSON helpers shared across the protocol.
//!
//! Payloads are schema-free trees ([`Json`]). The canonical form used for
//! signing is UTF-8 JSON with keys sorted lexicographically at every depth
//! and no insignificant whitespace. `serde_json`'s `Value` maps are backed
//! by a `BTreeMap`, so round-tripping any serializable value through
//! [`Json`] yields exactly that byte sequence.

use serde::Serialize;

use crate::error::Error;

/// Arbitrary structured payload value (null | bool | number | string |
/// sequence | mapping).
pub type Json = serde_json::Value;

/// Serializes a value to its canonical JSON byte form: keys sorted at every
/// depth, compact separators, shortest number form.
///
/// This is the only byte sequence ever fed to signature and encryption
/// primitives; deviating from it silently breaks interoperability.
pub fn to_canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&value)?)
}

/// Serializes a value to a canonical JSON string.
pub fn to_canonical_json_string<T: Serialize>(value: &T) -> Result<String, Error> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_keys() {
        let value = json!({"zeta": 1, "alpha": {"nested_z": true, "nested_a": null}});
        let bytes = to_canonical_json(&value).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"alpha":{"nested_a":null,"nested_z":true},"zeta":1}"#
        );
    }

    #[test]
    fn test_canonical_json_is_stable_for_structs() {
        #[derive(Serialize)]
        struct Unordered {
            zulu: u32,
            alpha: String,
        }

        let bytes = to_canonical_json(&Unordered {
            zulu: 7,
            alpha: "x".to_string(),
        })
        .unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"alpha":"x","zulu":7}"#);
    }
}
