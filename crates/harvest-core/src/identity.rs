//! Deterministic record identity.
//!
//! A record's `uuid` is the SHA-1 hex digest of its identity fields joined
//! with `:`. The index stores upsert by this value, so it must never depend
//! on anything but its inputs.
//!
//! ```
//! use harvest_core::identity::uuid;
//!
//! let id = uuid(&["http://example.com", "1"]).unwrap();
//! assert_eq!(id, "6a7ba2a01aee56603b9d8a5f6b40c843fc089b2f");
//! ```

use serde_json::Value;
use sha1::{Digest, Sha1};

use crate::error::{HarvestError, Result};

/// Separator placed between identity fields before hashing.
pub const SEPARATOR: &str = ":";

/// Generate the identity of a record from an ordered list of fields.
///
/// # Errors
///
/// Returns [`HarvestError::InvalidIdentity`] when the list is empty or any
/// field is an empty string.
pub fn uuid(fields: &[&str]) -> Result<String> {
    if fields.is_empty() {
        return Err(HarvestError::InvalidIdentity(
            "at least one identity field is required".to_string(),
        ));
    }

    for (pos, field) in fields.iter().enumerate() {
        check_value(pos, field)?;
    }

    let mut hasher = Sha1::new();
    hasher.update(fields.join(SEPARATOR).as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Generate an identity from fields pulled out of a JSON payload.
///
/// Each entry is the result of a lookup such as `item.get("id")`; a `None`
/// (absent field), a non-string value, or an empty string all fail.
pub fn uuid_from_values(fields: &[Option<&Value>]) -> Result<String> {
    let mut parts = Vec::with_capacity(fields.len());

    for (pos, field) in fields.iter().enumerate() {
        match field {
            None => {
                return Err(HarvestError::InvalidIdentity(format!(
                    "identity field #{} is missing",
                    pos
                )))
            }
            Some(Value::String(s)) => parts.push(s.as_str()),
            Some(other) => {
                return Err(HarvestError::InvalidIdentity(format!(
                    "{} value is not a string instance",
                    other
                )))
            }
        }
    }

    uuid(&parts)
}

fn check_value(pos: usize, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(HarvestError::InvalidIdentity(format!(
            "identity field #{} cannot be empty",
            pos
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn digest_is_stable() {
        assert_eq!(
            uuid(&["http://example.com", "1"]).unwrap(),
            "6a7ba2a01aee56603b9d8a5f6b40c843fc089b2f"
        );
        assert_eq!(
            uuid(&["a", "b", "c"]).unwrap(),
            "70bce09e827a98fe6acf7c3e9b0bcf136bc382ed"
        );
        assert_eq!(
            uuid(&["http://example.com", "2"]).unwrap(),
            uuid(&["http://example.com", "2"]).unwrap()
        );
    }

    #[test]
    fn different_inputs_differ() {
        let a = uuid(&["http://example.com", "1"]).unwrap();
        let b = uuid(&["http://example.com", "2"]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn empty_field_is_rejected() {
        let err = uuid(&["http://example.com", ""]).unwrap_err();
        assert!(matches!(err, HarvestError::InvalidIdentity(_)));

        let err = uuid(&[]).unwrap_err();
        assert!(matches!(err, HarvestError::InvalidIdentity(_)));
    }

    #[test]
    fn json_fields_must_be_strings() {
        let item = json!({ "origin": "http://example.com", "id": "1", "num": 1 });

        let ok = uuid_from_values(&[item.get("origin"), item.get("id")]).unwrap();
        assert_eq!(ok, "6a7ba2a01aee56603b9d8a5f6b40c843fc089b2f");

        let err = uuid_from_values(&[item.get("origin"), item.get("num")]).unwrap_err();
        assert!(matches!(err, HarvestError::InvalidIdentity(_)));

        let err = uuid_from_values(&[item.get("origin"), item.get("missing")]).unwrap_err();
        assert!(matches!(err, HarvestError::InvalidIdentity(_)));

        let err = uuid_from_values(&[item.get("origin"), Some(&json!(null))]).unwrap_err();
        assert!(matches!(err, HarvestError::InvalidIdentity(_)));
    }
}
