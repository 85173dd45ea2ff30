//! Deterministic JSON encoding (spec §9: "Deterministic JSON").
//!
//! Any JSON that gets digested must have sorted keys and no insignificant
//! whitespace, and must never embed timestamps, UUIDs, or locale-dependent
//! formatting. Round-tripping through [`serde_json::Value`] is sufficient:
//! `serde_json::Map` is a `BTreeMap` unless the `preserve_order` feature is
//! enabled, which this workspace never turns on.

use serde::Serialize;

use crate::error::{Error, Result};

pub fn to_canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let as_value = serde_json::to_value(value).map_err(|e| Error::format(e.to_string()))?;
    serde_json::to_vec(&as_value).map_err(|e| Error::format(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Unsorted {
        zebra: u32,
        apple: u32,
    }

    #[test]
    fn sorts_struct_fields() {
        let bytes = to_canonical_json(&Unsorted { zebra: 1, apple: 2 }).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.find("apple").unwrap() < text.find("zebra").unwrap());
        assert!(!text.contains(' '));
    }
}
