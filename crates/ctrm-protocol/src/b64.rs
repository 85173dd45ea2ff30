//! Serde helper: `data` fields carry raw bytes, base64-encoded in JSON (spec §3, §4.1).

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serializer};

pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&STANDARD.encode(bytes))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    STANDARD
        .decode(s.as_bytes())
        .map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(serde::Serialize, serde::Deserialize)]
    struct Wrapper {
        #[serde(with = "crate::b64")]
        data: Vec<u8>,
    }

    #[test]
    fn round_trips_through_json() {
        let w = Wrapper {
            data: vec![0, 1, 2, 255, 254],
        };
        let json = serde_json::to_string(&w).unwrap();
        assert!(json.contains("data"));
        assert!(!json.contains('['), "bytes must be base64, not a JSON array");
        let back: Wrapper = serde_json::from_str(&json).unwrap();
        assert_eq!(back.data, w.data);
    }
}
