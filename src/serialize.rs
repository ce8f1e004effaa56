//! Metadata persistence.
//!
//! Controller state is persisted as one JSON string in host view metadata.
//! A version integer is embedded alongside the state and must match on
//! load; otherwise deserialization fails and the controller falls back to a
//! fresh initial load.
//!
//! The adapter modules below pin the wire shape of enums (integers), region
//! flags (raw bits) and the keyed symbol/header tables (arrays of key/value
//! objects), independent of in-memory representation.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Version of the persisted metadata layout.
pub const METADATA_VERSION: u32 = 1;

/// Serializes `value` with the metadata version embedded.
pub fn to_versioned_json<T: Serialize>(value: &T) -> Result<String> {
    #[derive(Serialize)]
    struct Versioned<'a, T: Serialize> {
        #[serde(rename = "metadataVersion")]
        metadata_version: u32,
        #[serde(flatten)]
        value: &'a T,
    }

    Ok(serde_json::to_string(&Versioned {
        metadata_version: METADATA_VERSION,
        value,
    })?)
}

/// Deserializes a value produced by [`to_versioned_json`], enforcing the
/// version gate.
pub fn from_versioned_json<T: DeserializeOwned>(json: &str) -> Result<T> {
    let doc: serde_json::Value = serde_json::from_str(json)?;
    let found = doc
        .get("metadataVersion")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0) as u32;
    if found != METADATA_VERSION {
        return Err(Error::MetadataVersionMismatch {
            found,
            expected: METADATA_VERSION,
        });
    }
    Ok(serde_json::from_value(doc)?)
}

/// Serializes [`crate::host::SymbolKind`] as its integer code.
pub mod symbol_kind_as_u8 {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::host::SymbolKind;

    pub fn serialize<S: Serializer>(kind: &SymbolKind, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8((*kind).into())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SymbolKind, D::Error> {
        let value = u8::deserialize(deserializer)?;
        SymbolKind::try_from(value)
            .map_err(|v| serde::de::Error::custom(format!("invalid symbol kind {v}")))
    }
}

/// Serializes [`crate::controller::ViewState`] as its integer code.
pub mod view_state_as_u8 {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::controller::ViewState;

    pub fn serialize<S: Serializer>(state: &ViewState, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8((*state).into())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ViewState, D::Error> {
        let value = u8::deserialize(deserializer)?;
        ViewState::try_from(value)
            .map_err(|v| serde::de::Error::custom(format!("invalid view state {v}")))
    }
}

/// Serializes [`crate::cache::CacheFormat`] as its integer code.
pub mod cache_format_as_u8 {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::cache::CacheFormat;

    pub fn serialize<S: Serializer>(format: &CacheFormat, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8((*format).into())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<CacheFormat, D::Error> {
        let value = u8::deserialize(deserializer)?;
        CacheFormat::try_from(value)
            .map_err(|v| serde::de::Error::custom(format!("invalid cache format {v}")))
    }
}

/// Serializes [`crate::host::RegionFlags`] as its raw bits.
pub mod region_flags_as_u64 {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::host::RegionFlags;

    pub fn serialize<S: Serializer>(flags: &RegionFlags, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(flags.bits())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<RegionFlags, D::Error> {
        Ok(RegionFlags::from_bits_truncate(u64::deserialize(
            deserializer,
        )?))
    }
}

/// Serializes `BTreeMap<u64, Vec<Symbol>>` as `[{key, value}]` so the
/// addresses stay numeric in JSON.
pub mod symbol_map {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::host::Symbol;

    #[derive(Serialize, Deserialize)]
    struct Entry {
        key: u64,
        value: Vec<Symbol>,
    }

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<u64, Vec<Symbol>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let entries: Vec<Entry> = map
            .iter()
            .map(|(&key, value)| Entry {
                key,
                value: value.clone(),
            })
            .collect();
        entries.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<u64, Vec<Symbol>>, D::Error> {
        let entries = Vec::<Entry>::deserialize(deserializer)?;
        Ok(entries.into_iter().map(|e| (e.key, e.value)).collect())
    }
}

/// Serializes the header table as an array; the text base inside each
/// header is the key.
pub mod header_table {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::macho::ImageHeader;

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<u64, ImageHeader>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let headers: Vec<&ImageHeader> = map.values().collect();
        headers.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<u64, ImageHeader>, D::Error> {
        let headers = Vec::<ImageHeader>::deserialize(deserializer)?;
        Ok(headers.into_iter().map(|h| (h.text_base, h)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u64,
    }

    #[test]
    fn test_versioned_round_trip() {
        let sample = Sample {
            name: "cache".into(),
            count: 7,
        };
        let json = to_versioned_json(&sample).unwrap();
        assert!(json.contains("\"metadataVersion\":1"));
        let back: Sample = from_versioned_json(&json).unwrap();
        assert_eq!(back, sample);
    }

    #[test]
    fn test_version_mismatch() {
        let json = r#"{"metadataVersion": 999, "name": "cache", "count": 7}"#;
        let err = from_versioned_json::<Sample>(json).unwrap_err();
        assert!(matches!(
            err,
            Error::MetadataVersionMismatch {
                found: 999,
                expected: METADATA_VERSION
            }
        ));
    }

    #[test]
    fn test_version_missing() {
        let json = r#"{"name": "cache", "count": 7}"#;
        let err = from_versioned_json::<Sample>(json).unwrap_err();
        assert!(matches!(
            err,
            Error::MetadataVersionMismatch { found: 0, .. }
        ));
    }
}
