//! MMDB format constants, metadata and search tree record layout.

use std::collections::BTreeMap;

use super::data::Value;
use crate::{Error, Result};

/// Marker preceding the metadata map.
pub const METADATA_MARKER: &[u8] = b"\xAB\xCD\xEFMaxMind.com";

/// Zero bytes between the search tree and the data section.
pub const DATA_SECTION_SEPARATOR_SIZE: usize = 16;

/// Supported binary format major version.
pub const FORMAT_MAJOR_VERSION: u16 = 2;

/// Binary format minor version written by this crate.
pub const FORMAT_MINOR_VERSION: u16 = 0;

/// The metadata marker must appear within this many trailing bytes.
const METADATA_SEARCH_SIZE: usize = 128 * 1024;

/// Address family of a search tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    /// Parse the metadata `ip_version` field.
    pub fn from_u16(version: u16) -> Option<Self> {
        match version {
            4 => Some(IpVersion::V4),
            6 => Some(IpVersion::V6),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            IpVersion::V4 => 4,
            IpVersion::V6 => 6,
        }
    }

    /// Depth of the search tree (address width in bits).
    pub fn bit_count(self) -> u8 {
        match self {
            IpVersion::V4 => 32,
            IpVersion::V6 => 128,
        }
    }
}

/// Width of a single search tree record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSize {
    Bits24,
    Bits28,
    Bits32,
}

impl RecordSize {
    /// Parse the metadata `record_size` field.
    pub fn from_bits(bits: u16) -> Option<Self> {
        match bits {
            24 => Some(RecordSize::Bits24),
            28 => Some(RecordSize::Bits28),
            32 => Some(RecordSize::Bits32),
            _ => None,
        }
    }

    pub fn bits(self) -> u16 {
        match self {
            RecordSize::Bits24 => 24,
            RecordSize::Bits28 => 28,
            RecordSize::Bits32 => 32,
        }
    }

    /// Bytes used by one node (two records).
    pub fn node_bytes(self) -> usize {
        match self {
            RecordSize::Bits24 => 6,
            RecordSize::Bits28 => 7,
            RecordSize::Bits32 => 8,
        }
    }

    /// Largest record value that fits.
    pub fn max_value(self) -> u64 {
        (1u64 << self.bits()) - 1
    }

    /// Decode the (left, right) records of one node.
    ///
    /// `node` must be exactly [`node_bytes`](Self::node_bytes) long.
    pub fn read_node(self, node: &[u8]) -> (u32, u32) {
        let be24 = |b: &[u8]| ((b[0] as u32) << 16) | ((b[1] as u32) << 8) | b[2] as u32;
        match self {
            RecordSize::Bits24 => (be24(&node[0..3]), be24(&node[3..6])),
            RecordSize::Bits28 => {
                // Middle byte: high nibble belongs to left, low nibble to right
                let left = (((node[3] >> 4) as u32) << 24) | be24(&node[0..3]);
                let right = (((node[3] & 0x0F) as u32) << 24) | be24(&node[4..7]);
                (left, right)
            }
            RecordSize::Bits32 => (
                u32::from_be_bytes([node[0], node[1], node[2], node[3]]),
                u32::from_be_bytes([node[4], node[5], node[6], node[7]]),
            ),
        }
    }

    /// Encode the (left, right) records of one node into `out`.
    pub fn write_node(self, out: &mut [u8], left: u32, right: u32) {
        match self {
            RecordSize::Bits24 => {
                out[0..3].copy_from_slice(&left.to_be_bytes()[1..]);
                out[3..6].copy_from_slice(&right.to_be_bytes()[1..]);
            }
            RecordSize::Bits28 => {
                out[0..3].copy_from_slice(&left.to_be_bytes()[1..]);
                out[3] = ((((left >> 24) & 0x0F) as u8) << 4) | ((right >> 24) & 0x0F) as u8;
                out[4..7].copy_from_slice(&right.to_be_bytes()[1..]);
            }
            RecordSize::Bits32 => {
                out[0..4].copy_from_slice(&left.to_be_bytes());
                out[4..8].copy_from_slice(&right.to_be_bytes());
            }
        }
    }
}

/// Database metadata, stored as a map after the metadata marker.
///
/// `ip_version` and `record_size` are kept as raw numbers so a source image's
/// values pass through unchanged; consumers validate them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub binary_format_major_version: u16,
    pub binary_format_minor_version: u16,
    pub build_epoch: u64,
    pub database_type: String,
    pub description: BTreeMap<String, String>,
    pub ip_version: u16,
    pub languages: Vec<String>,
    pub node_count: u32,
    pub record_size: u16,
}

impl Metadata {
    /// Parse metadata from its decoded map.
    pub fn from_value(value: &Value) -> Result<Self> {
        let map = value
            .as_map()
            .ok_or_else(|| Error::malformed("metadata is not a map"))?;

        let major = required_uint(map, "binary_format_major_version")?;
        if major != FORMAT_MAJOR_VERSION as u64 {
            return Err(Error::malformed(format!(
                "unsupported binary format major version: {}",
                major
            )));
        }

        let node_count = required_uint(map, "node_count")?;
        let node_count = u32::try_from(node_count)
            .map_err(|_| Error::malformed(format!("node count out of range: {}", node_count)))?;

        let description = match map.get("description") {
            Some(Value::Map(entries)) => entries
                .iter()
                .filter_map(|(lang, text)| Some((lang.clone(), text.as_str()?.to_string())))
                .collect(),
            _ => BTreeMap::new(),
        };

        let languages = match map.get("languages") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };

        Ok(Self {
            binary_format_major_version: major as u16,
            binary_format_minor_version: if map.contains_key("binary_format_minor_version") {
                small_uint(map, "binary_format_minor_version")?
            } else {
                0
            },
            build_epoch: optional_uint(map, "build_epoch"),
            database_type: map
                .get("database_type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            description,
            ip_version: small_uint(map, "ip_version")?,
            languages,
            node_count,
            record_size: small_uint(map, "record_size")?,
        })
    }

    /// Convert to the map written after the metadata marker.
    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert(
            "binary_format_major_version".to_string(),
            Value::Uint16(self.binary_format_major_version),
        );
        map.insert(
            "binary_format_minor_version".to_string(),
            Value::Uint16(self.binary_format_minor_version),
        );
        map.insert("build_epoch".to_string(), Value::Uint64(self.build_epoch));
        map.insert(
            "database_type".to_string(),
            Value::String(self.database_type.clone()),
        );
        map.insert(
            "description".to_string(),
            Value::Map(
                self.description
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            ),
        );
        map.insert("ip_version".to_string(), Value::Uint16(self.ip_version));
        map.insert(
            "languages".to_string(),
            Value::Array(self.languages.iter().cloned().map(Value::String).collect()),
        );
        map.insert("node_count".to_string(), Value::Uint32(self.node_count));
        map.insert("record_size".to_string(), Value::Uint16(self.record_size));
        Value::Map(map)
    }

    /// Size of the search tree in bytes, if the record size is valid.
    pub fn search_tree_size(&self) -> Option<usize> {
        let record_size = RecordSize::from_bits(self.record_size)?;
        (self.node_count as usize).checked_mul(record_size.node_bytes())
    }
}

/// Find the LAST metadata marker within the trailing search window.
pub fn find_metadata_marker(data: &[u8]) -> Option<usize> {
    let start = data.len().saturating_sub(METADATA_SEARCH_SIZE);
    data[start..]
        .windows(METADATA_MARKER.len())
        .rposition(|window| window == METADATA_MARKER)
        .map(|pos| start + pos)
}

fn required_uint(map: &BTreeMap<String, Value>, key: &str) -> Result<u64> {
    match map.get(key) {
        Some(value) => value.as_u64().ok_or_else(|| {
            Error::malformed(format!("metadata field '{}' is not an unsigned integer", key))
        }),
        None => Err(Error::malformed(format!(
            "required metadata field '{}' not found",
            key
        ))),
    }
}

fn small_uint(map: &BTreeMap<String, Value>, key: &str) -> Result<u16> {
    let value = required_uint(map, key)?;
    u16::try_from(value)
        .map_err(|_| Error::malformed(format!("metadata field '{}' out of range: {}", key, value)))
}

fn optional_uint(map: &BTreeMap<String, Value>, key: &str) -> u64 {
    map.get(key).and_then(Value::as_u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metadata() -> Metadata {
        Metadata {
            binary_format_major_version: 2,
            binary_format_minor_version: 0,
            build_epoch: 1_700_000_000,
            database_type: "GeoLite2-Country".to_string(),
            description: BTreeMap::from([("en".to_string(), "Country".to_string())]),
            ip_version: 6,
            languages: vec!["en".to_string(), "de".to_string()],
            node_count: 42,
            record_size: 28,
        }
    }

    #[test]
    fn test_record_size_node_roundtrip() {
        for (size, left, right) in [
            (RecordSize::Bits24, 0x00AB_CDEF, 0x0012_3456),
            (RecordSize::Bits28, 0x0ABC_DEF1, 0x0123_4567),
            (RecordSize::Bits32, 0xDEAD_BEEF, 0x0102_0304),
        ] {
            let mut node = vec![0u8; size.node_bytes()];
            size.write_node(&mut node, left, right);
            assert_eq!(size.read_node(&node), (left, right), "{:?}", size);
        }
    }

    #[test]
    fn test_28bit_middle_nibbles() {
        let mut node = [0u8; 7];
        RecordSize::Bits28.write_node(&mut node, 0x0A00_0001, 0x0B00_0002);
        assert_eq!(node, [0x00, 0x00, 0x01, 0xAB, 0x00, 0x00, 0x02]);
    }

    #[test]
    fn test_record_size_parsing() {
        assert_eq!(RecordSize::from_bits(24), Some(RecordSize::Bits24));
        assert_eq!(RecordSize::from_bits(31), None);
        assert_eq!(RecordSize::Bits24.max_value(), 0xFF_FFFF);
        assert_eq!(IpVersion::from_u16(6), Some(IpVersion::V6));
        assert_eq!(IpVersion::from_u16(5), None);
    }

    #[test]
    fn test_metadata_value_roundtrip() {
        let metadata = sample_metadata();
        let parsed = Metadata::from_value(&metadata.to_value()).unwrap();
        assert_eq!(parsed, metadata);
        assert_eq!(parsed.search_tree_size(), Some(42 * 7));
    }

    #[test]
    fn test_metadata_missing_node_count() {
        let mut value = sample_metadata().to_value();
        if let Value::Map(map) = &mut value {
            map.remove("node_count");
        }
        let err = Metadata::from_value(&value).unwrap_err();
        assert!(matches!(err, Error::MalformedDatabase(_)));
        assert!(err.to_string().contains("node_count"));
    }

    #[test]
    fn test_metadata_unsupported_major_version() {
        let mut metadata = sample_metadata();
        metadata.binary_format_major_version = 3;
        let err = Metadata::from_value(&metadata.to_value()).unwrap_err();
        assert!(err.to_string().contains("major version"));
    }

    #[test]
    fn test_metadata_minor_version_out_of_range() {
        let mut value = sample_metadata().to_value();
        if let Value::Map(map) = &mut value {
            map.insert(
                "binary_format_minor_version".to_string(),
                Value::Uint32(70_000),
            );
        }
        let err = Metadata::from_value(&value).unwrap_err();
        assert!(matches!(err, Error::MalformedDatabase(_)));
        assert!(err.to_string().contains("binary_format_minor_version"));

        if let Value::Map(map) = &mut value {
            map.remove("binary_format_minor_version");
        }
        let parsed = Metadata::from_value(&value).unwrap();
        assert_eq!(parsed.binary_format_minor_version, 0);
    }

    #[test]
    fn test_find_metadata_marker_last_occurrence() {
        let mut data = vec![0u8; 10];
        data.extend_from_slice(METADATA_MARKER);
        data.extend_from_slice(&[1, 2, 3]);
        data.extend_from_slice(METADATA_MARKER);
        data.push(0xE0);

        assert_eq!(find_metadata_marker(&data), Some(13 + METADATA_MARKER.len()));
        assert_eq!(find_metadata_marker(&[0u8; 64]), None);
        assert_eq!(find_metadata_marker(&[]), None);
    }
}
