//! Reduce geo records to a single code and group networks by code.

use ahash::AHashMap;
use ipnet::IpNet;

use crate::record::GeoRecord;
use crate::Result;

/// Pick the code of a record: country, then registered country, then
/// represented country, then continent. Lowercased.
///
/// Returns `None` when all four fields are empty.
pub fn resolve_code(record: &GeoRecord) -> Option<String> {
    [
        &record.country,
        &record.registered_country,
        &record.represented_country,
        &record.continent,
    ]
    .into_iter()
    .find(|code| !code.is_empty())
    .map(|code| code.to_lowercase())
}

/// Code to networks, iterating codes in first-seen order.
#[derive(Debug, Clone, Default)]
pub struct CodeMap {
    entries: Vec<(String, Vec<IpNet>)>,
    index: AHashMap<String, usize>,
}

impl CodeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a network under `code`, creating the entry if needed.
    pub fn insert(&mut self, code: &str, network: IpNet) {
        match self.index.get(code) {
            Some(&i) => self.entries[i].1.push(network),
            None => {
                self.index.insert(code.to_string(), self.entries.len());
                self.entries.push((code.to_string(), vec![network]));
            }
        }
    }

    /// Networks recorded for `code`, in insertion order.
    pub fn get(&self, code: &str) -> Option<&[IpNet]> {
        self.index
            .get(code)
            .map(|&i| self.entries[i].1.as_slice())
    }

    pub fn contains(&self, code: &str) -> bool {
        self.index.contains_key(code)
    }

    /// Codes in first-seen order.
    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(code, _)| code.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[IpNet])> {
        self.entries
            .iter()
            .map(|(code, networks)| (code.as_str(), networks.as_slice()))
    }

    /// Number of codes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of networks over all codes.
    pub fn network_count(&self) -> usize {
        self.entries.iter().map(|(_, networks)| networks.len()).sum()
    }
}

/// Classify decoded networks into a [`CodeMap`].
///
/// Records without any code are dropped. The first error aborts.
pub fn classify<I>(networks: I) -> Result<CodeMap>
where
    I: IntoIterator<Item = Result<(IpNet, GeoRecord)>>,
{
    let mut code_map = CodeMap::new();
    let mut dropped = 0usize;

    for item in networks {
        let (network, record) = item?;
        match resolve_code(&record) {
            Some(code) => code_map.insert(&code, network),
            None => dropped += 1,
        }
    }

    if dropped > 0 {
        log::debug!("Dropped {} networks without any code", dropped);
    }

    Ok(code_map)
}
