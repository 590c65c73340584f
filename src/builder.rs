//! Build a code database from a classified [`CodeMap`].

use std::io::Write;

use crate::classify::CodeMap;
use crate::mmdb::{InsertPolicy, Metadata, Tree, TreeOptions, Value};
use crate::Result;

/// Database type written to every generated database.
pub const DATABASE_TYPE: &str = "sing-geoip";

/// Order in which codes are inserted.
///
/// An empty allow-list selects every code of `code_map`. The result is
/// lowercased, sorted and deduplicated.
pub fn insertion_order(code_map: &CodeMap, allow_list: &[String]) -> Vec<String> {
    let mut codes: Vec<String> = if allow_list.is_empty() {
        code_map.codes().map(str::to_string).collect()
    } else {
        allow_list.iter().map(|code| code.to_lowercase()).collect()
    };
    codes.sort();
    codes.dedup();
    codes
}

/// Writes `(network, code)` pairs into a fresh search tree.
///
/// Codes are inserted in sorted order with replace semantics, so on
/// overlapping networks the lexicographically later code wins.
pub struct GeoTreeBuilder {
    tree: Tree,
}

impl GeoTreeBuilder {
    /// Create a builder with the IP version and record size of `source`.
    ///
    /// `codes` become the database languages.
    pub fn new(source: &Metadata, codes: &[String]) -> Result<Self> {
        let mut languages = codes.to_vec();
        languages.sort();
        languages.dedup();

        let tree = Tree::new(TreeOptions {
            database_type: DATABASE_TYPE.to_string(),
            languages,
            ip_version: source.ip_version,
            record_size: source.record_size,
            insert_policy: InsertPolicy::Replace,
            ..TreeOptions::default()
        })?;

        Ok(Self { tree })
    }

    /// Fix the build epoch for reproducible output.
    pub fn with_build_epoch(mut self, epoch: u64) -> Self {
        self.tree.set_build_epoch(epoch);
        self
    }

    /// Insert the networks of every selected code. Returns the number of
    /// networks inserted.
    pub fn populate(&mut self, code_map: &CodeMap, allow_list: &[String]) -> Result<usize> {
        let mut inserted = 0;
        for code in insertion_order(code_map, allow_list) {
            let Some(networks) = code_map.get(&code) else {
                log::debug!("Code {} not present in source, skipping", code);
                continue;
            };
            for network in networks {
                self.tree.insert(*network, Value::from(code.as_str()))?;
            }
            inserted += networks.len();
        }
        Ok(inserted)
    }

    /// Serialize the database. Returns the number of bytes written.
    pub fn write_to<W: Write>(&self, sink: W) -> Result<u64> {
        self.tree.write_to(sink)
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }
}
