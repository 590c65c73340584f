//! MMDB search tree writer.
//!
//! Networks are inserted into an in-memory binary trie and serialized in
//! MaxMind DB format. IPv4 networks in an IPv6 tree live under `::/96` only;
//! no alias nodes are written and no ranges are reserved.

use std::collections::BTreeMap;
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use ahash::AHashMap;
use ipnet::IpNet;

use super::data::{Encoder, Value};
use super::format::*;
use crate::{Error, Result};

/// What happens when an inserted network overlaps existing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InsertPolicy {
    /// The new value replaces everything inside the inserted network.
    #[default]
    Replace,
    /// The new value only fills addresses that have no value yet.
    KeepExisting,
}

/// Options for a new [`Tree`].
#[derive(Debug, Clone)]
pub struct TreeOptions {
    pub database_type: String,
    pub languages: Vec<String>,
    pub description: BTreeMap<String, String>,
    /// 4 or 6
    pub ip_version: u16,
    /// 24, 28 or 32
    pub record_size: u16,
    pub insert_policy: InsertPolicy,
    /// Seconds since the epoch; the current time when `None`.
    pub build_epoch: Option<u64>,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            database_type: String::new(),
            languages: Vec::new(),
            description: BTreeMap::new(),
            ip_version: 6,
            record_size: 28,
            insert_policy: InsertPolicy::Replace,
            build_epoch: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Empty,
    /// Index into `Tree::values`
    Data(u32),
    Branch(Box<[Node; 2]>),
}

impl Node {
    /// Replace a branch whose two children are the same leaf by that leaf.
    fn collapse(&mut self) {
        if let Node::Branch(children) = self {
            if !matches!(children[0], Node::Branch(_)) && children[0] == children[1] {
                let leaf = children[0].clone();
                *self = leaf;
            }
        }
    }

    fn split(&mut self) {
        if !matches!(self, Node::Branch(_)) {
            let leaf = std::mem::replace(self, Node::Empty);
            *self = Node::Branch(Box::new([leaf.clone(), leaf]));
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Record {
    Empty,
    Node(u32),
    Data(u32),
}

/// In-memory MMDB search tree.
pub struct Tree {
    options: TreeOptions,
    ip_version: IpVersion,
    record_size: RecordSize,
    root: Node,
    values: Vec<Value>,
    interned: AHashMap<Vec<u8>, u32>,
    inserted: usize,
}

impl Tree {
    /// Create an empty tree; fails on an unsupported IP version or record size.
    pub fn new(options: TreeOptions) -> Result<Self> {
        let ip_version = IpVersion::from_u16(options.ip_version).ok_or_else(|| {
            Error::Config(format!("unsupported IP version: {}", options.ip_version))
        })?;
        let record_size = RecordSize::from_bits(options.record_size).ok_or_else(|| {
            Error::Config(format!("unsupported record size: {}", options.record_size))
        })?;

        Ok(Self {
            options,
            ip_version,
            record_size,
            root: Node::Empty,
            values: Vec::new(),
            interned: AHashMap::new(),
            inserted: 0,
        })
    }

    pub fn options(&self) -> &TreeOptions {
        &self.options
    }

    pub fn ip_version(&self) -> IpVersion {
        self.ip_version
    }

    /// Override the build epoch written to the metadata.
    pub fn set_build_epoch(&mut self, epoch: u64) {
        self.options.build_epoch = Some(epoch);
    }

    /// Number of successful `insert` calls.
    pub fn insert_count(&self) -> usize {
        self.inserted
    }

    /// Insert a network with a value according to the tree's insert policy.
    pub fn insert(&mut self, network: IpNet, value: Value) -> Result<()> {
        let (addr, prefix_len) = self.key_bits(&network)?;
        let id = self.intern(value)?;
        insert_at(
            &mut self.root,
            addr,
            0,
            prefix_len,
            id,
            self.options.insert_policy,
        );
        self.inserted += 1;
        Ok(())
    }

    /// Number of nodes the serialized search tree will contain.
    pub fn node_count(&self) -> usize {
        self.flatten().len()
    }

    /// Serialize the complete database into `sink`, returning bytes written.
    pub fn write_to<W: Write>(&self, mut sink: W) -> Result<u64> {
        let nodes = self.flatten();
        let node_count = u32::try_from(nodes.len())
            .map_err(|_| Error::Config(format!("too many nodes: {}", nodes.len())))?;

        // Only values reachable from the tree are written
        let mut encoder = Encoder::new();
        let mut offsets: AHashMap<u32, usize> = AHashMap::new();
        for record in nodes.iter().flatten() {
            if let Record::Data(id) = record {
                if !offsets.contains_key(id) {
                    let offset = encoder.encode(&self.values[*id as usize])?;
                    offsets.insert(*id, offset);
                }
            }
        }
        let data_section = encoder.into_bytes();

        let max_value = self.record_size.max_value();
        let record_value = |record: Record| -> Result<u32> {
            let value = match record {
                Record::Empty => node_count as u64,
                Record::Node(n) => n as u64,
                Record::Data(id) => {
                    node_count as u64 + DATA_SECTION_SEPARATOR_SIZE as u64 + offsets[&id] as u64
                }
            };
            if value > max_value {
                return Err(Error::Config(format!(
                    "record value {} does not fit in {}-bit records",
                    value,
                    self.record_size.bits()
                )));
            }
            Ok(value as u32)
        };

        let node_bytes = self.record_size.node_bytes();
        let mut tree_bytes = vec![0u8; nodes.len() * node_bytes];
        for (chunk, [left, right]) in tree_bytes.chunks_exact_mut(node_bytes).zip(&nodes) {
            self.record_size
                .write_node(chunk, record_value(*left)?, record_value(*right)?);
        }

        let metadata = Metadata {
            binary_format_major_version: FORMAT_MAJOR_VERSION,
            binary_format_minor_version: FORMAT_MINOR_VERSION,
            build_epoch: self.options.build_epoch.unwrap_or_else(|| {
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs()
            }),
            database_type: self.options.database_type.clone(),
            description: self.options.description.clone(),
            ip_version: self.ip_version.as_u16(),
            languages: self.options.languages.clone(),
            node_count,
            record_size: self.record_size.bits(),
        };
        let metadata_bytes = Encoder::encode_standalone(&metadata.to_value())?;

        sink.write_all(&tree_bytes)?;
        sink.write_all(&[0u8; DATA_SECTION_SEPARATOR_SIZE])?;
        sink.write_all(&data_section)?;
        sink.write_all(METADATA_MARKER)?;
        sink.write_all(&metadata_bytes)?;
        sink.flush()?;

        Ok((tree_bytes.len()
            + DATA_SECTION_SEPARATOR_SIZE
            + data_section.len()
            + METADATA_MARKER.len()
            + metadata_bytes.len()) as u64)
    }

    /// Serialize into a new buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    /// Left-aligned address bits and prefix length within this tree.
    fn key_bits(&self, network: &IpNet) -> Result<(u128, u8)> {
        match (self.ip_version, network) {
            (IpVersion::V4, IpNet::V4(net)) => {
                Ok(((u32::from(net.network()) as u128) << 96, net.prefix_len()))
            }
            (IpVersion::V4, IpNet::V6(net)) => Err(Error::InvalidNetwork(format!(
                "cannot insert IPv6 network {} into an IPv4 tree",
                net
            ))),
            (IpVersion::V6, IpNet::V4(net)) => {
                Ok((u32::from(net.network()) as u128, net.prefix_len() + 96))
            }
            (IpVersion::V6, IpNet::V6(net)) => {
                Ok((u128::from(net.network()), net.prefix_len()))
            }
        }
    }

    fn intern(&mut self, value: Value) -> Result<u32> {
        let key = Encoder::encode_standalone(&value)?;
        if let Some(&id) = self.interned.get(&key) {
            return Ok(id);
        }
        let id = self.values.len() as u32;
        self.values.push(value);
        self.interned.insert(key, id);
        Ok(id)
    }

    /// Number nodes in depth-first pre-order; the root is always node 0.
    fn flatten(&self) -> Vec<[Record; 2]> {
        let mut nodes = Vec::new();
        match &self.root {
            Node::Branch(children) => {
                flatten_branch(children, &mut nodes);
            }
            leaf => {
                let children = [leaf.clone(), leaf.clone()];
                flatten_branch(&children, &mut nodes);
            }
        }
        nodes
    }
}

fn insert_at(node: &mut Node, addr: u128, depth: u8, prefix_len: u8, id: u32, policy: InsertPolicy) {
    if depth == prefix_len {
        match policy {
            InsertPolicy::Replace => *node = Node::Data(id),
            InsertPolicy::KeepExisting => fill_empty(node, id),
        }
        return;
    }

    node.split();
    if let Node::Branch(children) = node {
        let bit = ((addr >> (127 - depth)) & 1) as usize;
        insert_at(&mut children[bit], addr, depth + 1, prefix_len, id, policy);
    }
    node.collapse();
}

fn fill_empty(node: &mut Node, id: u32) {
    match node {
        Node::Empty => *node = Node::Data(id),
        Node::Data(_) => {}
        Node::Branch(children) => {
            for child in children.iter_mut() {
                fill_empty(child, id);
            }
        }
    }
    node.collapse();
}

fn flatten_branch(children: &[Node; 2], nodes: &mut Vec<[Record; 2]>) -> u32 {
    let id = nodes.len() as u32;
    nodes.push([Record::Empty; 2]);

    let mut records = [Record::Empty; 2];
    for (record, child) in records.iter_mut().zip(children.iter()) {
        *record = match child {
            Node::Empty => Record::Empty,
            Node::Data(value) => Record::Data(*value),
            Node::Branch(grandchildren) => Record::Node(flatten_branch(grandchildren, nodes)),
        };
    }
    nodes[id as usize] = records;
    id
}
