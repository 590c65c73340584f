//! MMDB source database reader.
//!
//! Enumerates every network of a search tree together with its decoded data
//! record. IPv4 aliases inside IPv6 trees (e.g. `::ffff:0:0/96`) are skipped
//! so that each IPv4 range is reported once.

use std::marker::PhantomData;
use std::net::{Ipv4Addr, Ipv6Addr};

use ahash::AHashMap;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use super::data::{Decoder, Value};
use super::format::*;
use crate::{Error, Result};

/// Conversion from a decoded data record into a caller type.
pub trait DecodeRecord: Sized + Clone {
    fn decode_record(value: &Value) -> Result<Self>;
}

impl DecodeRecord for Value {
    fn decode_record(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

/// A parsed MMDB image borrowing its bytes.
pub struct SourceDatabase<'a> {
    metadata: Metadata,
    ip_version: IpVersion,
    record_size: RecordSize,
    tree: &'a [u8],
    data_section: &'a [u8],
    ipv4_start: u32,
}

impl<'a> SourceDatabase<'a> {
    /// Parse the metadata and locate the search tree and data section.
    pub fn from_bytes(data: &'a [u8]) -> Result<Self> {
        let marker = find_metadata_marker(data)
            .ok_or_else(|| Error::malformed("metadata marker not found"))?;

        let metadata_value = Decoder::new(&data[marker + METADATA_MARKER.len()..]).decode(0)?;
        let metadata = Metadata::from_value(&metadata_value)?;

        let ip_version = IpVersion::from_u16(metadata.ip_version).ok_or_else(|| {
            Error::malformed(format!("unsupported IP version: {}", metadata.ip_version))
        })?;
        let record_size = RecordSize::from_bits(metadata.record_size).ok_or_else(|| {
            Error::malformed(format!("unsupported record size: {}", metadata.record_size))
        })?;

        let tree_size = metadata
            .search_tree_size()
            .ok_or_else(|| Error::malformed("search tree size overflows"))?;
        let data_start = tree_size + DATA_SECTION_SEPARATOR_SIZE;
        if data_start > marker {
            return Err(Error::malformed(format!(
                "search tree of {} bytes does not fit in image of {} bytes",
                tree_size, marker
            )));
        }

        let mut db = Self {
            metadata,
            ip_version,
            record_size,
            tree: &data[..tree_size],
            data_section: &data[data_start..marker],
            ipv4_start: 0,
        };
        db.ipv4_start = db.find_ipv4_start()?;

        log::debug!(
            "Parsed {} database: IPv{}, {} nodes, {}-bit records",
            db.metadata.database_type,
            db.metadata.ip_version,
            db.metadata.node_count,
            db.metadata.record_size
        );

        Ok(db)
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn ip_version(&self) -> IpVersion {
        self.ip_version
    }

    /// Iterate all non-aliased networks with their records, in address order.
    pub fn networks<T: DecodeRecord>(&self) -> Networks<'_, 'a, T> {
        Networks {
            db: self,
            stack: vec![Pending {
                addr: 0,
                depth: 0,
                pointer: 0,
            }],
            cache: AHashMap::new(),
            done: false,
            _record: PhantomData,
        }
    }

    /// Read the left (0) or right (1) record of a node.
    fn read_record(&self, node: u32, side: usize) -> Result<u32> {
        if node >= self.metadata.node_count {
            return Err(Error::malformed(format!(
                "node {} exceeds node count {}",
                node, self.metadata.node_count
            )));
        }
        let node_bytes = self.record_size.node_bytes();
        let offset = node as usize * node_bytes;
        let (left, right) = self
            .record_size
            .read_node(&self.tree[offset..offset + node_bytes]);
        Ok(if side == 0 { left } else { right })
    }

    /// The node reached by following 96 zero bits in an IPv6 tree.
    fn find_ipv4_start(&self) -> Result<u32> {
        if self.ip_version == IpVersion::V4 {
            return Ok(0);
        }
        let mut node = 0;
        for _ in 0..96 {
            if node >= self.metadata.node_count {
                break;
            }
            node = self.read_record(node, 0)?;
        }
        Ok(node)
    }

    fn network(&self, addr: u128, depth: u8) -> Result<IpNet> {
        let net = match self.ip_version {
            IpVersion::V4 => {
                Ipv4Net::new(Ipv4Addr::from((addr >> 96) as u32), depth).map(IpNet::V4)
            }
            IpVersion::V6 if depth >= 96 && in_ipv4_subtree(addr) => {
                Ipv4Net::new(Ipv4Addr::from(addr as u32), depth - 96).map(IpNet::V4)
            }
            IpVersion::V6 => Ipv6Net::new(Ipv6Addr::from(addr), depth).map(IpNet::V6),
        };
        net.map_err(|e| Error::malformed(format!("invalid network depth {}: {}", depth, e)))
    }

    /// Data section offset of a data record value.
    fn data_offset(&self, pointer: u32) -> Result<usize> {
        let offset = (pointer - self.metadata.node_count) as usize;
        offset
            .checked_sub(DATA_SECTION_SEPARATOR_SIZE)
            .filter(|offset| *offset < self.data_section.len())
            .ok_or_else(|| {
                Error::malformed(format!(
                    "record {} points outside the data section of {} bytes",
                    pointer,
                    self.data_section.len()
                ))
            })
    }
}

/// Address bits left-aligned in a `u128`; first 96 bits zero means `::/96`.
fn in_ipv4_subtree(addr: u128) -> bool {
    addr >> 32 == 0
}

struct Pending {
    addr: u128,
    depth: u8,
    pointer: u32,
}

/// Lazy depth-first walk over a [`SourceDatabase`].
///
/// After the first error the iterator is exhausted.
pub struct Networks<'db, 'a, T> {
    db: &'db SourceDatabase<'a>,
    stack: Vec<Pending>,
    cache: AHashMap<usize, T>,
    done: bool,
    _record: PhantomData<T>,
}

impl<T: DecodeRecord> Networks<'_, '_, T> {
    fn advance(&mut self) -> Result<Option<(IpNet, T)>> {
        let node_count = self.db.metadata.node_count;
        let bit_count = self.db.ip_version.bit_count();

        while let Some(Pending {
            addr,
            depth,
            pointer,
        }) = self.stack.pop()
        {
            if pointer == node_count {
                continue;
            }

            if pointer > node_count {
                let network = self.db.network(addr, depth)?;
                let record = self.record(pointer)?;
                return Ok(Some((network, record)));
            }

            // Aliases point back at the IPv4 subtree from elsewhere
            if self.db.ipv4_start != 0
                && pointer == self.db.ipv4_start
                && !in_ipv4_subtree(addr)
            {
                continue;
            }

            if depth >= bit_count {
                return Err(Error::malformed(format!(
                    "search tree deeper than {} bits at node {}",
                    bit_count, pointer
                )));
            }

            let left = self.db.read_record(pointer, 0)?;
            let right = self.db.read_record(pointer, 1)?;
            self.stack.push(Pending {
                addr: addr | (1u128 << (127 - depth)),
                depth: depth + 1,
                pointer: right,
            });
            self.stack.push(Pending {
                addr,
                depth: depth + 1,
                pointer: left,
            });
        }

        Ok(None)
    }

    fn record(&mut self, pointer: u32) -> Result<T> {
        let offset = self.db.data_offset(pointer)?;
        if let Some(record) = self.cache.get(&offset) {
            return Ok(record.clone());
        }
        let value = Decoder::new(self.db.data_section).decode(offset)?;
        let record = T::decode_record(&value)?;
        self.cache.insert(offset, record.clone());
        Ok(record)
    }
}

impl<T: DecodeRecord> Iterator for Networks<'_, '_, T> {
    type Item = Result<(IpNet, T)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
