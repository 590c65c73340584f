//! Tests for the writer and reader working together.
//!
//! Trees written by [`Tree`] are read back both by [`SourceDatabase`] and by
//! the `maxminddb` crate, and hand-built images cover layouts the writer
//! never produces (aliases, corrupt records).

use std::collections::BTreeMap;
use std::net::IpAddr;

use ipnet::IpNet;

use super::*;
use crate::Error;

fn net(s: &str) -> IpNet {
    s.parse().unwrap()
}

fn string_tree(ip_version: u16, record_size: u16, entries: &[(&str, &str)]) -> Vec<u8> {
    let mut tree = Tree::new(TreeOptions {
        database_type: "test".to_string(),
        languages: vec!["en".to_string()],
        ip_version,
        record_size,
        build_epoch: Some(1_700_000_000),
        ..TreeOptions::default()
    })
    .unwrap();
    for (network, value) in entries {
        tree.insert(net(network), Value::from(*value)).unwrap();
    }
    tree.to_bytes().unwrap()
}

fn collect(bytes: &[u8]) -> Vec<(String, String)> {
    let db = SourceDatabase::from_bytes(bytes).unwrap();
    db.networks::<Value>()
        .map(|item| {
            let (network, value) = item.unwrap();
            (network.to_string(), value.as_str().unwrap().to_string())
        })
        .collect()
}

fn lookup(bytes: &[u8], ip: &str) -> Option<String> {
    let reader = maxminddb::Reader::from_source(bytes.to_vec()).unwrap();
    let ip: IpAddr = ip.parse().unwrap();
    reader.lookup::<String>(ip).ok()
}

/// Record of a hand-built node.
#[derive(Clone, Copy)]
enum Rec {
    Node(u32),
    Empty,
    Data(usize),
}

/// Build an image directly from node records and data values.
fn raw_image(ip_version: u16, record_size: RecordSize, nodes: &[[Rec; 2]], values: &[Value]) -> Vec<u8> {
    let node_count = nodes.len() as u32;
    let mut encoder = Encoder::new();
    let offsets: Vec<usize> = values.iter().map(|v| encoder.encode(v).unwrap()).collect();
    let data = encoder.into_bytes();

    let to_u32 = |rec: Rec| match rec {
        Rec::Node(n) => n,
        Rec::Empty => node_count,
        Rec::Data(i) => node_count + 16 + offsets[i] as u32,
    };

    let mut image = vec![0u8; nodes.len() * record_size.node_bytes()];
    for (chunk, [left, right]) in image.chunks_exact_mut(record_size.node_bytes()).zip(nodes) {
        record_size.write_node(chunk, to_u32(*left), to_u32(*right));
    }
    image.extend_from_slice(&[0u8; 16]);
    image.extend_from_slice(&data);
    image.extend_from_slice(METADATA_MARKER);

    let metadata = Metadata {
        binary_format_major_version: 2,
        binary_format_minor_version: 0,
        build_epoch: 0,
        database_type: "raw".to_string(),
        description: BTreeMap::new(),
        ip_version,
        languages: vec![],
        node_count,
        record_size: record_size.bits(),
    };
    image.extend_from_slice(&Encoder::encode_standalone(&metadata.to_value()).unwrap());
    image
}

/// Follow the bits of `addr` from the root for `depth` bits, adding nodes
/// where the path is empty. Returns the node reached.
fn node_at(nodes: &mut Vec<[Rec; 2]>, addr: u128, depth: u32) -> u32 {
    if nodes.is_empty() {
        nodes.push([Rec::Empty, Rec::Empty]);
    }
    let mut node = 0u32;
    for bit in 0..depth {
        let side = ((addr >> (127 - bit)) & 1) as usize;
        node = match nodes[node as usize][side] {
            Rec::Node(next) => next,
            Rec::Empty => {
                let next = nodes.len() as u32;
                nodes.push([Rec::Empty, Rec::Empty]);
                nodes[node as usize][side] = Rec::Node(next);
                next
            }
            Rec::Data(_) => panic!("path to {:x}/{} crosses a data record", addr, depth),
        };
    }
    node
}

/// Set the record of the `addr/prefix` network.
fn set_record(nodes: &mut Vec<[Rec; 2]>, addr: u128, prefix: u32, rec: Rec) {
    let parent = node_at(nodes, addr, prefix - 1);
    let side = ((addr >> (128 - prefix)) & 1) as usize;
    nodes[parent as usize][side] = rec;
}

// ============================================================================
// Writer -> reader round trips
// ============================================================================

#[test]
fn test_networks_in_address_order() {
    let bytes = string_tree(
        4,
        24,
        &[("5.6.7.0/24", "eu"), ("1.2.3.0/24", "us"), ("200.0.0.0/8", "br")],
    );
    assert_eq!(
        collect(&bytes),
        vec![
            ("1.2.3.0/24".to_string(), "us".to_string()),
            ("5.6.7.0/24".to_string(), "eu".to_string()),
            ("200.0.0.0/8".to_string(), "br".to_string()),
        ]
    );
}

#[test]
fn test_ipv4_networks_in_ipv6_tree_reported_as_ipv4() {
    let bytes = string_tree(6, 28, &[("1.2.3.0/24", "us"), ("2001:db8::/32", "doc")]);
    assert_eq!(
        collect(&bytes),
        vec![
            ("1.2.3.0/24".to_string(), "us".to_string()),
            ("2001:db8::/32".to_string(), "doc".to_string()),
        ]
    );
}

#[test]
fn test_all_record_sizes_roundtrip() {
    let entries = [
        ("10.0.0.0/8", "a"),
        ("10.1.0.0/16", "b"),
        ("192.168.0.0/24", "c"),
        ("2400:cb00::/32", "d"),
    ];
    for record_size in [24, 28, 32] {
        let bytes = string_tree(6, record_size, &entries);
        let db = SourceDatabase::from_bytes(&bytes).unwrap();
        assert_eq!(db.metadata().record_size, record_size);
        assert_eq!(db.metadata().database_type, "test");
        assert_eq!(db.metadata().languages, vec!["en".to_string()]);

        let found = collect(&bytes);
        assert!(found.contains(&("10.1.0.0/16".to_string(), "b".to_string())));
        assert!(found.contains(&("2400:cb00::/32".to_string(), "d".to_string())));

        assert_eq!(lookup(&bytes, "10.1.2.3").as_deref(), Some("b"));
        assert_eq!(lookup(&bytes, "10.2.0.1").as_deref(), Some("a"));
        assert_eq!(lookup(&bytes, "192.168.0.77").as_deref(), Some("c"));
        assert_eq!(lookup(&bytes, "2400:cb00::1").as_deref(), Some("d"));
        assert_eq!(lookup(&bytes, "8.8.8.8"), None);
    }
}

#[test]
fn test_maxminddb_reads_metadata() {
    let bytes = string_tree(6, 28, &[("1.0.0.0/8", "au")]);
    let reader = maxminddb::Reader::from_source(bytes).unwrap();
    assert_eq!(reader.metadata.database_type, "test");
    assert_eq!(reader.metadata.ip_version, 6);
    assert_eq!(reader.metadata.record_size, 28);
    assert_eq!(reader.metadata.binary_format_major_version, 2);
    assert_eq!(reader.metadata.build_epoch, 1_700_000_000);
}

#[test]
fn test_map_records_decode_through_pointers() {
    let mut tree = Tree::new(TreeOptions {
        ip_version: 4,
        record_size: 24,
        ..TreeOptions::default()
    })
    .unwrap();
    let record = |iso: &str| {
        Value::Map(BTreeMap::from([(
            "country".to_string(),
            Value::Map(BTreeMap::from([(
                "iso_code".to_string(),
                Value::from(iso),
            )])),
        )]))
    };
    tree.insert(net("1.0.0.0/8"), record("AU")).unwrap();
    tree.insert(net("2.0.0.0/8"), record("FR")).unwrap();
    let bytes = tree.to_bytes().unwrap();

    let db = SourceDatabase::from_bytes(&bytes).unwrap();
    let records: Vec<_> = db.networks::<Value>().map(|r| r.unwrap().1).collect();
    assert_eq!(records, vec![record("AU"), record("FR")]);
}

#[test]
fn test_empty_tree_has_no_networks() {
    let bytes = string_tree(6, 24, &[]);
    assert!(collect(&bytes).is_empty());
}

// ============================================================================
// Hand-built images
// ============================================================================

#[test]
fn test_aliased_ipv4_subtree_is_skipped() {
    // Nodes 0..=95 follow zero bits down to ::/96, node 96 is the IPv4 start.
    // Node 0's right record aliases the IPv4 subtree at 8000::/1.
    let mut nodes = Vec::new();
    for i in 0..96u32 {
        let right = if i == 0 { Rec::Node(96) } else { Rec::Empty };
        nodes.push([Rec::Node(i + 1), right]);
    }
    nodes.push([Rec::Data(0), Rec::Empty]);
    let image = raw_image(6, RecordSize::Bits24, &nodes, &[Value::from("us")]);

    assert_eq!(
        collect(&image),
        vec![("0.0.0.0/1".to_string(), "us".to_string())]
    );
}

#[test]
fn test_mapped_and_6to4_aliases_emit_ipv4_once() {
    let mut nodes = Vec::new();
    let ipv4_start = node_at(&mut nodes, 0, 96);
    nodes[ipv4_start as usize] = [Rec::Data(0), Rec::Data(1)];
    // ::ffff:0:0/96 and 2002::/16 both point at the IPv4 start node
    set_record(&mut nodes, 0xffff << 32, 96, Rec::Node(ipv4_start));
    set_record(&mut nodes, 0x2002 << 112, 16, Rec::Node(ipv4_start));
    let image = raw_image(
        6,
        RecordSize::Bits28,
        &nodes,
        &[Value::from("us"), Value::from("ir")],
    );

    assert_eq!(
        collect(&image),
        vec![
            ("0.0.0.0/1".to_string(), "us".to_string()),
            ("128.0.0.0/1".to_string(), "ir".to_string()),
        ]
    );

    // the aliases still resolve for readers that follow them
    assert_eq!(lookup(&image, "1.2.3.4").as_deref(), Some("us"));
    assert_eq!(lookup(&image, "::ffff:200.1.1.1").as_deref(), Some("ir"));
    assert_eq!(lookup(&image, "2002:c801:101::").as_deref(), Some("ir"));
    assert_eq!(lookup(&image, "2001:db8::1"), None);
}

#[test]
fn test_ipv4_database_walk() {
    let nodes = [[Rec::Data(0), Rec::Node(1)], [Rec::Empty, Rec::Data(1)]];
    let image = raw_image(
        4,
        RecordSize::Bits32,
        &nodes,
        &[Value::from("low"), Value::from("high")],
    );
    assert_eq!(
        collect(&image),
        vec![
            ("0.0.0.0/1".to_string(), "low".to_string()),
            ("192.0.0.0/2".to_string(), "high".to_string()),
        ]
    );
}

#[test]
fn test_missing_marker_is_malformed() {
    let err = SourceDatabase::from_bytes(b"definitely not a database").err().unwrap();
    assert!(matches!(err, Error::MalformedDatabase(_)));
}

#[test]
fn test_truncated_tree_is_malformed() {
    let bytes = string_tree(4, 24, &[("1.2.3.0/24", "us")]);
    let marker = find_metadata_marker(&bytes).unwrap();
    // keep the metadata but drop most of the search tree
    let mut truncated = bytes[..10].to_vec();
    truncated.extend_from_slice(&bytes[marker..]);

    let err = SourceDatabase::from_bytes(&truncated).err().unwrap();
    assert!(matches!(err, Error::MalformedDatabase(_)));
}

#[test]
fn test_unsupported_record_size_is_malformed() {
    let mut image = vec![0u8; 6 + 16];
    image.extend_from_slice(METADATA_MARKER);
    let metadata = Metadata {
        binary_format_major_version: 2,
        binary_format_minor_version: 0,
        build_epoch: 0,
        database_type: "raw".to_string(),
        description: BTreeMap::new(),
        ip_version: 4,
        languages: vec![],
        node_count: 1,
        record_size: 26,
    };
    image.extend_from_slice(&Encoder::encode_standalone(&metadata.to_value()).unwrap());

    let err = SourceDatabase::from_bytes(&image).err().unwrap();
    assert!(matches!(err, Error::MalformedDatabase(_)));
    assert!(err.to_string().contains("record size"));
}

#[test]
fn test_data_pointer_outside_section_fails_mid_stream() {
    // Node 1's right record points far past the data section
    let nodes = [[Rec::Data(0), Rec::Node(1)], [Rec::Empty, Rec::Empty]];
    let mut image = raw_image(4, RecordSize::Bits24, &nodes, &[Value::from("ok")]);
    RecordSize::Bits24.write_node(&mut image[6..12], 2, 2 + 16 + 5000);

    let db = SourceDatabase::from_bytes(&image).unwrap();
    let items: Vec<_> = db.networks::<Value>().collect();
    assert_eq!(items.len(), 2);
    assert!(items[0].is_ok());
    assert!(matches!(items[1], Err(Error::MalformedDatabase(_))));
}

#[test]
fn test_tree_deeper_than_address_width_fails() {
    // IPv4 tree whose node 0 points back at itself on the left
    let nodes = [[Rec::Node(0), Rec::Empty]];
    let image = raw_image(4, RecordSize::Bits24, &nodes, &[]);

    let db = SourceDatabase::from_bytes(&image).unwrap();
    let result: crate::Result<Vec<_>> = db.networks::<Value>().collect();
    assert!(matches!(result, Err(Error::MalformedDatabase(_))));
}
