//! MaxMind DB (MMDB) binary format support.
//!
//! The decoder reads upstream GeoIP images and enumerates their networks;
//! the writer builds fresh search trees and serializes them in the same
//! format so any MMDB reader can consume the output.
//!
//! # File Structure
//!
//! ```text
//! +------------------+
//! |   SEARCH TREE    |  node_count * record_size * 2 / 8 bytes
//! +------------------+
//! |    SEPARATOR     |  16 zero bytes
//! +------------------+
//! |   DATA SECTION   |  variable
//! +------------------+
//! | METADATA MARKER  |  "\xAB\xCD\xEFMaxMind.com"
//! +------------------+
//! |    METADATA      |  map (data section encoding)
//! +------------------+
//! ```

pub mod data;
mod format;
pub mod reader;
pub mod writer;

#[cfg(test)]
mod tests;

pub use data::{Decoder, Encoder, Value};
pub use format::*;
pub use reader::{DecodeRecord, Networks, SourceDatabase};
pub use writer::{InsertPolicy, Tree, TreeOptions};
