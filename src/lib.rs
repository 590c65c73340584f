//! sing-geoip - regenerate country code GeoIP databases.
//!
//! Reads an upstream MaxMind DB country database, reduces every network to a
//! single lowercase code and writes a new database whose records are plain
//! code strings, as consumed by sing-box `geoip` rules.
//!
//! # Pipeline
//!
//! 1. **Decode**: [`mmdb::SourceDatabase`] walks the search tree and yields
//!    every (network, record) pair once, skipping IPv4 aliases.
//! 2. **Classify**: [`classify()`] picks the country, registered country,
//!    represented country or continent code (first non-empty) and groups
//!    networks by code.
//! 3. **Build**: [`GeoTreeBuilder`] inserts the networks of each selected
//!    code in sorted code order and serializes the tree.
//!
//! # Quick Start
//!
//! ```ignore
//! use sing_geoip::{pipeline, GithubReleases, ReleaseConfig};
//!
//! let source = GithubReleases::new(std::env::var("ACCESS_TOKEN").ok())?;
//! for variant in ReleaseConfig::default().variants() {
//!     let summary = pipeline::release(&source, &variant)?;
//!     println!("{} {}", summary.output.display(), summary.sha256);
//! }
//! ```
//!
//! Generated databases can be queried with [`CodeReader`].

mod error;

pub mod builder;
pub mod classify;
pub mod config;
pub mod lookup;
pub mod mmdb;
pub mod pipeline;
pub mod record;
pub mod source;

// Re-export core types
pub use error::{Error, Result};
pub use record::GeoRecord;

pub use builder::{insertion_order, GeoTreeBuilder, DATABASE_TYPE};
pub use classify::{classify, resolve_code, CodeMap};
pub use config::{ReleaseConfig, Variant};
pub use lookup::CodeReader;
pub use pipeline::ReleaseSummary;
pub use source::{ArtifactSource, GithubReleases};
