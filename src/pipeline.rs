//! Decode, classify, rebuild and write a database.

use std::borrow::Cow;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::builder::{insertion_order, GeoTreeBuilder};
use crate::classify::{classify, CodeMap};
use crate::config::Variant;
use crate::mmdb::{Metadata, SourceDatabase};
use crate::record::GeoRecord;
use crate::source::{is_gzip, maybe_gunzip, ArtifactSource};
use crate::{Error, Result};

/// Outcome of writing one database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseSummary {
    pub variant: String,
    pub output: PathBuf,
    /// Networks inserted into the output tree
    pub networks: usize,
    /// Codes present in the output tree
    pub codes: usize,
    /// Size of the written file
    pub bytes: u64,
    /// Lowercase hex SHA-256 of the written file
    pub sha256: String,
}

/// Decode a source database and classify its networks.
pub fn parse(data: &[u8]) -> Result<(Metadata, CodeMap)> {
    let db = SourceDatabase::from_bytes(data)?;
    let code_map = classify(db.networks::<GeoRecord>())?;
    log::debug!(
        "Classified {} networks into {} codes",
        code_map.network_count(),
        code_map.len()
    );
    Ok((db.metadata().clone(), code_map))
}

/// Build the output tree. Every code of the source becomes a language.
pub fn build(
    metadata: &Metadata,
    code_map: &CodeMap,
    allow_list: &[String],
) -> Result<GeoTreeBuilder> {
    let codes: Vec<String> = code_map.codes().map(str::to_string).collect();
    let mut builder = GeoTreeBuilder::new(metadata, &codes)?;
    builder.populate(code_map, allow_list)?;
    Ok(builder)
}

/// Fetch a variant's asset and write its database.
pub fn release<S: ArtifactSource + ?Sized>(source: &S, variant: &Variant) -> Result<ReleaseSummary> {
    log::info!(
        "Building {} database from {} {}",
        variant.name,
        variant.repository,
        variant.asset
    );
    let data = source.fetch_latest_asset(&variant.repository, &variant.asset)?;
    let data = maybe_gunzip(data)?;
    generate(&variant.name, &data, &variant.codes, &variant.output)
}

/// Convert a local source image, plain or gzip compressed.
pub fn convert(input: &[u8], allow_list: &[String], output: &Path) -> Result<ReleaseSummary> {
    let data: Cow<'_, [u8]> = if is_gzip(input) {
        Cow::Owned(maybe_gunzip(input.to_vec())?)
    } else {
        Cow::Borrowed(input)
    };
    generate("convert", &data, allow_list, output)
}

fn generate(name: &str, data: &[u8], allow_list: &[String], output: &Path) -> Result<ReleaseSummary> {
    let (metadata, code_map) = parse(data)?;
    let networks = code_map.network_count();
    let codes = insertion_order(&code_map, allow_list)
        .iter()
        .filter(|code| code_map.contains(code))
        .count();
    if !allow_list.is_empty() && codes == 0 {
        log::warn!("None of the {} allowed codes occur in the source", allow_list.len());
    }

    let builder = build(&metadata, &code_map, allow_list)?;
    let (bytes, sha256) = write_output(&builder, output)?;

    let summary = ReleaseSummary {
        variant: name.to_string(),
        output: output.to_path_buf(),
        networks: builder.tree().insert_count(),
        codes,
        bytes,
        sha256,
    };
    log::info!(
        "Wrote {}: {} bytes, {} of {} networks, {} codes, sha256 {}",
        summary.output.display(),
        summary.bytes,
        summary.networks,
        networks,
        summary.codes,
        summary.sha256
    );
    Ok(summary)
}

/// Write the database next to `path` and rename it into place.
///
/// Returns the byte count and SHA-256 hex digest of the file.
pub fn write_output(builder: &GeoTreeBuilder, path: &Path) -> Result<(u64, String)> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let temp = NamedTempFile::new_in(dir)?;
    let mut writer = HashingWriter::new(BufWriter::new(temp.as_file()));
    let bytes = builder.write_to(&mut writer)?;
    let (buffered, digest) = writer.finish();
    buffered.into_inner().map_err(|e| e.into_error())?;
    temp.as_file().sync_all()?;

    // the temp file is removed when the persist error is dropped
    temp.persist(path).map_err(|e| {
        Error::Io(io::Error::new(
            e.error.kind(),
            format!("cannot replace {}: {}", path.display(), e.error),
        ))
    })?;
    Ok((bytes, digest))
}

/// Passes writes through while hashing them.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn finish(self) -> (W, String) {
        (self.inner, format!("{:x}", self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
