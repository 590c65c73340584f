//! Look up codes in a generated database.

use std::net::IpAddr;
use std::path::Path;

use maxminddb::MaxMindDBError;

use crate::{Error, Result};

/// Reader for databases whose records are plain code strings.
pub struct CodeReader {
    reader: maxminddb::Reader<Vec<u8>>,
}

impl CodeReader {
    /// Open a database file.
    pub fn open(path: &Path) -> Result<Self> {
        let reader = maxminddb::Reader::open_readfile(path)
            .map_err(|e| Error::GeoIp(format!("{}: {}", path.display(), e)))?;
        Ok(Self { reader })
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        let reader =
            maxminddb::Reader::from_source(data).map_err(|e| Error::GeoIp(e.to_string()))?;
        Ok(Self { reader })
    }

    /// The code stored for `ip`, or `None` if the address is not covered.
    pub fn lookup(&self, ip: IpAddr) -> Result<Option<String>> {
        match self.reader.lookup::<String>(ip) {
            Ok(code) => Ok(Some(code)),
            Err(MaxMindDBError::AddressNotFoundError(_)) => Ok(None),
            Err(e) => Err(Error::GeoIp(e.to_string())),
        }
    }

    pub fn database_type(&self) -> &str {
        &self.reader.metadata.database_type
    }

    /// Codes listed as the database languages.
    pub fn codes(&self) -> &[String] {
        &self.reader.metadata.languages
    }
}
