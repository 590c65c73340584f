//! Geo attribute records as stored in country databases.

use std::collections::BTreeMap;

use crate::mmdb::{DecodeRecord, Value};
use crate::{Error, Result};

/// The four code fields of a country record. Empty means absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeoRecord {
    pub country: String,
    pub registered_country: String,
    pub represented_country: String,
    pub continent: String,
}

impl GeoRecord {
    /// Build the nested map a country database stores for this record.
    ///
    /// Empty fields are left out.
    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        let fields = [
            ("country", "iso_code", &self.country),
            ("registered_country", "iso_code", &self.registered_country),
            ("represented_country", "iso_code", &self.represented_country),
            ("continent", "code", &self.continent),
        ];
        for (outer, inner, code) in fields {
            if code.is_empty() {
                continue;
            }
            let entry = BTreeMap::from([(inner.to_string(), Value::from(code.as_str()))]);
            map.insert(outer.to_string(), Value::Map(entry));
        }
        Value::Map(map)
    }

    fn field(value: &Value, outer: &str, inner: &str) -> Result<String> {
        match value.path(&[outer, inner]) {
            None => Ok(String::new()),
            Some(Value::String(code)) => Ok(code.clone()),
            Some(other) => Err(Error::malformed(format!(
                "{}.{} is not a string: {:?}",
                outer, inner, other
            ))),
        }
    }
}

impl DecodeRecord for GeoRecord {
    fn decode_record(value: &Value) -> Result<Self> {
        if value.as_map().is_none() {
            return Err(Error::malformed(format!(
                "data record is not a map: {:?}",
                value
            )));
        }
        Ok(Self {
            country: Self::field(value, "country", "iso_code")?,
            registered_country: Self::field(value, "registered_country", "iso_code")?,
            represented_country: Self::field(value, "represented_country", "iso_code")?,
            continent: Self::field(value, "continent", "code")?,
        })
    }
}
