//! Release configuration.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Result;

/// Default upstream repository.
pub const DEFAULT_REPOSITORY: &str = "Chocolate4U/Iran-v2ray-rules";

/// Upstream asset and output file of the full database.
pub const DEFAULT_ASSET: &str = "Country.mmdb";
pub const DEFAULT_OUTPUT: &str = "geoip.db";

/// Upstream asset and output file of the lite database.
pub const DEFAULT_LITE_ASSET: &str = "Country-lite.mmdb";
pub const DEFAULT_LITE_OUTPUT: &str = "geoip-lite.db";

/// What a release run fetches and writes. Every field has a default.
///
/// ```yaml
/// repository: Chocolate4U/Iran-v2ray-rules
/// output: dist/geoip.db
/// lite_output: dist/geoip-lite.db
/// lite_codes: [ir, cn, private]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseConfig {
    pub repository: String,
    pub asset: String,
    pub output: PathBuf,
    /// Allow-list for the full database; empty means every code.
    pub codes: Vec<String>,
    /// Falls back to `repository` when unset.
    pub lite_repository: Option<String>,
    pub lite_asset: String,
    pub lite_output: PathBuf,
    pub lite_codes: Vec<String>,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            repository: DEFAULT_REPOSITORY.to_string(),
            asset: DEFAULT_ASSET.to_string(),
            output: PathBuf::from(DEFAULT_OUTPUT),
            codes: Vec::new(),
            lite_repository: None,
            lite_asset: DEFAULT_LITE_ASSET.to_string(),
            lite_output: PathBuf::from(DEFAULT_LITE_OUTPUT),
            lite_codes: Vec::new(),
        }
    }
}

impl ReleaseConfig {
    /// Load a YAML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        // An empty document means all defaults
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// The full and lite variants, in build order.
    pub fn variants(&self) -> Vec<Variant> {
        vec![
            Variant {
                name: "full".to_string(),
                repository: self.repository.clone(),
                asset: self.asset.clone(),
                output: self.output.clone(),
                codes: self.codes.clone(),
            },
            Variant {
                name: "lite".to_string(),
                repository: self
                    .lite_repository
                    .clone()
                    .unwrap_or_else(|| self.repository.clone()),
                asset: self.lite_asset.clone(),
                output: self.lite_output.clone(),
                codes: self.lite_codes.clone(),
            },
        ]
    }
}

/// One database produced by a release run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    pub name: String,
    pub repository: String,
    pub asset: String,
    pub output: PathBuf,
    pub codes: Vec<String>,
}
