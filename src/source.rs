//! Upstream artifact sources.
//!
//! The pipeline only needs "the bytes of asset X in the latest release of
//! repository Y"; [`GithubReleases`] answers that through the GitHub REST API.

use std::io::Read;
use std::time::Duration;

use flate2::read::GzDecoder;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::{Error, Result};

/// Default GitHub API endpoint.
pub const DEFAULT_API_URL: &str = "https://api.github.com";

const USER_AGENT: &str = concat!("sing-geoip/", env!("CARGO_PKG_VERSION"));

/// Fetches release assets by name.
pub trait ArtifactSource {
    /// Download `asset` from the latest release of `repository` (`owner/name`).
    ///
    /// Fails with [`Error::NotFound`] if the release carries no such asset.
    /// The bytes are returned as published, possibly gzip compressed.
    fn fetch_latest_asset(&self, repository: &str, asset: &str) -> Result<Vec<u8>>;
}

/// A published release.
#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    #[serde(default)]
    pub name: Option<String>,
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
    #[serde(default)]
    pub size: u64,
}

impl Release {
    /// Parse a release payload of the REST API.
    pub fn from_json(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Find an asset by exact name.
    pub fn asset(&self, name: &str) -> Result<&ReleaseAsset> {
        self.assets
            .iter()
            .find(|asset| asset.name == name)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "{} not found in upstream release {}",
                    name,
                    self.name.as_deref().unwrap_or(&self.tag_name)
                ))
            })
    }
}

/// GitHub releases client.
pub struct GithubReleases {
    client: Client,
    api_url: String,
    token: Option<String>,
}

impl GithubReleases {
    /// Create a client; `token` is sent as basic auth user name when set.
    pub fn new(token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            api_url: DEFAULT_API_URL.to_string(),
            token: token.filter(|t| !t.is_empty()),
        })
    }

    /// Use a different API endpoint (GitHub Enterprise, mirrors).
    pub fn with_api_url(mut self, api_url: &str) -> Self {
        self.api_url = api_url.trim_end_matches('/').to_string();
        self
    }

    /// Fetch the latest release of `owner/name`.
    pub fn latest_release(&self, repository: &str) -> Result<Release> {
        let (owner, name) = split_repository(repository)?;
        let url = format!("{}/repos/{}/{}/releases/latest", self.api_url, owner, name);

        let response = self.get(&url).send()?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!(
                "no published release in {}",
                repository
            )));
        }
        let body = response.error_for_status()?.bytes()?;
        let release = Release::from_json(&body)?;
        log::debug!(
            "Latest release of {}: {} ({} assets)",
            repository,
            release.tag_name,
            release.assets.len()
        );
        Ok(release)
    }

    fn get(&self, url: &str) -> reqwest::blocking::RequestBuilder {
        let request = self.client.get(url);
        match &self.token {
            Some(token) => request.basic_auth(token, None::<&str>),
            None => request,
        }
    }
}

impl ArtifactSource for GithubReleases {
    fn fetch_latest_asset(&self, repository: &str, asset: &str) -> Result<Vec<u8>> {
        let release = self.latest_release(repository)?;
        let asset = release.asset(asset)?;

        log::info!(
            "Downloading {} from {} {}",
            asset.name,
            repository,
            release.tag_name
        );
        let response = self
            .get(&asset.browser_download_url)
            .send()?
            .error_for_status()?;
        Ok(response.bytes()?.to_vec())
    }
}

/// Split `owner/name`.
pub fn split_repository(repository: &str) -> Result<(&str, &str)> {
    match repository.split_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((owner, name))
        }
        _ => Err(Error::Config(format!(
            "repository must be owner/name, got {:?}",
            repository
        ))),
    }
}

/// Check if data is gzip compressed.
pub fn is_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}

/// Inflate gzip data, pass anything else through.
pub fn maybe_gunzip(data: Vec<u8>) -> Result<Vec<u8>> {
    if !is_gzip(&data) {
        return Ok(data);
    }
    let mut decoder = GzDecoder::new(&data[..]);
    let mut inflated = Vec::new();
    decoder.read_to_end(&mut inflated)?;
    log::debug!(
        "Inflated {} bytes to {} bytes",
        data.len(),
        inflated.len()
    );
    Ok(inflated)
}
