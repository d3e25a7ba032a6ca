use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::types::DappMetadata;

const MAX_NAME_LEN: usize = 255;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    #[error("Manifest fetch failed: {0}")]
    Fetch(String),
    #[error("Invalid manifest: {0}")]
    Invalid(String),
}

#[async_trait]
pub trait ManifestFetcher: Send + Sync {
    async fn fetch(&self, manifest_url: &str) -> Result<Value, ManifestError>;
}

pub struct HttpManifestFetcher {
    client: reqwest::Client,
}

impl HttpManifestFetcher {
    pub fn new(timeout: Duration) -> Result<Self, ManifestError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ManifestError::Fetch(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ManifestFetcher for HttpManifestFetcher {
    async fn fetch(&self, manifest_url: &str) -> Result<Value, ManifestError> {
        let response = self
            .client
            .get(manifest_url)
            .send()
            .await
            .map_err(|e| ManifestError::Fetch(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ManifestError::Fetch(format!("HTTP {}", response.status())));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| ManifestError::Invalid(e.to_string()))
    }
}

pub fn is_valid_url(value: &str) -> bool {
    match Url::parse(value) {
        Ok(url) => matches!(url.scheme(), "http" | "https") && url.host_str().is_some(),
        Err(_) => false,
    }
}

pub fn is_valid_string(value: &str) -> bool {
    let trimmed = value.trim();
    !trimmed.is_empty() && trimmed.len() <= MAX_NAME_LEN
}

/// `host[:port]` of an origin, the domain a proof is bound to.
pub fn origin_host(origin: &str) -> Option<String> {
    let url = Url::parse(origin).ok()?;
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

pub fn validate_manifest(origin: &str, manifest_url: &str, raw: &Value) -> Result<DappMetadata, ManifestError> {
    let field = |name: &str| raw.get(name).and_then(Value::as_str).unwrap_or_default().to_string();
    let (url, name, icon_url) = (field("url"), field("name"), field("iconUrl"));

    if !is_valid_url(&url) {
        return Err(ManifestError::Invalid("url".into()));
    }
    if !is_valid_string(&name) {
        return Err(ManifestError::Invalid("name".into()));
    }
    if !is_valid_url(&icon_url) {
        return Err(ManifestError::Invalid("iconUrl".into()));
    }

    Ok(DappMetadata {
        origin: origin.to_string(),
        url,
        name,
        icon_url,
        manifest_url: manifest_url.to_string(),
    })
}

pub async fn fetch_dapp_metadata(
    fetcher: &dyn ManifestFetcher,
    origin: &str,
    manifest_url: &str,
) -> Result<DappMetadata, ManifestError> {
    let result = match fetcher.fetch(manifest_url).await {
        Ok(raw) => validate_manifest(origin, manifest_url, &raw),
        Err(e) => Err(e),
    };
    if let Err(e) = &result {
        debug!(context = "fetchDapp", manifest_url, error = %e, "Manifest rejected");
    }
    result
}
