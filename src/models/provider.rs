//! Provider records — identity and transport configuration for one backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::{Host, Url};

use crate::{GatewayError, Result};

/// Provider transport variants supported by TokenHub.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Vllm,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::OpenAi => write!(f, "openai"),
            ProviderKind::Anthropic => write!(f, "anthropic"),
            ProviderKind::Vllm => write!(f, "vllm"),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "openai" => Ok(ProviderKind::OpenAi),
            "anthropic" => Ok(ProviderKind::Anthropic),
            "vllm" => Ok(ProviderKind::Vllm),
            other => Err(GatewayError::InvalidRequest(format!(
                "unknown provider type: {}",
                other
            ))),
        }
    }
}

/// Where an adapter's API key is resolved from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CredStore {
    Vault,
    None,
}

/// Identity and transport for a registered backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub id: String,
    pub kind: ProviderKind,
    /// Normalized on upsert: no trailing slash, no `/v1` or `/v2` suffix.
    pub base_url: String,
    pub cred_store: CredStore,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProviderRecord {
    pub fn new(id: impl Into<String>, kind: ProviderKind, base_url: &str) -> Result<Self> {
        let now = Utc::now();
        Ok(Self {
            id: id.into(),
            kind,
            base_url: normalize_base_url(base_url)?,
            cred_store: CredStore::None,
            enabled: true,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Normalize a provider base URL: validate it parses, strip trailing
/// slashes, then strip a trailing `/v1` or `/v2` path segment. Adapters
/// append their own versioned paths.
pub fn normalize_base_url(raw: &str) -> Result<String> {
    let url = Url::parse(raw)
        .map_err(|e| GatewayError::InvalidRequest(format!("invalid base_url {:?}: {}", raw, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(GatewayError::InvalidRequest(format!(
            "base_url must be http(s), got {:?}",
            url.scheme()
        )));
    }

    let mut out = raw.trim_end_matches('/').to_string();
    for suffix in ["/v1", "/v2"] {
        if let Some(stripped) = out.strip_suffix(suffix) {
            out = stripped.to_string();
            break;
        }
    }
    Ok(out.trim_end_matches('/').to_string())
}

/// The host portion of a base URL, used for the upsert-time DNS check.
/// IP literals are reported as such so the check can be bypassed.
pub fn base_url_host(base_url: &str) -> Result<(Host<String>, u16)> {
    let url = Url::parse(base_url)
        .map_err(|e| GatewayError::InvalidRequest(format!("invalid base_url: {}", e)))?;
    let host = url
        .host()
        .ok_or_else(|| GatewayError::InvalidRequest("base_url has no host".to_string()))?
        .to_owned();
    let port = url.port_or_known_default().unwrap_or(443);
    Ok((host, port))
}
