//! Exit-identity probe.

use std::time::Duration;

use async_trait::async_trait;
use select::document::Document;
use select::predicate::Name;
use tracing::debug;

use super::Identity;
use crate::config::ThrottleConfig;
use crate::error::ProbeError;

/// Reports the identity the outside world currently sees.
#[async_trait]
pub trait IdentityProbe: Send + Sync + std::fmt::Debug {
    async fn current_identity(&self) -> Result<Identity, ProbeError>;
}

/// Probe that fetches an identity-check page through the forwarding proxy.
#[derive(Debug, Clone)]
pub struct HttpIdentityProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpIdentityProbe {
    pub fn new(
        url: impl Into<String>,
        proxy: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, ProbeError> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        builder = match proxy {
            Some(proxy) => builder.proxy(reqwest::Proxy::all(proxy)?),
            None => builder.no_proxy(),
        };
        Ok(Self { client: builder.build()?, url: url.into() })
    }

    /// Probe using `cfg.probe` and `cfg.proxy`.
    pub fn from_config(cfg: &ThrottleConfig) -> Result<Self, ProbeError> {
        Self::new(cfg.probe.url.clone(), cfg.proxy.as_deref(), cfg.probe.timeout)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl IdentityProbe for HttpIdentityProbe {
    async fn current_identity(&self) -> Result<Identity, ProbeError> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(ProbeError::Status(status));
        }
        let body = response.text().await?;
        extract_identity(&body).ok_or_else(|| {
            debug!(target: "crawlguard::identity", url = %self.url, "no identity in probe body");
            ProbeError::MissingIdentity
        })
    }
}

/// Text of the first `<strong>` element, trimmed. Empty text counts as missing.
pub fn extract_identity(html: &str) -> Option<Identity> {
    let document = Document::from(html);
    let text = document.find(Name("strong")).next()?.text();
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(Identity::new(text))
    }
}
