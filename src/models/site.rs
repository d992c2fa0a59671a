use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// A registered backend server. `hostname` is the identity key and carries
/// the scheme, e.g. `https://alpha.example`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    pub hostname: String,
    pub last_sync: Option<DateTime<Utc>>,
    pub active: bool,
    pub api_key: Option<String>,
    pub notes: Option<String>,
}

impl Site {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            last_sync: None,
            active: false,
            api_key: None,
            notes: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Connection target (scheme, host, port) for this site.
    ///
    /// Bare hostnames are taken to be https.
    pub fn address(&self) -> Option<Url> {
        parse_address(&self.hostname)
    }
}

pub(crate) fn parse_address(hostname: &str) -> Option<Url> {
    let hostname = hostname.trim();
    if hostname.is_empty() {
        return None;
    }
    let parsed = if hostname.contains("://") {
        Url::parse(hostname).ok()?
    } else {
        Url::parse(&format!("https://{}", hostname)).ok()?
    };
    parsed.host_str()?;
    Some(parsed)
}
