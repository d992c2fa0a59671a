use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use url::Url;

use crate::error::{AppError, Result};
use crate::models::Credentials;
use crate::pipeline::BaseAddressSource;

pub const TOKEN_ISSUE_PATH: &str = "auth/token/";
pub const TOKEN_REFRESH_PATH: &str = "auth/token/refresh/";

#[derive(Debug, Serialize)]
struct IssueRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access: String,
    refresh: Option<String>,
}

/// Holds the token pair for the active site.
///
/// Reads never wait on the network. Every replacement swaps both tokens
/// under one write lock and bumps a generation counter, which lets
/// concurrent 401 handlers share a single refresh round trip.
pub struct CredentialStore {
    http: Client,
    sites: Arc<dyn BaseAddressSource>,
    fallback: Url,
    tokens: RwLock<Option<Credentials>>,
    generation: AtomicU64,
    refresh_gate: Mutex<()>,
}

impl CredentialStore {
    pub fn new(http: Client, sites: Arc<dyn BaseAddressSource>, fallback: Url) -> Self {
        Self {
            http,
            sites,
            fallback,
            tokens: RwLock::new(None),
            generation: AtomicU64::new(0),
            refresh_gate: Mutex::new(()),
        }
    }

    pub fn access_token(&self) -> Option<String> {
        self.access_snapshot().0
    }

    /// The current access token together with the generation it belongs to.
    pub fn access_snapshot(&self) -> (Option<String>, u64) {
        let tokens = self.tokens.read().unwrap_or_else(PoisonError::into_inner);
        let generation = self.generation.load(Ordering::SeqCst);
        (tokens.as_ref().map(|c| c.access.clone()), generation)
    }

    pub fn current(&self) -> Option<Credentials> {
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn set(&self, credentials: Credentials) {
        self.replace(Some(credentials));
    }

    /// Drops both tokens, e.g. on sign-out or when the active site changes.
    pub fn clear(&self) {
        self.replace(None);
    }

    fn replace(&self, credentials: Option<Credentials>) {
        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        *tokens = credentials;
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        let base = self
            .sites
            .active_base_address()
            .unwrap_or_else(|| self.fallback.clone());
        Ok(base.join(path)?)
    }

    /// Exchanges a username and password for a fresh token pair.
    pub async fn obtain(&self, username: &str, password: &str) -> Result<()> {
        let url = self.endpoint(TOKEN_ISSUE_PATH)?;
        let response = self
            .http
            .post(url)
            .json(&IssueRequest { username, password })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AppError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: TokenResponse = response.json().await?;
        match body.refresh {
            Some(refresh) if !body.access.is_empty() => {
                self.set(Credentials::new(body.access, refresh));
                tracing::info!("Signed in");
                Ok(())
            }
            _ => Err(AppError::Api {
                status: status.as_u16(),
                message: "token response is missing access or refresh token".to_string(),
            }),
        }
    }

    /// Unconditionally exchanges the refresh token for a new pair.
    ///
    /// Returns `false` and leaves the stored tokens untouched on any failure.
    pub async fn refresh(&self) -> bool {
        let _gate = self.refresh_gate.lock().await;
        self.exchange_refresh().await
    }

    /// Refreshes unless the tokens were already replaced after `observed`,
    /// in which case the newer tokens are reused without a round trip.
    pub async fn refresh_after(&self, observed: u64) -> bool {
        let _gate = self.refresh_gate.lock().await;
        if self.generation() != observed {
            tracing::debug!("Credentials already replaced by a concurrent refresh");
            return self.access_token().is_some();
        }
        self.exchange_refresh().await
    }

    async fn exchange_refresh(&self) -> bool {
        let Some(current) = self.current() else {
            tracing::debug!("No refresh token to exchange");
            return false;
        };

        match self.request_refresh(&current.refresh).await {
            Ok(fresh) => {
                self.set(fresh);
                tracing::debug!("Credentials refreshed");
                true
            }
            Err(e) => {
                tracing::warn!("Token refresh failed: {}", e);
                false
            }
        }
    }

    async fn request_refresh(&self, refresh: &str) -> Result<Credentials> {
        let url = self.endpoint(TOKEN_REFRESH_PATH)?;
        let response = self
            .http
            .post(url)
            .json(&RefreshRequest { refresh })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AppError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: TokenResponse = response.json().await?;
        if body.access.is_empty() {
            return Err(AppError::Api {
                status: status.as_u16(),
                message: "empty access token".to_string(),
            });
        }
        // Servers without rotation only send a new access token.
        let refresh = body.refresh.unwrap_or_else(|| refresh.to_string());
        Ok(Credentials::new(body.access, refresh))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoSite;

    impl BaseAddressSource for NoSite {
        fn active_base_address(&self) -> Option<Url> {
            None
        }
    }

    fn store() -> CredentialStore {
        CredentialStore::new(
            Client::new(),
            Arc::new(NoSite),
            Url::parse("http://127.0.0.1:9/").unwrap(),
        )
    }

    #[test]
    fn replacing_tokens_bumps_generation() {
        let store = store();
        assert_eq!(store.access_snapshot(), (None, 0));

        store.set(Credentials::new("a1", "r1"));
        assert_eq!(store.access_snapshot(), (Some("a1".to_string()), 1));

        store.clear();
        assert_eq!(store.access_snapshot(), (None, 2));
    }

    #[tokio::test]
    async fn refresh_without_tokens_fails_fast() {
        let store = store();
        assert!(!store.refresh().await);
        assert_eq!(store.generation(), 0);
    }

    #[tokio::test]
    async fn stale_generation_reuses_newer_tokens() {
        let store = store();
        store.set(Credentials::new("a1", "r1"));
        let (_, seen) = store.access_snapshot();
        store.set(Credentials::new("a2", "r2"));

        // No network involved: the port above is closed.
        assert!(store.refresh_after(seen).await);
        assert_eq!(store.access_token().as_deref(), Some("a2"));
    }
}
