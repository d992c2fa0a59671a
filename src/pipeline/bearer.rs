use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Request, Response, StatusCode};

use super::{is_exempt, Middleware, Next};
use crate::auth::CredentialStore;
use crate::error::Result;

/// Stage B: attaches the bearer token and, on a 401, refreshes the
/// credentials and replays the request exactly once.
pub struct BearerAuth {
    credentials: Arc<CredentialStore>,
}

impl BearerAuth {
    pub fn new(credentials: Arc<CredentialStore>) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl Middleware for BearerAuth {
    async fn handle(&self, request: Request, next: Next<'_>) -> Result<Response> {
        if is_exempt(request.url().path()) {
            return next.run(request).await;
        }

        let replay = request.try_clone();
        let (token, generation) = self.credentials.access_snapshot();
        let response = next.run(authorize(request, token)).await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(replay) = replay else {
            // No retry is possible, but later requests still get fresh tokens.
            let refreshed = self.credentials.refresh_after(generation).await;
            tracing::debug!(
                "Got 401 for a request whose body cannot be replayed (refreshed: {})",
                refreshed
            );
            return Ok(response);
        };

        // The 401 is held back until we know whether a retry will replace it.
        if !self.credentials.refresh_after(generation).await {
            tracing::warn!("Credential refresh failed; returning 401 for {}", replay.url());
            return Ok(response);
        }
        drop(response);

        let (token, _) = self.credentials.access_snapshot();
        tracing::debug!("Retrying {} with refreshed credentials", replay.url());
        next.run(authorize(replay, token)).await
    }
}

fn authorize(mut request: Request, token: Option<String>) -> Request {
    if let Some(token) = token {
        match HeaderValue::from_str(&format!("Bearer {}", token)) {
            Ok(mut value) => {
                value.set_sensitive(true);
                request.headers_mut().insert(AUTHORIZATION, value);
            }
            Err(_) => tracing::warn!("Access token is not a valid header value; sending without it"),
        }
    }
    request
}
