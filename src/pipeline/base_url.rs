use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Request, Response};
use url::Url;

use super::{is_exempt, Middleware, Next};
use crate::error::Result;

/// Anything that can say which backend requests should go to right now.
pub trait BaseAddressSource: Send + Sync {
    fn active_base_address(&self) -> Option<Url>;
}

/// Stage A: points the request at the active site, keeping path and query.
pub struct BaseUrlRewrite {
    source: Arc<dyn BaseAddressSource>,
}

impl BaseUrlRewrite {
    pub fn new(source: Arc<dyn BaseAddressSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl Middleware for BaseUrlRewrite {
    async fn handle(&self, mut request: Request, next: Next<'_>) -> Result<Response> {
        if is_exempt(request.url().path()) {
            return next.run(request).await;
        }

        // No active site: the caller's default address stands.
        if let Some(base) = self.source.active_base_address() {
            rewrite_origin(request.url_mut(), &base);
            tracing::debug!("Routing request to {}", request.url());
        }

        next.run(request).await
    }
}

/// Replaces scheme, host and port of `url` with those of `base`.
pub(crate) fn rewrite_origin(url: &mut Url, base: &Url) {
    if url.scheme() != base.scheme() && url.set_scheme(base.scheme()).is_err() {
        tracing::warn!("Cannot switch {} to scheme {}", url, base.scheme());
        return;
    }
    if let Err(err) = url.set_host(base.host_str()) {
        tracing::warn!("Cannot rewrite host of {}: {}", url, err);
        return;
    }
    if url.set_port(base.port()).is_err() {
        tracing::warn!("Cannot rewrite port of {}", url);
    }
}
