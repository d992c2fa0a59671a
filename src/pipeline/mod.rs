//! Interceptor chain wrapped around every outgoing API request.
//!
//! Middlewares run in registration order and hand the (possibly rewritten)
//! request on through [`Next`]. The end of the chain is the reqwest
//! transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Request, Response};

use crate::error::Result;

mod base_url;
mod bearer;

pub use base_url::{BaseAddressSource, BaseUrlRewrite};
pub use bearer::BearerAuth;

const TOKEN_ISSUE_SUFFIX: &str = "/token/";
const TOKEN_REFRESH_SUFFIX: &str = "/token/refresh/";
const LOGIN_SEGMENT: &str = "/login";

/// Authentication endpoints skip both base-address rewriting and credential
/// attachment, so fetching credentials never recurses into itself.
pub fn is_exempt(path: &str) -> bool {
    path.ends_with(TOKEN_ISSUE_SUFFIX)
        || path.ends_with(TOKEN_REFRESH_SUFFIX)
        || path.contains(LOGIN_SEGMENT)
}

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, request: Request, next: Next<'_>) -> Result<Response>;
}

/// Cursor over the rest of the chain. Copyable so a stage can replay a
/// request through the same downstream stages.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    transport: &'a Transport,
    rest: &'a [Arc<dyn Middleware>],
}

impl<'a> Next<'a> {
    pub async fn run(self, request: Request) -> Result<Response> {
        match self.rest.split_first() {
            Some((head, rest)) => {
                head.handle(
                    request,
                    Next {
                        transport: self.transport,
                        rest,
                    },
                )
                .await
            }
            None => self.transport.send(request).await,
        }
    }
}

const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(250);

struct Transport {
    client: Client,
    connect_retries: u32,
    retry_delay: Duration,
}

impl Transport {
    async fn send(&self, mut request: Request) -> Result<Response> {
        let mut attempt = 0;
        loop {
            let spare = if attempt < self.connect_retries {
                request.try_clone()
            } else {
                None
            };

            match self.client.execute(request).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_connect() => match spare {
                    Some(again) => {
                        attempt += 1;
                        tracing::debug!("Connection failed, retrying ({}): {}", attempt, err);
                        tokio::time::sleep(self.retry_delay).await;
                        request = again;
                    }
                    None => return Err(err.into()),
                },
                Err(err) => return Err(err.into()),
            }
        }
    }
}

pub struct Pipeline {
    transport: Transport,
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    pub fn builder(client: Client) -> PipelineBuilder {
        PipelineBuilder {
            client,
            connect_retries: 1,
            retry_delay: DEFAULT_RETRY_DELAY,
            middlewares: Vec::new(),
        }
    }

    /// Client used to build requests for [`Pipeline::execute`].
    pub fn client(&self) -> &Client {
        &self.transport.client
    }

    pub async fn execute(&self, request: Request) -> Result<Response> {
        Next {
            transport: &self.transport,
            rest: &self.middlewares,
        }
        .run(request)
        .await
    }
}

pub struct PipelineBuilder {
    client: Client,
    connect_retries: u32,
    retry_delay: Duration,
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl PipelineBuilder {
    pub fn with<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    pub fn connect_retries(mut self, retries: u32) -> Self {
        self.connect_retries = retries;
        self
    }

    /// Pause before each connection retry.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline {
            transport: Transport {
                client: self.client,
                connect_retries: self.connect_retries,
                retry_delay: self.retry_delay,
            },
            middlewares: self.middlewares,
        }
    }
}

/// HTTP client shared by the pipeline, the credential store and the
/// downloader. Redirects are followed by default.
pub fn http_client(connect_timeout: Duration, read_timeout: Duration) -> Result<Client> {
    let client = Client::builder()
        .connect_timeout(connect_timeout)
        .read_timeout(read_timeout)
        .user_agent(concat!("curtain-client/", env!("CARGO_PKG_VERSION")))
        .build()?;
    Ok(client)
}
