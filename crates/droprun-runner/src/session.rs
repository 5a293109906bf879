//! Per-run HTTP session.
//!
//! Every run owns its own session: created at task setup, rebound to a new
//! proxy on swap, dropped with the run context. Nothing here is shared
//! between runs.

use std::sync::Arc;
use std::time::Duration;

use droprun_core::Proxy;
use reqwest::cookie::Jar;
use thiserror::Error;

/// Errors building a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Cookie jar plus an HTTP client routed through the run's active proxy.
#[derive(Debug, Clone)]
pub struct Session {
    jar: Arc<Jar>,
    client: reqwest::Client,
    proxy: Option<Proxy>,
    timeout: Duration,
}

impl Session {
    /// Create a session with an empty cookie jar.
    pub fn new(proxy: Option<&Proxy>, timeout: Duration) -> Result<Self, SessionError> {
        Self::build(Arc::new(Jar::default()), proxy, timeout)
    }

    /// Build a session for a new proxy that keeps this session's cookies.
    pub fn rebind(&self, proxy: Option<&Proxy>) -> Result<Self, SessionError> {
        Self::build(Arc::clone(&self.jar), proxy, self.timeout)
    }

    fn build(jar: Arc<Jar>, proxy: Option<&Proxy>, timeout: Duration) -> Result<Self, SessionError> {
        let mut builder = reqwest::Client::builder()
            .cookie_provider(Arc::clone(&jar))
            .timeout(timeout);
        if let Some(proxy) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(&proxy.url)?);
        }

        Ok(Self {
            jar,
            client: builder.build()?,
            proxy: proxy.cloned(),
            timeout,
        })
    }

    /// HTTP client for site driver requests.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Cookie jar shared by every client this session has been rebound to.
    pub fn jar(&self) -> &Arc<Jar> {
        &self.jar
    }

    /// Proxy the client is routed through, if any.
    pub fn proxy(&self) -> Option<&Proxy> {
        self.proxy.as_ref()
    }
}
