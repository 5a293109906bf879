//! Proxy descriptors.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::CoreError;

/// A proxy a run can route its session through.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Proxy {
    /// Stable id derived from the raw string.
    pub id: String,

    /// The string the user configured.
    pub raw: String,

    /// Proxy URL in `scheme://[user:pass@]host:port` form.
    pub url: String,
}

impl Proxy {
    /// Parse a user-supplied proxy string.
    ///
    /// Accepted forms are `ip:port`, `ip:port:user:pass` and
    /// `scheme://host:port[:user:pass]`. Returns `Ok(None)` for entries that
    /// mean "no proxy" (empty, `localhost`, `127.*`).
    pub fn parse(raw: &str) -> Result<Option<Self>, CoreError> {
        let raw = raw.trim();
        if raw.is_empty() || raw.starts_with("localhost") || raw.starts_with("127.") {
            return Ok(None);
        }

        let (scheme, rest) = match raw.split_once("://") {
            Some((scheme, rest)) => (scheme, rest),
            None => ("http", raw),
        };

        let parts: Vec<&str> = rest.split(':').collect();
        let url = match parts.as_slice() {
            [host, port] => format!("{scheme}://{host}:{}", parse_port(raw, port)?),
            [host, port, user, pass] => format!(
                "{scheme}://{user}:{pass}@{host}:{}",
                parse_port(raw, port)?
            ),
            _ => return Err(CoreError::InvalidProxy(raw.to_string())),
        };

        if parts[0].is_empty() {
            return Err(CoreError::InvalidProxy(raw.to_string()));
        }

        Ok(Some(Self {
            id: proxy_id(raw),
            raw: raw.to_string(),
            url,
        }))
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn parse_port(raw: &str, port: &str) -> Result<u16, CoreError> {
    port.parse::<u16>()
        .map_err(|_| CoreError::InvalidProxy(raw.to_string()))
}

fn proxy_id(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    hex::encode(&digest[..6])
}
