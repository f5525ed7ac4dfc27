//! Caller identity: request metadata and the strategies that turn it into
//! rate limit keys.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use crate::config::KeyStrategyConfig;

/// The request attributes a key can be derived from.
///
/// Header names are case-insensitive. A header may repeat; lookups return
/// its first value.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    remote_addr: Option<IpAddr>,
    headers: HashMap<String, Vec<String>>,
}

impl RequestMeta {
    /// Create empty request metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the peer address of the connection.
    pub fn with_remote_addr(mut self, addr: IpAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Add a header. A repeated header keeps every value in arrival order.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.insert_header(name, value);
        self
    }

    /// Add a header in place. See [`RequestMeta::with_header`].
    pub fn insert_header(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.headers
            .entry(name.as_ref().to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    /// Peer address of the connection.
    pub fn remote_addr(&self) -> Option<IpAddr> {
        self.remote_addr
    }

    /// Look up the first value of a header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.header_values(name).next()
    }

    /// Every value of a header, in the order they were added.
    pub fn header_values(&self, name: &str) -> impl Iterator<Item = &str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// The `User-Agent` header.
    pub fn user_agent(&self) -> Option<&str> {
        self.header("user-agent")
    }

    /// Best-effort client address.
    ///
    /// Prefers the first hop of `X-Forwarded-For`, then `X-Real-IP`, then
    /// the connection's peer address.
    pub fn client_ip(&self) -> Option<String> {
        let forwarded = self
            .header("x-forwarded-for")
            .and_then(|xff| xff.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty());
        if let Some(ip) = forwarded {
            return Some(ip.to_string());
        }

        let real_ip = self
            .header("x-real-ip")
            .map(str::trim)
            .filter(|ip| !ip.is_empty());
        if let Some(ip) = real_ip {
            return Some(ip.to_string());
        }

        self.remote_addr.map(|addr| addr.to_string())
    }
}

/// Caller-supplied key function.
pub type KeyFn = Arc<dyn Fn(&RequestMeta) -> String + Send + Sync>;

/// Strategy for deriving a rate limit key from a request.
///
/// Keys are SHA-256 digests of the contributing signals, hex encoded, so
/// raw addresses and header values never end up in the cache. When every
/// signal is empty the key is the empty string, which limiters treat as
/// "do not limit".
#[derive(Clone)]
pub enum KeyDeriver {
    /// Client address
    Ip,
    /// `User-Agent` header
    UserAgent,
    /// Client address and `User-Agent` header
    IpAndUserAgent,
    /// Values of the named headers, in order. Only the first value of a
    /// repeated header counts.
    Headers(Vec<String>),
    /// Arbitrary function of the request
    Custom(KeyFn),
}

impl KeyDeriver {
    /// Key on the values of the given headers.
    pub fn headers<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        KeyDeriver::Headers(names.into_iter().map(Into::into).collect())
    }

    /// Key on the result of `f`. The returned string is digested like any
    /// other signal; returning an empty string bypasses the limiter.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&RequestMeta) -> String + Send + Sync + 'static,
    {
        KeyDeriver::Custom(Arc::new(f))
    }

    /// Derive the key for `meta`.
    pub fn derive(&self, meta: &RequestMeta) -> String {
        match self {
            KeyDeriver::Ip => {
                let ip = meta.client_ip().unwrap_or_default();
                digest(&[ip.as_str()])
            }
            KeyDeriver::UserAgent => digest(&[meta.user_agent().unwrap_or_default()]),
            KeyDeriver::IpAndUserAgent => {
                let ip = meta.client_ip().unwrap_or_default();
                digest(&[ip.as_str(), meta.user_agent().unwrap_or_default()])
            }
            KeyDeriver::Headers(names) => {
                let values: Vec<&str> = names
                    .iter()
                    .map(|name| meta.header(name).unwrap_or_default())
                    .collect();
                digest(&values)
            }
            KeyDeriver::Custom(f) => {
                let raw = f(meta);
                digest(&[raw.as_str()])
            }
        }
    }
}

impl fmt::Debug for KeyDeriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyDeriver::Ip => f.write_str("Ip"),
            KeyDeriver::UserAgent => f.write_str("UserAgent"),
            KeyDeriver::IpAndUserAgent => f.write_str("IpAndUserAgent"),
            KeyDeriver::Headers(names) => f.debug_tuple("Headers").field(names).finish(),
            KeyDeriver::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl From<&KeyStrategyConfig> for KeyDeriver {
    fn from(config: &KeyStrategyConfig) -> Self {
        match config {
            KeyStrategyConfig::Ip => KeyDeriver::Ip,
            KeyStrategyConfig::UserAgent => KeyDeriver::UserAgent,
            KeyStrategyConfig::IpAndUserAgent => KeyDeriver::IpAndUserAgent,
            KeyStrategyConfig::Headers { names } => KeyDeriver::Headers(names.clone()),
        }
    }
}

/// Hex SHA-256 over length-prefixed signals, or `""` if all are empty.
///
/// The length prefix keeps `["ab", "c"]` and `["a", "bc"]` apart.
fn digest(signals: &[&str]) -> String {
    if signals.iter().all(|s| s.is_empty()) {
        return String::new();
    }

    let mut hasher = Sha256::new();
    for signal in signals {
        hasher.update((signal.len() as u64).to_le_bytes());
        hasher.update(signal.as_bytes());
    }
    hex::encode(hasher.finalize())
}
