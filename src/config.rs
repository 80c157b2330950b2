//! Rendezvous address and session options.

use std::{fmt, net::SocketAddr};

use crate::error::{Error, Result};

/// Environment variable overriding the default rendezvous host.
pub const HOST_ENV: &str = "TELEREPL_HOST";

/// Environment variable overriding the default rendezvous port.
pub const PORT_ENV: &str = "TELEREPL_PORT";

pub const DEFAULT_HOST: &str = "127.0.0.1";

pub const DEFAULT_PORT: u16 = 9876;

/// Network address at which the host publishes its session handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RendezvousAddress {
    pub host: String,
    pub port: u16,
}

impl RendezvousAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Default address, taking `TELEREPL_HOST` and `TELEREPL_PORT` into account.
    ///
    /// An unparsable port is ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_vars(
            std::env::var(HOST_ENV).ok(),
            std::env::var(PORT_ENV).ok(),
        )
    }

    fn from_vars(host: Option<String>, port: Option<String>) -> Self {
        let host = host
            .filter(|host| !host.is_empty())
            .unwrap_or_else(|| DEFAULT_HOST.to_owned());
        let port = match port {
            Some(port) => port.parse().unwrap_or_else(|_| {
                tracing::warn!("ignoring invalid {PORT_ENV} value {port:?}");
                DEFAULT_PORT
            }),
            None => DEFAULT_PORT,
        };
        Self { host, port }
    }

    /// Resolves the host name, keeping the first address found.
    pub async fn resolve(&self) -> Result<SocketAddr> {
        async_net::resolve((self.host.as_str(), self.port))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Connection(format!("unable to resolve {self}")))
    }
}

impl Default for RendezvousAddress {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl fmt::Display for RendezvousAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl From<SocketAddr> for RendezvousAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use futures::executor::block_on;

    use super::*;

    #[test]
    fn test_defaults() {
        let addr = RendezvousAddress::from_vars(None, None);
        assert_eq!(addr, RendezvousAddress::new("127.0.0.1", 9876));
        assert_eq!(addr.to_string(), "127.0.0.1:9876");
    }

    #[test]
    fn test_overrides() {
        let addr =
            RendezvousAddress::from_vars(Some("10.0.0.7".to_owned()), Some("4000".to_owned()));
        assert_eq!(addr, RendezvousAddress::new("10.0.0.7", 4000));
    }

    #[test]
    fn test_bad_port_falls_back() {
        let addr = RendezvousAddress::from_vars(Some(String::new()), Some("nope".to_owned()));
        assert_eq!(addr, RendezvousAddress::default());
    }

    #[test]
    fn test_ipv6_display_and_resolve() {
        let addr = RendezvousAddress::new("::1", 9876);
        assert_eq!(addr.to_string(), "[::1]:9876");

        let resolved = block_on(RendezvousAddress::default().resolve()).unwrap();
        assert_eq!(resolved, "127.0.0.1:9876".parse().unwrap());
    }
}
