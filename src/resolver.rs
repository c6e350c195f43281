use std::net::IpAddr;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::error::{Error, Result};

/// On-device resolution used for the local side of the race.
pub trait LocalResolver: Send + Sync {
    /// Fails with [`Error::UnknownHost`] when the name does not resolve.
    fn resolve<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Result<Vec<IpAddr>>>;
}

/// Resolves through the operating system (`getaddrinfo`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl LocalResolver for SystemResolver {
    fn resolve<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Result<Vec<IpAddr>>> {
        async move {
            let addrs = tokio::net::lookup_host((host, 0))
                .await
                .map_err(|_| Error::UnknownHost(host.to_string()))?;
            let mut ips: Vec<IpAddr> = Vec::new();
            for addr in addrs {
                if !ips.contains(&addr.ip()) {
                    ips.push(addr.ip());
                }
            }
            if ips.is_empty() {
                return Err(Error::UnknownHost(host.to_string()));
            }
            Ok(ips)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_ip_literals_without_lookup() {
        let ips = SystemResolver.resolve("127.0.0.1").await.unwrap();
        assert_eq!(ips, vec![IpAddr::from([127, 0, 0, 1])]);
    }

    #[tokio::test]
    async fn unknown_names_map_to_unknown_host() {
        let err = SystemResolver.resolve("nonexistent.invalid").await.unwrap_err();
        assert!(matches!(err, Error::UnknownHost(host) if host == "nonexistent.invalid"));
    }
}
