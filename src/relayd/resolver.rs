//! Resolver / HostMapper plugin interfaces.
//!
//! The core only consumes these via small traits; concrete strategies
//! (DNS-over-HTTPS, split-horizon, etc.) are external collaborators. Two
//! trivial implementations are provided so the core is runnable standalone:
//! a system-resolver-backed `Resolver` and a static `HostMapper`.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;

#[derive(Debug)]
pub enum ResolveError {
    /// "Not a name" — the resolver declined to resolve this input at all.
    /// This means "leave the address alone", not an error.
    Invalid,
    Other(std::io::Error),
}

#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, network: &str, host: &str) -> Result<Vec<IpAddr>, ResolveError>;
}

#[async_trait]
pub trait HostMapper: Send + Sync {
    async fn lookup(&self, network: &str, host: &str) -> Vec<IpAddr>;
}

/// Resolves via the OS resolver (`getaddrinfo` through `tokio::net`).
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, _network: &str, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        if host.parse::<IpAddr>().is_ok() {
            return Err(ResolveError::Invalid);
        }
        match tokio::net::lookup_host((host, 0)).await {
            Ok(iter) => Ok(iter.map(|sa| sa.ip()).collect()),
            Err(err) => Err(ResolveError::Other(err)),
        }
    }
}

/// A static name -> IP table, the simplest possible HostMapper.
#[derive(Debug, Default, Clone)]
pub struct StaticHostMapper {
    table: HashMap<String, Vec<IpAddr>>,
}

impl StaticHostMapper {
    pub fn new(table: HashMap<String, Vec<IpAddr>>) -> Self {
        Self { table }
    }
}

#[async_trait]
impl HostMapper for StaticHostMapper {
    async fn lookup(&self, _network: &str, host: &str) -> Vec<IpAddr> {
        self.table.get(host).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_host_mapper_hit_and_miss() {
        let mut table = HashMap::new();
        table.insert(
            "example.com".to_string(),
            vec!["93.184.216.34".parse().unwrap()],
        );
        let mapper = StaticHostMapper::new(table);
        assert_eq!(
            mapper.lookup("ip", "example.com").await,
            vec!["93.184.216.34".parse::<IpAddr>().unwrap()]
        );
        assert!(mapper.lookup("ip", "nowhere.invalid").await.is_empty());
    }

    #[tokio::test]
    async fn system_resolver_rejects_ip_literal_as_invalid() {
        let r = SystemResolver;
        let err = r.resolve("ip", "127.0.0.1").await.unwrap_err();
        assert!(matches!(err, ResolveError::Invalid));
    }
}
