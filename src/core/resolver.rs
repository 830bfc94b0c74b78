//! Domain resolution for the remote allowlist
//!
//! Resolved addresses feed the compiler exactly like allowlist entries.

use crate::core::error::{Error, Result};
use async_trait::async_trait;
use hickory_resolver::TokioResolver;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::debug;

#[async_trait]
pub trait DomainResolver: Send + Sync {
    /// All A and AAAA addresses of `domain`. An empty answer is an error.
    async fn resolve(&self, domain: &str) -> Result<Vec<IpAddr>>;
}

/// Resolver using the system configuration via hickory.
#[derive(Clone)]
pub struct HickoryResolver {
    resolver: TokioResolver,
}

impl HickoryResolver {
    pub fn new() -> Self {
        // Try system config, fall back to defaults
        let resolver = TokioResolver::builder_tokio()
            .map(|b| b.build())
            .unwrap_or_else(|_| {
                TokioResolver::builder_with_config(
                    ResolverConfig::default(),
                    TokioConnectionProvider::default(),
                )
                .build()
            });

        Self { resolver }
    }
}

impl Default for HickoryResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DomainResolver for HickoryResolver {
    async fn resolve(&self, domain: &str) -> Result<Vec<IpAddr>> {
        // Trailing dot keeps search domains out of the lookup
        let fqdn = format!("{domain}.");
        let response = self
            .resolver
            .lookup_ip(fqdn.as_str())
            .await
            .map_err(|e| Error::Resolution {
                domain: domain.to_string(),
                message: e.to_string(),
            })?;

        let mut addrs: Vec<IpAddr> = response.iter().collect();
        addrs.sort();
        addrs.dedup();
        debug!("Resolved {} to {} address(es)", domain, addrs.len());

        if addrs.is_empty() {
            return Err(Error::Resolution {
                domain: domain.to_string(),
                message: "no A/AAAA records".to_string(),
            });
        }
        Ok(addrs)
    }
}

/// Fixed domain table, used by tests and `--dry-run`.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    table: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, domain: &str, addrs: &[IpAddr]) -> Self {
        self.table.insert(domain.to_string(), addrs.to_vec());
        self
    }
}

#[async_trait]
impl DomainResolver for StaticResolver {
    async fn resolve(&self, domain: &str) -> Result<Vec<IpAddr>> {
        match self.table.get(domain) {
            Some(addrs) if !addrs.is_empty() => Ok(addrs.clone()),
            _ => Err(Error::Resolution {
                domain: domain.to_string(),
                message: "NXDOMAIN".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_resolver() {
        let ip: IpAddr = "192.0.2.10".parse().unwrap();
        let resolver = StaticResolver::new().with("portal.example.com", &[ip]);

        assert_eq!(resolver.resolve("portal.example.com").await.unwrap(), vec![ip]);

        let err = resolver.resolve("missing.example.com").await.unwrap_err();
        assert!(matches!(err, Error::Resolution { ref domain, .. } if domain == "missing.example.com"));
    }
}
