//! Target resolution for the in-process clients.
//!
//! Wraps hickory-resolver: system configuration by default, an explicit
//! upstream when the measurement names one. Every candidate set is passed
//! through the safety filter; a target whose only addresses are private is
//! rejected before any traffic is sent.

use std::net::IpAddr;

use hickory_resolver::config::{
    LookupIpStrategy, NameServerConfigGroup, ResolverConfig, ResolverOpts,
};
use hickory_resolver::TokioAsyncResolver;

use common::IpVersion;

use crate::safety::is_private_ip;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("Couldn't resolve target: {0}")]
    Lookup(String),
    #[error("Couldn't resolve the custom resolver: {0}")]
    BadResolver(String),
    #[error("target resolved to private addresses only")]
    PrivateOnly,
    #[error("no address of the requested family")]
    FamilyMismatch,
}

/// Outcome of resolving one measurement target.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    /// First public address of the requested family; connect here.
    pub address: IpAddr,
    /// Every public candidate, in resolver order.
    pub all: Vec<IpAddr>,
}

/// Resolve `host` for the requested family, filter private candidates and
/// pick the connect address. `custom_resolver` is an IP or hostname of an
/// upstream to query instead of the system configuration.
pub async fn resolve_target(
    host: &str,
    version: IpVersion,
    custom_resolver: Option<&str>,
) -> Result<ResolvedTarget, ResolveError> {
    // literal IPs skip DNS entirely
    if let Ok(literal) = host.parse::<IpAddr>() {
        if !family_matches(literal, version) {
            return Err(ResolveError::FamilyMismatch);
        }
        if is_private_ip(literal) {
            return Err(ResolveError::PrivateOnly);
        }
        return Ok(ResolvedTarget {
            address: literal,
            all: vec![literal],
        });
    }

    let resolver = build_resolver(version, custom_resolver).await?;
    let lookup = resolver
        .lookup_ip(host)
        .await
        .map_err(|e| ResolveError::Lookup(e.to_string()))?;

    let candidates: Vec<IpAddr> = lookup
        .iter()
        .filter(|addr| family_matches(*addr, version))
        .collect();
    if candidates.is_empty() {
        return Err(ResolveError::FamilyMismatch);
    }

    let public: Vec<IpAddr> = candidates
        .iter()
        .copied()
        .filter(|addr| !is_private_ip(*addr))
        .collect();
    match public.first() {
        Some(&address) => Ok(ResolvedTarget {
            address,
            all: public,
        }),
        None => Err(ResolveError::PrivateOnly),
    }
}

async fn build_resolver(
    version: IpVersion,
    custom_resolver: Option<&str>,
) -> Result<TokioAsyncResolver, ResolveError> {
    let mut opts = ResolverOpts::default();
    opts.ip_strategy = match version {
        IpVersion::V4 => LookupIpStrategy::Ipv4Only,
        IpVersion::V6 => LookupIpStrategy::Ipv6Only,
    };

    match custom_resolver {
        // The system path keeps its own options; family selection happens
        // in resolve_target's candidate filter either way.
        None => TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| ResolveError::Lookup(e.to_string())),
        Some(upstream) => {
            let upstream_ip = resolve_upstream(upstream).await?;
            let group = NameServerConfigGroup::from_ips_clear(&[upstream_ip], 53, true);
            let config = ResolverConfig::from_parts(None, Vec::new(), group);
            Ok(TokioAsyncResolver::tokio(config, opts))
        }
    }
}

/// A custom resolver can itself be a hostname; resolve it with the system
/// configuration first.
async fn resolve_upstream(upstream: &str) -> Result<IpAddr, ResolveError> {
    if let Ok(ip) = upstream.parse::<IpAddr>() {
        return Ok(ip);
    }
    let system = TokioAsyncResolver::tokio_from_system_conf()
        .map_err(|e| ResolveError::BadResolver(e.to_string()))?;
    system
        .lookup_ip(upstream)
        .await
        .ok()
        .and_then(|lookup| lookup.iter().next())
        .ok_or_else(|| ResolveError::BadResolver(upstream.to_string()))
}

fn family_matches(addr: IpAddr, version: IpVersion) -> bool {
    match version {
        IpVersion::V4 => addr.is_ipv4(),
        IpVersion::V6 => addr.is_ipv6(),
    }
}

/// Infer the family a literal-IP target implies, if it is one.
pub fn literal_ip_version(target: &str) -> Option<IpVersion> {
    target.parse::<IpAddr>().ok().map(|addr| {
        if addr.is_ipv4() {
            IpVersion::V4
        } else {
            IpVersion::V6
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn literal_public_ip_resolves_to_itself() {
        let resolved = resolve_target("1.1.1.1", IpVersion::V4, None).await.unwrap();
        assert_eq!(resolved.address, "1.1.1.1".parse::<IpAddr>().unwrap());
        assert_eq!(resolved.all.len(), 1);
    }

    #[tokio::test]
    async fn literal_private_ip_is_rejected() {
        let err = resolve_target("192.168.0.1", IpVersion::V4, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::PrivateOnly));
    }

    #[tokio::test]
    async fn literal_family_mismatch_is_rejected() {
        let err = resolve_target("1.1.1.1", IpVersion::V6, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::FamilyMismatch));
    }

    #[test]
    fn literal_version_inference() {
        assert_eq!(literal_ip_version("8.8.8.8"), Some(IpVersion::V4));
        assert_eq!(literal_ip_version("2606:4700::1"), Some(IpVersion::V6));
        assert_eq!(literal_ip_version("example.com"), None);
    }
}
