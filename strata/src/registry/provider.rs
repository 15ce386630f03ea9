//! Registry selection and transport security.

use crate::errors::{StrataError, StrataResult};
use crate::registry::V1Session;
use std::net::IpAddr;
use std::sync::Arc;

/// Where and how a session talks to a registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryEndpoint {
    pub host: String,
    pub secure: bool,
    pub url: String,
}

/// Hands out registry sessions for a hostname.
///
/// Registries are contacted over https. A registry listed in
/// `insecure_registries` (by exact hostname, or by IP falling in a listed
/// CIDR range) may fall back to plain http.
#[derive(Clone, Debug)]
pub struct RegistryProvider {
    default_host: String,
    insecure_registries: Vec<String>,
}

impl RegistryProvider {
    pub fn new(default_host: impl Into<String>, insecure_registries: Vec<String>) -> Self {
        Self {
            default_host: default_host.into(),
            insecure_registries,
        }
    }

    /// `hostname`, or the default registry when it is empty.
    pub fn resolve_host<'a>(&'a self, hostname: &'a str) -> &'a str {
        if hostname.is_empty() {
            &self.default_host
        } else {
            hostname
        }
    }

    pub fn is_insecure(&self, host: &str) -> bool {
        self.insecure_registries
            .iter()
            .any(|entry| entry == host || cidr_contains(entry, host))
    }

    /// Open a session against `hostname` (or the default registry).
    pub async fn provide_registry(
        &self,
        hostname: &str,
    ) -> StrataResult<(Arc<V1Session>, RegistryEndpoint)> {
        let host = self.resolve_host(hostname).to_string();
        let secure = !self.is_insecure(&host);

        let https_url = format!("https://{host}");
        let session = V1Session::new(https_url.clone())?;
        let https_error = match session.ping().await {
            Ok(()) => {
                return Ok((
                    Arc::new(session),
                    RegistryEndpoint {
                        host,
                        secure,
                        url: https_url,
                    },
                ));
            }
            Err(e) => e,
        };

        let http_url = format!("http://{host}");
        let session = V1Session::new(http_url.clone())?;
        let http_result = session.ping().await;
        if let Err(e) = http_fallback(&host, secure, &self.insecure_registries, https_error, http_result) {
            tracing::warn!(host = %host, error = %e, "registry not reachable");
            return Err(e);
        }

        Ok((
            Arc::new(session),
            RegistryEndpoint {
                host,
                secure,
                url: http_url,
            },
        ))
    }
}

/// Decide whether an http session may be used after the https ping failed.
///
/// A registry that answers over http but is not listed as insecure is
/// reported as `InsecureRegistry`. When http fails too, a secure registry
/// reports the https failure.
fn http_fallback(
    host: &str,
    secure: bool,
    insecure_registries: &[String],
    https_error: StrataError,
    http_result: StrataResult<()>,
) -> StrataResult<()> {
    match (secure, http_result) {
        (true, Ok(())) => Err(StrataError::InsecureRegistry {
            endpoint: host.to_string(),
            insecure_registries: insecure_registries.to_vec(),
        }),
        (true, Err(_)) => Err(https_error),
        (false, result) => result,
    }
}

/// Whether `entry` is a CIDR range containing the IP in `host`.
///
/// `host` may carry a port.
fn cidr_contains(entry: &str, host: &str) -> bool {
    let Some((network, prefix)) = entry.split_once('/') else {
        return false;
    };
    let (Ok(network), Ok(prefix)) = (network.parse::<IpAddr>(), prefix.parse::<u32>()) else {
        return false;
    };
    let Some(ip) = parse_host_ip(host) else {
        return false;
    };

    match (network, ip) {
        (IpAddr::V4(net), IpAddr::V4(ip)) if prefix <= 32 => {
            let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
            u32::from(net) & mask == u32::from(ip) & mask
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) if prefix <= 128 => {
            let mask = u128::MAX.checked_shl(128 - prefix).unwrap_or(0);
            u128::from(net) & mask == u128::from(ip) & mask
        }
        _ => false,
    }
}

fn parse_host_ip(host: &str) -> Option<IpAddr> {
    if let Ok(ip) = host.parse() {
        return Some(ip);
    }
    let (addr, port) = host.rsplit_once(':')?;
    port.parse::<u16>().ok()?;
    addr.trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .ok()
}
