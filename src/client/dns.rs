//! Client endpoint resolution: explicit `host:port` input or SRV lookup.
//!
//! A bare domain is resolved through `_xmpp-client._tcp.<domain>` (RFC 6120
//! §3.2.1). All candidates are returned in connection-attempt order so the
//! caller can fall through to the next one when an endpoint is unreachable.

use tracing::{info, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

/// Standard XMPP client port (RFC 6120).
pub const DEFAULT_CLIENT_PORT: u16 = 5222;

fn elapsed_ms(start: std::time::Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// A TCP endpoint to try for a client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

/// Result of parsing the server input string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedServer {
    /// Explicit endpoint, skip SRV.
    Direct(Endpoint),
    /// Domain only, perform SRV resolution.
    Domain(String),
}

/// Parse `tcp://host[:port]`, `host:port` or a bare domain.
pub fn parse_server_input(server: &str) -> ParsedServer {
    let trimmed = server.trim();

    if let Some(rest) = trimmed.strip_prefix("tcp://") {
        if let Some((host, port_str)) = rest.rsplit_once(':') {
            if let Ok(port) = port_str.parse::<u16>() {
                return ParsedServer::Direct(Endpoint {
                    host: host.to_string(),
                    port,
                });
            }
        }
        return ParsedServer::Direct(Endpoint {
            host: rest.to_string(),
            port: DEFAULT_CLIENT_PORT,
        });
    }

    // rsplit_once so IPv6 literals keep their colons
    if let Some((host, port_str)) = trimmed.rsplit_once(':') {
        if let Ok(port) = port_str.parse::<u16>() {
            return ParsedServer::Direct(Endpoint {
                host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
                port,
            });
        }
    }

    ParsedServer::Domain(trimmed.to_string())
}

/// One SRV answer, detached from the resolver's record type.
#[derive(Debug, Clone)]
pub(crate) struct SrvTarget {
    pub priority: u16,
    pub weight: u16,
    pub target: String,
    pub port: u16,
}

/// Order SRV answers per RFC 2782: priority ascending, then weight
/// descending. Targets of `.` mean "service not available" and are dropped.
pub(crate) fn order_srv_targets(mut records: Vec<SrvTarget>) -> Vec<Endpoint> {
    records.sort_by(|a, b| a.priority.cmp(&b.priority).then(b.weight.cmp(&a.weight)));
    records
        .into_iter()
        .filter_map(|r| {
            let host = r.target.trim_end_matches('.');
            if host.is_empty() {
                info!("SRV record with '.' target (service not available), skipping");
                return None;
            }
            Some(Endpoint {
                host: host.to_string(),
                port: r.port,
            })
        })
        .collect()
}

/// Resolve the client endpoints for `domain`, falling back to
/// `domain:5222` when no usable SRV record exists.
pub async fn resolve_client_endpoints(domain: &str) -> Vec<Endpoint> {
    let resolve_started = std::time::Instant::now();
    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(r) => r,
        Err(e) => {
            warn!(
                "Failed to load system DNS config: {}, falling back to default resolver",
                e
            );
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        }
    };

    let srv_name = format!("_xmpp-client._tcp.{}", domain);
    info!(domain, srv = %srv_name, "SRV lookup");
    let mut endpoints = match resolver.srv_lookup(srv_name.as_str()).await {
        Ok(lookup) => {
            let records = lookup
                .iter()
                .map(|r| SrvTarget {
                    priority: r.priority(),
                    weight: r.weight(),
                    target: r.target().to_string(),
                    port: r.port(),
                })
                .collect();
            order_srv_targets(records)
        }
        Err(e) => {
            info!(
                domain,
                srv = %srv_name,
                lookup_ms = elapsed_ms(resolve_started),
                error = %e,
                "SRV lookup failed"
            );
            Vec::new()
        }
    };

    if endpoints.is_empty() {
        warn!(
            domain,
            resolve_total_ms = elapsed_ms(resolve_started),
            "No SRV records found, using fallback: {}:{}",
            domain,
            DEFAULT_CLIENT_PORT
        );
        endpoints.push(Endpoint {
            host: domain.to_string(),
            port: DEFAULT_CLIENT_PORT,
        });
    } else {
        info!(
            domain,
            total = endpoints.len(),
            resolve_total_ms = elapsed_ms(resolve_started),
            "SRV resolution complete"
        );
    }
    endpoints
}
