//! Address resolution for status queries.
//!
//! Turns a query configuration into a concrete `(ip, port)` pair,
//! honouring protocol SRV-record conventions. IP literals skip DNS
//! entirely but must carry an explicit query port.

use std::net::IpAddr;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::proto::op::ResponseCode;
use hickory_resolver::TokioAsyncResolver;

use crate::db::{QueryKind, StatusQuery};

use super::{QueryError, DNS_TIMEOUT};

/// Build a resolver for one polling cycle.
///
/// The resolver caches answers internally, so targets sharing a hostname
/// within the cycle resolve once. A fresh resolver per cycle keeps cycles
/// independent of each other.
pub fn new_resolver() -> TokioAsyncResolver {
    let (config, mut opts) = hickory_resolver::system_conf::read_system_conf()
        .unwrap_or_else(|_| (ResolverConfig::default(), ResolverOpts::default()));
    opts.timeout = DNS_TIMEOUT;
    TokioAsyncResolver::tokio(config, opts)
}

/// The SRV lookup name and query-port offset for protocols that define a
/// service-record convention.
///
/// Arma 3 advertises its game port in SRV records while the query port
/// sits one above it, hence the +1 offset.
fn srv_convention(kind: QueryKind, host: &str) -> Option<(String, u16)> {
    let (service, offset) = match kind {
        QueryKind::Arma3 => ("_arma3._udp", 1),
        QueryKind::Fivem => ("_cfx._udp", 0),
        QueryKind::MinecraftJava => ("_minecraft._tcp", 0),
        QueryKind::Teamspeak3 => ("_ts3._udp", 0),
        _ => return None,
    };
    Some((format!("{}.{}", service, host), offset))
}

/// Resolve a query configuration to a concrete host and port.
///
/// There could be multiple DNS records; the first one always wins.
pub async fn resolve_host(
    resolver: &TokioAsyncResolver,
    query: &StatusQuery,
) -> Result<(IpAddr, u16), QueryError> {
    if let Ok(ip) = query.host.parse::<IpAddr>() {
        if query.query_port == 0 {
            return Err(QueryError::invalid(
                "IP address was provided without a query port",
            ));
        }
        return Ok((ip, query.query_port));
    }

    let mut host = query.host.clone();
    let mut query_port = query.query_port;

    let convention = srv_convention(query.kind, &host);
    if let Some((srv_name, offset)) = &convention {
        if let Some(record) = check_lookup(resolver.srv_lookup(srv_name.as_str()).await)?
            .and_then(|answer| answer.iter().next().cloned())
        {
            tracing::debug!("Resolved query #{} with SRV record", query.status_query_id);
            let (srv_host, srv_port) =
                apply_srv_record(&record.target().to_utf8(), record.port(), *offset);
            host = srv_host;
            query_port = srv_port;
        }
    }

    if query_port == 0 {
        if convention.is_some() {
            return Err(QueryError::invalid(
                "Query port not defined and no SRV DNS record found",
            ));
        }
        return Err(QueryError::invalid("Domain name provided without a query port"));
    }

    if let Some(record) = check_lookup(resolver.ipv4_lookup(host.as_str()).await)?
        .and_then(|answer| answer.iter().next().cloned())
    {
        tracing::debug!("Resolved query #{} with A record", query.status_query_id);
        return Ok((IpAddr::V4(record.0), query_port));
    }

    if let Some(record) = check_lookup(resolver.ipv6_lookup(host.as_str()).await)?
        .and_then(|answer| answer.iter().next().cloned())
    {
        tracing::debug!("Resolved query #{} with AAAA record", query.status_query_id);
        return Ok((IpAddr::V6(record.0), query_port));
    }

    Err(QueryError::invalid("DNS name does not exist"))
}

/// Apply an SRV answer: the record's target replaces the host and its
/// port, plus the protocol's offset, becomes the query port.
fn apply_srv_record(target: &str, port: u16, offset: u16) -> (String, u16) {
    (
        target.trim_end_matches('.').to_string(),
        port.saturating_add(offset),
    )
}

/// Classify a lookup result.
///
/// Missing records are not an error; the caller falls through to the
/// next lookup type. Timeouts and unreachable nameservers are transient,
/// while an oversized name can never resolve.
fn check_lookup<T>(result: Result<T, ResolveError>) -> Result<Option<T>, QueryError> {
    match result {
        Ok(answer) => Ok(Some(answer)),
        Err(e) => match e.kind() {
            ResolveErrorKind::NoRecordsFound { response_code, .. } => {
                if *response_code == ResponseCode::YXDomain {
                    Err(QueryError::invalid("DNS name is too long"))
                } else {
                    Ok(None)
                }
            }
            ResolveErrorKind::Timeout => {
                tracing::warn!("DNS lookup timed out after {:?}", DNS_TIMEOUT);
                Err(QueryError::failed("DNS lookup timed out"))
            }
            ResolveErrorKind::NoConnections => {
                tracing::warn!("DNS nameservers unavailable");
                Err(QueryError::failed("DNS nameservers unavailable"))
            }
            _ => Err(QueryError::failed(format!("DNS lookup failed: {}", e))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(kind: QueryKind, host: &str, query_port: u16) -> StatusQuery {
        StatusQuery {
            status_query_id: 1,
            status_id: 1,
            host: host.to_string(),
            game_port: 0,
            query_port,
            kind,
            priority: 0,
            enabled_at: None,
            failed_at: None,
            extra: String::new(),
        }
    }

    #[test]
    fn test_apply_srv_record() {
        // Arma 3 advertises the game port; the query port is one above.
        let (host, port) = apply_srv_record("game.example.com.", 2302, 1);
        assert_eq!(host, "game.example.com");
        assert_eq!(port, 2303);

        let (host, port) = apply_srv_record("mc.example.com.", 25565, 0);
        assert_eq!(host, "mc.example.com");
        assert_eq!(port, 25565);

        // The offset never wraps.
        assert_eq!(apply_srv_record("x.example.com.", u16::MAX, 1).1, u16::MAX);
    }

    #[test]
    fn test_srv_conventions() {
        assert_eq!(
            srv_convention(QueryKind::Arma3, "example.com"),
            Some(("_arma3._udp.example.com".to_string(), 1))
        );
        assert_eq!(
            srv_convention(QueryKind::Fivem, "example.com"),
            Some(("_cfx._udp.example.com".to_string(), 0))
        );
        assert_eq!(
            srv_convention(QueryKind::MinecraftJava, "example.com"),
            Some(("_minecraft._tcp.example.com".to_string(), 0))
        );
        assert_eq!(
            srv_convention(QueryKind::Teamspeak3, "example.com"),
            Some(("_ts3._udp.example.com".to_string(), 0))
        );
        assert_eq!(srv_convention(QueryKind::Source, "example.com"), None);
        assert_eq!(srv_convention(QueryKind::MinecraftBedrock, "example.com"), None);
    }

    #[tokio::test]
    async fn test_ip_literal_without_port_is_permanent() {
        let resolver = new_resolver();
        for host in ["198.51.100.7", "2001:db8::1"] {
            let err = resolve_host(&resolver, &query(QueryKind::Source, host, 0))
                .await
                .unwrap_err();
            assert!(matches!(err, QueryError::Invalid(_)), "{:?}", err);
        }
    }

    #[tokio::test]
    async fn test_ip_literal_with_port_skips_dns() {
        let resolver = new_resolver();
        let (ip, port) = resolve_host(&resolver, &query(QueryKind::Source, "198.51.100.7", 27015))
            .await
            .unwrap();
        assert_eq!(ip, "198.51.100.7".parse::<IpAddr>().unwrap());
        assert_eq!(port, 27015);
    }

    #[tokio::test]
    async fn test_domain_without_port_and_no_convention_is_permanent() {
        let resolver = new_resolver();
        let err = resolve_host(&resolver, &query(QueryKind::Source, "play.example.com", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Invalid(_)), "{:?}", err);
    }
}
