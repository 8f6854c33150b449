//! Turning server specifiers into transport targets.
//!
//! A specifier is either `[scheme://]host[:port][/path][?query]` or a `sdns://` DNS stamp. The
//! result is a [`Target`] whose address always carries an explicit port.

use std::fmt::{self, Display};

use resolv_conf::ScopedIp;
use sonde_stamp::{Protocol, ServerStamp, STAMP_PREFIX};

use crate::config::Options;
use crate::error::{Error, IoContext, Result};

/// Path queried on DoH servers when the specifier carries none.
pub const DEFAULT_DOH_PATH: &str = "/dns-query";

/// Where the system's nameservers are configured.
pub const RESOLV_CONF: &str = "/etc/resolv.conf";

/// The wire protocol used to reach a server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// UDP, falling back to TCP for truncated replies.
    Plain,
    Tcp,
    Tls,
    Http,
    Quic,
    DnsCrypt,
}

impl TransportKind {
    fn from_scheme(scheme: &str) -> Option<Self> {
        Some(match scheme {
            "plain" | "udp" => TransportKind::Plain,
            "tcp" => TransportKind::Tcp,
            "tls" | "dot" => TransportKind::Tls,
            "https" | "http" => TransportKind::Http,
            "quic" | "doq" => TransportKind::Quic,
            "dnscrypt" => TransportKind::DnsCrypt,
            _ => return None,
        })
    }

    /// The port used when the specifier names none.
    pub fn default_port(&self, scheme: &str) -> u16 {
        match self {
            TransportKind::Plain | TransportKind::Tcp => 53,
            TransportKind::Tls | TransportKind::Quic => 853,
            TransportKind::Http if scheme == "http" => 80,
            TransportKind::Http | TransportKind::DnsCrypt => 443,
        }
    }
}

impl Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Plain => "plain",
            TransportKind::Tcp => "tcp",
            TransportKind::Tls => "tls",
            TransportKind::Http => "https",
            TransportKind::Quic => "quic",
            TransportKind::DnsCrypt => "dnscrypt",
        };
        write!(f, "{}", name)
    }
}

/// A resolved server: how to reach it and where.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub kind: TransportKind,
    /// The literal scheme (`http` and `https` both map to [`TransportKind::Http`]).
    pub scheme: String,
    /// `host:port` for most transports, a full URI for HTTP, the raw stamp for stamp-configured
    /// DNSCrypt servers.
    pub address: String,
    pub alpn: Vec<String>,
    /// IPv6 zone, already included in `address`.
    pub scope_id: Option<String>,
    /// Name to use for SNI and certificate verification, if it differs from the host.
    pub server_name: Option<String>,
}

impl Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TransportKind::Http => write!(f, "{}", self.address),
            TransportKind::DnsCrypt if self.address.starts_with(STAMP_PREFIX) => {
                write!(f, "{}", self.address)
            }
            _ => write!(f, "{}://{}", self.scheme, self.address),
        }
    }
}

/// The pieces of an authority component.
#[derive(Debug, PartialEq, Eq)]
struct Authority {
    /// Bracketed for IPv6 literals, without the zone.
    host: String,
    port: Option<u16>,
    scope_id: Option<String>,
}

impl Authority {
    /// The host with the zone put back in front of the closing bracket.
    fn host_with_scope(&self) -> String {
        match &self.scope_id {
            Some(zone) => format!("{}%{}]", self.host.trim_end_matches(']'), zone),
            None => self.host.clone(),
        }
    }
}

fn split_zone(ip: &str) -> (&str, Option<String>) {
    match ip.split_once('%') {
        Some((ip, zone)) => (ip, Some(zone.to_string())),
        None => (ip, None),
    }
}

fn parse_port(port: &str, spec: &str) -> Result<u16> {
    port.parse()
        .map_err(|_| Error::spec(spec, format!("invalid port {:?}", port)))
}

/// Splits an authority into host, port and IPv6 zone.
fn split_authority(auth: &str, spec: &str) -> Result<Authority> {
    let open = auth.find('[');
    let close = auth.find(']');
    match (open, close) {
        (Some(open), Some(close)) if open < close => {
            let (ip, scope_id) = split_zone(&auth[open + 1..close]);
            let port = match &auth[close + 1..] {
                "" => None,
                rest => match rest.strip_prefix(':') {
                    Some(port) => Some(parse_port(port, spec)?),
                    None => return Err(Error::spec(spec, "unexpected text after ']'")),
                },
            };
            tracing::trace!("host contains ], treating as v6 with port. host: {} port: {:?}", ip, port);
            Ok(Authority {
                host: format!("[{}]", ip),
                port,
                scope_id,
            })
        }
        (None, None) => match auth.matches(':').count() {
            0 => Ok(Authority {
                host: auth.to_string(),
                port: None,
                scope_id: None,
            }),
            1 => {
                let (host, port) = auth.split_once(':').unwrap_or((auth, ""));
                tracing::trace!("treating as (v4 or host) with explicit port. host {} port {}", host, port);
                Ok(Authority {
                    host: host.to_string(),
                    port: Some(parse_port(port, spec)?),
                    scope_id: None,
                })
            }
            _ => {
                let (ip, scope_id) = split_zone(auth);
                tracing::trace!("host contains :, treating as v6 without port. host {}", ip);
                Ok(Authority {
                    host: format!("[{}]", ip),
                    port: None,
                    scope_id,
                })
            }
        },
        _ => Err(Error::spec(spec, "invalid IPv6 bracket notation")),
    }
}

/// Splits a `host:port` address as produced by [`Target::resolve`] into an unbracketed host
/// (zone included) and a port.
///
/// # Examples
/// ```rust
/// use sonde::target::split_host_port;
///
/// assert_eq!(split_host_port("[fe80::1%en0]:53"), Some(("fe80::1%en0", 53)));
/// assert_eq!(split_host_port("dns.quad9.net:853"), Some(("dns.quad9.net", 853)));
/// assert_eq!(split_host_port("dns.quad9.net"), None);
/// ```
pub fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    if host.starts_with('[') != host.ends_with(']') {
        return None;
    }
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Some((host, port.parse().ok()?))
}

/// Removes a trailing `:port` from a hostname, leaving IPv6 literals alone.
fn strip_port(host: &str) -> &str {
    match (host.rfind(':'), host.rfind(']')) {
        (Some(colon), Some(bracket)) if colon > bracket => &host[..colon],
        (Some(colon), None) if host.matches(':').count() == 1 => &host[..colon],
        _ => host,
    }
}

impl Target {
    /// Resolves a server specifier.
    ///
    /// Fails without touching the network if the specifier is malformed, names an unknown scheme
    /// or an unsupported stamp protocol, or conflicts with the ODoH settings in `opts`.
    ///
    /// An empty specifier names the first nameserver configured in [`RESOLV_CONF`].
    pub fn resolve(spec: &str, opts: &Options) -> Result<Target> {
        if spec.trim().is_empty() {
            let conf = std::fs::read(RESOLV_CONF).context(format!("reading {}", RESOLV_CONF))?;
            let system = first_nameserver(&conf)?;
            tracing::debug!("no server given, using {} from {}", system, RESOLV_CONF);
            return Target::resolve(&system, opts);
        }
        if spec.starts_with(STAMP_PREFIX) {
            return Target::from_stamp(spec, opts);
        }

        let (scheme, rest) = match spec.split_once("://") {
            Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
            None => ("plain".to_string(), spec),
        };
        let kind = TransportKind::from_scheme(&scheme)
            .ok_or_else(|| Error::spec(spec, format!("unknown scheme {:?}", scheme)))?;

        // host and port live in the authority only; a path may contain anything
        let split_at = rest.find(|c: char| c == '/' || c == '?').unwrap_or(rest.len());
        let (authority, tail) = rest.split_at(split_at);
        if authority.is_empty() {
            return Err(Error::spec(spec, "missing host"));
        }
        let authority = split_authority(authority, spec)?;
        let port = authority
            .port
            .unwrap_or_else(|| kind.default_port(&scheme));
        tracing::debug!(
            "using scheme: {} host: {} port: {}",
            scheme,
            authority.host,
            port
        );

        if let Some(proxy) = &opts.odoh_proxy {
            if !proxy.starts_with("https://") {
                return Err(Error::config("ODoH proxy must use HTTPS"));
            }
            if scheme != "https" {
                return Err(Error::config("ODoH target must use HTTPS"));
            }
        }

        let host = authority.host_with_scope();
        let address = match kind {
            TransportKind::Http => {
                let tail = if tail.is_empty() || tail.starts_with('?') {
                    format!("{}{}", DEFAULT_DOH_PATH, tail)
                } else {
                    tail.to_string()
                };
                format!("{}://{}:{}{}", scheme, host, port, tail)
            }
            _ => {
                if !tail.is_empty() {
                    tracing::debug!("ignoring path {:?} for {} server", tail, kind);
                }
                format!("{}:{}", host, port)
            }
        };

        let alpn = match kind {
            TransportKind::Quic => opts.quic_alpn.clone(),
            _ => opts.tls.next_protos.clone(),
        };

        Ok(Target {
            kind,
            scheme,
            address,
            alpn,
            scope_id: authority.scope_id,
            server_name: opts.tls.server_name.clone(),
        })
    }

    fn from_stamp(spec: &str, opts: &Options) -> Result<Target> {
        let stamp = ServerStamp::parse(spec)?;
        tracing::debug!("decoded {} stamp", stamp.protocol);

        match stamp.protocol {
            Protocol::Plain => Target::resolve(&format!("plain://{}", stamp.server_addr), opts),
            Protocol::Tls | Protocol::DoQ => {
                let scheme = if stamp.protocol == Protocol::Tls {
                    "tls"
                } else {
                    "quic"
                };
                let addr = if stamp.server_addr.is_empty() {
                    &stamp.provider_name
                } else {
                    &stamp.server_addr
                };
                let mut target = Target::resolve(&format!("{}://{}", scheme, addr), opts)?;
                if target.server_name.is_none() && !stamp.provider_name.is_empty() {
                    target.server_name = Some(strip_port(&stamp.provider_name).to_string());
                }
                Ok(target)
            }
            Protocol::DoH => Target::resolve(
                &format!("https://{}{}", stamp.provider_name, stamp.path),
                opts,
            ),
            // the DNSCrypt transport decodes the stamp itself
            Protocol::DnsCrypt => Ok(Target {
                kind: TransportKind::DnsCrypt,
                scheme: "dnscrypt".to_string(),
                address: spec.to_string(),
                alpn: Vec::new(),
                scope_id: None,
                server_name: None,
            }),
            other => Err(Error::spec(
                spec,
                format!("unsupported stamp protocol {}", other),
            )),
        }
    }

    /// The host (unbracketed, zone included) and port of a non-HTTP target.
    pub fn host_port(&self) -> Result<(&str, u16)> {
        split_host_port(&self.address)
            .ok_or_else(|| Error::spec(&self.address, "expected host:port"))
    }

    /// The name presented via SNI and checked against the server certificate.
    pub fn tls_name(&self) -> Result<String> {
        if let Some(name) = &self.server_name {
            return Ok(name.clone());
        }
        match self.kind {
            TransportKind::Http => {
                let url = url::Url::parse(&self.address)
                    .map_err(|e| Error::spec(&self.address, e.to_string()))?;
                let host = url
                    .host_str()
                    .ok_or_else(|| Error::spec(&self.address, "missing host"))?;
                Ok(host.trim_start_matches('[').trim_end_matches(']').to_string())
            }
            _ => Ok(self.host_port()?.0.to_string()),
        }
    }
}

/// The first `nameserver` entry of a resolv.conf file, as a plain specifier.
fn first_nameserver(conf: &[u8]) -> Result<String> {
    let conf = resolv_conf::Config::parse(conf)
        .map_err(|e| Error::config(format!("could not parse {}: {}", RESOLV_CONF, e)))?;
    match conf.nameservers.first() {
        Some(ScopedIp::V4(ip)) => Ok(ip.to_string()),
        Some(ScopedIp::V6(ip, Some(scope))) => Ok(format!("{}%{}", ip, scope)),
        Some(ScopedIp::V6(ip, None)) => Ok(ip.to_string()),
        None => Err(Error::config(format!("no nameserver in {}", RESOLV_CONF))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(spec: &str) -> Target {
        Target::resolve(spec, &Options::default()).unwrap()
    }

    fn check(spec: &str, kind: TransportKind, address: &str) {
        let target = resolve(spec);
        assert_eq!(target.kind, kind, "{}", spec);
        assert_eq!(target.address, address, "{}", spec);
    }

    #[test]
    fn plain_targets() {
        check("1.1.1.1", TransportKind::Plain, "1.1.1.1:53");
        check("1.1.1.1:5353", TransportKind::Plain, "1.1.1.1:5353");
        check("2a09::", TransportKind::Plain, "[2a09::]:53");
        check("[2a09::]:5353", TransportKind::Plain, "[2a09::]:5353");
        check(
            "2001:db8:11:8340:dea6:32ff:fe5b:a19e",
            TransportKind::Plain,
            "[2001:db8:11:8340:dea6:32ff:fe5b:a19e]:53",
        );
        check("tcp://dns.quad9.net", TransportKind::Tcp, "dns.quad9.net:53");
        assert_eq!(resolve("1.1.1.1").to_string(), "plain://1.1.1.1:53");
    }

    #[test]
    fn scoped_ipv6() {
        let target = resolve("fe80::1%en0");
        assert_eq!(target.kind, TransportKind::Plain);
        assert_eq!(target.address, "[fe80::1%en0]:53");
        assert_eq!(target.scope_id.as_deref(), Some("en0"));
        assert_eq!(target.host_port().unwrap(), ("fe80::1%en0", 53));

        check("plain://[fe80::1%en0]:53", TransportKind::Plain, "[fe80::1%en0]:53");
    }

    #[test]
    fn encrypted_targets() {
        check("tls://dns.quad9.net", TransportKind::Tls, "dns.quad9.net:853");
        check("tls://dns.quad9.net:8530", TransportKind::Tls, "dns.quad9.net:8530");
        check("quic://dns.adguard.com", TransportKind::Quic, "dns.adguard.com:853");
        check("quic://dns.adguard.com:8530", TransportKind::Quic, "dns.adguard.com:8530");
        assert_eq!(resolve("quic://dns.adguard.com").alpn, vec!["doq", "doq-i11"]);
    }

    #[test]
    fn https_targets() {
        check(
            "https://dns.quad9.net",
            TransportKind::Http,
            "https://dns.quad9.net:443/dns-query",
        );
        check(
            "https://dns.quad9.net/custom-path",
            TransportKind::Http,
            "https://dns.quad9.net:443/custom-path",
        );
        check("https://1.1.1.1", TransportKind::Http, "https://1.1.1.1:443/dns-query");
        check("https://2a09::", TransportKind::Http, "https://[2a09::]:443/dns-query");
        check("http://127.0.0.1", TransportKind::Http, "http://127.0.0.1:80/dns-query");
        check(
            "https://localhost/1%3A89%3D%3D%3A64fx",
            TransportKind::Http,
            "https://localhost:443/1%3A89%3D%3D%3A64fx",
        );
        check(
            "https://localhost/1:89==:64fx",
            TransportKind::Http,
            "https://localhost:443/1:89==:64fx",
        );
        check(
            "https://dns.example:8443?ct",
            TransportKind::Http,
            "https://dns.example:8443/dns-query?ct",
        );
        assert_eq!(resolve("https://[2a09::]").tls_name().unwrap(), "2a09::");
    }

    #[test]
    fn stamps() {
        let target = resolve("sdns://AgcAAAAAAAAAAAAHOS45LjkuOQA");
        assert_eq!(target.kind, TransportKind::Http);
        assert_eq!(target.address, "https://9.9.9.9:443/dns-query");

        let mut dot = ServerStamp::parse("sdns://AgcAAAAAAAAAAAAHOS45LjkuOQA").unwrap();
        dot.protocol = Protocol::Tls;
        dot.server_addr = "9.9.9.9".into();
        dot.provider_name = "dns.quad9.net".into();
        let target = resolve(&dot.to_string());
        assert_eq!(target.kind, TransportKind::Tls);
        assert_eq!(target.address, "9.9.9.9:853");
        assert_eq!(target.tls_name().unwrap(), "dns.quad9.net");

        let key = "D12E:6A93:1FB5:2DC1:BC49:13E2:BE54:7CAC:5C77:0F69:9D9E:C3BE:4AB5:8C47:9848:3C2B";
        let dnscrypt = ServerStamp::from_legacy_dnscrypt("127.0.0.1", key, "2.dnscrypt-cert.example")
            .unwrap()
            .to_string();
        let target = resolve(&dnscrypt);
        assert_eq!(target.kind, TransportKind::DnsCrypt);
        assert_eq!(target.address, dnscrypt);

        let mut relay = dot;
        relay.protocol = Protocol::ODoHRelay;
        assert!(matches!(
            Target::resolve(&relay.to_string(), &Options::default()),
            Err(Error::InvalidSpecifier { .. })
        ));
    }

    #[test]
    fn idempotent() {
        for spec in ["1.1.1.1", "https://dns.quad9.net", "fe80::1%en0", "tls://[::1]:853"] {
            assert_eq!(resolve(spec), resolve(spec));
        }
    }

    #[test]
    fn invalid_specifiers() {
        let opts = Options::default();
        for spec in ["[2a09::", "2a09::]", "ftp://example.com", "1.1.1.1:http", "[::1]x"] {
            assert!(Target::resolve(spec, &opts).is_err(), "{}", spec);
        }

        let odoh = Options {
            odoh_proxy: Some("https://odoh-proxy.example".into()),
            ..Options::default()
        };
        assert!(Target::resolve("https://odoh-target.example", &odoh).is_ok());
        assert!(matches!(
            Target::resolve("tls://odoh-target.example", &odoh),
            Err(Error::Config(_))
        ));
        let insecure_proxy = Options {
            odoh_proxy: Some("http://odoh-proxy.example".into()),
            ..Options::default()
        };
        assert!(matches!(
            Target::resolve("https://odoh-target.example", &insecure_proxy),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn system_nameserver() {
        let conf = b"# generated\nsearch example.net\nnameserver 192.0.2.53\nnameserver 192.0.2.54\n";
        let first = first_nameserver(conf).unwrap();
        assert_eq!(first, "192.0.2.53");
        check(&first, TransportKind::Plain, "192.0.2.53:53");

        let scoped = first_nameserver(b"nameserver fe80::1%eth0\n").unwrap();
        check(&scoped, TransportKind::Plain, "[fe80::1%eth0]:53");

        assert!(matches!(first_nameserver(b"search example.net\n"), Err(Error::Config(_))));
    }

    #[test]
    fn empty_specifier_uses_system_nameserver() {
        let conf = match std::fs::read(RESOLV_CONF) {
            Ok(conf) => conf,
            // nothing to fall back to on this host
            Err(_) => return,
        };
        match first_nameserver(&conf) {
            Ok(system) => {
                let target = resolve("");
                assert_eq!(target.kind, TransportKind::Plain);
                assert_eq!(target, resolve(&system));
            }
            Err(_) => assert!(Target::resolve("", &Options::default()).is_err()),
        }
    }
}
