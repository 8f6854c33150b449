//! The immutable option set every component of the engine reads from.
//!
//! An [`Options`] value is built once per invocation (typically by a command line front end) and
//! then passed by reference. Its [`Default`] matches the defaults of a freshly started client.

use std::path::PathBuf;
use std::time::Duration;

use toluol_proto::Class;

/// Header flags to set in outgoing queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueryFlags {
    /// Authoritative Answer
    pub aa: bool,
    /// Authentic Data
    pub ad: bool,
    /// Checking Disabled
    pub cd: bool,
    /// Recursion Desired
    pub rd: bool,
    /// Recursion Available
    pub ra: bool,
    /// The reserved Z bit
    pub z: bool,
    /// Truncated
    pub tc: bool,
}

impl Default for QueryFlags {
    fn default() -> Self {
        QueryFlags {
            aa: false,
            ad: false,
            cd: false,
            rd: true,
            ra: false,
            z: false,
            tc: false,
        }
    }
}

impl QueryFlags {
    /// Returns the flags as the second 16-bit word of a DNS header (QR, opcode and rcode zero).
    pub fn as_bits(&self) -> u16 {
        let mut bits = 0;
        if self.aa {
            bits |= 1 << 10;
        }
        if self.tc {
            bits |= 1 << 9;
        }
        if self.rd {
            bits |= 1 << 8;
        }
        if self.ra {
            bits |= 1 << 7;
        }
        if self.z {
            bits |= 1 << 6;
        }
        if self.ad {
            bits |= 1 << 5;
        }
        if self.cd {
            bits |= 1 << 4;
        }
        bits
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// Which address family to use for root hints and glue in recursive mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressFamily {
    /// Probe for IPv6 connectivity.
    Auto,
    V4,
    V6,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

/// TLS settings shared by the TLS, DoH, DoQ and ODoH transports.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsOptions {
    /// Skip certificate verification entirely.
    pub insecure_skip_verify: bool,
    /// Overrides the name used for SNI and certificate verification.
    pub server_name: Option<String>,
    pub min_version: TlsVersion,
    pub max_version: TlsVersion,
    /// ALPN protocols for TLS and DoH; DoQ uses [`Options::quic_alpn`] instead.
    pub next_protos: Vec<String>,
    /// PEM encoded client certificate chain.
    pub client_cert: Option<PathBuf>,
    /// PEM encoded private key belonging to `client_cert`.
    pub client_key: Option<PathBuf>,
    /// Log session secrets to the file named by `SSLKEYLOGFILE`.
    pub key_log: bool,
}

impl Default for TlsOptions {
    fn default() -> Self {
        TlsOptions {
            insecure_skip_verify: false,
            server_name: None,
            min_version: TlsVersion::Tls12,
            max_version: TlsVersion::Tls13,
            next_protos: Vec::new(),
            client_cert: None,
            client_key: None,
            key_log: false,
        }
    }
}

/// Everything that influences how targets are resolved, queries are built and exchanged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Options {
    /// Overall bound for one invocation.
    pub timeout: Duration,
    /// Bound for TLS and QUIC handshakes.
    pub handshake_timeout: Duration,

    pub class: Class,
    pub flags: QueryFlags,
    /// Fixed transaction id; random per message if unset.
    pub id: Option<u16>,

    // EDNS0
    pub udp_buffer: u16,
    pub dnssec: bool,
    pub nsid: bool,
    pub pad: bool,
    pub keepalive: bool,
    /// Client subnet in CIDR notation.
    pub client_subnet: Option<String>,
    /// Client cookie, hex encoded.
    pub cookie: Option<String>,

    pub id_check: bool,
    pub reuse_conn: bool,
    pub txt_concat: bool,
    pub round_ttl: bool,

    /// Use TCP even when UDP would do.
    pub prefer_tcp: bool,

    pub tls: TlsOptions,

    pub odoh_proxy: Option<String>,
    pub http_user_agent: Option<String>,
    pub http_method: HttpMethod,
    pub http3: bool,

    /// PMTU discovery for QUIC based transports.
    pub pmtud: bool,
    pub quic_alpn: Vec<String>,
    pub quic_length_prefix: bool,
    pub quic_dial_timeout: Duration,
    pub quic_open_stream_timeout: Duration,

    pub dnscrypt_tcp: bool,
    /// Largest response accepted over UDP; 0 selects 4096.
    pub dnscrypt_udp_size: u16,
    pub dnscrypt_public_key: Option<String>,
    pub dnscrypt_provider: Option<String>,

    /// Plain DNS server used to resolve hostnames in targets, instead of the system resolver.
    pub bootstrap_server: Option<String>,
    pub bootstrap_timeout: Duration,

    pub address_family: AddressFamily,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            class: Class::IN,
            flags: QueryFlags::default(),
            id: None,
            udp_buffer: 1232,
            dnssec: false,
            nsid: false,
            pad: false,
            keepalive: false,
            client_subnet: None,
            cookie: None,
            id_check: true,
            reuse_conn: true,
            txt_concat: false,
            round_ttl: false,
            prefer_tcp: false,
            tls: TlsOptions::default(),
            odoh_proxy: None,
            http_user_agent: None,
            http_method: HttpMethod::Get,
            http3: false,
            pmtud: true,
            quic_alpn: vec!["doq".to_string(), "doq-i11".to_string()],
            quic_length_prefix: true,
            quic_dial_timeout: Duration::from_secs(10),
            quic_open_stream_timeout: Duration::from_secs(10),
            dnscrypt_tcp: false,
            dnscrypt_udp_size: 0,
            dnscrypt_public_key: None,
            dnscrypt_provider: None,
            bootstrap_server: None,
            bootstrap_timeout: Duration::from_secs(5),
            address_family: AddressFamily::Auto,
        }
    }
}

impl Options {
    /// Whether queries built from these options carry an OPT record.
    pub fn wants_edns(&self) -> bool {
        self.dnssec
            || self.nsid
            || self.pad
            || self.keepalive
            || self.client_subnet.is_some()
            || self.cookie.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_bits() {
        assert_eq!(QueryFlags::default().as_bits(), 0x0100);

        let all = QueryFlags {
            aa: true,
            ad: true,
            cd: true,
            rd: true,
            ra: true,
            z: true,
            tc: true,
        };
        assert_eq!(all.as_bits(), 0x07f0);
    }

    #[test]
    fn edns_presence() {
        let mut opts = Options::default();
        assert!(!opts.wants_edns());
        opts.cookie = Some("0102030405060708".into());
        assert!(opts.wants_edns());
    }
}
