//! `sonde-stamp` decodes and encodes DNS Stamps, the compact `sdns://` representation of a DNS
//! server's address, protocol and cryptographic parameters.
//!
//! It is used by [`sonde`] to turn stamps into transport targets, but it has no dependency on the
//! rest of the engine and can be used on its own.
//!
//! # Basic usage example
//! ```rust
//! use sonde_stamp::{Protocol, ServerStamp};
//!
//! let stamp: ServerStamp = "sdns://AgcAAAAAAAAAAAAHOS45LjkuOQA".parse().unwrap();
//! assert_eq!(stamp.protocol, Protocol::DoH);
//! assert_eq!(stamp.provider_name, "9.9.9.9");
//! assert_eq!(stamp.to_string(), "sdns://AgcAAAAAAAAAAAAHOS45LjkuOQA");
//! ```
//!
//! [`sonde`]: https://docs.rs/sonde

use std::fmt::{self, Display};
use std::io::{Cursor, Read};
use std::net::IpAddr;
use std::str::FromStr;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use data_encoding::{BASE64URL_NOPAD, HEXLOWER_PERMISSIVE};

pub mod error;

pub use error::StampError;

/// Every stamp starts with this.
pub const STAMP_PREFIX: &str = "sdns://";

/// Length of a DNSCrypt provider public key.
pub const PUBLIC_KEY_LEN: usize = 32;

/// The protocol a stamp describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Plain,
    DnsCrypt,
    DoH,
    Tls,
    DoQ,
    ODoHTarget,
    DnsCryptRelay,
    ODoHRelay,
}

/// Informal properties a server advertises about itself.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Properties {
    /// The server supports DNSSEC.
    pub dnssec: bool,
    /// The server doesn't keep logs.
    pub no_log: bool,
    /// The server doesn't intentionally block domains.
    pub no_filter: bool,
}

/// A decoded DNS stamp.
///
/// Not every field is meaningful for every protocol; unused fields are left empty. For DoH, DoT
/// and DoQ stamps `provider_name` holds the server hostname (optionally with a port).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerStamp {
    pub protocol: Protocol,
    pub props: Properties,
    /// IP address with port, may be empty for DoH/DoT/DoQ stamps.
    pub server_addr: String,
    /// DNSCrypt provider public key.
    pub server_pk: Vec<u8>,
    /// SHA256 hashes of certificates in the TLS chain.
    pub hashes: Vec<Vec<u8>>,
    pub provider_name: String,
    pub path: String,
    pub bootstrap_ips: Vec<String>,
}

impl Protocol {
    /// Encodes a `Protocol` as its one-byte identifier.
    pub fn encode(&self) -> u8 {
        match self {
            Protocol::Plain => 0x00,
            Protocol::DnsCrypt => 0x01,
            Protocol::DoH => 0x02,
            Protocol::Tls => 0x03,
            Protocol::DoQ => 0x04,
            Protocol::ODoHTarget => 0x05,
            Protocol::DnsCryptRelay => 0x81,
            Protocol::ODoHRelay => 0x85,
        }
    }

    /// Parses a one-byte protocol identifier.
    pub fn parse(val: u8) -> Result<Self, StampError> {
        Ok(match val {
            0x00 => Protocol::Plain,
            0x01 => Protocol::DnsCrypt,
            0x02 => Protocol::DoH,
            0x03 => Protocol::Tls,
            0x04 => Protocol::DoQ,
            0x05 => Protocol::ODoHTarget,
            0x81 => Protocol::DnsCryptRelay,
            0x85 => Protocol::ODoHRelay,
            x => return Err(StampError::UnsupportedProtocol(x)),
        })
    }

    /// The port implied when a stamp address carries none.
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Plain => 53,
            Protocol::Tls | Protocol::DoQ => 853,
            _ => 443,
        }
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Plain => "Plain",
            Protocol::DnsCrypt => "DNSCrypt",
            Protocol::DoH => "DoH",
            Protocol::Tls => "DoT",
            Protocol::DoQ => "DoQ",
            Protocol::ODoHTarget => "ODoH target",
            Protocol::DnsCryptRelay => "DNSCrypt relay",
            Protocol::ODoHRelay => "ODoH relay",
        };
        write!(f, "{}", name)
    }
}

impl Properties {
    pub fn from_bits(bits: u64) -> Self {
        Properties {
            dnssec: bits & 1 != 0,
            no_log: bits & 2 != 0,
            no_filter: bits & 4 != 0,
        }
    }

    pub fn as_bits(&self) -> u64 {
        (self.dnssec as u64) | (self.no_log as u64) << 1 | (self.no_filter as u64) << 2
    }
}

impl ServerStamp {
    fn empty(protocol: Protocol, props: Properties) -> Self {
        ServerStamp {
            protocol,
            props,
            server_addr: String::new(),
            server_pk: Vec::new(),
            hashes: Vec::new(),
            provider_name: String::new(),
            path: String::new(),
            bootstrap_ips: Vec::new(),
        }
    }

    /// Builds a DNSCrypt stamp from the pre-stamp configuration triple: a resolver address, the
    /// provider public key in hex (`:` separators allowed) and the provider name.
    ///
    /// A bare IP address gets the default DNSCrypt port 443.
    ///
    /// # Examples
    /// ```rust
    /// use sonde_stamp::ServerStamp;
    ///
    /// let key = "D12E:6A93:1FB5:2DC1:BC49:13E2:BE54:7CAC:5C77:0F69:9D9E:C3BE:4AB5:8C47:9848:3C2B";
    /// let stamp = ServerStamp::from_legacy_dnscrypt("127.0.0.1", key, "2.dnscrypt-cert.example")
    ///     .unwrap();
    /// assert_eq!(stamp.server_addr, "127.0.0.1:443");
    /// assert_eq!(stamp.server_pk.len(), 32);
    ///
    /// assert!(ServerStamp::from_legacy_dnscrypt("127.0.0.1", "abcd", "example").is_err());
    /// ```
    pub fn from_legacy_dnscrypt(
        server_addr: &str,
        public_key: &str,
        provider_name: &str,
    ) -> Result<Self, StampError> {
        let server_addr = match server_addr.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => format!("{}:{}", ip, Protocol::DnsCrypt.default_port()),
            Ok(IpAddr::V6(ip)) => format!("[{}]:{}", ip, Protocol::DnsCrypt.default_port()),
            Err(_) => server_addr.to_string(),
        };

        let hex = public_key.replace(':', "");
        let server_pk = HEXLOWER_PERMISSIVE
            .decode(hex.as_bytes())
            .map_err(|e| StampError::InvalidPublicKeyEncoding(e.to_string()))?;
        if server_pk.len() != PUBLIC_KEY_LEN {
            return Err(StampError::InvalidPublicKey(server_pk.len()));
        }

        let mut stamp = ServerStamp::empty(Protocol::DnsCrypt, Properties::default());
        stamp.server_addr = server_addr;
        stamp.server_pk = server_pk;
        stamp.provider_name = provider_name.to_string();
        Ok(stamp)
    }

    /// Decodes a stamp string.
    ///
    /// Returns an error if the prefix is missing, the payload is not valid base64url, a field
    /// runs past the end of the payload, or the protocol identifier is unknown.
    pub fn parse(stamp: &str) -> Result<Self, StampError> {
        let payload = stamp
            .strip_prefix(STAMP_PREFIX)
            .ok_or(StampError::MissingPrefix)?;
        let bin = BASE64URL_NOPAD.decode(payload.as_bytes())?;
        let mut cur = Cursor::new(bin.as_slice());

        let protocol = Protocol::parse(read_u8(&mut cur)?)?;
        let props = match protocol {
            Protocol::DnsCryptRelay => Properties::default(),
            _ => {
                expect_bytes(&mut cur, 8)?;
                Properties::from_bits(cur.read_u64::<LittleEndian>()?)
            }
        };

        let mut stamp = ServerStamp::empty(protocol, props);
        match protocol {
            Protocol::Plain => {
                stamp.server_addr = with_default_port(read_lp_string(&mut cur)?, protocol);
            }
            Protocol::DnsCrypt => {
                stamp.server_addr = with_default_port(read_lp_string(&mut cur)?, protocol);
                stamp.server_pk = read_lp(&mut cur)?;
                if stamp.server_pk.len() != PUBLIC_KEY_LEN {
                    return Err(StampError::InvalidPublicKey(stamp.server_pk.len()));
                }
                stamp.provider_name = read_lp_string(&mut cur)?;
            }
            Protocol::DoH | Protocol::ODoHRelay => {
                stamp.server_addr = with_default_port(read_lp_string(&mut cur)?, protocol);
                stamp.hashes = read_vlp(&mut cur)?;
                stamp.provider_name = read_lp_string(&mut cur)?;
                stamp.path = read_lp_string(&mut cur)?;
                stamp.bootstrap_ips = read_bootstrap(&mut cur)?;
            }
            Protocol::Tls | Protocol::DoQ => {
                stamp.server_addr = with_default_port(read_lp_string(&mut cur)?, protocol);
                stamp.hashes = read_vlp(&mut cur)?;
                stamp.provider_name = read_lp_string(&mut cur)?;
                stamp.bootstrap_ips = read_bootstrap(&mut cur)?;
            }
            Protocol::ODoHTarget => {
                stamp.provider_name = read_lp_string(&mut cur)?;
                stamp.path = read_lp_string(&mut cur)?;
            }
            Protocol::DnsCryptRelay => {
                stamp.server_addr = with_default_port(read_lp_string(&mut cur)?, protocol);
            }
        }

        let left = remaining(&cur);
        if left != 0 {
            return Err(StampError::TrailingGarbage(left));
        }

        Ok(stamp)
    }

    /// Encodes the stamp as its binary payload (without base64 or prefix).
    ///
    /// Addresses carrying the protocol's default port are written without it.
    pub fn encode(&self) -> Result<Vec<u8>, StampError> {
        let mut buf = vec![self.protocol.encode()];
        if self.protocol != Protocol::DnsCryptRelay {
            buf.write_u64::<LittleEndian>(self.props.as_bits())?;
        }

        let addr = strip_default_port(&self.server_addr, self.protocol);
        match self.protocol {
            Protocol::Plain | Protocol::DnsCryptRelay => write_lp(&mut buf, addr.as_bytes())?,
            Protocol::DnsCrypt => {
                write_lp(&mut buf, addr.as_bytes())?;
                write_lp(&mut buf, &self.server_pk)?;
                write_lp(&mut buf, self.provider_name.as_bytes())?;
            }
            Protocol::DoH | Protocol::ODoHRelay => {
                write_lp(&mut buf, addr.as_bytes())?;
                write_vlp(&mut buf, &self.hashes)?;
                write_lp(&mut buf, self.provider_name.as_bytes())?;
                write_lp(&mut buf, self.path.as_bytes())?;
                write_bootstrap(&mut buf, &self.bootstrap_ips)?;
            }
            Protocol::Tls | Protocol::DoQ => {
                write_lp(&mut buf, addr.as_bytes())?;
                write_vlp(&mut buf, &self.hashes)?;
                write_lp(&mut buf, self.provider_name.as_bytes())?;
                write_bootstrap(&mut buf, &self.bootstrap_ips)?;
            }
            Protocol::ODoHTarget => {
                write_lp(&mut buf, self.provider_name.as_bytes())?;
                write_lp(&mut buf, self.path.as_bytes())?;
            }
        }

        Ok(buf)
    }
}

impl FromStr for ServerStamp {
    type Err = StampError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServerStamp::parse(s)
    }
}

impl Display for ServerStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bin = self.encode().map_err(|_| fmt::Error)?;
        write!(f, "{}{}", STAMP_PREFIX, BASE64URL_NOPAD.encode(&bin))
    }
}

fn remaining(cur: &Cursor<&[u8]>) -> usize {
    cur.get_ref().len().saturating_sub(cur.position() as usize)
}

fn expect_bytes(cur: &Cursor<&[u8]>, len: usize) -> Result<(), StampError> {
    if remaining(cur) < len {
        return Err(StampError::TooShort {
            offset: cur.position() as usize,
            expected: len,
        });
    }
    Ok(())
}

fn read_u8(cur: &mut Cursor<&[u8]>) -> Result<u8, StampError> {
    expect_bytes(cur, 1)?;
    Ok(cur.read_u8()?)
}

fn read_exact(cur: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>, StampError> {
    expect_bytes(cur, len)?;
    let mut buf = vec![0; len];
    cur.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_lp(cur: &mut Cursor<&[u8]>) -> Result<Vec<u8>, StampError> {
    let len = read_u8(cur)? as usize;
    read_exact(cur, len)
}

fn read_lp_string(cur: &mut Cursor<&[u8]>) -> Result<String, StampError> {
    Ok(String::from_utf8(read_lp(cur)?)?)
}

/// Reads a variable-length set: every length byte but the last has its high bit set. Empty
/// entries are skipped.
fn read_vlp(cur: &mut Cursor<&[u8]>) -> Result<Vec<Vec<u8>>, StampError> {
    let mut items = Vec::new();
    loop {
        let vlen = read_u8(cur)?;
        let item = read_exact(cur, (vlen & 0x7f) as usize)?;
        if !item.is_empty() {
            items.push(item);
        }
        if vlen & 0x80 == 0 {
            return Ok(items);
        }
    }
}

fn read_bootstrap(cur: &mut Cursor<&[u8]>) -> Result<Vec<String>, StampError> {
    if remaining(cur) == 0 {
        return Ok(Vec::new());
    }
    read_vlp(cur)?
        .into_iter()
        .map(|ip| String::from_utf8(ip).map_err(StampError::from))
        .collect()
}

fn write_lp(buf: &mut Vec<u8>, field: &[u8]) -> Result<(), StampError> {
    if field.len() > 0xff {
        return Err(StampError::FieldTooLong(field.len()));
    }
    buf.write_u8(field.len() as u8)?;
    buf.extend_from_slice(field);
    Ok(())
}

fn write_vlp<T: AsRef<[u8]>>(buf: &mut Vec<u8>, items: &[T]) -> Result<(), StampError> {
    if items.is_empty() {
        buf.write_u8(0)?;
        return Ok(());
    }
    let last = items.len() - 1;
    for (i, item) in items.iter().enumerate() {
        let item = item.as_ref();
        if item.len() > 0x7f {
            return Err(StampError::FieldTooLong(item.len()));
        }
        let mut vlen = item.len() as u8;
        if i < last {
            vlen |= 0x80;
        }
        buf.write_u8(vlen)?;
        buf.extend_from_slice(item);
    }
    Ok(())
}

fn write_bootstrap(buf: &mut Vec<u8>, ips: &[String]) -> Result<(), StampError> {
    if ips.is_empty() {
        return Ok(());
    }
    write_vlp(buf, ips)
}

/// Whether `addr` ends in a `:port` that is not part of an IPv6 literal.
///
/// An unbracketed address with more than one colon is a bare IPv6 literal and has no port.
fn has_port(addr: &str) -> bool {
    match (addr.rfind(':'), addr.rfind(']')) {
        (Some(colon), Some(bracket)) => colon > bracket,
        (Some(_), None) => addr.matches(':').count() == 1,
        _ => false,
    }
}

fn with_default_port(addr: String, protocol: Protocol) -> String {
    if addr.is_empty() || has_port(&addr) {
        addr
    } else if addr.contains(':') && !addr.starts_with('[') {
        format!("[{}]:{}", addr, protocol.default_port())
    } else {
        format!("{}:{}", addr, protocol.default_port())
    }
}

fn strip_default_port(addr: &str, protocol: Protocol) -> &str {
    if !has_port(addr) {
        return addr;
    }
    let suffix = format!(":{}", protocol.default_port());
    addr.strip_suffix(suffix.as_str()).unwrap_or(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUAD9_DOH: &str = "sdns://AgcAAAAAAAAAAAAHOS45LjkuOQA";

    #[test]
    fn decode_doh() {
        let stamp = ServerStamp::parse(QUAD9_DOH).unwrap();
        assert_eq!(stamp.protocol, Protocol::DoH);
        assert_eq!(
            stamp.props,
            Properties {
                dnssec: true,
                no_log: true,
                no_filter: true
            }
        );
        assert!(stamp.server_addr.is_empty());
        assert!(stamp.hashes.is_empty());
        assert_eq!(stamp.provider_name, "9.9.9.9");
        assert!(stamp.path.is_empty());
        assert!(stamp.bootstrap_ips.is_empty());

        assert_eq!(stamp.to_string(), QUAD9_DOH);
    }

    #[test]
    fn plain_gets_default_port() {
        let mut stamp = ServerStamp::empty(Protocol::Plain, Properties::default());
        stamp.server_addr = "9.9.9.9".into();
        let encoded = stamp.to_string();

        let decoded = ServerStamp::parse(&encoded).unwrap();
        assert_eq!(decoded.server_addr, "9.9.9.9:53");
        // the default port is not written out again
        assert_eq!(decoded.to_string(), encoded);

        let mut v6 = ServerStamp::empty(Protocol::Plain, Properties::default());
        v6.server_addr = "[2620:fe::fe]".into();
        let decoded = ServerStamp::parse(&v6.to_string()).unwrap();
        assert_eq!(decoded.server_addr, "[2620:fe::fe]:53");
    }

    #[test]
    fn bare_ipv6_gets_brackets_and_port() {
        assert!(!has_port("2001:db8::1"));
        assert!(has_port("[2001:db8::1]:53"));
        assert!(has_port("192.0.2.1:53"));
        assert_eq!(
            with_default_port("2001:db8::1".into(), Protocol::Plain),
            "[2001:db8::1]:53"
        );
        // an address ending in the default port number is not mistaken for one with a port
        assert_eq!(strip_default_port("2001:db8::53", Protocol::Plain), "2001:db8::53");

        let mut stamp = ServerStamp::empty(Protocol::Plain, Properties::default());
        stamp.server_addr = "2001:db8::1".into();
        let decoded = ServerStamp::parse(&stamp.to_string()).unwrap();
        assert_eq!(decoded.server_addr, "[2001:db8::1]:53");
    }

    #[test]
    fn dnscrypt_fields() {
        let key = "D12E:6A93:1FB5:2DC1:BC49:13E2:BE54:7CAC:5C77:0F69:9D9E:C3BE:4AB5:8C47:9848:3C2B";
        let stamp =
            ServerStamp::from_legacy_dnscrypt("2001:db8::1", key, "2.dnscrypt-cert.example").unwrap();
        assert_eq!(stamp.server_addr, "[2001:db8::1]:443");
        assert_eq!(stamp.server_pk[0], 0xd1);

        let decoded = ServerStamp::parse(&stamp.to_string()).unwrap();
        assert_eq!(decoded, stamp);
    }

    #[test]
    fn hashes_and_bootstrap() {
        let mut stamp = ServerStamp::empty(Protocol::DoQ, Properties::default());
        stamp.server_addr = "94.140.14.14:8853".into();
        stamp.hashes = vec![vec![1; 32], vec![2; 32]];
        stamp.provider_name = "dns.adguard.com".into();
        stamp.bootstrap_ips = vec!["1.1.1.1".into(), "8.8.8.8".into()];

        let bin = stamp.encode().unwrap();
        // first hash length has the continuation bit set, the second doesn't
        let hashes_at = 1 + 8 + 1 + stamp.server_addr.len();
        assert_eq!(bin[hashes_at], 0x80 | 32);
        assert_eq!(bin[hashes_at + 33], 32);

        let decoded = ServerStamp::parse(&stamp.to_string()).unwrap();
        assert_eq!(decoded, stamp);
    }

    #[test]
    fn relay_has_no_properties() {
        let mut stamp = ServerStamp::empty(Protocol::DnsCryptRelay, Properties::default());
        stamp.server_addr = "192.0.2.1".into();
        let bin = stamp.encode().unwrap();
        assert_eq!(bin[0], 0x81);
        assert_eq!(bin[1] as usize, "192.0.2.1".len());

        let decoded = ServerStamp::parse(&stamp.to_string()).unwrap();
        assert_eq!(decoded.server_addr, "192.0.2.1:443");
    }

    #[test]
    fn rejects_malformed() {
        assert!(matches!(
            ServerStamp::parse("https://example.com"),
            Err(StampError::MissingPrefix)
        ));
        assert!(matches!(
            ServerStamp::parse("sdns://!!!"),
            Err(StampError::Base64(_))
        ));
        // protocol 0x07 does not exist
        let bogus = format!("sdns://{}", BASE64URL_NOPAD.encode(&[7, 0, 0, 0, 0, 0, 0, 0, 0]));
        assert!(matches!(
            ServerStamp::parse(&bogus),
            Err(StampError::UnsupportedProtocol(7))
        ));
        // length byte claims more than there is
        let short = format!("sdns://{}", BASE64URL_NOPAD.encode(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 9, b'1']));
        assert!(matches!(
            ServerStamp::parse(&short),
            Err(StampError::TooShort { .. })
        ));
        let trailing = format!("sdns://{}", BASE64URL_NOPAD.encode(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]));
        assert!(matches!(
            ServerStamp::parse(&trailing),
            Err(StampError::TrailingGarbage(1))
        ));
    }
}
