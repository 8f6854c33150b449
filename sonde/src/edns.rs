//! The EDNS0 pseudo-record attached to outgoing queries.
//!
//! `toluol_proto` can only attach a cookie to its own `OPT` records, so the record is encoded here.

use std::io::Write;
use std::net::IpAddr;

use byteorder::{NetworkEndian, WriteBytesExt};
use data_encoding::HEXLOWER_PERMISSIVE;
use ipnetwork::IpNetwork;

use crate::config::Options;
use crate::error::{Error, Result};

/// `OPT` record type code.
const TYPE_OPT: u16 = 41;
/// DNSSEC OK bit within the extended flags.
const FLAG_DO: u16 = 1 << 15;

/// Padding target block size for queries (RFC 8467, block-length padding).
pub const PAD_BLOCK: usize = 128;

/// An option carried in the `OPT` record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EdnsOption {
    /// Requests the server's NSID; the empty payload is the request.
    Nsid,
    /// Client subnet as described in RFC 7871.
    ClientSubnet {
        family: u16,
        source_prefix: u8,
        scope_prefix: u8,
        address: IpAddr,
    },
    Cookie(Vec<u8>),
    TcpKeepalive,
    /// Padding of the given length.
    Padding(usize),
}

/// The `OPT` pseudo-record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Edns {
    /// Advertised UDP payload size, carried in the CLASS field.
    pub udp_size: u16,
    pub dnssec_ok: bool,
    pub options: Vec<EdnsOption>,
}

impl EdnsOption {
    pub fn code(&self) -> u16 {
        match self {
            EdnsOption::Nsid => 3,
            EdnsOption::ClientSubnet { .. } => 8,
            EdnsOption::Cookie(_) => 10,
            EdnsOption::TcpKeepalive => 11,
            EdnsOption::Padding(_) => 12,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            EdnsOption::Nsid | EdnsOption::TcpKeepalive => Vec::new(),
            EdnsOption::ClientSubnet {
                family,
                source_prefix,
                scope_prefix,
                address,
            } => {
                let mut payload = Vec::with_capacity(20);
                payload.extend_from_slice(&family.to_be_bytes());
                payload.push(*source_prefix);
                payload.push(*scope_prefix);
                // only the significant octets of the address are sent
                let octets = match address {
                    IpAddr::V4(ip) => ip.octets().to_vec(),
                    IpAddr::V6(ip) => ip.octets().to_vec(),
                };
                let significant = (*source_prefix as usize + 7) / 8;
                payload.extend_from_slice(&octets[..significant.min(octets.len())]);
                payload
            }
            EdnsOption::Cookie(cookie) => cookie.clone(),
            EdnsOption::Padding(len) => vec![0; *len],
        }
    }

    /// Parses a CIDR such as `192.0.2.0/24` into a client subnet option.
    ///
    /// The address is masked down to the prefix.
    pub fn client_subnet(cidr: &str) -> Result<Self> {
        let net: IpNetwork = cidr
            .parse()
            .map_err(|e| Error::config(format!("invalid client subnet {:?}: {}", cidr, e)))?;
        let family = match net {
            IpNetwork::V4(_) => 1,
            IpNetwork::V6(v6) if v6.ip().to_ipv4_mapped().is_some() => 1,
            IpNetwork::V6(_) => 2,
        };
        let (address, source_prefix) = match (net, family) {
            (IpNetwork::V6(v6), 1) => {
                // an IPv4 address in IPv6 clothing
                let prefix = v6.prefix().saturating_sub(96);
                let ip = v6.ip().to_ipv4_mapped().map(IpAddr::V4).unwrap_or(net.ip());
                let masked = IpNetwork::new(ip, prefix)
                    .map(|n| n.network())
                    .map_err(|e| Error::config(format!("invalid client subnet {:?}: {}", cidr, e)))?;
                (masked, prefix)
            }
            _ => (net.network(), net.prefix()),
        };
        Ok(EdnsOption::ClientSubnet {
            family,
            source_prefix,
            scope_prefix: 0,
            address,
        })
    }

    /// Parses a hex encoded client cookie.
    pub fn cookie(hex: &str) -> Result<Self> {
        let cookie = HEXLOWER_PERMISSIVE
            .decode(hex.as_bytes())
            .map_err(|e| Error::config(format!("invalid cookie {:?}: {}", hex, e)))?;
        Ok(EdnsOption::Cookie(cookie))
    }
}

/// Number of padding bytes for a message of `msg_len` bytes advertised with a `bufsize` UDP
/// payload size.
///
/// Pads up to the next [`PAD_BLOCK`] boundary, but never past `bufsize`.
///
/// # Examples
/// ```rust
/// use sonde::edns::padding_len;
///
/// assert_eq!(padding_len(29, 1232), 99);
/// assert_eq!(padding_len(1200, 1232), 32);
/// assert_eq!(padding_len(1300, 1232), 0);
/// ```
pub fn padding_len(msg_len: usize, bufsize: u16) -> usize {
    let bufsize = bufsize as usize;
    let pad = PAD_BLOCK - msg_len % PAD_BLOCK;
    if msg_len + pad > bufsize {
        bufsize.saturating_sub(msg_len)
    } else {
        pad
    }
}

impl Edns {
    /// Builds the `OPT` record requested by `opts`, or `None` if no EDNS0 feature is requested.
    ///
    /// `msg_len` is the length of the message without the `OPT` record; it determines the
    /// padding length.
    pub fn from_options(opts: &Options, msg_len: usize) -> Result<Option<Self>> {
        if !opts.wants_edns() {
            return Ok(None);
        }

        let mut options = Vec::new();
        if opts.nsid {
            options.push(EdnsOption::Nsid);
        }
        if opts.pad {
            let len = padding_len(msg_len, opts.udp_buffer);
            tracing::debug!("padding with {} bytes", len);
            options.push(EdnsOption::Padding(len));
        }
        if let Some(subnet) = &opts.client_subnet {
            let option = EdnsOption::client_subnet(subnet)?;
            tracing::debug!(?option, "EDNS0 client subnet");
            options.push(option);
        }
        if let Some(cookie) = &opts.cookie {
            options.push(EdnsOption::cookie(cookie)?);
        }
        if opts.keepalive {
            options.push(EdnsOption::TcpKeepalive);
        }

        Ok(Some(Edns {
            udp_size: opts.udp_buffer,
            dnssec_ok: opts.dnssec,
            options,
        }))
    }

    pub fn has_keepalive(&self) -> bool {
        self.options
            .iter()
            .any(|o| matches!(o, EdnsOption::TcpKeepalive))
    }

    /// Appends the encoded record to `buf`.
    pub fn encode_into(&self, buf: &mut impl Write) -> Result<()> {
        let mut rdata = Vec::new();
        for option in &self.options {
            let payload = option.payload();
            rdata.write_u16::<NetworkEndian>(option.code()).map_err(io_encode)?;
            rdata.write_u16::<NetworkEndian>(payload.len() as u16).map_err(io_encode)?;
            rdata.extend_from_slice(&payload);
        }

        let flags = if self.dnssec_ok { FLAG_DO } else { 0 };
        // root owner name
        buf.write_u8(0).map_err(io_encode)?;
        buf.write_u16::<NetworkEndian>(TYPE_OPT).map_err(io_encode)?;
        buf.write_u16::<NetworkEndian>(self.udp_size).map_err(io_encode)?;
        // extended rcode and version are zero in queries
        buf.write_u16::<NetworkEndian>(0).map_err(io_encode)?;
        buf.write_u16::<NetworkEndian>(flags).map_err(io_encode)?;
        buf.write_u16::<NetworkEndian>(rdata.len() as u16).map_err(io_encode)?;
        buf.write_all(&rdata).map_err(io_encode)?;
        Ok(())
    }
}

fn io_encode(e: std::io::Error) -> Error {
    Error::Encode(e.into())
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    #[test]
    fn padding_stays_within_buffer() {
        for bufsize in [0u16, 100, 512, 1232, 4096] {
            for len in 0..2000usize {
                let pad = padding_len(len, bufsize);
                if len <= bufsize as usize {
                    assert!(len + pad <= bufsize as usize, "len {} bufsize {}", len, bufsize);
                } else {
                    assert_eq!(pad, 0);
                }
            }
        }
        assert_eq!(padding_len(128, 4096), 128);
    }

    #[test]
    fn subnet_option() {
        let v4 = EdnsOption::client_subnet("192.0.2.77/24").unwrap();
        assert_eq!(
            v4,
            EdnsOption::ClientSubnet {
                family: 1,
                source_prefix: 24,
                scope_prefix: 0,
                address: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 0)),
            }
        );
        assert_eq!(v4.payload(), vec![0, 1, 24, 0, 192, 0, 2]);

        let v6 = EdnsOption::client_subnet("2001:db8::/32").unwrap();
        assert_eq!(v6.payload(), vec![0, 2, 32, 0, 0x20, 0x01, 0x0d, 0xb8]);

        let mapped = EdnsOption::client_subnet("::ffff:198.51.100.1/120").unwrap();
        assert_eq!(mapped.payload(), vec![0, 1, 24, 0, 198, 51, 100]);

        assert!(matches!(
            EdnsOption::client_subnet("not-a-subnet"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn opt_record_layout() {
        let edns = Edns {
            udp_size: 1232,
            dnssec_ok: true,
            options: vec![EdnsOption::Nsid, EdnsOption::cookie("0102030405060708").unwrap()],
        };
        let mut buf = Vec::new();
        edns.encode_into(&mut buf).unwrap();
        assert_eq!(
            buf,
            vec![
                0, 0, 41, 0x04, 0xd0, 0, 0, 0x80, 0, 0, 16, // header, rdlength 16
                0, 3, 0, 0, // NSID
                0, 10, 0, 8, 1, 2, 3, 4, 5, 6, 7, 8, // cookie
            ]
        );
        assert!(!edns.has_keepalive());
        assert!(EdnsOption::cookie("xyz").is_err());
    }
}
