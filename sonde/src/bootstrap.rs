//! Hostname resolution for targets that name their server by hostname.
//!
//! Either the system resolver is used, or a configured plain DNS server queried directly, so that
//! a broken or filtered system resolver does not prevent reaching an encrypted upstream.

use std::io::Cursor;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use toluol_proto::{Class, Message, RecordType};

use crate::config::Options;
use crate::deadline::Deadline;
use crate::error::{Error, IoContext, Result};
use crate::query::{parse_name, Query};
use crate::target::{Target, TransportKind};
use crate::transport::plain;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bootstrap {
    server: Option<SocketAddr>,
    timeout: Duration,
}

impl Bootstrap {
    /// The system resolver.
    pub fn system() -> Self {
        Bootstrap {
            server: None,
            timeout: Duration::from_secs(5),
        }
    }

    pub fn from_options(opts: &Options) -> Result<Self> {
        let server = match &opts.bootstrap_server {
            Some(spec) => {
                let target = Target::resolve(spec, opts)?;
                if target.kind != TransportKind::Plain {
                    return Err(Error::config("bootstrap server must be a plain DNS server"));
                }
                let (host, port) = target.host_port()?;
                let addr = (host, port)
                    .to_socket_addrs()
                    .context(format!("resolving bootstrap server {}", host))?
                    .next()
                    .ok_or_else(|| Error::Unresolvable(host.to_string()))?;
                tracing::debug!("using bootstrap server {}", addr);
                Some(addr)
            }
            None => None,
        };
        Ok(Bootstrap {
            server,
            timeout: opts.bootstrap_timeout,
        })
    }

    /// Resolves `host` to socket addresses. IP literals (with an optional zone) never hit the
    /// network.
    pub fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        let addrs = match self.server {
            Some(server) if !host.contains('%') => self.lookup(server, host, port)?,
            _ => (host, port)
                .to_socket_addrs()
                .context(format!("resolving {}", host))?
                .collect(),
        };
        if addrs.is_empty() {
            return Err(Error::Unresolvable(host.to_string()));
        }
        tracing::trace!("resolved {} to {:?}", host, addrs);
        Ok(addrs)
    }

    fn lookup(&self, server: SocketAddr, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
        let deadline = Deadline::after(self.timeout);
        let name = parse_name(host)?;

        let mut addrs = Vec::new();
        for qtype in [RecordType::A, RecordType::AAAA] {
            let query = Query::new(name.clone(), qtype, Class::IN);
            let reply = plain::udp_exchange(server, &query.to_wire()?, 4096, deadline)?;
            let reply = Message::parse(&mut Cursor::new(&reply[..]))?;
            for record in reply.answers.iter().filter_map(|r| r.as_nonopt()) {
                let rdata = record.rdata();
                if let Some(a) = rdata.as_a() {
                    addrs.push(SocketAddr::new(IpAddr::V4(a.address), port));
                } else if let Some(aaaa) = rdata.as_aaaa() {
                    addrs.push(SocketAddr::new(IpAddr::V6(aaaa.address), port));
                }
            }
        }
        Ok(addrs)
    }

    /// Resolves a `host:port` string the way HTTP clients pass it.
    pub fn resolve_netloc(&self, netloc: &str) -> std::io::Result<Vec<SocketAddr>> {
        let (host, port) = crate::target::split_host_port(netloc).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("bad address {}", netloc))
        })?;
        self.resolve(host, port)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::net::UdpSocket;
    use std::thread;

    use super::*;

    #[test]
    fn literals_skip_lookup() {
        let bootstrap = Bootstrap::system();
        assert_eq!(
            bootstrap.resolve("192.0.2.1", 853).unwrap(),
            vec!["192.0.2.1:853".parse().unwrap()]
        );
        assert_eq!(
            bootstrap.resolve_netloc("[2001:db8::1]:443").unwrap(),
            vec!["[2001:db8::1]:443".parse().unwrap()]
        );
    }

    #[test]
    fn rejects_non_plain_server() {
        let opts = Options {
            bootstrap_server: Some("tls://1.1.1.1".into()),
            ..Options::default()
        };
        assert!(matches!(Bootstrap::from_options(&opts), Err(Error::Config(_))));
    }

    #[test]
    fn queries_bootstrap_server() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        thread::spawn(move || {
            let mut buf = [0u8; 512];
            for _ in 0..2 {
                let (len, peer) = server.recv_from(&mut buf).unwrap();
                let query = &buf[..len];
                let qtype = u16::from_be_bytes([query[len - 4], query[len - 3]]);
                let mut reply = query.to_vec();
                reply[2] = 0x81;
                reply[3] = 0x80;
                if qtype == 1 {
                    reply[7] = 1;
                    reply.extend_from_slice(&[0xc0, 12, 0, 1, 0, 1, 0, 0, 0, 60, 0, 4, 192, 0, 2, 7]);
                }
                server.send_to(&reply, peer).unwrap();
            }
        });

        let opts = Options {
            bootstrap_server: Some(addr.to_string()),
            ..Options::default()
        };
        let bootstrap = Bootstrap::from_options(&opts).unwrap();
        assert_eq!(
            bootstrap.resolve("dns.example", 853).unwrap(),
            vec!["192.0.2.7:853".parse().unwrap()]
        );
    }
}
