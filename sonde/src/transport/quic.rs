//! DNS over QUIC (RFC 9250), plus the QUIC plumbing shared with HTTP/3.
//!
//! quinn is async only. Each transport owns a current-thread tokio runtime, created on first use,
//! and blocks on it for the duration of one exchange.

use std::fmt::Display;
use std::future::Future;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use quinn::crypto::rustls::QuicClientConfig;
use quinn::{Connection, Endpoint, TransportConfig, VarInt};
use tokio::runtime::Runtime;

use crate::bootstrap::Bootstrap;
use crate::config::Options;
use crate::deadline::Deadline;
use crate::error::{Error, IoContext, Result};
use crate::query::Query;
use crate::target::Target;
use crate::tls_config;
use crate::wire;

/// DoQ application error codes (RFC 9250, Section 8.4).
const DOQ_NO_ERROR: u32 = 0x0;
const DOQ_PROTOCOL_ERROR: u32 = 0x2;

/// Upper bound for a reply read from one stream.
const MAX_REPLY_LEN: usize = u16::MAX as usize + 2;

pub(crate) fn runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("could not start QUIC runtime")
}

/// Wraps a rustls configuration for use with quinn. PMTU discovery is turned off unless `pmtud`.
pub(crate) fn quic_config(
    tls: Arc<rustls::ClientConfig>,
    pmtud: bool,
) -> Result<quinn::ClientConfig> {
    let crypto = QuicClientConfig::try_from(tls).map_err(|e| Error::Quic(e.to_string()))?;
    let mut config = quinn::ClientConfig::new(Arc::new(crypto));
    let mut transport = TransportConfig::default();
    if !pmtud {
        transport.mtu_discovery_config(None);
    }
    config.transport_config(Arc::new(transport));
    Ok(config)
}

/// Awaits `fut` for at most `limit`, mapping both the timeout and the inner error.
pub(crate) async fn timed<T, E: Display>(
    limit: Duration,
    what: &str,
    fut: impl Future<Output = std::result::Result<T, E>>,
) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(Error::Quic(format!("{}: {}", what, e))),
        Err(_) => Err(Error::Timeout(what.to_string())),
    }
}

/// Opens a QUIC connection to the first address that answers. Must run inside the runtime.
pub(crate) async fn dial(
    config: quinn::ClientConfig,
    addrs: &[SocketAddr],
    server_name: &str,
    limit: Duration,
) -> Result<(Endpoint, Connection)> {
    let server_name = server_name.split('%').next().unwrap_or(server_name);
    let mut last_err = Error::Unresolvable(server_name.to_string());
    for addr in addrs {
        let local: SocketAddr = match addr {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let mut endpoint = Endpoint::client(local).context("could not bind QUIC endpoint")?;
        endpoint.set_default_client_config(config.clone());

        let connecting = endpoint
            .connect(*addr, server_name)
            .map_err(|e| Error::Quic(format!("opening QUIC session to {}: {}", addr, e)))?;
        match timed(limit, "dialing QUIC", connecting).await {
            Ok(conn) => {
                tracing::debug!("QUIC connection to {} established", addr);
                return Ok((endpoint, conn));
            }
            Err(e) => {
                tracing::debug!("could not connect to {} via QUIC: {}", addr, e);
                last_err = e;
            }
        }
    }
    Err(last_err)
}

/// Closes `conn` with `code` and gives the endpoint a moment to send the close frame.
pub(crate) fn shutdown(rt: &Runtime, endpoint: Endpoint, conn: Connection, code: u32) {
    conn.close(VarInt::from_u32(code), b"");
    rt.block_on(async {
        let _ = tokio::time::timeout(Duration::from_millis(100), endpoint.wait_idle()).await;
    });
}

/// Strips the length prefix from a DoQ reply.
fn unframe(mut reply: Vec<u8>, length_prefix: bool) -> Result<Vec<u8>> {
    if reply.is_empty() {
        return Err(Error::protocol("empty DoQ response"));
    }
    if length_prefix {
        if reply.len() < 2 {
            return Err(Error::protocol("DoQ response shorter than its length prefix"));
        }
        reply.drain(..2);
    }
    Ok(reply)
}

pub struct QuicTransport {
    address: String,
    host: String,
    port: u16,
    server_name: String,
    alpn: Vec<String>,
    config: quinn::ClientConfig,
    bootstrap: Bootstrap,
    dial_timeout: Duration,
    open_stream_timeout: Duration,
    length_prefix: bool,
    reuse: bool,
    rt: Option<Runtime>,
    conn: Option<(Endpoint, Connection)>,
}

impl QuicTransport {
    pub fn new(target: &Target, opts: &Options, bootstrap: Bootstrap) -> Result<Self> {
        let (host, port) = target.host_port()?;
        let alpn = if target.alpn.is_empty() {
            tracing::debug!("no ALPN tokens specified, using default: \"doq\"");
            vec!["doq".to_string()]
        } else {
            target.alpn.clone()
        };
        let tls = tls_config::client_config(&opts.tls, &alpn)?;
        Ok(QuicTransport {
            address: target.address.clone(),
            host: host.to_string(),
            port,
            server_name: target.tls_name()?,
            alpn,
            config: quic_config(tls, opts.pmtud)?,
            bootstrap,
            dial_timeout: opts.quic_dial_timeout,
            open_stream_timeout: opts.quic_open_stream_timeout,
            length_prefix: opts.quic_length_prefix,
            reuse: opts.reuse_conn,
            rt: None,
            conn: None,
        })
    }

    pub fn server(&self) -> &str {
        &self.address
    }

    pub fn exchange(&mut self, query: &Query, deadline: Deadline) -> Result<Vec<u8>> {
        let payload = doq_payload(query, self.length_prefix)?;

        if !self.reuse {
            self.close()?;
        }
        let rt = match &mut self.rt {
            Some(rt) => rt,
            empty => empty.insert(runtime()?),
        };

        let conn = match &self.conn {
            Some((_, conn)) => conn.clone(),
            None => {
                let addrs = self.bootstrap.resolve(&self.host, self.port)?;
                let limit = deadline.bound(self.dial_timeout, "dialing QUIC")?;
                tracing::debug!("dialing with QUIC ALPN tokens: {:?}", self.alpn);
                let (endpoint, conn) =
                    rt.block_on(dial(self.config.clone(), &addrs, &self.server_name, limit))?;
                self.conn = Some((endpoint, conn.clone()));
                conn
            }
        };

        if let Err(e) = check_keepalive(query) {
            if let Some((endpoint, conn)) = self.conn.take() {
                shutdown(rt, endpoint, conn, DOQ_PROTOCOL_ERROR);
            }
            return Err(e);
        }

        let open_timeout = self.open_stream_timeout;
        let result = rt.block_on(async {
            let limit = deadline.bound(open_timeout, "opening QUIC stream")?;
            let (mut send, mut recv) = timed(limit, "opening QUIC stream", conn.open_bi()).await?;

            let limit = deadline.remaining("sending query via QUIC")?;
            timed(limit, "sending query via QUIC", send.write_all(&payload)).await?;
            send.finish()
                .map_err(|e| Error::Quic(format!("finishing QUIC stream: {}", e)))?;

            let limit = deadline.remaining("reading reply via QUIC")?;
            timed(limit, "reading reply via QUIC", recv.read_to_end(MAX_REPLY_LEN)).await
        });

        if result.is_err() {
            self.conn = None;
        } else if !self.reuse {
            self.close()?;
        }
        unframe(result?, self.length_prefix)
    }

    pub fn close(&mut self) -> Result<()> {
        if let (Some(rt), Some((endpoint, conn))) = (&self.rt, self.conn.take()) {
            shutdown(rt, endpoint, conn, DOQ_NO_ERROR);
        }
        Ok(())
    }
}

/// The query as sent on a DoQ stream: id zeroed, optionally behind a 2-byte length.
fn doq_payload(query: &Query, length_prefix: bool) -> Result<Vec<u8>> {
    // the stream identifies the transaction, so the wire id must be zero (RFC 9250, 4.2.1)
    let mut msg = query.to_wire()?;
    wire::set_message_id(&mut msg, 0);
    if !length_prefix {
        return Ok(msg);
    }
    let mut framed = Vec::with_capacity(msg.len() + 2);
    super::write_framed(&mut framed, &msg).context("could not frame DoQ query")?;
    Ok(framed)
}

/// edns-tcp-keepalive must not be sent on a DoQ connection (RFC 9250, 5.5.2).
fn check_keepalive(query: &Query) -> Result<()> {
    if query.has_keepalive() {
        return Err(Error::protocol("EDNS0 TCP keepalive option is set"));
    }
    Ok(())
}

impl Drop for QuicTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_framing() {
        assert_eq!(unframe(vec![0, 2, 0xab, 0xcd], true).unwrap(), vec![0xab, 0xcd]);
        assert_eq!(unframe(vec![0xab, 0xcd], false).unwrap(), vec![0xab, 0xcd]);
        assert!(matches!(unframe(Vec::new(), false), Err(Error::Protocol(_))));
        assert!(matches!(unframe(vec![0], true), Err(Error::Protocol(_))));
    }

    #[test]
    fn config_without_pmtud() {
        let tls = tls_config::client_config(&Default::default(), &["doq".to_string()]).unwrap();
        assert!(quic_config(tls.clone(), false).is_ok());
        assert!(quic_config(tls, true).is_ok());
    }

    #[test]
    fn default_alpn() {
        let opts = Options {
            quic_alpn: Vec::new(),
            ..Options::default()
        };
        let target = Target::resolve("quic://127.0.0.1", &opts).unwrap();
        let transport = QuicTransport::new(&target, &opts, Bootstrap::system()).unwrap();
        assert_eq!(transport.alpn, vec!["doq"]);
        assert_eq!(transport.server(), "127.0.0.1:853");
    }

    fn query(opts: &Options) -> Query {
        crate::query::build_queries("example.com", &[toluol_proto::RecordType::A], opts)
            .unwrap()
            .remove(0)
    }

    #[test]
    fn wire_id_is_zero() {
        let opts = Options {
            id: Some(0x1234),
            ..Options::default()
        };
        let query = query(&opts);
        assert_eq!(query.id, 0x1234);

        let plain = doq_payload(&query, false).unwrap();
        assert_eq!(wire::message_id(&plain), Some(0));
        assert_eq!(plain.len(), query.to_wire().unwrap().len());

        let framed = doq_payload(&query, true).unwrap();
        assert_eq!(usize::from(u16::from_be_bytes([framed[0], framed[1]])), plain.len());
        assert_eq!(&framed[2..], &plain[..]);
    }

    #[test]
    fn keepalive_is_refused() {
        assert!(check_keepalive(&query(&Options::default())).is_ok());

        let opts = Options {
            keepalive: true,
            ..Options::default()
        };
        assert!(matches!(check_keepalive(&query(&opts)), Err(Error::Protocol(_))));
    }
}
