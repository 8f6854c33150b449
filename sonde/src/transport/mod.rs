//! The wire transports, i.e. actually sending queries and receiving answers.
//!
//! Every transport owns at most one connection or session. With connection reuse enabled it is
//! created on the first exchange and kept until [`Transport::close`]; otherwise every exchange
//! starts from scratch.

use std::io::{self, Cursor, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};
use toluol_proto::Message;

use crate::bootstrap::Bootstrap;
use crate::config::Options;
use crate::deadline::Deadline;
use crate::error::{Error, IoContext, Result};
use crate::query::Query;
use crate::target::{Target, TransportKind};

pub mod dnscrypt;
pub mod http;
pub mod odoh;
pub mod plain;
pub mod quic;
pub mod tls;

pub use dnscrypt::DnsCryptTransport;
pub use http::HttpTransport;
pub use odoh::OdohTransport;
pub use plain::PlainTransport;
pub use quic::QuicTransport;
pub use tls::TlsTransport;

/// Bound for single socket writes.
pub(crate) const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// A decoded reply together with where and how fast it came.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub message: Message,
    /// The server that answered, as given in the target.
    pub server: String,
    pub rtt: Duration,
    /// Size of the reply on the wire.
    pub len: usize,
}

/// One of the supported transports.
pub enum Transport {
    Plain(PlainTransport),
    Tls(TlsTransport),
    Http(HttpTransport),
    Quic(QuicTransport),
    DnsCrypt(DnsCryptTransport),
    Odoh(OdohTransport),
}

impl Transport {
    /// Creates the transport for `target`. No connection is made yet.
    pub fn new(target: &Target, opts: &Options) -> Result<Self> {
        let bootstrap = Bootstrap::from_options(opts)?;
        Ok(match target.kind {
            TransportKind::Plain => {
                tracing::debug!("using UDP with TCP fallback: {}", target.address);
                Transport::Plain(PlainTransport::new(target, opts, bootstrap, opts.prefer_tcp)?)
            }
            TransportKind::Tcp => {
                tracing::debug!("using TCP transport: {}", target.address);
                Transport::Plain(PlainTransport::new(target, opts, bootstrap, true)?)
            }
            TransportKind::Tls => {
                tracing::debug!("using TLS transport: {}", target.address);
                Transport::Tls(TlsTransport::new(target, opts, bootstrap)?)
            }
            TransportKind::Http => match &opts.odoh_proxy {
                Some(proxy) => {
                    tracing::debug!("using ODoH transport with target {} proxy {}", target.address, proxy);
                    Transport::Odoh(OdohTransport::new(target, proxy, opts, bootstrap)?)
                }
                None => {
                    tracing::debug!("using HTTP(S) transport: {}", target.address);
                    Transport::Http(HttpTransport::new(target, opts, bootstrap)?)
                }
            },
            TransportKind::Quic => {
                tracing::debug!("using QUIC transport: {}", target.address);
                Transport::Quic(QuicTransport::new(target, opts, bootstrap)?)
            }
            TransportKind::DnsCrypt => {
                tracing::debug!("using DNSCrypt transport: {}", target.address);
                Transport::DnsCrypt(DnsCryptTransport::new(target, opts, bootstrap)?)
            }
        })
    }

    /// Whether replies from this transport carry meaningful transaction ids.
    pub fn checks_id(&self) -> bool {
        !matches!(self, Transport::Quic(_))
    }

    /// Sends `query` and decodes the reply.
    pub fn exchange(&mut self, query: &Query, deadline: Deadline) -> Result<Reply> {
        let before = Instant::now();
        let (raw, server) = match self {
            Transport::Plain(t) => (t.exchange(query, deadline)?, t.server()),
            Transport::Tls(t) => (t.exchange(query, deadline)?, t.server()),
            Transport::Http(t) => (t.exchange(query, deadline)?, t.server()),
            Transport::Quic(t) => (t.exchange(query, deadline)?, t.server()),
            Transport::DnsCrypt(t) => (t.exchange(query, deadline)?, t.server()),
            Transport::Odoh(t) => (t.exchange(query, deadline)?, t.server()),
        };
        let rtt = before.elapsed();

        let message = Message::parse(&mut Cursor::new(&raw[..]))?;
        Ok(Reply {
            message,
            server: server.to_string(),
            rtt,
            len: raw.len(),
        })
    }

    /// Releases any held connection. Safe to call at any time.
    pub fn close(&mut self) -> Result<()> {
        match self {
            Transport::Plain(_) | Transport::Http(_) | Transport::Odoh(_) => Ok(()),
            Transport::Tls(t) => t.close(),
            Transport::Quic(t) => t.close(),
            Transport::DnsCrypt(t) => t.close(),
        }
    }
}

/// Connects to the first reachable address, bounded by `step` and the deadline.
pub(crate) fn connect_tcp(
    addrs: &[SocketAddr],
    step: Duration,
    deadline: Deadline,
) -> Result<TcpStream> {
    let mut last_err = None;
    for addr in addrs {
        let timeout = deadline.bound(step, "connecting")?;
        match TcpStream::connect_timeout(addr, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true).context("could not set TCP_NODELAY")?;
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!("could not connect to {} via TCP: {}", addr, e);
                last_err = Some((addr, e));
            }
        }
    }
    match last_err {
        Some((addr, e)) => Err(e).context(format!("could not connect to {} via TCP", addr)),
        None => Err(Error::Unresolvable("no address to connect to".to_string())),
    }
}

/// Arms read and write timeouts on `stream` for the next I/O step.
pub(crate) fn arm_timeouts(stream: &TcpStream, deadline: Deadline) -> Result<()> {
    stream
        .set_write_timeout(Some(deadline.bound(WRITE_TIMEOUT, "writing")?))
        .context("could not set TCP stream write timeout")?;
    stream
        .set_read_timeout(Some(deadline.remaining("reading")?))
        .context("could not set TCP stream read timeout")?;
    Ok(())
}

/// Writes a message with the two-byte length prefix used on stream transports (RFC 1035,
/// Section 4.2.2).
pub(crate) fn write_framed(stream: &mut impl Write, msg: &[u8]) -> io::Result<()> {
    let len = u16::try_from(msg.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "message too long for TCP"))?;
    let mut buf = Vec::with_capacity(msg.len() + 2);
    buf.write_u16::<NetworkEndian>(len)?;
    buf.extend_from_slice(msg);
    stream.write_all(&buf)?;
    stream.flush()
}

/// Reads one length-prefixed message. Stops as soon as the announced length is read instead of
/// waiting for EOF.
pub(crate) fn read_framed(stream: &mut impl Read) -> io::Result<Vec<u8>> {
    let len = stream.read_u16::<NetworkEndian>()?;
    let mut buf = vec![0; len as usize];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}
