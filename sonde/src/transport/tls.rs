//! DNS over TLS (RFC 7858).

use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use rustls::{ClientConfig, ClientConnection, StreamOwned};

use crate::bootstrap::Bootstrap;
use crate::config::Options;
use crate::deadline::Deadline;
use crate::error::{IoContext, Result};
use crate::query::Query;
use crate::target::Target;
use crate::tls_config;

use super::{arm_timeouts, connect_tcp, read_framed, write_framed};

type TlsStream = StreamOwned<ClientConnection, TcpStream>;

pub struct TlsTransport {
    address: String,
    host: String,
    port: u16,
    server_name: String,
    config: Arc<ClientConfig>,
    bootstrap: Bootstrap,
    handshake_timeout: Duration,
    reuse: bool,
    conn: Option<TlsStream>,
}

impl TlsTransport {
    pub fn new(target: &Target, opts: &Options, bootstrap: Bootstrap) -> Result<Self> {
        let (host, port) = target.host_port()?;
        Ok(TlsTransport {
            address: target.address.clone(),
            host: host.to_string(),
            port,
            server_name: target.tls_name()?,
            config: tls_config::client_config(&opts.tls, &target.alpn)?,
            bootstrap,
            handshake_timeout: opts.handshake_timeout,
            reuse: opts.reuse_conn,
            conn: None,
        })
    }

    pub fn server(&self) -> &str {
        &self.address
    }

    /// Opens a TCP connection and runs the TLS handshake, bounded by the handshake timeout.
    pub(crate) fn connect(
        config: Arc<ClientConfig>,
        server_name: &str,
        addrs: &[std::net::SocketAddr],
        handshake_timeout: Duration,
        deadline: Deadline,
    ) -> Result<TlsStream> {
        let handshake = deadline.nested(handshake_timeout);
        let sock = connect_tcp(addrs, handshake_timeout, handshake)?;
        let conn = ClientConnection::new(config, tls_config::server_name(server_name)?)?;
        let mut stream = StreamOwned::new(conn, sock);

        arm_timeouts(&stream.sock, handshake)?;
        while stream.conn.is_handshaking() {
            stream
                .conn
                .complete_io(&mut stream.sock)
                .context(format!("TLS handshake with {} failed", server_name))?;
        }
        tracing::debug!(
            "TLS handshake with {} done, {:?}, ALPN {:?}",
            server_name,
            stream.conn.protocol_version(),
            stream
                .conn
                .alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).into_owned())
        );
        Ok(stream)
    }

    pub fn exchange(&mut self, query: &Query, deadline: Deadline) -> Result<Vec<u8>> {
        let msg = query.to_wire()?;

        if !self.reuse {
            self.close()?;
        }
        let stream = match &mut self.conn {
            Some(stream) => stream,
            empty => {
                let addrs = self.bootstrap.resolve(&self.host, self.port)?;
                let stream = Self::connect(
                    self.config.clone(),
                    &self.server_name,
                    &addrs,
                    self.handshake_timeout,
                    deadline,
                )?;
                empty.insert(stream)
            }
        };

        arm_timeouts(&stream.sock, deadline)?;
        let result = write_framed(stream, &msg)
            .context("could not send query via TLS")
            .and_then(|_| read_framed(stream).context("could not read reply via TLS"));
        if result.is_err() || !self.reuse {
            // a broken or one-shot connection is not kept around
            self.close()?;
        }
        result
    }

    pub fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.conn.take() {
            stream.conn.send_close_notify();
            // the peer may already be gone, a failed close_notify is of no interest
            let _ = stream.conn.complete_io(&mut stream.sock);
        }
        Ok(())
    }
}

impl Drop for TlsTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
