//! Unencrypted DNS over UDP and TCP.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use crate::bootstrap::Bootstrap;
use crate::config::Options;
use crate::deadline::Deadline;
use crate::error::{Error, IoContext, Result};
use crate::query::Query;
use crate::target::Target;
use crate::wire;

use super::{arm_timeouts, connect_tcp, read_framed, write_framed, WRITE_TIMEOUT};

/// Plain DNS: UDP with a one-shot TCP retry on truncation, or TCP only.
pub struct PlainTransport {
    address: String,
    bootstrap: Bootstrap,
    bufsize: usize,
    tcp: bool,
    dial_timeout: std::time::Duration,
}

impl PlainTransport {
    pub fn new(target: &Target, opts: &Options, bootstrap: Bootstrap, tcp: bool) -> Result<Self> {
        target.host_port()?;
        Ok(PlainTransport {
            address: target.address.clone(),
            bootstrap,
            bufsize: (opts.udp_buffer as usize).max(512),
            tcp,
            dial_timeout: opts.timeout,
        })
    }

    pub fn server(&self) -> &str {
        &self.address
    }

    fn resolve(&self) -> Result<Vec<SocketAddr>> {
        let (host, port) = crate::target::split_host_port(&self.address)
            .ok_or_else(|| Error::spec(&self.address, "expected host:port"))?;
        self.bootstrap.resolve(host, port)
    }

    pub fn exchange(&mut self, query: &Query, deadline: Deadline) -> Result<Vec<u8>> {
        let msg = query.to_wire()?;
        let addrs = self.resolve()?;

        if self.tcp {
            return tcp_exchange(&addrs, &msg, self.dial_timeout, deadline);
        }

        let reply = udp_exchange(addrs[0], &msg, self.bufsize, deadline)?;
        if wire::is_truncated(&reply) {
            tracing::debug!("reply from {} is truncated, retrying via TCP", addrs[0]);
            return tcp_exchange(&addrs, &msg, self.dial_timeout, deadline);
        }
        Ok(reply)
    }
}

/// Sends `msg` to `server` over UDP and waits for one reply of at most `bufsize` bytes.
///
/// Multicast destinations are answered from a unicast address, so the socket stays unconnected
/// for them and the first datagram from anyone is taken as the reply.
pub fn udp_exchange(
    server: SocketAddr,
    msg: &[u8],
    bufsize: usize,
    deadline: Deadline,
) -> Result<Vec<u8>> {
    let local: SocketAddr = match server {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(local).context("could not bind UDP socket")?;
    socket
        .set_write_timeout(Some(deadline.bound(WRITE_TIMEOUT, "sending UDP query")?))
        .context("could not set UDP socket write timeout")?;
    socket
        .set_read_timeout(Some(deadline.remaining("waiting for UDP reply")?))
        .context("could not set UDP socket read timeout")?;

    let mut buf = vec![0; bufsize.max(512)];
    let len = if server.ip().is_multicast() {
        tracing::trace!("sending multicast query to {}", server);
        socket
            .send_to(msg, server)
            .context(format!("could not send query to {} via UDP", server))?;
        let (len, from) = socket
            .recv_from(&mut buf)
            .context(format!("no reply to multicast query to {}", server))?;
        tracing::trace!("multicast reply from {}", from);
        len
    } else {
        socket
            .connect(server)
            .context(format!("could not connect to {} via UDP", server))?;
        socket
            .send(msg)
            .context(format!("could not send query to {} via UDP", server))?;
        socket
            .recv(&mut buf)
            .context(format!("could not receive reply from {} via UDP", server))?
    };
    buf.truncate(len);
    tracing::trace!("received {} bytes via UDP", len);
    Ok(buf)
}

/// Sends `msg` over a fresh TCP connection to the first reachable address.
pub fn tcp_exchange(
    addrs: &[SocketAddr],
    msg: &[u8],
    dial_timeout: std::time::Duration,
    deadline: Deadline,
) -> Result<Vec<u8>> {
    let mut stream = connect_tcp(addrs, dial_timeout, deadline)?;
    arm_timeouts(&stream, deadline)?;
    write_framed(&mut stream, msg).context("could not send query via TCP")?;
    let reply = read_framed(&mut stream).context("could not read reply via TCP")?;
    tracing::trace!("received {} bytes via TCP", reply.len());
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    use toluol_proto::{Class, RecordType};

    use super::*;
    use crate::query::parse_name;

    fn answer(query: &[u8], truncated: bool) -> Vec<u8> {
        let mut reply = query.to_vec();
        reply[2] = 0x81 | if truncated { 0x02 } else { 0 };
        reply[3] = 0x80;
        if !truncated {
            reply[7] = 1;
            reply.extend_from_slice(&[0xc0, 12, 0, 1, 0, 1, 0, 0, 0, 60, 0, 4, 192, 0, 2, 53]);
        }
        reply
    }

    fn query() -> Query {
        Query::new(parse_name("example.com").unwrap(), RecordType::A, Class::IN)
    }

    #[test]
    fn truncation_falls_back_to_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let udp = UdpSocket::bind(addr).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        thread::spawn(move || {
            let mut buf = [0u8; 512];
            let (len, peer) = udp.recv_from(&mut buf).unwrap();
            udp.send_to(&answer(&buf[..len], true), peer).unwrap();
            tx.send(buf[..len].to_vec()).unwrap();
        });
        let (tcp_tx, tcp_rx) = std::sync::mpsc::channel();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let msg = read_framed(&mut stream).unwrap();
            write_framed(&mut stream, &answer(&msg, false)).unwrap();
            tcp_tx.send(msg).unwrap();
        });

        let target = Target::resolve(&addr.to_string(), &Options::default()).unwrap();
        let mut transport =
            PlainTransport::new(&target, &Options::default(), Bootstrap::system(), false).unwrap();
        let query = query();
        let reply = transport
            .exchange(&query, Deadline::after(Duration::from_secs(5)))
            .unwrap();

        assert!(!wire::is_truncated(&reply));
        assert_eq!(wire::message_id(&reply), Some(query.id));
        let udp_bytes = rx.recv().unwrap();
        let tcp_bytes = tcp_rx.recv().unwrap();
        assert_eq!(udp_bytes, tcp_bytes);
        assert_eq!(udp_bytes, query.to_wire().unwrap());
    }

    #[test]
    fn tcp_only() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let msg = read_framed(&mut stream).unwrap();
            write_framed(&mut stream, &answer(&msg, false)).unwrap();
        });

        let target = Target::resolve(&format!("tcp://{}", addr), &Options::default()).unwrap();
        let mut transport =
            PlainTransport::new(&target, &Options::default(), Bootstrap::system(), true).unwrap();
        let reply = transport
            .exchange(&query(), Deadline::after(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(reply[7], 1);
    }

    #[test]
    fn silent_server_times_out() {
        let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = udp.local_addr().unwrap();
        let msg = query().to_wire().unwrap();
        let result = udp_exchange(addr, &msg, 512, Deadline::after(Duration::from_millis(200)));
        assert!(matches!(result, Err(Error::Timeout(_))));
        drop(udp);
    }
}
