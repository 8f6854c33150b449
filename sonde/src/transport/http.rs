//! DNS over HTTPS (RFC 8484), over HTTP/1.1 or HTTP/3.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes};
use data_encoding::BASE64URL_NOPAD;
use quinn::Endpoint;
use rustls::ClientConfig;
use tokio::runtime::Runtime;

use crate::bootstrap::Bootstrap;
use crate::config::{HttpMethod, Options};
use crate::deadline::Deadline;
use crate::error::{Error, IoContext, Result};
use crate::query::Query;
use crate::target::Target;
use crate::tls_config;

use super::quic::{self, timed};

pub(crate) const DNS_MESSAGE: &str = "application/dns-message";

/// Upper bound for a response body.
pub(crate) const MAX_BODY_LEN: u64 = 65535;

type H3SendRequest = h3::client::SendRequest<h3_quinn::OpenStreams, Bytes>;

/// Builds a blocking HTTP agent that resolves hostnames through `bootstrap`.
pub(crate) fn agent(
    tls: Arc<ClientConfig>,
    bootstrap: Bootstrap,
    user_agent: Option<&str>,
    connect_timeout: Duration,
) -> ureq::Agent {
    let mut builder = ureq::AgentBuilder::new()
        .tls_config(tls)
        .timeout_connect(connect_timeout)
        .resolver(move |netloc: &str| bootstrap.resolve_netloc(netloc));
    if let Some(user_agent) = user_agent {
        tracing::debug!("setting User-Agent to {}", user_agent);
        builder = builder.user_agent(user_agent);
    }
    builder.build()
}

/// Maps an HTTP client error, keeping the status code of error responses.
pub(crate) fn http_error(url: &str, e: ureq::Error) -> Error {
    let reason = match e {
        ureq::Error::Status(code, _) => format!("got status code {}", code),
        ureq::Error::Transport(t) => t.to_string(),
    };
    Error::Http {
        url: url.to_string(),
        reason,
    }
}

/// Checks the status of a response and reads its body.
pub(crate) fn read_body(url: &str, response: ureq::Response) -> Result<Vec<u8>> {
    if response.status() != 200 {
        return Err(Error::Http {
            url: url.to_string(),
            reason: format!("got status code {}", response.status()),
        });
    }
    let mut body = Vec::new();
    response
        .into_reader()
        .take(MAX_BODY_LEN)
        .read_to_end(&mut body)
        .context(format!("could not read the HTTP(S) response from {}", url))?;
    Ok(body)
}

/// A live HTTP/3 session.
struct H3Session {
    endpoint: Endpoint,
    send_request: H3SendRequest,
}

enum Client {
    Http1(Option<ureq::Agent>),
    Http3 {
        config: quinn::ClientConfig,
        rt: Option<Runtime>,
        session: Option<H3Session>,
    },
}

pub struct HttpTransport {
    url: String,
    host: String,
    port: u16,
    server_name: String,
    method: HttpMethod,
    user_agent: Option<String>,
    tls: Arc<ClientConfig>,
    bootstrap: Bootstrap,
    handshake_timeout: Duration,
    reuse: bool,
    client: Client,
}

impl HttpTransport {
    pub fn new(target: &Target, opts: &Options, bootstrap: Bootstrap) -> Result<Self> {
        let url = url::Url::parse(&target.address)
            .map_err(|e| Error::spec(&target.address, e.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| Error::spec(&target.address, "missing host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::spec(&target.address, "missing port"))?;

        let client = if opts.http3 {
            if url.scheme() != "https" {
                return Err(Error::config("HTTP/3 requires an https target"));
            }
            tracing::debug!("using HTTP/3");
            let tls = tls_config::client_config(&opts.tls, &["h3".to_string()])?;
            Client::Http3 {
                config: quic::quic_config(tls, opts.pmtud)?,
                rt: None,
                session: None,
            }
        } else {
            Client::Http1(None)
        };

        Ok(HttpTransport {
            url: target.address.clone(),
            host,
            port,
            server_name: target.tls_name()?,
            method: opts.http_method,
            user_agent: opts.http_user_agent.clone(),
            tls: tls_config::client_config(&opts.tls, &target.alpn)?,
            bootstrap,
            handshake_timeout: opts.handshake_timeout,
            reuse: opts.reuse_conn,
            client,
        })
    }

    pub fn server(&self) -> &str {
        &self.url
    }

    pub fn exchange(&mut self, query: &Query, deadline: Deadline) -> Result<Vec<u8>> {
        let msg = query.to_wire()?;
        if matches!(self.client, Client::Http3 { .. }) {
            self.exchange_http3(&msg, deadline)
        } else {
            self.exchange_http1(&msg, deadline)
        }
    }

    fn exchange_http1(&mut self, msg: &[u8], deadline: Deadline) -> Result<Vec<u8>> {
        let fresh = || {
            agent(
                self.tls.clone(),
                self.bootstrap.clone(),
                self.user_agent.as_deref(),
                self.handshake_timeout,
            )
        };
        let agent = match &self.client {
            Client::Http1(Some(agent)) if self.reuse => agent.clone(),
            _ => fresh(),
        };
        if self.reuse {
            self.client = Client::Http1(Some(agent.clone()));
        }

        let timeout = deadline.remaining("waiting for HTTP reply")?;
        tracing::debug!("sending {:?} request to {}", self.method, self.url);
        let response = match self.method {
            HttpMethod::Get => agent
                .get(&self.url)
                .set("Accept", DNS_MESSAGE)
                .query("dns", &BASE64URL_NOPAD.encode(msg))
                .timeout(timeout)
                .call(),
            HttpMethod::Post => agent
                .post(&self.url)
                .set("Accept", DNS_MESSAGE)
                .set("Content-Type", DNS_MESSAGE)
                .timeout(timeout)
                .send_bytes(msg),
        }
        .map_err(|e| http_error(&self.url, e))?;

        read_body(&self.url, response)
    }

    fn request(&self, msg: &[u8]) -> Result<(http::Request<()>, Option<Bytes>)> {
        let mut builder = http::Request::builder().header("accept", DNS_MESSAGE);
        if let Some(user_agent) = &self.user_agent {
            builder = builder.header("user-agent", user_agent.as_str());
        }
        let (builder, body) = match self.method {
            HttpMethod::Get => {
                let mut url = url::Url::parse(&self.url)
                    .map_err(|e| Error::spec(&self.url, e.to_string()))?;
                url.query_pairs_mut()
                    .append_pair("dns", &BASE64URL_NOPAD.encode(msg));
                (builder.method("GET").uri(url.as_str()), None)
            }
            HttpMethod::Post => (
                builder
                    .method("POST")
                    .uri(self.url.as_str())
                    .header("content-type", DNS_MESSAGE),
                Some(Bytes::copy_from_slice(msg)),
            ),
        };
        let request = builder.body(()).map_err(|e| Error::Http {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        Ok((request, body))
    }

    fn exchange_http3(&mut self, msg: &[u8], deadline: Deadline) -> Result<Vec<u8>> {
        let (request, body) = self.request(msg)?;
        if !self.reuse {
            self.close_session();
        }

        let addrs = match &self.client {
            Client::Http3 { session: None, .. } => Some(self.bootstrap.resolve(&self.host, self.port)?),
            _ => None,
        };
        let Client::Http3 {
            config,
            rt,
            session,
        } = &mut self.client
        else {
            return Err(Error::config("HTTP/3 session on an HTTP/1 transport"));
        };
        let rt = match rt {
            Some(rt) => rt,
            empty => empty.insert(quic::runtime()?),
        };

        let url = self.url.as_str();
        let server_name = self.server_name.as_str();
        let handshake_timeout = self.handshake_timeout;
        let result = rt.block_on(async {
            let mut send_request = if let Some(live) = session.as_ref() {
                live.send_request.clone()
            } else {
                let addrs = addrs.unwrap_or_default();
                let limit = deadline.bound(handshake_timeout, "dialing HTTP/3")?;
                let (endpoint, conn) = quic::dial(config.clone(), &addrs, server_name, limit).await?;
                let (mut driver, send_request) = timed(
                    limit,
                    "HTTP/3 handshake",
                    h3::client::new(h3_quinn::Connection::new(conn)),
                )
                .await?;
                tokio::spawn(async move {
                    let _ = std::future::poll_fn(|cx| driver.poll_close(cx)).await;
                });
                *session = Some(H3Session {
                    endpoint,
                    send_request: send_request.clone(),
                });
                send_request
            };

            let limit = deadline.remaining("sending HTTP/3 request")?;
            let mut stream = timed(limit, "sending HTTP/3 request", send_request.send_request(request)).await?;
            if let Some(body) = body {
                timed(limit, "sending HTTP/3 body", stream.send_data(body)).await?;
            }
            timed(limit, "finishing HTTP/3 request", stream.finish()).await?;

            let limit = deadline.remaining("waiting for HTTP/3 response")?;
            let response = timed(limit, "waiting for HTTP/3 response", stream.recv_response()).await?;
            if response.status() != http::StatusCode::OK {
                return Err(Error::Http {
                    url: url.to_string(),
                    reason: format!("got status code {}", response.status().as_u16()),
                });
            }

            let mut reply = Vec::new();
            while let Some(mut chunk) = timed(
                deadline.remaining("reading HTTP/3 response")?,
                "reading HTTP/3 response",
                stream.recv_data(),
            )
            .await?
            {
                reply.extend_from_slice(chunk.chunk());
                chunk.advance(chunk.remaining());
                if reply.len() as u64 > MAX_BODY_LEN {
                    return Err(Error::protocol("HTTP/3 response too large"));
                }
            }
            Ok(reply)
        });

        if result.is_err() || !self.reuse {
            self.close_session();
        }
        result
    }

    fn close_session(&mut self) {
        if let Client::Http3 {
            rt: Some(rt),
            session,
            ..
        } = &mut self.client
        {
            if let Some(H3Session { endpoint, send_request }) = session.take() {
                drop(send_request);
                endpoint.close(quinn::VarInt::from_u32(0), b"");
                rt.block_on(async {
                    let _ = tokio::time::timeout(Duration::from_millis(100), endpoint.wait_idle()).await;
                });
            }
        }
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        self.close_session();
    }
}
