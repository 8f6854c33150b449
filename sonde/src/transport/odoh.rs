//! Oblivious DNS over HTTPS (RFC 9230).
//!
//! The target's key configuration is fetched for every query; the encrypted query is posted to
//! the proxy, which forwards it to the target named in its query parameters.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use odoh_rs::{
    ObliviousDoHConfigContents, ObliviousDoHConfigs, ObliviousDoHMessage,
    ObliviousDoHMessagePlaintext,
};
use rustls::ClientConfig;
use url::Url;

use crate::bootstrap::Bootstrap;
use crate::config::Options;
use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::query::Query;
use crate::target::Target;
use crate::tls_config;

use super::http::{agent, http_error, read_body};

pub(crate) const ODOH_MESSAGE: &str = "application/oblivious-dns-message";
const CONFIGS_PATH: &str = "/.well-known/odohconfigs";
const DEFAULT_PROXY_PATH: &str = "/proxy";

fn parse_url(s: &str) -> Result<Url> {
    Url::parse(s).map_err(|e| Error::spec(s, e.to_string()))
}

fn odoh_error(what: &str, e: odoh_rs::Error) -> Error {
    Error::protocol(format!("{}: {}", what, e))
}

/// The URL of the target's key configurations.
fn configs_url(target: &Url) -> Url {
    let mut url = target.clone();
    url.set_path(CONFIGS_PATH);
    url.set_query(None);
    url
}

/// The proxy URL, pointing the proxy at `target` unless the proxy URL already names one.
fn proxy_url(proxy: &str, target: &Url) -> Result<Url> {
    let mut url = parse_url(proxy)?;
    if url.path().is_empty() || url.path() == "/" {
        url.set_path(DEFAULT_PROXY_PATH);
    }

    let target_host = match target.port() {
        Some(port) => format!("{}:{}", target.host_str().unwrap_or_default(), port),
        None => target.host_str().unwrap_or_default().to_string(),
    };
    let has = |key: &str| url.query_pairs().any(|(k, _)| k == key);
    let (has_host, has_path) = (has("targethost"), has("targetpath"));
    if !has_host || !has_path {
        let mut pairs = url.query_pairs_mut();
        if !has_host {
            pairs.append_pair("targethost", &target_host);
        }
        if !has_path {
            pairs.append_pair("targetpath", target.path());
        }
    }
    Ok(url)
}

pub struct OdohTransport {
    target: Url,
    proxy: Url,
    address: String,
    tls: Arc<ClientConfig>,
    bootstrap: Bootstrap,
    user_agent: Option<String>,
    connect_timeout: Duration,
}

impl OdohTransport {
    pub fn new(target: &Target, proxy: &str, opts: &Options, bootstrap: Bootstrap) -> Result<Self> {
        let target_url = parse_url(&target.address)?;
        Ok(OdohTransport {
            proxy: proxy_url(proxy, &target_url)?,
            target: target_url,
            address: target.address.clone(),
            tls: tls_config::client_config(&opts.tls, &target.alpn)?,
            bootstrap,
            user_agent: opts.http_user_agent.clone(),
            connect_timeout: opts.handshake_timeout,
        })
    }

    pub fn server(&self) -> &str {
        &self.address
    }

    fn fetch_config(&self, agent: &ureq::Agent, deadline: Deadline) -> Result<ObliviousDoHConfigContents> {
        let url = configs_url(&self.target);
        let response = agent
            .get(url.as_str())
            .timeout(deadline.remaining("fetching ODoH configs")?)
            .call()
            .map_err(|e| http_error(url.as_str(), e))?;
        let mut body = Bytes::from(read_body(url.as_str(), response)?);

        let configs: ObliviousDoHConfigs =
            odoh_rs::parse(&mut body).map_err(|e| odoh_error("unmarshal target configs", e))?;
        let configs = configs.supported();
        tracing::debug!("retrieved {} ODoH configs", configs.len());
        configs
            .into_iter()
            .next()
            .map(Into::into)
            .ok_or_else(|| Error::protocol("target provided no valid ODoH configs"))
    }

    pub fn exchange(&mut self, query: &Query, deadline: Deadline) -> Result<Vec<u8>> {
        let agent = agent(
            self.tls.clone(),
            self.bootstrap.clone(),
            self.user_agent.as_deref(),
            self.connect_timeout,
        );
        let config = self.fetch_config(&agent, deadline)?;

        let plaintext = ObliviousDoHMessagePlaintext::new(&query.to_wire()?, 0);
        let (encrypted, secret) = odoh_rs::encrypt_query(&plaintext, &config, &mut rand::thread_rng())
            .map_err(|e| odoh_error("encrypt query", e))?;
        let body = odoh_rs::compose(&encrypted)
            .map_err(|e| odoh_error("compose query", e))?
            .freeze();

        tracing::debug!("POST {}", self.proxy);
        let response = agent
            .post(self.proxy.as_str())
            .set("Content-Type", ODOH_MESSAGE)
            .set("Accept", ODOH_MESSAGE)
            .timeout(deadline.remaining("waiting for ODoH reply")?)
            .send_bytes(&body)
            .map_err(|e| http_error(self.proxy.as_str(), e))?;

        let content_type = response.content_type().to_string();
        if content_type != ODOH_MESSAGE {
            return Err(Error::protocol(format!(
                "{} responded with an invalid Content-Type header {}, expected {}",
                self.proxy, content_type, ODOH_MESSAGE
            )));
        }

        let mut body = Bytes::from(read_body(self.proxy.as_str(), response)?);
        let encrypted: ObliviousDoHMessage =
            odoh_rs::parse(&mut body).map_err(|e| odoh_error("odoh unmarshal", e))?;
        let decrypted = odoh_rs::decrypt_response(&plaintext, &encrypted, secret)
            .map_err(|e| odoh_error("open answer", e))?;
        Ok(decrypted.into_msg().to_vec())
    }
}
