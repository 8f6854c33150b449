//! Iterative resolution, starting at the root servers and following delegations.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use lazy_static::lazy_static;
use toluol_proto::{Message, Name, NonOptRecord, RecordType};

use crate::bootstrap::Bootstrap;
use crate::config::{AddressFamily, Options};
use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::exchange::exchange_queries;
use crate::probe;
use crate::query::{build_queries, Query};
use crate::target::Target;
use crate::tls_config;
use crate::transport::http::{agent, http_error, read_body};
use crate::transport::{Reply, Transport};

/// Bound for one server's reply, so that a dead server leaves time for the others.
const SERVER_TIMEOUT: Duration = Duration::from_secs(3);

/// Where the current root zone servers are published.
pub const ROOT_HINTS_URL: &str = "https://www.internic.net/domain/named.root";

lazy_static! {
    /// IPv4 addresses of the root servers ({a,b,c,d,e,f,g,h,i,j,k,l,m}.root-servers.net).
    static ref ROOT_IPV4: Vec<IpAddr> = [
        Ipv4Addr::new(198, 41, 0, 4),
        Ipv4Addr::new(170, 247, 170, 2),
        Ipv4Addr::new(192, 33, 4, 12),
        Ipv4Addr::new(199, 7, 91, 13),
        Ipv4Addr::new(192, 203, 230, 10),
        Ipv4Addr::new(192, 5, 5, 241),
        Ipv4Addr::new(192, 112, 36, 4),
        Ipv4Addr::new(198, 97, 190, 53),
        Ipv4Addr::new(192, 36, 148, 17),
        Ipv4Addr::new(192, 58, 128, 30),
        Ipv4Addr::new(193, 0, 14, 129),
        Ipv4Addr::new(199, 7, 83, 42),
        Ipv4Addr::new(202, 12, 27, 33),
    ]
    .into_iter()
    .map(IpAddr::V4)
    .collect();

    /// IPv6 addresses of the root servers ({a,b,c,d,e,f,g,h,i,j,k,l,m}.root-servers.net).
    static ref ROOT_IPV6: Vec<IpAddr> = [
        Ipv6Addr::new(0x2001, 0x503, 0xba3e, 0, 0, 0, 0x2, 0x30),
        Ipv6Addr::new(0x2801, 0x1b8, 0x10, 0, 0, 0, 0, 0xb),
        Ipv6Addr::new(0x2001, 0x500, 0x2, 0, 0, 0, 0, 0xc),
        Ipv6Addr::new(0x2001, 0x500, 0x2d, 0, 0, 0, 0, 0xd),
        Ipv6Addr::new(0x2001, 0x500, 0xa8, 0, 0, 0, 0, 0xe),
        Ipv6Addr::new(0x2001, 0x500, 0x2f, 0, 0, 0, 0, 0xf),
        Ipv6Addr::new(0x2001, 0x500, 0x12, 0, 0, 0, 0, 0xd0d),
        Ipv6Addr::new(0x2001, 0x500, 0x1, 0, 0, 0, 0, 0x53),
        Ipv6Addr::new(0x2001, 0x7fe, 0, 0, 0, 0, 0, 0x53),
        Ipv6Addr::new(0x2001, 0x503, 0xc27, 0, 0, 0, 0x2, 0x30),
        Ipv6Addr::new(0x2001, 0x7fd, 0, 0, 0, 0, 0, 0x1),
        Ipv6Addr::new(0x2001, 0x500, 0x9f, 0, 0, 0, 0, 0x42),
        Ipv6Addr::new(0x2001, 0xdc3, 0, 0, 0, 0, 0, 0x35),
    ]
    .into_iter()
    .map(IpAddr::V6)
    .collect();
}

/// Extracts the root server addresses from a `named.root` style zone file.
///
/// Returns the IPv4 and IPv6 addresses, in file order.
pub fn parse_root_hints(text: &str) -> (Vec<IpAddr>, Vec<IpAddr>) {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    for line in text.lines() {
        let line = line.split(';').next().unwrap_or_default();
        let fields: Vec<_> = line.split_whitespace().collect();
        if fields.len() < 3 {
            continue;
        }
        let (rtype, value) = (fields[fields.len() - 2], fields[fields.len() - 1]);
        match (rtype.to_ascii_uppercase().as_str(), value.parse::<IpAddr>()) {
            ("A", Ok(ip @ IpAddr::V4(_))) => v4.push(ip),
            ("AAAA", Ok(ip @ IpAddr::V6(_))) => v6.push(ip),
            _ => {}
        }
    }
    (v4, v6)
}

/// Downloads the current root hints.
pub fn fetch_root_hints(opts: &Options) -> Result<(Vec<IpAddr>, Vec<IpAddr>)> {
    let agent = agent(
        tls_config::client_config(&opts.tls, &[])?,
        Bootstrap::from_options(opts)?,
        opts.http_user_agent.as_deref(),
        opts.handshake_timeout,
    );
    let response = agent
        .get(ROOT_HINTS_URL)
        .timeout(opts.timeout)
        .call()
        .map_err(|e| http_error(ROOT_HINTS_URL, e))?;
    let body = read_body(ROOT_HINTS_URL, response)?;
    Ok(parse_root_hints(&String::from_utf8_lossy(&body)))
}

/// Root server addresses of one family: freshly fetched if possible, built in otherwise.
fn root_servers(opts: &Options, ipv6: bool) -> Vec<IpAddr> {
    let fetched = match fetch_root_hints(opts) {
        Ok((v4, v6)) => {
            if ipv6 {
                v6
            } else {
                v4
            }
        }
        Err(e) => {
            tracing::debug!("could not fetch root hints, using built-in list: {}", e);
            Vec::new()
        }
    };
    if !fetched.is_empty() {
        return fetched;
    }
    if ipv6 {
        ROOT_IPV6.clone()
    } else {
        ROOT_IPV4.clone()
    }
}

/// Whether delegations are followed over IPv6.
fn use_ipv6(family: AddressFamily) -> bool {
    match family {
        AddressFamily::V4 => false,
        AddressFamily::V6 => true,
        AddressFamily::Auto => probe::has_ipv6(),
    }
}

/// One step of the walk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hop {
    /// The zone the answering server was asked as authority for.
    pub zone: Name,
    pub reply: Reply,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
    /// Every reply received on the way, the final one included.
    pub hops: Vec<Hop>,
    /// The first reply with a non-empty answer section, if the walk reached one.
    pub answer: Option<Reply>,
}

/// Walks the delegation chain for one query.
pub struct Resolver {
    roots: Vec<IpAddr>,
    port: u16,
    ipv6: bool,
    opts: Options,
}

impl Resolver {
    /// Starts from the root servers of the address family selected in `opts`.
    pub fn new(opts: &Options) -> Self {
        let ipv6 = use_ipv6(opts.address_family);
        tracing::debug!("iterating over {}", if ipv6 { "IPv6" } else { "IPv4" });
        Resolver {
            roots: root_servers(opts, ipv6),
            port: 53,
            ipv6,
            opts: opts.clone(),
        }
    }

    /// Starts from the given servers, all listening on `port`.
    pub fn with_roots(roots: Vec<IpAddr>, port: u16, opts: &Options) -> Self {
        Resolver {
            ipv6: roots.iter().any(IpAddr::is_ipv6) && opts.address_family != AddressFamily::V4,
            roots,
            port,
            opts: opts.clone(),
        }
    }

    fn server(&self, ip: IpAddr) -> String {
        SocketAddr::new(ip, self.port).to_string()
    }

    /// Exchanges `query` with each server in turn until one returns a non-empty answer section.
    ///
    /// Without an answer, the first reply carrying a referral is returned, then the first reply of
    /// any kind. Errors only if every server failed.
    fn ask(&self, servers: &[String], query: &Query, deadline: Deadline) -> Result<Reply> {
        let mut last_err = Error::Unresolvable("no nameserver to ask".to_string());
        let mut referral = None;
        let mut fallback = None;
        for server in servers {
            let reply = Target::resolve(server, &self.opts)
                .and_then(|target| Transport::new(&target, &self.opts))
                .and_then(|mut transport| {
                    let queries = std::slice::from_ref(query);
                    let step = deadline.nested(SERVER_TIMEOUT);
                    let replies = exchange_queries(&mut transport, queries, &self.opts, step);
                    let _ = transport.close();
                    replies
                });
            match reply.map(|mut replies| replies.pop()) {
                Ok(Some(reply)) if !reply.message.answers.is_empty() => return Ok(reply),
                Ok(Some(reply)) => {
                    tracing::debug!("{} returned no answer", server);
                    if referral.is_none() && self.next_hop(&reply.message).is_some() {
                        referral = Some(reply);
                    } else if fallback.is_none() {
                        fallback = Some(reply);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!("{} failed: {}", server, e);
                    let expired =
                        matches!(e, Error::Timeout(_)) && deadline.remaining("iterating").is_err();
                    last_err = e;
                    if expired {
                        break;
                    }
                }
            }
        }
        referral.or(fallback).ok_or(last_err)
    }

    /// Resolves `name` for the single type in `types`.
    pub fn resolve(&self, name: &str, types: &[RecordType]) -> Result<Resolution> {
        let qtype = single_type(types)?;
        let query = build_queries(name, &[qtype], &self.opts)?.remove(0);
        let deadline = Deadline::after(self.opts.timeout);

        let mut zone = Name::root();
        let mut servers: Vec<String> = self.roots.iter().map(|ip| self.server(*ip)).collect();
        let mut hops = Vec::new();

        loop {
            tracing::debug!("asking {} servers for {}: {:?}", zone, query.question.qname, servers);
            let reply = self.ask(&servers, &query, deadline)?;
            hops.push(Hop {
                zone: zone.clone(),
                reply: reply.clone(),
            });

            if !reply.message.answers.is_empty() {
                return Ok(Resolution {
                    hops,
                    answer: Some(reply),
                });
            }

            match self.next_hop(&reply.message) {
                Some((next_zone, next)) => {
                    zone = next_zone;
                    servers = next;
                }
                None => {
                    tracing::debug!("no delegation below {}, giving up", zone);
                    return Ok(Resolution { hops, answer: None });
                }
            }
        }
    }

    /// The delegated zone and the servers to ask next: glue addresses if there are any, the
    /// nameserver hostnames otherwise.
    fn next_hop(&self, reply: &Message) -> Option<(Name, Vec<String>)> {
        let nameservers = filter_ns(reply);
        let zone = nameservers.first()?.owner.clone();
        let ns_names: Vec<&Name> = nameservers
            .iter()
            .filter_map(|rec| rec.rdata().as_ns().map(|ns| &ns.name))
            .collect();

        let glue = |typ: RecordType| -> Vec<String> {
            reply
                .additional_answers
                .iter()
                .filter_map(|rec| rec.as_nonopt())
                .filter(|rec| rec.rtype == typ && ns_names.iter().any(|ns| **ns == rec.owner))
                .filter_map(|rec| {
                    let rdata = rec.rdata();
                    let ip: IpAddr = match typ {
                        RecordType::A => rdata.as_a()?.address.into(),
                        _ => rdata.as_aaaa()?.address.into(),
                    };
                    Some(self.server(ip))
                })
                .collect()
        };
        let mut servers = if self.ipv6 {
            glue(RecordType::AAAA)
        } else {
            glue(RecordType::A)
        };
        if servers.is_empty() && self.ipv6 {
            servers = glue(RecordType::A);
        }

        if servers.is_empty() {
            // resolved through the bootstrap resolver when the transport is built
            servers = ns_names
                .iter()
                .map(|ns| format!("{}:{}", ns, self.port))
                .collect();
        }
        if servers.is_empty() {
            return None;
        }
        Some((zone, servers))
    }
}

fn single_type(types: &[RecordType]) -> Result<RecordType> {
    match types {
        [qtype] => Ok(*qtype),
        _ => Err(Error::config(format!(
            "iterative resolution needs exactly one record type, got {}",
            types.len()
        ))),
    }
}

/// Resolves `name` iteratively from the root servers.
///
/// The type count is checked before root hints are fetched, so a bad request never touches the
/// network.
pub fn resolve(name: &str, types: &[RecordType], opts: &Options) -> Result<Resolution> {
    single_type(types)?;
    Resolver::new(opts).resolve(name, types)
}

/// All NS records from the authority section.
fn filter_ns(reply: &Message) -> Vec<&NonOptRecord> {
    reply
        .authoritative_answers
        .iter()
        .filter_map(|rec| rec.as_nonopt())
        .filter(|rec| rec.rtype == RecordType::NS)
        .collect()
}
