//! Recursive zone transfers.
//!
//! Starting from one zone, every delegation found in a transferred zone is transferred as well,
//! from the same server. Each zone ends up in its own file below a fresh output directory.

use std::collections::HashSet;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use toluol_proto::{Message, NonOptRecord, RCode, Record, RecordType};

use crate::bootstrap::Bootstrap;
use crate::config::Options;
use crate::deadline::Deadline;
use crate::error::{Error, IoContext, Result};
use crate::query::{parse_name, Query};
use crate::target::{Target, TransportKind};
use crate::tls_config;
use crate::transport::{arm_timeouts, connect_tcp, read_framed, write_framed, TlsTransport};

/// Query type of a full zone transfer (RFC 5936).
const AXFR: u16 = 252;

/// The label as a lower-case name without the trailing dot, `.` for the root.
fn normalize(label: &str) -> Result<String> {
    Ok(parse_name(label)?.to_string().to_ascii_lowercase())
}

/// `<label>_<timestamp>_recaxfr`, with the spaces of the timestamp replaced by dashes.
fn dir_name(label: &str) -> String {
    let label = label.trim_start_matches('.');
    let label = if label.is_empty() { "root" } else { label };
    let now = chrono::Local::now().format("%a %b %e %H:%M:%S %Z %Y").to_string();
    format!("{}_{}_recaxfr", label, now.replace(' ', "-"))
}

/// Everything a finished walk produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ZoneDump {
    /// All transferred records, in transfer order.
    pub records: Vec<NonOptRecord>,
    /// The directory holding one `<zone>.zone` file per non-empty zone.
    pub dir: PathBuf,
}

/// Transfers a zone and, recursively, every zone delegated from it.
pub struct ZoneWalker {
    target: Target,
    opts: Options,
    bootstrap: Bootstrap,
    dir: PathBuf,
    visited: HashSet<String>,
    records: Vec<NonOptRecord>,
}

impl ZoneWalker {
    /// Prepares a walk against `target`, writing zone files into `dir`.
    ///
    /// Only plain DNS (transferred over TCP) and TLS targets can serve zone transfers.
    pub fn new(target: &Target, opts: &Options, dir: PathBuf) -> Result<Self> {
        match target.kind {
            TransportKind::Plain | TransportKind::Tcp | TransportKind::Tls => {}
            other => {
                return Err(Error::config(format!(
                    "zone transfers need a TCP or TLS server, not {}",
                    other
                )))
            }
        }
        Ok(ZoneWalker {
            target: target.clone(),
            opts: opts.clone(),
            bootstrap: Bootstrap::from_options(opts)?,
            dir,
            visited: HashSet::new(),
            records: Vec::new(),
        })
    }

    /// Transfers `label` unless it was seen before, stores its records and follows its
    /// delegations.
    ///
    /// A failed transfer only costs that zone. Failing to write a zone file ends the walk.
    pub fn walk(&mut self, label: &str) -> Result<()> {
        let label = normalize(label)?;
        if !self.visited.insert(label.clone()) {
            return Ok(());
        }
        tracing::info!("AXFR {}", label);

        let records = match self.transfer(&label) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!("AXFR of {} failed: {}", label, e);
                Vec::new()
            }
        };
        self.persist(&label, &records)?;

        let delegations: Vec<String> = records
            .iter()
            .filter(|rec| rec.rtype == RecordType::NS)
            .map(|rec| rec.owner.to_string())
            .collect();
        self.records.extend(records);

        for zone in delegations {
            self.walk(&zone)?;
        }
        Ok(())
    }

    fn persist(&self, label: &str, records: &[NonOptRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let name = if label == "." { "root" } else { label };
        let path = self.dir.join(format!("{}.zone", name));
        let mut zone = String::new();
        for record in records {
            zone.push_str(&record.to_string());
            zone.push('\n');
        }
        fs::write(&path, zone).map_err(|source| Error::ZoneWrite { path, source })
    }

    /// Runs one AXFR over a fresh connection.
    pub fn transfer(&self, label: &str) -> Result<Vec<NonOptRecord>> {
        let deadline = Deadline::after(self.opts.timeout);
        let mut query = Query::new(parse_name(label)?, RecordType::from(AXFR), self.opts.class);
        query.flags.rd = false;

        let (host, port) = self.target.host_port()?;
        let addrs = self.bootstrap.resolve(host, port)?;
        if self.target.kind == TransportKind::Tls {
            let config = tls_config::client_config(&self.opts.tls, &self.target.alpn)?;
            let mut stream = TlsTransport::connect(
                config,
                &self.target.tls_name()?,
                &addrs,
                self.opts.handshake_timeout,
                deadline,
            )?;
            arm_timeouts(&stream.sock, deadline)?;
            self.receive(&mut stream, &query)
        } else {
            let mut stream = connect_tcp(&addrs, self.opts.timeout, deadline)?;
            arm_timeouts(&stream, deadline)?;
            self.receive(&mut stream, &query)
        }
    }

    /// Sends the transfer request and collects records until the closing SOA.
    fn receive(&self, stream: &mut (impl Read + Write), query: &Query) -> Result<Vec<NonOptRecord>> {
        write_framed(stream, &query.to_wire()?).context("could not send AXFR request")?;

        let mut records = Vec::new();
        let mut soas = 0;
        while soas < 2 {
            let raw = read_framed(stream).context("could not read AXFR response")?;
            let message = Message::parse(&mut Cursor::new(&raw[..]))?;
            if self.opts.id_check && message.header.msg_id != query.id {
                return Err(Error::IdMismatch {
                    sent: query.id,
                    received: message.header.msg_id,
                });
            }
            match message.header.rcode {
                Some(RCode::NOERROR) | None => {}
                Some(rcode) => return Err(Error::protocol(format!("transfer refused: {}", rcode))),
            }
            if message.answers.is_empty() {
                return Err(Error::protocol("empty AXFR response"));
            }

            for record in message.answers {
                if let Record::NONOPT(record) = record {
                    if record.rtype == RecordType::SOA {
                        soas += 1;
                        // the closing SOA repeats the opening one
                        if soas == 2 {
                            break;
                        }
                    }
                    records.push(record);
                }
            }
        }
        tracing::debug!("received {} records", records.len());
        Ok(records)
    }

    pub fn into_dump(self) -> ZoneDump {
        ZoneDump {
            records: self.records,
            dir: self.dir,
        }
    }
}

/// Walks all zones reachable from `label` on `server`, writing them below `parent`.
///
/// The output directory is created fresh as `<label>_<timestamp>_recaxfr`.
pub fn recursive_axfr(label: &str, server: &str, opts: &Options, parent: &Path) -> Result<ZoneDump> {
    let target = Target::resolve(server, opts)?;
    let label = normalize(label)?;
    let dir = parent.join(dir_name(&label));
    fs::create_dir_all(&dir).map_err(|source| Error::ZoneWrite {
        path: dir.clone(),
        source,
    })?;

    let mut walker = ZoneWalker::new(&target, opts, dir)?;
    walker.walk(&label)?;
    let dump = walker.into_dump();
    tracing::info!(
        "AXFR complete, {} records saved to {}",
        dump.records.len(),
        dump.dir.display()
    );
    Ok(dump)
}
