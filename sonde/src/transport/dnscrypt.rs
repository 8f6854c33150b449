//! DNSCrypt version 2.
//!
//! Setting up a session resolves the provider stamp, fetches the provider's certificates as TXT
//! records, verifies them against the provider public key and derives the shared key from the
//! best valid one. Queries are then boxed with that key and sent over UDP or TCP.

use std::net::SocketAddr;
use std::time::Duration;

use byteorder::{ByteOrder, NetworkEndian};
use crypto_box::aead::generic_array::GenericArray;
use crypto_box::aead::Aead;
use crypto_box::{ChaChaBox, PublicKey, SalsaBox, SecretKey};
use rand::Rng;
use ring::signature::{UnparsedPublicKey, ED25519};
use sonde_stamp::{Protocol, ServerStamp, PUBLIC_KEY_LEN, STAMP_PREFIX};
use toluol_proto::{Class, RecordType};

use crate::bootstrap::Bootstrap;
use crate::config::Options;
use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::query::{parse_name, Query};
use crate::target::{split_host_port, Target};
use crate::wire;

use super::plain::{tcp_exchange, udp_exchange};

const CERT_MAGIC: &[u8; 4] = b"DNSC";
const RESOLVER_MAGIC: &[u8; 8] = b"r6fnvWj8";
/// Certificate length without extensions.
const CERT_LEN: usize = 124;
const CLIENT_MAGIC_LEN: usize = 8;
const HALF_NONCE_LEN: usize = 12;
const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;
const PADDING_BLOCK: usize = 64;
/// Queries over UDP are padded to at least this size.
const MIN_UDP_QUERY_LEN: usize = 256;
const DEFAULT_UDP_SIZE: usize = 4096;

/// The encryption system of a certificate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum EsVersion {
    XSalsa20Poly1305,
    XChaCha20Poly1305,
}

impl EsVersion {
    fn parse(val: u16) -> Option<Self> {
        match val {
            1 => Some(EsVersion::XSalsa20Poly1305),
            2 => Some(EsVersion::XChaCha20Poly1305),
            _ => None,
        }
    }
}

/// A verified resolver certificate.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Certificate {
    es_version: EsVersion,
    resolver_pk: [u8; PUBLIC_KEY_LEN],
    client_magic: [u8; CLIENT_MAGIC_LEN],
    serial: u32,
    ts_start: u32,
    ts_end: u32,
}

impl Certificate {
    /// Parses and verifies a certificate signed by `provider_pk`, valid at `now`.
    fn parse(bin: &[u8], provider_pk: &[u8], now: i64) -> Result<Self> {
        if bin.len() < CERT_LEN {
            return Err(Error::protocol(format!(
                "DNSCrypt certificate too short ({} bytes)",
                bin.len()
            )));
        }
        if &bin[..4] != CERT_MAGIC {
            return Err(Error::protocol("invalid DNSCrypt certificate magic"));
        }
        let es_version = EsVersion::parse(NetworkEndian::read_u16(&bin[4..6])).ok_or_else(|| {
            Error::protocol(format!(
                "unsupported DNSCrypt encryption system {}",
                NetworkEndian::read_u16(&bin[4..6])
            ))
        })?;

        UnparsedPublicKey::new(&ED25519, provider_pk)
            .verify(&bin[72..], &bin[8..72])
            .map_err(|_| Error::protocol("DNSCrypt certificate signature does not verify"))?;

        let mut resolver_pk = [0; PUBLIC_KEY_LEN];
        resolver_pk.copy_from_slice(&bin[72..104]);
        let mut client_magic = [0; CLIENT_MAGIC_LEN];
        client_magic.copy_from_slice(&bin[104..112]);
        let cert = Certificate {
            es_version,
            resolver_pk,
            client_magic,
            serial: NetworkEndian::read_u32(&bin[112..116]),
            ts_start: NetworkEndian::read_u32(&bin[116..120]),
            ts_end: NetworkEndian::read_u32(&bin[120..124]),
        };

        if now < cert.ts_start as i64 || now > cert.ts_end as i64 {
            return Err(Error::protocol(format!(
                "DNSCrypt certificate {} is not valid now",
                cert.serial
            )));
        }
        Ok(cert)
    }
}

/// Picks the certificate with the strongest encryption system, then the highest serial.
fn best_certificate(records: &[Vec<u8>], provider_pk: &[u8], now: i64) -> Result<Certificate> {
    records
        .iter()
        .filter_map(|bin| match Certificate::parse(bin, provider_pk, now) {
            Ok(cert) => Some(cert),
            Err(e) => {
                tracing::debug!("skipping DNSCrypt certificate: {}", e);
                None
            }
        })
        .max_by_key(|cert| (cert.es_version, cert.serial))
        .ok_or_else(|| Error::protocol("no valid DNSCrypt certificate"))
}

enum Cipher {
    Salsa(SalsaBox),
    ChaCha(ChaChaBox),
}

impl Cipher {
    fn new(es_version: EsVersion, resolver_pk: &PublicKey, secret: &SecretKey) -> Self {
        match es_version {
            EsVersion::XSalsa20Poly1305 => Cipher::Salsa(SalsaBox::new(resolver_pk, secret)),
            EsVersion::XChaCha20Poly1305 => Cipher::ChaCha(ChaChaBox::new(resolver_pk, secret)),
        }
    }

    fn seal(&self, nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = GenericArray::from_slice(nonce);
        match self {
            Cipher::Salsa(b) => b.encrypt(nonce, plaintext),
            Cipher::ChaCha(b) => b.encrypt(nonce, plaintext),
        }
        .map_err(|_| Error::protocol("could not encrypt DNSCrypt query"))
    }

    fn open(&self, nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = GenericArray::from_slice(nonce);
        match self {
            Cipher::Salsa(b) => b.decrypt(nonce, ciphertext),
            Cipher::ChaCha(b) => b.decrypt(nonce, ciphertext),
        }
        .map_err(|_| Error::protocol("could not decrypt DNSCrypt response"))
    }
}

/// ISO/IEC 7816-4 padding to a multiple of the block size, at least `min_len` long.
fn pad(msg: &[u8], min_len: usize) -> Vec<u8> {
    let len = (msg.len() + 1).max(min_len);
    let len = (len + PADDING_BLOCK - 1) / PADDING_BLOCK * PADDING_BLOCK;
    let mut padded = Vec::with_capacity(len);
    padded.extend_from_slice(msg);
    padded.push(0x80);
    padded.resize(len, 0);
    padded
}

fn unpad(mut padded: Vec<u8>) -> Result<Vec<u8>> {
    let end = padded
        .iter()
        .rposition(|&b| b != 0)
        .filter(|&i| padded[i] == 0x80)
        .ok_or_else(|| Error::protocol("invalid DNSCrypt padding"))?;
    padded.truncate(end);
    Ok(padded)
}

/// An established DNSCrypt session.
struct Session {
    server: SocketAddr,
    cert: Certificate,
    public_key: PublicKey,
    cipher: Cipher,
}

impl Session {
    fn encrypt(&self, msg: &[u8], min_len: usize) -> Result<([u8; HALF_NONCE_LEN], Vec<u8>)> {
        let mut half_nonce = [0; HALF_NONCE_LEN];
        rand::thread_rng().fill(&mut half_nonce);
        let mut nonce = [0; NONCE_LEN];
        nonce[..HALF_NONCE_LEN].copy_from_slice(&half_nonce);

        let sealed = self.cipher.seal(&nonce, &pad(msg, min_len))?;
        let mut packet =
            Vec::with_capacity(CLIENT_MAGIC_LEN + PUBLIC_KEY_LEN + HALF_NONCE_LEN + sealed.len());
        packet.extend_from_slice(&self.cert.client_magic);
        packet.extend_from_slice(self.public_key.as_bytes());
        packet.extend_from_slice(&half_nonce);
        packet.extend_from_slice(&sealed);
        Ok((half_nonce, packet))
    }

    fn decrypt(&self, half_nonce: &[u8; HALF_NONCE_LEN], packet: &[u8]) -> Result<Vec<u8>> {
        if packet.len() < RESOLVER_MAGIC.len() + NONCE_LEN + TAG_LEN {
            return Err(Error::protocol("DNSCrypt response too short"));
        }
        let (magic, rest) = packet.split_at(RESOLVER_MAGIC.len());
        if magic != RESOLVER_MAGIC {
            return Err(Error::protocol("invalid DNSCrypt response magic"));
        }
        let (nonce, sealed) = rest.split_at(NONCE_LEN);
        if &nonce[..HALF_NONCE_LEN] != half_nonce {
            return Err(Error::protocol("DNSCrypt response nonce does not match the query"));
        }
        let mut full = [0; NONCE_LEN];
        full.copy_from_slice(nonce);
        unpad(self.cipher.open(&full, sealed)?)
    }
}

pub struct DnsCryptTransport {
    address: String,
    stamp: ServerStamp,
    bootstrap: Bootstrap,
    tcp: bool,
    udp_size: usize,
    dial_timeout: Duration,
    reuse: bool,
    session: Option<Session>,
}

impl DnsCryptTransport {
    pub fn new(target: &Target, opts: &Options, bootstrap: Bootstrap) -> Result<Self> {
        let stamp = if target.address.starts_with(STAMP_PREFIX) {
            ServerStamp::parse(&target.address)?
        } else {
            let (Some(public_key), Some(provider)) =
                (&opts.dnscrypt_public_key, &opts.dnscrypt_provider)
            else {
                return Err(Error::config(
                    "DNSCrypt needs a stamp, or a public key and provider name",
                ));
            };
            let stamp = ServerStamp::from_legacy_dnscrypt(&target.address, public_key, provider)?;
            tracing::debug!("created DNS stamp from manual DNSCrypt configuration: {}", stamp);
            stamp
        };
        if stamp.protocol != Protocol::DnsCrypt {
            return Err(Error::config(format!(
                "expected a DNSCrypt stamp, got {}",
                stamp.protocol
            )));
        }

        Ok(DnsCryptTransport {
            address: target.address.clone(),
            stamp,
            bootstrap,
            tcp: opts.dnscrypt_tcp,
            udp_size: match opts.dnscrypt_udp_size {
                0 => DEFAULT_UDP_SIZE,
                size => size as usize,
            },
            dial_timeout: opts.timeout,
            reuse: opts.reuse_conn,
            session: None,
        })
    }

    pub fn server(&self) -> &str {
        &self.address
    }

    /// Sends a plain DNS message to the resolver, over TCP or UDP as configured.
    fn send_plain(&self, server: SocketAddr, msg: &[u8], deadline: Deadline) -> Result<Vec<u8>> {
        if self.tcp {
            tcp_exchange(&[server], msg, self.dial_timeout, deadline)
        } else {
            udp_exchange(server, msg, self.udp_size, deadline)
        }
    }

    fn setup(&self, deadline: Deadline) -> Result<Session> {
        let (host, port) = split_host_port(&self.stamp.server_addr)
            .ok_or_else(|| Error::spec(&self.stamp.server_addr, "expected host:port"))?;
        let server = self.bootstrap.resolve(host, port)?[0];

        let query = Query::new(parse_name(&self.stamp.provider_name)?, RecordType::TXT, Class::IN);
        let reply = self.send_plain(server, &query.to_wire()?, deadline)?;
        if wire::message_id(&reply) != Some(query.id) {
            return Err(Error::protocol("DNSCrypt certificate reply does not match the query"));
        }
        let records = wire::answer_txt(&reply)?;
        tracing::debug!(
            "got {} DNSCrypt certificate(s) for {}",
            records.len(),
            self.stamp.provider_name
        );

        let cert = best_certificate(&records, &self.stamp.server_pk, chrono::Utc::now().timestamp())?;
        tracing::debug!(
            "using DNSCrypt certificate {} ({:?}) from {}",
            cert.serial,
            cert.es_version,
            server
        );

        let mut secret = [0u8; 32];
        rand::thread_rng().fill(&mut secret);
        let secret = SecretKey::from(secret);
        let public_key = secret.public_key();
        let cipher = Cipher::new(cert.es_version, &PublicKey::from(cert.resolver_pk), &secret);
        Ok(Session {
            server,
            cert,
            public_key,
            cipher,
        })
    }

    pub fn exchange(&mut self, query: &Query, deadline: Deadline) -> Result<Vec<u8>> {
        let msg = query.to_wire()?;
        if !self.reuse {
            self.close()?;
        }
        if self.session.is_none() {
            self.session = Some(self.setup(deadline)?);
        }
        let Some(session) = &self.session else {
            return Err(Error::protocol("no DNSCrypt session"));
        };

        let min_len = if self.tcp { 0 } else { MIN_UDP_QUERY_LEN };
        let (half_nonce, packet) = session.encrypt(&msg, min_len)?;
        let reply = self.send_plain(session.server, &packet, deadline)?;
        session.decrypt(&half_nonce, &reply)
    }

    pub fn close(&mut self) -> Result<()> {
        self.session = None;
        Ok(())
    }
}
