//! `sonde` is the engine of a DNS client that speaks every common DNS transport: plain DNS over
//! UDP and TCP, DNS over TLS, DNS over HTTPS (HTTP/1.1 and HTTP/3), DNS over QUIC, DNSCrypt and
//! Oblivious DoH.
//!
//! A server is named by a specifier such as `1.1.1.1`, `tls://dns.quad9.net`,
//! `https://dns.google/dns-query` or a `sdns://` stamp. The specifier is resolved into a
//! [`Target`], queries are built from an [`Options`] value, and a [`Transport`] exchanges them.
//! [`exchange::run`] ties these steps together for a list of servers.
//!
//! Two more modes build on the same pieces: [`iter`] resolves a name by walking down from the root
//! servers, and [`xfr`] transfers a zone and every zone delegated from it.
//!
//! # Basic usage example
//! ```rust,no_run
//! use sonde::{exchange, Options};
//! use toluol_proto::RecordType;
//!
//! let opts = Options::default();
//! let entries = exchange::run(&["tls://1.1.1.1"], "example.com", &[RecordType::AAAA], &opts)?;
//! for entry in entries {
//!     for reply in entry.replies {
//!         println!("{} answered in {:?}:\n{}", reply.server, reply.rtt, reply.message.as_string(None));
//!     }
//! }
//! # Ok::<(), sonde::Error>(())
//! ```
//!
//! The library logs through [`tracing`] and never installs a subscriber itself.

pub mod bootstrap;
pub mod config;
pub mod deadline;
pub mod edns;
pub mod error;
pub mod exchange;
pub mod iter;
pub mod probe;
pub mod query;
pub mod target;
pub mod tls_config;
pub mod transport;
pub mod wire;
pub mod xfr;

pub use config::{AddressFamily, HttpMethod, Options, QueryFlags, TlsOptions, TlsVersion};
pub use deadline::Deadline;
pub use error::{Error, Result};
pub use exchange::Entry;
pub use query::Query;
pub use target::{Target, TransportKind};
pub use transport::{Reply, Transport};
