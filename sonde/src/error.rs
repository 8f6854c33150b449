//! Error types used by the engine.

use std::io::ErrorKind;
use std::path::PathBuf;

use thiserror::Error;

/// Shorthand used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while resolving a target, building queries or exchanging them.
///
/// The variants roughly follow the stages of an invocation: configuration problems are reported
/// before any network I/O happens, protocol and I/O errors abort the exchange in flight.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}.")]
    Config(String),

    #[error("Invalid server specifier {spec:?}: {reason}.")]
    InvalidSpecifier { spec: String, reason: String },

    #[error("{0} is not a valid RR type.")]
    InvalidType(String),

    #[error("Protocol violation: {0}.")]
    Protocol(String),

    #[error("ID mismatch: sent {sent}, received {received}.")]
    IdMismatch { sent: u16, received: u16 },

    #[error("Timed out: {0}.")]
    Timeout(String),

    #[error("Could not resolve host {0}.")]
    Unresolvable(String),

    #[error("IO error: {context}.")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS error.")]
    Tls(#[from] rustls::Error),

    #[error("HTTP request to {url} failed: {reason}.")]
    Http { url: String, reason: String },

    #[error("QUIC error: {0}.")]
    Quic(String),

    #[error("Invalid DNS stamp.")]
    Stamp(#[from] sonde_stamp::StampError),

    #[error("Could not decode DNS message.")]
    Parse(#[from] toluol_proto::error::ParseError),

    #[error("Could not encode DNS message.")]
    Encode(#[from] toluol_proto::error::EncodeError),

    #[error("Could not write zone file {path:?}.")]
    ZoneWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Error::Config(reason.into())
    }

    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        Error::Protocol(reason.into())
    }

    pub(crate) fn spec(spec: &str, reason: impl Into<String>) -> Self {
        Error::InvalidSpecifier {
            spec: spec.to_string(),
            reason: reason.into(),
        }
    }
}

/// Attaches a human readable context to IO errors, in the spirit of `anyhow::Context`.
///
/// Socket timeouts surface as [`Error::Timeout`] so callers can tell them apart from other
/// failures.
pub(crate) trait IoContext<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|source| match source.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut => Error::Timeout(context.into()),
            _ => Error::Io {
                context: context.into(),
                source,
            },
        })
    }
}
