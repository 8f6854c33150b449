//! Error types used by this crate.

use thiserror::Error;

/// Errors that may arise while decoding or encoding a stamp.
#[derive(Debug, Error)]
pub enum StampError {
    #[error("Stamps are expected to start with \"sdns://\".")]
    MissingPrefix,

    #[error("Invalid base64url payload.")]
    Base64(#[from] data_encoding::DecodeError),

    #[error("Stamp too short: expected {expected} more bytes at offset {offset}.")]
    TooShort { offset: usize, expected: usize },

    #[error("Unsupported stamp protocol: {0:#04x}.")]
    UnsupportedProtocol(u8),

    #[error("Invalid public key: expected 32 bytes, got {0}.")]
    InvalidPublicKey(usize),

    #[error("Invalid public key encoding: {0}.")]
    InvalidPublicKeyEncoding(String),

    #[error("Field too long to be encoded: {0} bytes.")]
    FieldTooLong(usize),

    #[error("Trailing garbage after the stamp payload ({0} bytes).")]
    TrailingGarbage(usize),

    #[error("Stamp field is not valid UTF-8.")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("IO error.")]
    IoError(#[from] std::io::Error),
}
