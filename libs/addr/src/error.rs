//! Error types for address parsing.

use thiserror::Error;

/// Errors that can occur when parsing a key or address.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddrError {
    /// The input string is empty.
    #[error("{label} cannot be empty")]
    Empty { label: &'static str },

    /// The input is not a dotted-quad IPv4 address.
    #[error("invalid {label}: '{input}' is not an IPv4 address")]
    NotIpv4 { label: &'static str, input: String },
}
