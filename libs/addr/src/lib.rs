//! # lifter-addr
//!
//! Address types shared by the lifter control plane and its service table.
//!
//! ## Design Principles
//!
//! - Keys and addresses are fixed-width (32-bit IPv4) and `Copy`
//! - Canonical text form is the dotted quad, with strict parsing
//! - Ordering is numeric, so iteration over a [`BackendSet`] is deterministic
//! - Service keys and backend addresses are distinct types and never mix
//!
//! ## Wire Format
//!
//! The data-plane map stores both keys and values as the four address octets
//! in network byte order. [`ServiceKey::to_wire`] and
//! [`BackendAddress::to_wire`] produce exactly that layout.

mod error;
mod macros;
mod types;

pub use error::AddrError;
pub use types::*;
