//! # edgelink-id
//!
//! Typed identifiers shared by the connector and the edge protocol.
//!
//! ## ID Format
//!
//! Tunnel and connector IDs use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `tun_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `ctr_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//!
//! Connection indexes are small integers (one per HA connection) and are
//! not ULID-based.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
