//! # fleet-id
//!
//! Typed identifiers for records that fleetd creates itself.
//!
//! Provider-owned identifiers (instance ids, image ids, ARNs) stay plain
//! strings because their format belongs to the cloud provider. Everything
//! fleetd mints is a prefixed ULID: `{prefix}_{ulid}`.
//!
//! Examples:
//! - `ib_01HV4Z2WQXKJNM8GPQY6VBKC3D` (instance build)
//! - `asgb_01HV4Z3MXNKPQR9HSTZ7WCLD4E` (autoscaling group build)
//! - `req_01HV4Z4NYPLTRS0JTUA8XDME5F` (request correlation)
//!
//! The prefix keeps ids from being mixed up across record kinds and the ULID
//! keeps them time-ordered, which is handy when scanning build history.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
