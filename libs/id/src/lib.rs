//! # fleetboot-id
//!
//! Identifier types shared across the fleetboot workspace.
//!
//! Two families of identifiers exist:
//!
//! - **External keys** (`InstanceId`, `NodeId`) are assigned by the control
//!   plane. They are opaque strings; we only validate that they are non-empty,
//!   bounded and free of whitespace so they are safe in log fields and URLs.
//! - **Generated IDs** (`RunId`) are minted locally as `{prefix}_{ulid}`,
//!   which keeps them sortable by creation time.
//!
//! Examples:
//! - `InstanceId`: `a1b2c3d4`, `lobby-01`
//! - `RunId`: `run_01HV4Z2WQXKJNM8GPQY6VBKC3D`

mod error;
mod macros;
mod types;

pub use error::IdError;
#[doc(hidden)]
pub use macros::is_key_char;
pub use macros::MAX_KEY_LEN;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
