//! Work Harness Coordinator — core domain types
//!
//! This crate contains the pure domain logic shared by the store and
//! runtime crates: time-ordered identifiers, the message envelope and its
//! hop chain, the work-class model (outbox/inbox/perspective), the status
//! bitmask, and domain errors.
//!
//! Per the hexagonal split this workspace follows, this crate MUST NOT
//! import a database client, an HTTP framework, or a transport SDK.

pub mod envelope;
pub mod errors;
pub mod ids;
pub mod status;
pub mod work;

pub use envelope::*;
pub use errors::*;
pub use ids::*;
pub use status::*;
pub use work::*;
