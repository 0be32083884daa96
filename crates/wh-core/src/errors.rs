//! Domain errors raised by pure `wh-core` logic (envelope construction,
//! name normalization). Adapter-level errors (database, transport) live in
//! `wh-store`/`wh-runtime`, each with a `From<CoreError>` conversion.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid envelope: {reason}")]
    InvalidEnvelope { reason: String },

    #[error("invalid type descriptor: {descriptor}")]
    InvalidTypeDescriptor { descriptor: String },
}
