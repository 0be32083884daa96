//! Work Harness Coordinator — Postgres-backed store.
//!
//! Implements `wh_ports::WorkStore` against the six infrastructure
//! tables in `spec.md` §3, following `sr-adapters::postgres`'s
//! one-transaction-per-call shape.

pub mod error;
pub mod migrations;
pub mod orchestrator;
pub mod partition;
pub mod registry;

pub use error::StoreError;
pub use orchestrator::PgWorkStore;
pub use registry::{RegistryError, TypeRegistry, TypeRegistryBuilder};
