//! Persistence layer for run records
//!
//! This module provides:
//! - [`RunStore`] trait for run record persistence
//! - [`InMemoryRunStore`] for testing and dev mode
//! - [`PostgresRunStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryRunStore;
pub use postgres::PostgresRunStore;
pub use store::{RunFilter, RunRecord, RunStore, StoreError};
