mod error;
pub mod memory;
mod sqlite;
mod store;

pub use error::*;
pub use memory::MemoryStore;
pub use sqlite::*;
pub use store::*;

/// SQL migration for the initial schema
pub const MIGRATION_001_INITIAL: &str = include_str!("migrations/001_initial.sql");
