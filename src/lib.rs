pub mod application;
pub mod cli;
pub mod domain;
pub mod io;
pub mod storage;

pub use application::{AppError, ErrorKind, LedgerService, TransferPolicy, TransferService};
pub use domain::*;
pub use storage::{DbConfig, MemoryStore, Queries, SqlStore, Store, StoreError};
