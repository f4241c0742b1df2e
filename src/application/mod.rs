// Application layer - the transfer core and the validating service in front of it.

pub mod error;
pub mod metrics;
pub mod service;
pub mod transfer;

pub use error::*;
pub use metrics::*;
pub use service::*;
pub use transfer::*;
