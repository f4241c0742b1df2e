mod account;
mod entry;
mod ledger;
mod money;
mod transfer;

pub use account::*;
pub use entry::*;
pub use ledger::*;
pub use money::*;
pub use transfer::*;
