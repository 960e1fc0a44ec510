//! Request handlers for record writes and the change feed.

mod changes;
mod records;

pub use changes::*;
pub use records::*;
