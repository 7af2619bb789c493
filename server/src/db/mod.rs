//! In-memory record persistence.

mod records;

pub use records::*;
