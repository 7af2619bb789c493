//! Request handlers for sync operations.

mod push;

pub use push::*;
