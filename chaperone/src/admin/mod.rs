//! The varnishadm protocol engine: connection handling, command builders and
//! response parsers.

pub mod commands;
pub mod connection;
pub mod parsers;

pub use connection::{AdminError, AdminHandle, AdminServer};
