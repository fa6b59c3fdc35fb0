//! HTTP API for the instruction store.

pub mod instructions;
pub mod server;
