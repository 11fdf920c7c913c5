//! Endpoint handlers.

pub mod system;
