//! # Configuration
//!
//! Server configuration and its loader.

pub mod server;
