//! # rete
//!
//! The binary half of the Rete rule engine: CLI, configuration and the
//! monitoring HTTP server. The engine itself lives in `rete-core`.

pub mod api;
pub mod cli;
pub mod config;
