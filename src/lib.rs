#![forbid(unsafe_code)]

//! `acp-host` drives coding agents over the Agent Client Protocol.
//!
//! The library owns one agent session at a time: it launches the agent,
//! negotiates authentication, and rebuilds the conversation timeline from
//! the agent's ordered stream of session updates.

pub mod acp;
pub mod config;
pub mod driver;
pub mod engine;
pub mod errors;
pub mod mcp;
pub mod models;
pub mod persistence;
pub mod registry;
pub mod telemetry;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
