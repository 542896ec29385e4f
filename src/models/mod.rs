//! Domain model module declarations.

pub mod auth;
pub mod mcp;
pub mod message;
pub mod session;
pub mod tool_call;
pub mod update;
