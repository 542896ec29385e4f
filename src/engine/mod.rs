//! Session engine: lifecycle, authentication, and ordered notification
//! processing for one agent session.

pub mod auth;
pub mod coalescer;
pub mod core;
pub mod lifecycle;
pub mod processor;
pub mod subagent;
pub mod tool_call_store;

pub use self::core::{PendingPermission, SessionCore, SessionSnapshot};
pub use lifecycle::{EngineDeps, PromptOutcome, SessionEngine};
