//! Agent Client Protocol (ACP) transport.
//!
//! JSON-RPC 2.0 over newline-delimited JSON on the agent's stdio. Each
//! connected agent owns a reader task and a writer task:
//! - `codec`: [`LinesCodec`](tokio_util::codec::LinesCodec)-based NDJSON framing.
//! - `reader`: classifies inbound lines and routes responses and
//!   [`AgentEvent`](crate::driver::AgentEvent)s.
//! - `writer`: serialises outbound frames to the agent's stdin.
//! - `client`: request id allocation and response correlation.
//! - `spawner`: process spawning with stdio capture.
//! - `handshake`: the `initialize` exchange.
//! - `protocol`: wire types and `session/update` decoding.

pub mod client;
pub mod codec;
pub mod handshake;
pub mod protocol;
pub mod reader;
pub mod spawner;
pub mod writer;
