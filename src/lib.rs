//! Server-side WebSocket protocol engine for the Tokio stack.
//!
//! This library carries WebSocket conversations across the historical wire
//! dialects a long-lived deployment still meets: the original Hixie-75
//! protocol, HyBi-00 (draft-76) with its MD5 key challenge, the HyBi-04/06
//! era with server-to-client masking, and the RFC-6455-style latest
//! revision. The opening handshake picks the dialect from the request
//! headers, installs a message stream on the connection context and hands
//! the conversation to a registered resource handler.
//!
//! An optional multiplexing extension carries many logical channels over
//! one physical connection using the draft-01 control-block protocol.

pub mod codec;
pub mod config;
pub mod context;
pub mod dialect;
pub mod error;
pub mod extensions;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod message;
pub mod mux;
pub mod request;
pub mod server;
pub mod split;
pub mod stream;
pub mod transport;
pub mod write;

#[cfg(test)]
mod tests;
