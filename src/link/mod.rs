//! Server-to-server linking: wire grammar, line framing, topology tree,
//! link sessions, the negotiation handshake, and the netsplit algorithm.

pub mod codec;
pub mod config;
pub mod handshake;
pub mod message;
pub mod registry;
pub mod server;
pub mod session;
pub mod squit;
pub mod tree;
