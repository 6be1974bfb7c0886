//! Arena Relay - real-time state replication for a 2D multiplayer game
//!
//! The server side of the replication protocol: per-connection handshake
//! and subscriptions, the multiplayer session registry with host-authority
//! election, the binary snapshot codec, and tick/latency synchronization.
//! The `replica` module is the peer-side consumer the client builds on.

pub mod app;
pub mod auth;
pub mod codec;
pub mod config;
pub mod engine;
pub mod http;
pub mod replica;
pub mod util;
pub mod ws;
