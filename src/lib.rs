//! Veilnet - peer-to-peer secret network engine.
//!
//! Each node listens for peers and keeps one mirrored link per peer: the
//! socket the peer dialed plus a socket dialed back to the peer's advertised
//! port. Typed binary frames travel over those links (messages, chunked file
//! transfers, a user-trust handshake), optionally sealed in an RSA
//! chunked-encryption envelope. The binary in `main.rs` is only console
//! glue; everything protocol-shaped lives here.

pub mod error;
pub mod types;
pub mod utils;
pub mod auth;
pub mod crypto;
pub mod net;
pub mod client;
pub mod transfer;
pub mod server;
