//! Cryptographic core for Plover sessions.
//!
//! This crate provides:
//! - X25519 static keys with base64 persistence
//! - The client identity payload carried inside the handshake
//! - The Noise IK protocol state machine driving handshake and transport
//!
//! # Design
//!
//! Uses the Noise IK pattern (`Noise_IK_25519_ChaChaPoly_BLAKE2s`): the
//! client knows the server's static key up front, so the handshake is a
//! single round trip and the client identity rides encrypted inside the
//! first message. The state machine is phase-aware (HANDSHAKE vs TRANSPORT)
//! and performs all segment I/O through the [`SegmentIo`] seam, so the
//! session layer above decides how segments actually reach the wire.

#![forbid(unsafe_code)]

pub mod identity;
pub mod keys;
pub mod protocol;

pub use identity::{ClientIdentity, UserAgent};
pub use keys::{NoiseKeypair, NoisePublicKey};
pub use protocol::{NoiseProtocol, Phase, ProtocolError, SegmentIo};
