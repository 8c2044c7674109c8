//! Noise IK protocol state machine.
//!
//! One [`NoiseProtocol`] instance lives for the whole lifetime of the layer
//! above it and is shared between the network-facing thread and the
//! handshake worker thread. It owns the HANDSHAKE/TRANSPORT phase, encrypts
//! outbound payloads, decrypts inbound segments and notifies a listener
//! when the handshake completes.
//!
//! # Handshake Flow
//!
//! ```text
//! Initiator (Client)                    Responder (Server)
//!     |                                       |
//!     |  -> e, es, s, ss  (identity payload)  |
//!     |-------------------------------------->|
//!     |                                       |
//!     |  <- e, ee, se                         |
//!     |<--------------------------------------|
//!     |                                       |
//!     [     Session keys established          ]
//! ```
//!
//! The blocking handshake never holds the transport-state mutex while
//! waiting on segment I/O, so the network thread can keep polling
//! [`NoiseProtocol::phase`] throughout.

use anyhow::{Context, Result};
use snow::{Builder, TransportState};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroize;

use crate::identity::ClientIdentity;
use crate::keys::{NoiseKeypair, NoisePublicKey};

/// Noise protocol pattern (IK with X25519, ChaCha20-Poly1305, BLAKE2s)
pub const NOISE_PATTERN: &str = "Noise_IK_25519_ChaChaPoly_BLAKE2s";

/// Maximum size of a single Noise message
const MAX_SEGMENT_SIZE: usize = 65535;

/// Protocol phase: negotiating keys, or moving application data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Initial state; handshake not yet complete.
    Handshake,
    /// Handshake complete; segments are encrypted application payloads.
    Transport,
}

const PHASE_HANDSHAKE: u8 = 0;
const PHASE_TRANSPORT: u8 = 1;

/// Noise protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("session not established")]
    NotEstablished,

    #[error("handshake already complete")]
    AlreadyEstablished,

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("identity payload error: {0}")]
    Payload(#[from] bincode::Error),

    #[error("snow error: {0}")]
    Snow(#[from] snow::Error),
}

/// The protocol's view of segment transport.
///
/// Both calls block: `write_segment` until the segment is consumed by the
/// layer below, `read_segment` until a segment is available. The session
/// layer provides the implementation that bridges these to the wire.
pub trait SegmentIo: Send + Sync {
    /// Hand one segment to the transport. Blocks until consumed.
    fn write_segment(&self, segment: Vec<u8>) -> Result<()>;

    /// Pull the next inbound segment. Blocks until one arrives.
    fn read_segment(&self) -> Result<Vec<u8>>;
}

type PhaseListener = Box<dyn Fn(Phase) + Send + Sync>;

/// Noise IK state machine, initiator side.
///
/// Shared across threads; all methods take `&self` and lock internally.
pub struct NoiseProtocol {
    phase: AtomicU8,
    transport: Mutex<Option<TransportState>>,
    io: Mutex<Option<Arc<dyn SegmentIo>>>,
    phase_listener: Mutex<Option<PhaseListener>>,
}

impl NoiseProtocol {
    /// Create a new state machine in the HANDSHAKE phase.
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(PHASE_HANDSHAKE),
            transport: Mutex::new(None),
            io: Mutex::new(None),
            phase_listener: Mutex::new(None),
        }
    }

    /// Current phase. Readable at any time without blocking on the
    /// handshake in progress.
    pub fn phase(&self) -> Phase {
        match self.phase.load(Ordering::Acquire) {
            PHASE_TRANSPORT => Phase::Transport,
            _ => Phase::Handshake,
        }
    }

    /// Register the listener invoked on the HANDSHAKE -> TRANSPORT
    /// transition. Called on the thread that completes the handshake.
    pub fn set_phase_listener(&self, listener: PhaseListener) {
        *self.phase_listener.lock().expect("phase listener lock poisoned") = Some(listener);
    }

    /// Reset to the initial HANDSHAKE phase, discarding session state.
    pub fn reset(&self) {
        *self.transport.lock().expect("transport lock poisoned") = None;
        *self.io.lock().expect("io lock poisoned") = None;
        self.phase.store(PHASE_HANDSHAKE, Ordering::Release);
        debug!("noise protocol reset to handshake phase");
    }

    /// Run the full IK handshake over `io`, blocking until complete.
    ///
    /// On success the protocol transitions to TRANSPORT, retains `io` for
    /// subsequent sends and fires the phase listener.
    pub fn run_handshake(
        &self,
        io: Arc<dyn SegmentIo>,
        identity: &ClientIdentity,
        local_static: &NoiseKeypair,
        remote_static: &NoisePublicKey,
    ) -> Result<()> {
        if self.phase() == Phase::Transport {
            return Err(ProtocolError::AlreadyEstablished.into());
        }

        let mut private = local_static.private_bytes();
        let handshake = Builder::new(NOISE_PATTERN.parse()?)
            .local_private_key(&private)
            .remote_public_key(remote_static.as_bytes())
            .build_initiator()
            .context("failed to build noise initiator");
        private.zeroize();
        let mut handshake = handshake?;

        debug!(
            remote = %remote_static.fingerprint(),
            "starting noise handshake [username={}, passive={}]",
            identity.username,
            identity.passive
        );

        // -> e, es, s, ss  carrying the client identity
        let payload = identity.encode()?;
        let mut buf = vec![0u8; MAX_SEGMENT_SIZE];
        let len = handshake
            .write_message(&payload, &mut buf)
            .map_err(ProtocolError::Snow)?;
        buf.truncate(len);
        io.write_segment(buf).context("failed to send handshake message")?;

        // <- e, ee, se
        let response = io
            .read_segment()
            .context("failed to read handshake response")?;
        let mut buf = vec![0u8; MAX_SEGMENT_SIZE];
        handshake
            .read_message(&response, &mut buf)
            .map_err(ProtocolError::Snow)?;

        let transport = handshake
            .into_transport_mode()
            .map_err(ProtocolError::Snow)?;

        *self.transport.lock().expect("transport lock poisoned") = Some(transport);
        *self.io.lock().expect("io lock poisoned") = Some(io);
        self.phase.store(PHASE_TRANSPORT, Ordering::Release);
        debug!("noise handshake complete, entering transport phase");

        let listener = self.phase_listener.lock().expect("phase listener lock poisoned");
        if let Some(listener) = listener.as_ref() {
            listener(Phase::Transport);
        }

        Ok(())
    }

    /// Encrypt a payload and transmit it through the handshake-time
    /// segment channel.
    ///
    /// Fails with [`ProtocolError::NotEstablished`] before the handshake
    /// completes.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        let io = self
            .io
            .lock()
            .expect("io lock poisoned")
            .clone()
            .ok_or(ProtocolError::NotEstablished)?;

        // Hold the state lock across the write so ciphertexts reach the
        // wire in nonce order.
        let mut guard = self.transport.lock().expect("transport lock poisoned");
        let transport = guard.as_mut().ok_or(ProtocolError::NotEstablished)?;

        let mut buf = vec![0u8; payload.len() + 16];
        let len = transport
            .write_message(payload, &mut buf)
            .map_err(|e| ProtocolError::Encryption(e.to_string()))?;
        buf.truncate(len);

        io.write_segment(buf).context("failed to transmit segment")
    }

    /// Decrypt one inbound segment, returning the plaintext payload.
    pub fn receive(&self, segment: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        if segment.len() < 16 {
            return Err(ProtocolError::Decryption("segment too short".into()));
        }

        let mut guard = self.transport.lock().expect("transport lock poisoned");
        let transport = guard.as_mut().ok_or(ProtocolError::NotEstablished)?;

        let mut buf = vec![0u8; segment.len()];
        let len = transport
            .read_message(segment, &mut buf)
            .map_err(|e| ProtocolError::Decryption(e.to_string()))?;
        buf.truncate(len);

        Ok(buf)
    }
}

impl Default for NoiseProtocol {
    fn default() -> Self {
        Self::new()
    }
}
