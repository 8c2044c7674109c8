//! Noise session layer for Plover.
//!
//! Sits between the segmented transport layer and the authenticated upper
//! protocol layer. On an auth-intent signal it emits the protocol version
//! header, spawns a handshake worker against the Noise state machine and
//! demultiplexes inbound segments: buffered while the handshake runs,
//! decrypted and delivered upward once the session reaches the transport
//! phase.
//!
//! # Threads
//!
//! Two threads touch this layer: the network-facing thread (driving
//! [`NoiseLayer::receive`] and consuming stream events) and the handshake
//! worker thread. All cross-thread handoffs go through exactly two
//! primitives: the unbounded inbound segment queue and the single-slot
//! [`SegmentedStream`] bridge.

#![forbid(unsafe_code)]

pub mod layer;
pub mod stream;
pub mod worker;

pub use layer::{
    AuthIntent, LayerConfig, NoiseLayer, PayloadSink, ProtocolStateMachine, TransportSink,
    PROTOCOL_HEADER,
};
pub use stream::{SegmentedStream, StreamError, StreamEvent, StreamEventSink};
pub use worker::HandshakeWorker;
