//! Handshake worker thread.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

use plover_crypto::{ClientIdentity, NoiseKeypair, NoisePublicKey};

use crate::layer::ProtocolStateMachine;
use crate::stream::SegmentedStream;

/// Dedicated thread driving the blocking handshake exchange against the
/// protocol state machine and the segment bridge.
///
/// Failures are the collaborator's to report; the worker logs them and
/// terminates. There is no in-band cancellation: closing the stream is what
/// wakes and stops a blocked worker.
pub struct HandshakeWorker {
    handle: JoinHandle<()>,
}

impl HandshakeWorker {
    /// Spawn the worker. The handshake starts immediately.
    pub fn spawn(
        protocol: Arc<dyn ProtocolStateMachine>,
        stream: Arc<SegmentedStream>,
        identity: ClientIdentity,
        local_static: NoiseKeypair,
        remote_static: NoisePublicKey,
    ) -> std::io::Result<Self> {
        let handle = thread::Builder::new()
            .name("noise-handshake".to_string())
            .spawn(move || {
                debug!("handshake worker started");
                match protocol.run_handshake(stream, &identity, &local_static, &remote_static) {
                    Ok(()) => debug!("handshake worker finished"),
                    Err(e) => error!("handshake failed: {e:#}"),
                }
            })?;

        Ok(Self { handle })
    }

    /// Whether the worker thread is still running.
    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Wait for the worker to finish. Used by tests and teardown paths.
    pub fn join(self) {
        let _ = self.handle.join();
    }
}
