//! Client identity payload carried inside the handshake.
//!
//! The first Noise IK message carries a serialized [`ClientIdentity`] so the
//! server learns who is connecting as part of the handshake itself, before
//! any application traffic flows. Everything in here is descriptive
//! configuration supplied per connection attempt.

use serde::{Deserialize, Serialize};

use crate::protocol::ProtocolError;

/// Descriptive user-agent bundle reported to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAgent {
    /// Application version string, e.g. "2.19.51".
    pub app_version: String,
    /// Platform identifier, e.g. "android".
    pub platform: String,
    /// Device model descriptor.
    pub device: String,
    /// Operating system version.
    pub os_version: String,
}

impl UserAgent {
    /// Convenience constructor for the common case.
    pub fn new(app_version: &str, platform: &str, device: &str, os_version: &str) -> Self {
        Self {
            app_version: app_version.to_string(),
            platform: platform.to_string(),
            device: device.to_string(),
            os_version: os_version.to_string(),
        }
    }
}

/// Identity bundle for one connection attempt.
///
/// Immutable once built; assembled from injected configuration plus the
/// auth-intent event that triggered the attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    /// Numeric account identifier.
    pub username: u64,
    /// Whether this connection is passive (no presence announcements).
    pub passive: bool,
    /// User-agent descriptor.
    pub useragent: UserAgent,
    /// Display name shown to other users.
    pub pushname: String,
    /// Request a short-lived connection.
    pub short_connect: bool,
}

impl ClientIdentity {
    /// Serialize for inclusion as the handshake message payload.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize a handshake message payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(bytes)?)
    }
}
