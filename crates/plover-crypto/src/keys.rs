//! X25519 static keys for Noise sessions.
//!
//! Key material is injected configuration: loaded from base64 at the edge
//! of the stack and handed to the session layer, never baked into code.
//! The at-rest form is the 64-byte concatenation `private || public`,
//! base64-encoded with the standard alphabet.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

/// X25519 static keypair used as the local Noise identity.
pub struct NoiseKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl NoiseKeypair {
    /// Generate a new random keypair using the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);

        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        bytes.zeroize();

        Self { secret, public }
    }

    /// Create from raw private key bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        let secret = StaticSecret::from(*bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Parse the base64-encoded 64-byte `private || public` form.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let mut decoded = STANDARD
            .decode(encoded.trim())
            .context("invalid base64 keypair encoding")?;

        if decoded.len() != 64 {
            decoded.zeroize();
            anyhow::bail!("invalid keypair length: expected 64 bytes");
        }

        let mut private = [0u8; 32];
        private.copy_from_slice(&decoded[..32]);
        decoded.zeroize();

        let keypair = Self::from_bytes(&private);
        private.zeroize();

        Ok(keypair)
    }

    /// Encode as base64 of `private || public`.
    ///
    /// # Security
    /// The result contains the private key. Handle with care.
    pub fn to_base64(&self) -> String {
        let mut buf = [0u8; 64];
        buf[..32].copy_from_slice(&self.secret.to_bytes());
        buf[32..].copy_from_slice(self.public.as_bytes());

        let encoded = STANDARD.encode(buf);
        buf.zeroize();
        encoded
    }

    /// Get the raw private key bytes.
    pub fn private_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Get the public half.
    pub fn public(&self) -> NoisePublicKey {
        NoisePublicKey(*self.public.as_bytes())
    }
}

impl Clone for NoiseKeypair {
    fn clone(&self) -> Self {
        Self {
            secret: self.secret.clone(),
            public: self.public,
        }
    }
}

impl fmt::Debug for NoiseKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the secret half.
        write!(f, "NoiseKeypair({})", self.public().fingerprint())
    }
}

/// Remote peer's X25519 static public key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct NoisePublicKey([u8; 32]);

impl NoisePublicKey {
    /// Create from raw public key bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a base64-encoded 32-byte public key.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let decoded = STANDARD
            .decode(encoded.trim())
            .context("invalid base64 public key encoding")?;

        let bytes: [u8; 32] = decoded
            .try_into()
            .map_err(|_| anyhow::anyhow!("invalid public key length: expected 32 bytes"))?;

        Ok(Self(bytes))
    }

    /// Encode as standard base64.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Get the raw public key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short hex fingerprint for log lines.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Debug for NoisePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NoisePublicKey({})", self.fingerprint())
    }
}

impl fmt::Display for NoisePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let a = NoiseKeypair::generate();
        let b = NoiseKeypair::generate();
        assert_ne!(a.public().as_bytes(), b.public().as_bytes());
    }

    #[test]
    fn test_keypair_base64_roundtrip() {
        let keypair = NoiseKeypair::generate();
        let encoded = keypair.to_base64();

        let restored = NoiseKeypair::from_base64(&encoded).unwrap();
        assert_eq!(restored.private_bytes(), keypair.private_bytes());
        assert_eq!(restored.public(), keypair.public());
    }

    #[test]
    fn test_keypair_rejects_wrong_length() {
        let encoded = STANDARD.encode([0u8; 33]);
        assert!(NoiseKeypair::from_base64(&encoded).is_err());
    }

    #[test]
    fn test_public_key_base64_roundtrip() {
        let public = NoiseKeypair::generate().public();
        let parsed = NoisePublicKey::from_base64(&public.to_base64()).unwrap();
        assert_eq!(parsed, public);
    }

    #[test]
    fn test_public_key_rejects_garbage() {
        assert!(NoisePublicKey::from_base64("not base64!!!").is_err());
        assert!(NoisePublicKey::from_base64(&STANDARD.encode([0u8; 16])).is_err());
    }

    #[test]
    fn test_fingerprint_is_short_hex() {
        let public = NoisePublicKey::from_bytes([0xab; 32]);
        assert_eq!(public.fingerprint(), "abababababababab");
    }

    #[test]
    fn test_debug_hides_secret() {
        let keypair = NoiseKeypair::generate();
        let debug = format!("{:?}", keypair);
        assert!(!debug.contains(&keypair.to_base64()));
    }
}
