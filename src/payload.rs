//! Payload generation for the verification pipeline
//!
//! Payloads are short printable strings: a few random bytes rendered as
//! uppercase hexadecimal. The text, not the raw random bytes, is what gets
//! written to and compared against the VDI.

use bytes::Bytes;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::warn;

use crate::error::{Error, Result};

/// Random bytes drawn per payload unless configured otherwise.
pub const DEFAULT_SEED_BYTES: usize = 4;

/// Upper bound on random bytes per payload.
pub const MAX_SEED_BYTES: usize = 64;

/// Returned in place of random text when the entropy source fails.
const SENTINEL: &[u8] = b"rand";

// =============================================================================
// Payload
// =============================================================================

/// An immutable byte sequence written once and verified once.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Payload(Bytes);

impl Payload {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::ops::Deref for Payload {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<[u8]> for Payload {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

// =============================================================================
// Generator
// =============================================================================

/// Produces hex-text payloads from an entropy source.
///
/// Every payload is exactly [`PayloadGenerator::max_len`] bytes long.
#[derive(Debug)]
pub struct PayloadGenerator<R = OsRng> {
    rng: R,
    seed_bytes: usize,
}

impl PayloadGenerator<OsRng> {
    /// Generator drawing [`DEFAULT_SEED_BYTES`] from the operating system.
    pub fn new() -> Self {
        Self {
            rng: OsRng,
            seed_bytes: DEFAULT_SEED_BYTES,
        }
    }

    /// Generator drawing `seed_bytes` from the operating system.
    pub fn with_seed_bytes(seed_bytes: usize) -> Result<Self> {
        Self::from_rng(OsRng, seed_bytes)
    }
}

impl Default for PayloadGenerator<OsRng> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: RngCore> PayloadGenerator<R> {
    /// Generator over a caller-supplied entropy source.
    pub fn from_rng(rng: R, seed_bytes: usize) -> Result<Self> {
        if seed_bytes == 0 || seed_bytes > MAX_SEED_BYTES {
            return Err(Error::Config(format!(
                "payload seed bytes must be between 1 and {}, got {}",
                MAX_SEED_BYTES, seed_bytes
            )));
        }
        Ok(Self { rng, seed_bytes })
    }

    /// Length of every payload this generator returns.
    pub fn max_len(&self) -> usize {
        self.seed_bytes * 2
    }

    /// The payload used when entropy is unavailable.
    pub fn sentinel(&self) -> Payload {
        let text: Vec<u8> = SENTINEL.iter().copied().cycle().take(self.max_len()).collect();
        Payload::new(text)
    }

    /// Draw a fresh payload, never failing.
    pub fn next_payload(&mut self) -> Payload {
        let mut seed = vec![0u8; self.seed_bytes];
        match self.rng.try_fill_bytes(&mut seed) {
            Ok(()) => Payload::new(hex::encode_upper(&seed)),
            Err(e) => {
                warn!(error = %e, "Entropy source failed, using sentinel payload");
                self.sentinel()
            }
        }
    }
}
