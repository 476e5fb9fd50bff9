//! Run configuration
//!
//! Settings for one verification run, independent of where they come from.
//! The binary fills these in from command-line flags and `SHEEPDOG_*`
//! environment variables.

use std::time::Duration;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::payload::{DEFAULT_SEED_BYTES, MAX_SEED_BYTES};

/// Default number of payloads written per run
pub const DEFAULT_PAYLOAD_COUNT: usize = 10;

/// Default VDI size (4 MiB)
pub const DEFAULT_VDI_SIZE: u64 = 1 << 22;

/// Default VDI name
pub const DEFAULT_VDI_NAME: &str = "testvdi";

// =============================================================================
// Pipeline Configuration
// =============================================================================

/// Configuration for the verification pipeline
#[derive(Debug, Clone, Serialize)]
pub struct PipelineConfig {
    /// Number of payloads to write
    pub payload_count: usize,

    /// Delay before each read-back
    #[serde(with = "duration_millis")]
    pub read_delay: Duration,

    /// Payloads the writer may publish ahead of the reader.
    ///
    /// This is a buffered slot count, not a rendezvous: with the default of 1
    /// the writer can finish one more write than an unbuffered handoff would
    /// allow while the reader is still in its delay.
    pub handoff_capacity: usize,

    /// Random bytes per payload (payload length is twice this)
    pub seed_bytes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            payload_count: DEFAULT_PAYLOAD_COUNT,
            read_delay: Duration::ZERO,
            handoff_capacity: 1,
            seed_bytes: DEFAULT_SEED_BYTES,
        }
    }
}

impl PipelineConfig {
    /// Largest payload this configuration produces.
    pub fn max_payload_len(&self) -> usize {
        self.seed_bytes * 2
    }

    /// Bytes a full run writes.
    pub fn bytes_required(&self) -> u64 {
        (self.payload_count as u64).saturating_mul(self.max_payload_len() as u64)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.handoff_capacity == 0 {
            return Err(Error::Config("handoff capacity must be at least 1".into()));
        }
        if self.seed_bytes == 0 || self.seed_bytes > MAX_SEED_BYTES {
            return Err(Error::Config(format!(
                "payload seed bytes must be between 1 and {}, got {}",
                MAX_SEED_BYTES, self.seed_bytes
            )));
        }
        Ok(())
    }

    /// Reject settings that would overrun a VDI of `vdi_size` bytes.
    pub fn validate_for_vdi(&self, vdi_size: u64) -> Result<()> {
        self.validate()?;
        if self.bytes_required() > vdi_size {
            return Err(Error::Config(format!(
                "{} payloads of {} bytes need {} bytes but the vdi holds {}",
                self.payload_count,
                self.max_payload_len(),
                self.bytes_required(),
                vdi_size
            )));
        }
        Ok(())
    }
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

// =============================================================================
// Duration Parsing
// =============================================================================

/// Parse a duration such as `250ms`, `2s`, `1m30s` or `1h`.
///
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total = Duration::ZERO;
    let mut num_buf = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            num_buf.push(c);
            continue;
        }

        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        num_buf.clear();

        let unit = match c {
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                Duration::from_millis(1)
            }
            'h' | 'H' => Duration::from_secs(3600),
            'm' | 'M' => Duration::from_secs(60),
            's' | 'S' => Duration::from_secs(1),
            _ => {
                return Err(Error::DurationParse(format!(
                    "unknown duration unit: {}",
                    c
                )))
            }
        };

        let component = u32::try_from(num)
            .ok()
            .and_then(|n| unit.checked_mul(n))
            .ok_or_else(too_large)?;
        total = total.checked_add(component).ok_or_else(too_large)?;
    }

    // Handle case where string ends with a number (assume seconds)
    if !num_buf.is_empty() {
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        total = total
            .checked_add(Duration::from_secs(num))
            .ok_or_else(too_large)?;
    }

    Ok(total)
}

fn too_large() -> Error {
    Error::DurationParse("duration too large".to_string())
}
