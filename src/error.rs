//! Error types for the Picard VDI client

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while talking to a Sheepdog cluster or verifying a VDI
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    // =========================================================================
    // Connection Lifecycle Errors
    // =========================================================================
    /// Could not establish a session
    #[error("cannot connect to cluster at {endpoint}: {reason}")]
    Connection { endpoint: String, reason: String },

    /// Session release failed
    #[error("cannot disconnect from cluster at {endpoint}: {reason}")]
    Disconnection { endpoint: String, reason: String },

    /// The owning connection has already been released
    #[error("connection backing vdi {vdi} is no longer available")]
    Disconnected { vdi: String },

    // =========================================================================
    // VDI Lifecycle Errors
    // =========================================================================
    /// VDI allocation failed
    #[error("cannot create vdi {vdi} of {size} bytes: {reason}")]
    VolumeCreate {
        vdi: String,
        size: u64,
        reason: String,
    },

    /// VDI open failed
    #[error("cannot open vdi {vdi}: {reason}")]
    VolumeOpen { vdi: String, reason: String },

    /// VDI deletion failed
    #[error("cannot delete vdi {vdi}: {reason}")]
    VolumeDelete { vdi: String, reason: String },

    /// Handle release failed
    #[error("cannot close vdi {vdi}: {reason}")]
    Close { vdi: String, reason: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Read fault reported by the cluster.
    ///
    /// `len` is the byte count the cluster call reported for the request,
    /// which callers tracking a cursor advance by.
    #[error("read of {len} bytes at offset {offset} from vdi {vdi} failed: {reason}")]
    Read {
        vdi: String,
        offset: u64,
        len: usize,
        reason: String,
    },

    /// Write fault reported by the cluster
    #[error("write of {len} bytes at offset {offset} to vdi {vdi} failed: {reason}")]
    Write {
        vdi: String,
        offset: u64,
        len: usize,
        reason: String,
    },

    /// Data read back differs from the payload that was written
    #[error(
        "payload mismatch on vdi {vdi} at offset {offset}: expected {expected:?}, read {actual:?}"
    )]
    Mismatch {
        vdi: String,
        offset: u64,
        expected: String,
        actual: String,
    },

    // =========================================================================
    // Ambient Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Lifecycle faults end a run immediately; read faults and mismatches do not.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Read { .. } | Error::Mismatch { .. })
    }

    /// Returns true for a locally detected data-integrity fault.
    pub fn is_mismatch(&self) -> bool {
        matches!(self, Error::Mismatch { .. })
    }

    /// Returns true for a read fault reported by the cluster.
    pub fn is_read_fault(&self) -> bool {
        matches!(self, Error::Read { .. })
    }

    /// Short label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Connection { .. } => "connection",
            Error::Disconnection { .. } => "disconnection",
            Error::Disconnected { .. } => "disconnected",
            Error::VolumeCreate { .. } => "volume_create",
            Error::VolumeOpen { .. } => "volume_open",
            Error::VolumeDelete { .. } => "volume_delete",
            Error::Close { .. } => "close",
            Error::Read { .. } => "read",
            Error::Write { .. } => "write",
            Error::Mismatch { .. } => "mismatch",
            Error::Config(_) => "config",
            Error::DurationParse(_) => "duration_parse",
            Error::Internal(_) => "internal",
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(format!("task failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let read = Error::Read {
            vdi: "t1".into(),
            offset: 4,
            len: 4,
            reason: "injected".into(),
        };
        assert!(read.is_read_fault());
        assert!(!read.is_mismatch());
        assert!(!read.is_fatal());

        let mismatch = Error::Mismatch {
            vdi: "t1".into(),
            offset: 0,
            expected: "ABCD".into(),
            actual: "ABCE".into(),
        };
        assert!(mismatch.is_mismatch());
        assert!(!mismatch.is_fatal());

        let write = Error::Write {
            vdi: "t1".into(),
            offset: 8,
            len: 4,
            reason: "injected".into(),
        };
        assert!(write.is_fatal());
        assert_eq!(write.kind(), "write");
    }

    #[test]
    fn test_display_carries_context() {
        let err = Error::VolumeCreate {
            vdi: "testvdi".into(),
            size: 4096,
            reason: "VDI exists already".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("testvdi"));
        assert!(msg.contains("4096"));
        assert!(msg.contains("VDI exists already"));
    }
}
