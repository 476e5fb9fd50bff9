//! Picard - Sheepdog VDI client and read-back verifier
//!
//! A client-side abstraction over a Sheepdog block-storage cluster: connect
//! to a cluster, manage named virtual disk images (VDIs) and perform
//! offset-addressed reads and writes against them. On top of the client sits
//! a verification pipeline that writes payloads through one handle while a
//! second handle, possibly on a replica connection, reads them back and
//! compares them byte for byte.
//!
//! # Architecture
//!
//! ```text
//! Connector → Cluster → Vdi (write) ─┐
//!                                    ├─▶ Pipeline → PipelineReport
//! Connector → Cluster → Vdi (read)  ─┘
//! ```
//!
//! # Modules
//!
//! - [`backend`] - Cluster backends (in-memory, native libsheepdog)
//! - [`cluster`] - Cluster connection and VDI lifecycle
//! - [`config`] - Run configuration and duration parsing
//! - [`error`] - Error types
//! - [`metrics`] - Prometheus metrics for pipeline runs
//! - [`payload`] - Payload generation
//! - [`pipeline`] - Write/read-back verification pipeline
//! - [`vdi`] - Open VDI handles

pub mod backend;
pub mod cluster;
pub mod config;
pub mod error;
pub mod metrics;
pub mod payload;
pub mod pipeline;
pub mod vdi;

// Re-export commonly used types
pub use cluster::Cluster;
pub use config::{parse_duration, PipelineConfig};
pub use error::{Error, Result};
pub use payload::{Payload, PayloadGenerator};
pub use pipeline::{Pipeline, PipelineReport, PipelineRun, ReadOutcome, RunStatus, WriteOutcome};
pub use vdi::Vdi;

/// Returns true when built with native libsheepdog support
pub fn has_native_backend() -> bool {
    cfg!(feature = "sheepdog")
}
