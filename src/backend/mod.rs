//! Cluster Backends (Port/Adapter Pattern)
//!
//! The client layer ([`crate::cluster`], [`crate::vdi`]) never talks to a
//! storage cluster directly. It goes through the [`ClusterBackend`] port,
//! which exposes the blocking primitives a Sheepdog session offers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Client Layer                            │
//! │        Cluster (session owner)  ──▶  Vdi (open handle)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Ports: Connector / ClusterBackend            │
//! ├─────────────────────────────────────────────────────────────┤
//! │   MemoryCluster (always)     │   SheepdogConnector (ffi)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Feature Flags
//!
//! - `sheepdog` - Enable native `libsheepdog` bindings
//!
//! All primitives block the calling thread and carry no timeout.

pub mod memory;
#[cfg(feature = "sheepdog")]
pub mod sheepdog;

use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};

use crate::error::Result;

pub use memory::{FaultPlan, MemoryCluster};
#[cfg(feature = "sheepdog")]
pub use sheepdog::SheepdogConnector;

/// Identifier of an open VDI within one backend session.
///
/// Backends keep the native handle in a registry and hand out this index,
/// so nothing non-`Send` crosses into the client layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VdiId(pub u64);

impl std::fmt::Display for VdiId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "vdi#{}", self.0)
    }
}

/// A live session to a storage cluster.
///
/// Implementations must be safe to share between the writer and reader
/// threads of a pipeline; each open [`VdiId`] is used by one thread at a time.
pub trait ClusterBackend: Send + Sync + std::fmt::Debug {
    /// Endpoint this session is connected to.
    fn endpoint(&self) -> &str;

    /// Release the session. Called at most once by [`crate::Cluster`].
    fn disconnect(&self) -> Result<()>;

    /// Allocate a new VDI of `size` bytes.
    fn create_vdi(&self, name: &str, size: u64) -> Result<()>;

    /// Delete every VDI named `name`.
    fn delete_vdi(&self, name: &str) -> Result<()>;

    /// Open an existing VDI.
    fn open_vdi(&self, name: &str) -> Result<VdiId>;

    /// Release an open VDI. The VDI itself is kept.
    fn close_vdi(&self, vdi: VdiId) -> Result<()>;

    /// Fill `buf` from `offset`. Either the whole buffer is read or an error
    /// is returned.
    fn read_vdi(&self, vdi: VdiId, buf: &mut [u8], offset: u64) -> Result<()>;

    /// Write all of `buf` at `offset`.
    fn write_vdi(&self, vdi: VdiId, buf: &[u8], offset: u64) -> Result<()>;
}

/// Factory for backend sessions.
pub trait Connector: Send + Sync {
    /// Human-readable name of this connector (e.g. "memory", "sheepdog").
    fn name(&self) -> &str;

    /// Establish a session to `endpoint`.
    fn connect(&self, endpoint: &str) -> Result<Arc<dyn ClusterBackend>>;
}

// =============================================================================
// Session Gate
// =============================================================================

/// Orders session release after every call already in flight.
///
/// Calls hold the read side for their whole duration; release takes the
/// write side, so a native session is never torn down under a running call.
#[derive(Debug)]
pub(crate) struct SessionGate {
    live: RwLock<bool>,
}

impl SessionGate {
    pub(crate) fn new() -> Self {
        Self {
            live: RwLock::new(true),
        }
    }

    /// Enter a call. Fails once the session has been released.
    pub(crate) fn enter(&self) -> std::result::Result<RwLockReadGuard<'_, bool>, String> {
        let live = self.live.read();
        if *live {
            Ok(live)
        } else {
            Err("session is disconnected".into())
        }
    }

    /// Run `release` once no call is in flight.
    ///
    /// The gate closes only if `release` succeeds.
    pub(crate) fn release<F>(&self, release: F) -> std::result::Result<(), String>
    where
        F: FnOnce() -> std::result::Result<(), String>,
    {
        let mut live = self.live.write();
        if !*live {
            return Err("session already released".into());
        }
        release()?;
        *live = false;
        Ok(())
    }
}
