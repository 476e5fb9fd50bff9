//! Cluster connection
//!
//! A [`Cluster`] owns one session to a Sheepdog cluster and manages VDIs on
//! it. Handles opened through it ([`Vdi`]) keep only a weak reference to the
//! session, so the connection controls its own lifetime.
//!
//! # Example
//!
//! ```
//! use picard::backend::MemoryCluster;
//! use picard::Cluster;
//!
//! let backend = MemoryCluster::new();
//! let cluster = Cluster::connect(&backend, "127.0.0.1:7000")?;
//!
//! let mut vdi = cluster.create_open_vdi("testvdi", 4096)?;
//! vdi.write_at(b"0F3A", 0)?;
//!
//! vdi.close()?;
//! cluster.delete_vdi("testvdi")?;
//! cluster.disconnect()?;
//! # Ok::<(), picard::Error>(())
//! ```

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::backend::{ClusterBackend, Connector};
use crate::error::Result;
use crate::vdi::Vdi;

/// A live session to a storage cluster.
///
/// Dropping a `Cluster` without calling [`Cluster::disconnect`] still
/// releases the session; a failure there is only logged.
pub struct Cluster {
    backend: Arc<dyn ClusterBackend>,
    endpoint: String,
    released: bool,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("endpoint", &self.endpoint)
            .field("released", &self.released)
            .finish()
    }
}

impl Cluster {
    /// Connect to the cluster at `endpoint` ("host:port").
    #[instrument(skip(connector), fields(connector = connector.name()))]
    pub fn connect(connector: &dyn Connector, endpoint: &str) -> Result<Self> {
        let backend = connector.connect(endpoint)?;
        info!("Created connection to cluster");
        Ok(Self {
            backend,
            endpoint: endpoint.to_string(),
            released: false,
        })
    }

    /// Endpoint this connection was made to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Release the session.
    ///
    /// Handles still open on this connection become unusable and report
    /// [`crate::Error::Disconnected`].
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    pub fn disconnect(mut self) -> Result<()> {
        self.released = true;
        self.backend.disconnect()?;
        info!("Disconnected from cluster");
        Ok(())
    }

    /// Create a VDI named `name` of `size` bytes.
    ///
    /// Whether an existing name is an error is up to the cluster; its answer
    /// is returned unchanged.
    pub fn create_vdi(&self, name: &str, size: u64) -> Result<()> {
        self.backend.create_vdi(name, size)?;
        debug!(vdi = name, size, "created vdi");
        Ok(())
    }

    /// Open an existing VDI for reads and writes.
    pub fn open_vdi(&self, name: &str) -> Result<Vdi> {
        let id = self.backend.open_vdi(name)?;
        debug!(vdi = name, %id, "opened vdi");
        Ok(Vdi::new(name, id, Arc::downgrade(&self.backend)))
    }

    /// Create a VDI and open it.
    ///
    /// If creation fails, opening is never attempted. If opening fails, the
    /// VDI stays allocated and removing it is up to the caller.
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    pub fn create_open_vdi(&self, name: &str, size: u64) -> Result<Vdi> {
        self.create_vdi(name, size)?;
        self.open_vdi(name)
    }

    /// Delete every VDI on the cluster named `name`.
    pub fn delete_vdi(&self, name: &str) -> Result<()> {
        self.backend.delete_vdi(name)?;
        debug!(vdi = name, "deleted vdi");
        Ok(())
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.backend.disconnect() {
            warn!(endpoint = %self.endpoint, error = %e, "Failed to release dropped connection");
        }
    }
}
