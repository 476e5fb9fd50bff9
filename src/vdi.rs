//! Open VDI handle

use std::sync::{Arc, Weak};

use tracing::{trace, warn};

use crate::backend::{ClusterBackend, VdiId};
use crate::error::{Error, Result};

/// A local, closable handle onto a named VDI.
///
/// The handle does not own its connection. Once the connection has been
/// released every I/O call fails with [`Error::Disconnected`]. Several
/// handles, from one or more connections, may refer to the same VDI.
///
/// Dropping an open handle closes it; [`Vdi::close`] reports the outcome.
pub struct Vdi {
    name: String,
    id: VdiId,
    cluster: Weak<dyn ClusterBackend>,
    closed: bool,
}

impl std::fmt::Debug for Vdi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vdi")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Vdi {
    pub(crate) fn new(name: &str, id: VdiId, cluster: Weak<dyn ClusterBackend>) -> Self {
        Self {
            name: name.to_string(),
            id,
            cluster,
            closed: false,
        }
    }

    /// Name the VDI was created or opened with.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn session(&self) -> Result<Arc<dyn ClusterBackend>> {
        self.cluster.upgrade().ok_or_else(|| Error::Disconnected {
            vdi: self.name.clone(),
        })
    }

    /// Read `buf.len()` bytes starting at `offset`.
    ///
    /// There is no short read: the buffer is filled or an error is returned.
    pub fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let session = self.session()?;
        session.read_vdi(self.id, buf, offset)?;
        trace!(vdi = %self.name, offset, len = buf.len(), "read");
        Ok(buf.len())
    }

    /// Write all of `buf` starting at `offset`.
    ///
    /// On failure nothing is assumed about how much of `buf` reached the VDI.
    pub fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let session = self.session()?;
        session.write_vdi(self.id, buf, offset)?;
        trace!(vdi = %self.name, offset, len = buf.len(), "write");
        Ok(buf.len())
    }

    /// Read from the start of the VDI. No cursor is kept between calls.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.read_at(buf, 0)
    }

    /// Write at the start of the VDI. No cursor is kept between calls.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.write_at(buf, 0)
    }

    /// Release the handle. The VDI itself is kept.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.session()?.close_vdi(self.id)
    }
}

impl Drop for Vdi {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // nothing to release once the session is gone
        if let Some(session) = self.cluster.upgrade() {
            if let Err(e) = session.close_vdi(self.id) {
                warn!(vdi = %self.name, error = %e, "Failed to close dropped vdi handle");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::{FaultPlan, MemoryCluster};
    use crate::error::Error;
    use crate::Cluster;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    fn open(size: u64) -> (MemoryCluster, Cluster) {
        let backend = MemoryCluster::new();
        let cluster = Cluster::connect(&backend, "local").unwrap();
        cluster.create_vdi("testVDI", size).unwrap();
        (backend, cluster)
    }

    #[test]
    fn test_offset_io() {
        let (_backend, cluster) = open(10);
        let mut vdi = cluster.open_vdi("testVDI").unwrap();
        let data = [1u8, 2, 3, 4, 5];

        assert_eq!(vdi.write_at(&data, 5).unwrap(), 5);
        let mut buf = [0u8; 5];
        assert_eq!(vdi.read_at(&mut buf, 5).unwrap(), 5);
        assert_eq!(buf, data);

        // bytes before the offset are untouched
        vdi.read(&mut buf).unwrap();
        assert_eq!(buf, [0u8; 5]);
    }

    #[test]
    fn test_read_and_write_restart_at_zero() {
        let (backend, cluster) = open(4);
        let mut vdi = cluster.open_vdi("testVDI").unwrap();

        vdi.write(b"AB").unwrap();
        vdi.write(b"CD").unwrap();
        assert_eq!(backend.snapshot("testVDI").unwrap(), b"CD\0\0");
    }

    #[test]
    fn test_empty_buffers_are_noops() {
        let (backend, cluster) = open(4);
        let mut vdi = cluster.open_vdi("testVDI").unwrap();
        assert_eq!(vdi.write_at(&[], 0).unwrap(), 0);
        assert_eq!(vdi.read_at(&mut [], 0).unwrap(), 0);
        assert_eq!(backend.write_calls(), 0);
        assert_eq!(backend.read_calls(), 0);
    }

    #[test]
    fn test_write_failure_propagates() {
        let (backend, cluster) = open(8);
        backend.set_faults(FaultPlan::new().fail_nth_write(1));
        let mut vdi = cluster.open_vdi("testVDI").unwrap();
        assert_matches!(vdi.write_at(b"ABCD", 0), Err(Error::Write { offset: 0, len: 4, .. }));
    }

    #[test]
    fn test_close_keeps_vdi() {
        let (backend, cluster) = open(8);
        let vdi = cluster.open_vdi("testVDI").unwrap();
        vdi.close().unwrap();
        assert_eq!(backend.vdi_count("testVDI"), 1);

        // the same name can be reopened after close
        let again = cluster.open_vdi("testVDI").unwrap();
        assert_eq!(again.name(), "testVDI");
    }

    #[test]
    fn test_close_failure_surfaces() {
        let (backend, cluster) = open(8);
        let vdi = cluster.open_vdi("testVDI").unwrap();
        backend.set_faults(FaultPlan::new().fail_close());
        assert_matches!(vdi.close(), Err(Error::Close { .. }));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Property: a write at any in-range offset reads back unchanged.
        #[test]
        fn prop_write_then_read_roundtrip(
            data in prop::collection::vec(any::<u8>(), 1..64),
            offset in 0u64..192,
        ) {
            let (_backend, cluster) = open(256);
            let mut vdi = cluster.open_vdi("testVDI").unwrap();

            prop_assert_eq!(vdi.write_at(&data, offset)?, data.len());
            let mut buf = vec![0u8; data.len()];
            prop_assert_eq!(vdi.read_at(&mut buf, offset)?, data.len());
            prop_assert_eq!(buf, data);
        }
    }
}
