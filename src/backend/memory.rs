//! In-process cluster backend
//!
//! A [`MemoryCluster`] stands in for a Sheepdog cluster. Every connection made
//! through the same `MemoryCluster` sees the same VDIs, so a second
//! "replica" connection reads what the primary wrote. Use this for:
//!
//! - Unit and integration testing without a cluster
//! - Dry runs of the verification pipeline
//! - Fault injection (failed writes, failed reads, corrupted reads)

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tracing::debug;

use super::{ClusterBackend, Connector, SessionGate, VdiId};
use crate::error::{Error, Result};

// =============================================================================
// Fault Plan
// =============================================================================

/// Faults to inject into cluster calls.
///
/// Call numbers are 1-based and counted across every connection of the
/// cluster, per operation kind.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Write calls that fail
    pub failed_writes: Vec<u64>,
    /// Read calls that fail
    pub failed_reads: Vec<u64>,
    /// Read calls that succeed but return altered bytes
    pub corrupted_reads: Vec<u64>,
    /// Refuse every new connection
    pub refuse_connect: bool,
    /// Fail every disconnect
    pub fail_disconnect: bool,
    /// Fail every VDI close
    pub fail_close: bool,
}

impl FaultPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the `n`-th write call.
    pub fn fail_nth_write(mut self, n: u64) -> Self {
        self.failed_writes.push(n);
        self
    }

    /// Fail the `n`-th read call.
    pub fn fail_nth_read(mut self, n: u64) -> Self {
        self.failed_reads.push(n);
        self
    }

    /// Corrupt the data returned by the `n`-th read call.
    pub fn corrupt_nth_read(mut self, n: u64) -> Self {
        self.corrupted_reads.push(n);
        self
    }

    pub fn refuse_connect(mut self) -> Self {
        self.refuse_connect = true;
        self
    }

    pub fn fail_disconnect(mut self) -> Self {
        self.fail_disconnect = true;
        self
    }

    pub fn fail_close(mut self) -> Self {
        self.fail_close = true;
        self
    }
}

// =============================================================================
// Cluster State
// =============================================================================

type VolumeData = Arc<Mutex<Vec<u8>>>;
type LiveGuard<'a> = RwLockReadGuard<'a, bool>;

#[derive(Debug)]
struct StoredVdi {
    name: String,
    data: VolumeData,
}

#[derive(Debug, Default)]
struct ClusterState {
    /// Stored as a list so that duplicate names are representable
    vdis: RwLock<Vec<StoredVdi>>,
    allow_duplicate_names: bool,
    faults: RwLock<FaultPlan>,
    write_calls: AtomicU64,
    read_calls: AtomicU64,
    live_sessions: AtomicU64,
}

/// In-process stand-in for a Sheepdog cluster.
#[derive(Debug, Clone, Default)]
pub struct MemoryCluster {
    state: Arc<ClusterState>,
}

impl MemoryCluster {
    /// Create an empty cluster that rejects duplicate VDI names.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty cluster that accepts several VDIs with one name.
    pub fn allowing_duplicate_names() -> Self {
        Self {
            state: Arc::new(ClusterState {
                allow_duplicate_names: true,
                ..Default::default()
            }),
        }
    }

    /// Replace the fault plan. Call counters are not reset.
    pub fn set_faults(&self, plan: FaultPlan) {
        *self.state.faults.write() = plan;
    }

    /// Builder form of [`MemoryCluster::set_faults`].
    pub fn with_faults(self, plan: FaultPlan) -> Self {
        self.set_faults(plan);
        self
    }

    /// Number of VDIs currently named `name`.
    pub fn vdi_count(&self, name: &str) -> usize {
        self.state
            .vdis
            .read()
            .iter()
            .filter(|v| v.name == name)
            .count()
    }

    /// Names of all stored VDIs, in creation order.
    pub fn vdi_names(&self) -> Vec<String> {
        self.state
            .vdis
            .read()
            .iter()
            .map(|v| v.name.clone())
            .collect()
    }

    /// Copy of the contents of the first VDI named `name`.
    pub fn snapshot(&self, name: &str) -> Option<Vec<u8>> {
        self.state
            .vdis
            .read()
            .iter()
            .find(|v| v.name == name)
            .map(|v| v.data.lock().clone())
    }

    /// Write calls issued so far, failed ones included.
    pub fn write_calls(&self) -> u64 {
        self.state.write_calls.load(Ordering::SeqCst)
    }

    /// Read calls issued so far, failed ones included.
    pub fn read_calls(&self) -> u64 {
        self.state.read_calls.load(Ordering::SeqCst)
    }

    /// Sessions connected and not yet disconnected.
    pub fn live_sessions(&self) -> u64 {
        self.state.live_sessions.load(Ordering::SeqCst)
    }
}

impl Connector for MemoryCluster {
    fn name(&self) -> &str {
        "memory"
    }

    fn connect(&self, endpoint: &str) -> Result<Arc<dyn ClusterBackend>> {
        if endpoint.trim().is_empty() {
            return Err(Error::Connection {
                endpoint: endpoint.to_string(),
                reason: "empty endpoint".into(),
            });
        }
        if self.state.faults.read().refuse_connect {
            return Err(Error::Connection {
                endpoint: endpoint.to_string(),
                reason: "connection refused".into(),
            });
        }

        self.state.live_sessions.fetch_add(1, Ordering::SeqCst);
        debug!(endpoint, "memory session established");

        Ok(Arc::new(MemorySession {
            endpoint: endpoint.to_string(),
            state: Arc::clone(&self.state),
            open: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            gate: SessionGate::new(),
        }))
    }
}

// =============================================================================
// Session
// =============================================================================

#[derive(Debug)]
struct OpenVdi {
    name: String,
    data: VolumeData,
}

#[derive(Debug)]
struct MemorySession {
    endpoint: String,
    state: Arc<ClusterState>,
    open: Mutex<HashMap<u64, OpenVdi>>,
    next_id: AtomicU64,
    gate: SessionGate,
}

impl MemorySession {
    fn ensure_connected(&self) -> std::result::Result<LiveGuard<'_>, String> {
        self.gate.enter()
    }

    /// Resolve an open vdi. The returned guard keeps the session live.
    fn lookup(&self, vdi: VdiId) -> std::result::Result<(LiveGuard<'_>, String, VolumeData), String> {
        let live = self.ensure_connected()?;
        let (name, data) = self
            .open
            .lock()
            .get(&vdi.0)
            .map(|v| (v.name.clone(), Arc::clone(&v.data)))
            .ok_or_else(|| format!("{} is not open", vdi))?;
        Ok((live, name, data))
    }
}

fn range_check(len: usize, offset: u64, size: usize) -> std::result::Result<usize, String> {
    let start = usize::try_from(offset).map_err(|_| format!("offset {} out of range", offset))?;
    match start.checked_add(len) {
        Some(end) if end <= size => Ok(start),
        _ => Err(format!(
            "range {}..{} exceeds vdi size {}",
            offset,
            offset.saturating_add(len as u64),
            size
        )),
    }
}

impl ClusterBackend for MemorySession {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn disconnect(&self) -> Result<()> {
        if self.state.faults.read().fail_disconnect {
            return Err(Error::Disconnection {
                endpoint: self.endpoint.clone(),
                reason: "injected disconnect fault".into(),
            });
        }
        self.gate
            .release(|| Ok(()))
            .map_err(|reason| Error::Disconnection {
                endpoint: self.endpoint.clone(),
                reason,
            })?;
        self.open.lock().clear();
        self.state.live_sessions.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn create_vdi(&self, name: &str, size: u64) -> Result<()> {
        let fail = |reason: String| Error::VolumeCreate {
            vdi: name.to_string(),
            size,
            reason,
        };
        let _live = self.ensure_connected().map_err(fail)?;
        if name.is_empty() {
            return Err(fail("empty vdi name".into()));
        }
        let len = usize::try_from(size).map_err(|_| fail("size too large".into()))?;

        let mut vdis = self.state.vdis.write();
        if !self.state.allow_duplicate_names && vdis.iter().any(|v| v.name == name) {
            return Err(fail("VDI exists already".into()));
        }
        vdis.push(StoredVdi {
            name: name.to_string(),
            data: Arc::new(Mutex::new(vec![0u8; len])),
        });
        Ok(())
    }

    fn delete_vdi(&self, name: &str) -> Result<()> {
        let fail = |reason: String| Error::VolumeDelete {
            vdi: name.to_string(),
            reason,
        };
        let _live = self.ensure_connected().map_err(fail)?;

        let mut vdis = self.state.vdis.write();
        let before = vdis.len();
        vdis.retain(|v| v.name != name);
        if vdis.len() == before {
            return Err(fail("No VDI found".into()));
        }
        debug!(vdi = name, removed = before - vdis.len(), "deleted vdis");
        Ok(())
    }

    fn open_vdi(&self, name: &str) -> Result<VdiId> {
        let fail = |reason: String| Error::VolumeOpen {
            vdi: name.to_string(),
            reason,
        };
        let _live = self.ensure_connected().map_err(fail)?;

        let data = self
            .state
            .vdis
            .read()
            .iter()
            .find(|v| v.name == name)
            .map(|v| Arc::clone(&v.data))
            .ok_or_else(|| fail("No VDI found".into()))?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.open.lock().insert(
            id,
            OpenVdi {
                name: name.to_string(),
                data,
            },
        );
        Ok(VdiId(id))
    }

    fn close_vdi(&self, vdi: VdiId) -> Result<()> {
        let (_live, name, _) = self.lookup(vdi).map_err(|reason| Error::Close {
            vdi: vdi.to_string(),
            reason,
        })?;
        if self.state.faults.read().fail_close {
            return Err(Error::Close {
                vdi: name,
                reason: "injected close fault".into(),
            });
        }
        self.open.lock().remove(&vdi.0);
        Ok(())
    }

    fn read_vdi(&self, vdi: VdiId, buf: &mut [u8], offset: u64) -> Result<()> {
        let call = self.state.read_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let len = buf.len();
        let fail = |name: String, reason: String| Error::Read {
            vdi: name,
            offset,
            len,
            reason,
        };

        let (_live, name, data) = self
            .lookup(vdi)
            .map_err(|reason| fail(vdi.to_string(), reason))?;

        let (failed, corrupted) = {
            let faults = self.state.faults.read();
            (
                faults.failed_reads.contains(&call),
                faults.corrupted_reads.contains(&call),
            )
        };
        if failed {
            return Err(fail(name, format!("injected fault on read call {}", call)));
        }

        let data = data.lock();
        let start = range_check(len, offset, data.len()).map_err(|r| fail(name, r))?;
        buf.copy_from_slice(&data[start..start + len]);

        if corrupted {
            if let Some(first) = buf.first_mut() {
                *first ^= 0x01;
            }
        }
        Ok(())
    }

    fn write_vdi(&self, vdi: VdiId, buf: &[u8], offset: u64) -> Result<()> {
        let call = self.state.write_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let fail = |name: String, reason: String| Error::Write {
            vdi: name,
            offset,
            len: buf.len(),
            reason,
        };

        let (_live, name, data) = self
            .lookup(vdi)
            .map_err(|reason| fail(vdi.to_string(), reason))?;

        if self.state.faults.read().failed_writes.contains(&call) {
            return Err(fail(name, format!("injected fault on write call {}", call)));
        }

        let mut data = data.lock();
        let start = range_check(buf.len(), offset, data.len()).map_err(|r| fail(name, r))?;
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}
