//! Native Sheepdog backend
//!
//! Safe wrappers around the `libsheepdog` client library. The raw
//! `sd_cluster` and `sd_vdi` pointers never leave this module: sessions own
//! the cluster pointer and keep open VDIs in a registry keyed by [`VdiId`].
//!
//! Enable with: `cargo build --features sheepdog`
//!
//! # Safety
//!
//! libsheepdog serialises requests on a cluster internally, so a session
//! may be shared across threads. A single `sd_vdi` is only ever used by the
//! thread holding its `Vdi` handle.

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLockReadGuard};
use tracing::{debug, info};

use super::{ClusterBackend, Connector, SessionGate, VdiId};
use crate::error::{Error, Result};

// =============================================================================
// FFI Bindings
// =============================================================================

mod ffi {
    use libc::{c_char, c_int, c_void, off_t, size_t};

    /// Opaque libsheepdog cluster connection
    pub enum SdCluster {}

    /// Opaque libsheepdog vdi descriptor
    pub enum SdVdi {}

    /// Success code returned by libsheepdog calls
    pub const SD_RES_SUCCESS: c_int = 0;

    extern "C" {
        /// Connect to the cluster at `host` ("host:port"). NULL on failure.
        pub fn sd_connect(host: *mut c_char) -> *mut SdCluster;

        /// Release a cluster connection.
        pub fn sd_disconnect(c: *mut SdCluster) -> c_int;

        /// Create a vdi of `size` bytes.
        pub fn sd_vdi_create(c: *mut SdCluster, name: *mut c_char, size: u64) -> c_int;

        /// Open a vdi. NULL on failure.
        pub fn sd_vdi_open(c: *mut SdCluster, name: *mut c_char) -> *mut SdVdi;

        /// Close a vdi descriptor.
        pub fn sd_vdi_close(c: *mut SdCluster, vdi: *mut SdVdi) -> c_int;

        /// Read `count` bytes at `offset`.
        pub fn sd_vdi_read(
            c: *mut SdCluster,
            vdi: *mut SdVdi,
            buf: *mut c_void,
            count: size_t,
            offset: off_t,
        ) -> c_int;

        /// Write `count` bytes at `offset`.
        pub fn sd_vdi_write(
            c: *mut SdCluster,
            vdi: *mut SdVdi,
            buf: *mut c_void,
            count: size_t,
            offset: off_t,
        ) -> c_int;

        /// Delete every vdi named `name` (all snapshots when `tag` is NULL).
        pub fn sd_vdi_delete(c: *mut SdCluster, name: *mut c_char, tag: *mut c_char) -> c_int;

        /// Human-readable description of a result code.
        pub fn sd_strerror(err: c_int) -> *const c_char;
    }
}

fn describe(code: libc::c_int) -> String {
    // SAFETY: sd_strerror returns a pointer to a static string table entry.
    let msg = unsafe { ffi::sd_strerror(code) };
    if msg.is_null() {
        return format!("sheepdog error {}", code);
    }
    // SAFETY: non-null pointers from sd_strerror are NUL-terminated.
    unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
}

fn last_os_error() -> String {
    std::io::Error::last_os_error().to_string()
}

fn c_string(value: &str) -> std::result::Result<CString, String> {
    CString::new(value).map_err(|_| format!("{:?} contains an interior NUL byte", value))
}

fn c_offset(offset: u64) -> std::result::Result<libc::off_t, String> {
    libc::off_t::try_from(offset).map_err(|_| format!("offset {} out of range", offset))
}

// =============================================================================
// Connector
// =============================================================================

/// Connects to real Sheepdog clusters through `libsheepdog`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SheepdogConnector;

impl SheepdogConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for SheepdogConnector {
    fn name(&self) -> &str {
        "sheepdog"
    }

    fn connect(&self, endpoint: &str) -> Result<Arc<dyn ClusterBackend>> {
        let fail = |reason: String| Error::Connection {
            endpoint: endpoint.to_string(),
            reason,
        };
        let host = c_string(endpoint).map_err(fail)?;

        // SAFETY: host is a valid NUL-terminated string that outlives the call;
        // libsheepdog copies it.
        let raw = unsafe { ffi::sd_connect(host.as_ptr() as *mut libc::c_char) };
        let cluster = NonNull::new(raw).ok_or_else(|| fail(last_os_error()))?;

        info!(endpoint, "connected to sheepdog cluster");
        Ok(Arc::new(SheepdogSession {
            endpoint: endpoint.to_string(),
            cluster,
            vdis: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            gate: SessionGate::new(),
        }))
    }
}

// =============================================================================
// Session
// =============================================================================

type LiveGuard<'a> = RwLockReadGuard<'a, bool>;

struct SheepdogSession {
    endpoint: String,
    cluster: NonNull<ffi::SdCluster>,
    vdis: Mutex<HashMap<u64, (String, NonNull<ffi::SdVdi>)>>,
    next_id: AtomicU64,
    /// Every call into libsheepdog runs inside this gate
    gate: SessionGate,
}

// SAFETY: the cluster pointer is only passed to libsheepdog, which locks
// internally; vdi pointers are reachable only through the registry mutex.
// sd_disconnect runs under the gate's write side, after every call holding
// the read side has returned.
unsafe impl Send for SheepdogSession {}
unsafe impl Sync for SheepdogSession {}

impl std::fmt::Debug for SheepdogSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SheepdogSession")
            .field("endpoint", &self.endpoint)
            .field("open_vdis", &self.vdis.lock().len())
            .finish()
    }
}

impl SheepdogSession {
    /// Resolve an open vdi. The returned guard must outlive the FFI call.
    fn lookup(&self, vdi: VdiId) -> std::result::Result<(LiveGuard<'_>, String, NonNull<ffi::SdVdi>), String> {
        let live = self.gate.enter()?;
        let (name, handle) = self
            .vdis
            .lock()
            .get(&vdi.0)
            .cloned()
            .ok_or_else(|| format!("{} is not open", vdi))?;
        Ok((live, name, handle))
    }
}

impl ClusterBackend for SheepdogSession {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn disconnect(&self) -> Result<()> {
        self.gate
            .release(|| {
                // SAFETY: the cluster pointer came from sd_connect, the gate
                // admits this at most once and no other call is in flight.
                let ret = unsafe { ffi::sd_disconnect(self.cluster.as_ptr()) };
                if ret != ffi::SD_RES_SUCCESS {
                    return Err(describe(ret));
                }
                Ok(())
            })
            .map_err(|reason| Error::Disconnection {
                endpoint: self.endpoint.clone(),
                reason,
            })?;
        self.vdis.lock().clear();
        Ok(())
    }

    fn create_vdi(&self, name: &str, size: u64) -> Result<()> {
        let fail = |reason: String| Error::VolumeCreate {
            vdi: name.to_string(),
            size,
            reason,
        };
        let _live = self.gate.enter().map_err(fail)?;
        let c_name = c_string(name).map_err(fail)?;

        // SAFETY: valid cluster pointer and NUL-terminated name.
        let ret = unsafe {
            ffi::sd_vdi_create(self.cluster.as_ptr(), c_name.as_ptr() as *mut _, size)
        };
        if ret != ffi::SD_RES_SUCCESS {
            return Err(fail(describe(ret)));
        }
        Ok(())
    }

    fn delete_vdi(&self, name: &str) -> Result<()> {
        let fail = |reason: String| Error::VolumeDelete {
            vdi: name.to_string(),
            reason,
        };
        let _live = self.gate.enter().map_err(fail)?;
        let c_name = c_string(name).map_err(fail)?;

        // SAFETY: valid cluster pointer and name; a NULL tag selects every
        // vdi with this name.
        let ret = unsafe {
            ffi::sd_vdi_delete(
                self.cluster.as_ptr(),
                c_name.as_ptr() as *mut _,
                std::ptr::null_mut(),
            )
        };
        if ret != ffi::SD_RES_SUCCESS {
            return Err(fail(describe(ret)));
        }
        Ok(())
    }

    fn open_vdi(&self, name: &str) -> Result<VdiId> {
        let fail = |reason: String| Error::VolumeOpen {
            vdi: name.to_string(),
            reason,
        };
        let _live = self.gate.enter().map_err(fail)?;
        let c_name = c_string(name).map_err(fail)?;

        // SAFETY: valid cluster pointer and NUL-terminated name.
        let raw = unsafe { ffi::sd_vdi_open(self.cluster.as_ptr(), c_name.as_ptr() as *mut _) };
        let handle = NonNull::new(raw).ok_or_else(|| fail(last_os_error()))?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.vdis.lock().insert(id, (name.to_string(), handle));
        debug!(vdi = name, id, "opened sheepdog vdi");
        Ok(VdiId(id))
    }

    fn close_vdi(&self, vdi: VdiId) -> Result<()> {
        let (_live, name, handle) = self.lookup(vdi).map_err(|reason| Error::Close {
            vdi: vdi.to_string(),
            reason,
        })?;

        // SAFETY: handle came from sd_vdi_open on this cluster and is still
        // registered.
        let ret = unsafe { ffi::sd_vdi_close(self.cluster.as_ptr(), handle.as_ptr()) };
        if ret != ffi::SD_RES_SUCCESS {
            return Err(Error::Close {
                vdi: name,
                reason: describe(ret),
            });
        }
        self.vdis.lock().remove(&vdi.0);
        Ok(())
    }

    fn read_vdi(&self, vdi: VdiId, buf: &mut [u8], offset: u64) -> Result<()> {
        let len = buf.len();
        let fail = |name: String, reason: String| Error::Read {
            vdi: name,
            offset,
            len,
            reason,
        };
        let (_live, name, handle) = self
            .lookup(vdi)
            .map_err(|reason| fail(vdi.to_string(), reason))?;
        if len == 0 {
            return Ok(());
        }
        let off = c_offset(offset).map_err(|r| fail(name.clone(), r))?;

        // SAFETY: buf is valid for `len` writable bytes for the whole call.
        let ret = unsafe {
            ffi::sd_vdi_read(
                self.cluster.as_ptr(),
                handle.as_ptr(),
                buf.as_mut_ptr().cast(),
                len,
                off,
            )
        };
        if ret != ffi::SD_RES_SUCCESS {
            return Err(fail(name, describe(ret)));
        }
        Ok(())
    }

    fn write_vdi(&self, vdi: VdiId, buf: &[u8], offset: u64) -> Result<()> {
        let len = buf.len();
        let fail = |name: String, reason: String| Error::Write {
            vdi: name,
            offset,
            len,
            reason,
        };
        let (_live, name, handle) = self
            .lookup(vdi)
            .map_err(|reason| fail(vdi.to_string(), reason))?;
        if len == 0 {
            return Ok(());
        }
        let off = c_offset(offset).map_err(|r| fail(name.clone(), r))?;

        // SAFETY: libsheepdog only reads from the buffer despite the mutable
        // pointer in its signature.
        let ret = unsafe {
            ffi::sd_vdi_write(
                self.cluster.as_ptr(),
                handle.as_ptr(),
                buf.as_ptr() as *mut libc::c_void,
                len,
                off,
            )
        };
        if ret != ffi::SD_RES_SUCCESS {
            return Err(fail(name, describe(ret)));
        }
        Ok(())
    }
}
