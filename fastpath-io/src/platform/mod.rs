//! Host collaborators used around the fast path: CPU placement and interface lookup.

pub mod affinity;
pub mod iface;

/// Locks the pages currently mapped into the process into physical RAM.
///
/// Only `MCL_CURRENT` is requested. Slot buffers lock their own pages as they are
/// allocated, so future mappings are not forced past `ulimit -l`.
///
/// Failure is not fatal; it is logged and the process continues unlocked.
pub fn lock_memory_pages() -> bool {
    // SAFETY: FFI call with valid flags.
    let ret = unsafe { libc::mlockall(libc::MCL_CURRENT) };

    if ret != 0 {
        let err = std::io::Error::last_os_error();
        log::warn!("Failed to lock memory pages (mlockall): {}.", err);
        log::warn!("Fix: Run 'ulimit -l unlimited' or grant CAP_IPC_LOCK. Continuing unlocked.");
        return false;
    }
    true
}
