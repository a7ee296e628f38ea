use std::io;

use log::{info, warn};
use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
use nix::unistd::{gettid, Pid};

/// Pins the current thread to one CPU core.
///
/// Does not fail: a warning is logged and the thread keeps running unpinned when
/// the core is unknown or the kernel refuses the mask.
pub fn pin_thread_to_core(core_id: usize) -> bool {
    let known = core_affinity::get_core_ids()
        .map(|ids| ids.iter().any(|c| c.id == core_id))
        .unwrap_or(false);
    if !known {
        warn!("Core {} is not available to this process (running floating)", core_id);
        return false;
    }

    if !core_affinity::set_for_current(core_affinity::CoreId { id: core_id }) {
        warn!("Failed to pin thread {} to core {} (running floating)", thread_id(), core_id);
        return false;
    }

    info!("Thread {} pinned to core {}", thread_id(), core_id);
    true
}

/// Cores this process may schedule on, in ascending order.
pub fn available_cores() -> Vec<usize> {
    let mut ids: Vec<usize> = core_affinity::get_core_ids()
        .map(|ids| ids.into_iter().map(|c| c.id).collect())
        .unwrap_or_default();
    ids.sort_unstable();
    ids
}

/// CPU indices in the calling thread's affinity mask.
pub fn current_affinity() -> io::Result<Vec<usize>> {
    let set = sched_getaffinity(Pid::from_raw(0)).map_err(io::Error::from)?;
    let mut cores = Vec::new();
    for cpu in 0..CpuSet::count() {
        if set.is_set(cpu).map_err(io::Error::from)? {
            cores.push(cpu);
        }
    }
    Ok(cores)
}

/// Replaces the calling thread's affinity mask with `cores`.
pub fn set_affinity(cores: &[usize]) -> io::Result<()> {
    if cores.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty CPU set"));
    }
    let mut set = CpuSet::new();
    for &cpu in cores {
        set.set(cpu).map_err(io::Error::from)?;
    }
    sched_setaffinity(Pid::from_raw(0), &set).map_err(io::Error::from)
}

/// Kernel thread id of the caller.
pub fn thread_id() -> i32 {
    gettid().as_raw()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affinity_round_trip() {
        let initial = current_affinity().unwrap();
        assert!(!initial.is_empty());

        set_affinity(&initial[..1]).unwrap();
        assert_eq!(current_affinity().unwrap(), vec![initial[0]]);

        set_affinity(&initial).unwrap();
        assert_eq!(current_affinity().unwrap(), initial);
    }

    #[test]
    fn test_available_cores_cover_current_mask() {
        let cores = available_cores();
        assert!(!cores.is_empty());
        assert!(cores.windows(2).all(|w| w[0] < w[1]));
        for cpu in current_affinity().unwrap() {
            assert!(cores.contains(&cpu));
        }
    }

    #[test]
    fn test_empty_mask_rejected() {
        let err = set_affinity(&[]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_thread_id_is_positive() {
        assert!(thread_id() > 0);
    }
}
