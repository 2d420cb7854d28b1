//! Binding the calling thread to a core.
//!
//! One implementation per platform family is selected at compile time:
//!
//! - Linux/Android: `sched_setaffinity` with a single-CPU set, plus
//!   `set_mempolicy(MPOL_PREFERRED)` when the `numa` feature is enabled.
//! - Windows: `SetThreadAffinityMask` with `1 << core`. NUMA is ignored.
//! - Anything else: [`AffinityError::Unsupported`], nothing is changed.

use crate::error::AffinityError;

/// Whether this build can bind memory to a NUMA node. When it can't, the
/// NUMA id of an [`Affinity`] is always reported as `0`.
pub const NUMA_SUPPORTED: bool = cfg!(all(target_os = "linux", feature = "numa"));

/// Core and NUMA node a thread should be bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Affinity {
    core_id: usize,
    numa_id: u32,
}

impl Affinity {
    pub const fn new(core_id: usize, numa_id: u32) -> Self {
        Self {
            core_id,
            numa_id: if NUMA_SUPPORTED { numa_id } else { 0 },
        }
    }

    pub const fn core_id(&self) -> usize {
        self.core_id
    }

    pub const fn numa_id(&self) -> u32 {
        self.numa_id
    }

    /// Bind the calling thread to this record. See [`apply_affinity`].
    pub fn apply(&self) -> Result<(), AffinityError> {
        apply_affinity(self.core_id, self.numa_id)
    }
}

/// Bind the *calling* thread to logical CPU `core_id` and, where supported,
/// prefer NUMA node `numa_id` for its future memory allocations.
///
/// Indices are handed to the OS as-is; only values that can't be encoded in
/// the platform's CPU mask are rejected up front. Callers that want
/// best-effort pinning can simply ignore the result.
pub fn apply_affinity(core_id: usize, numa_id: u32) -> Result<(), AffinityError> {
    imp::pin_thread_to_core(core_id)?;
    imp::prefer_numa_node(numa_id)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod imp {
    use rustix::process::{ sched_setaffinity, CpuSet, Pid };

    use crate::error::AffinityError;

    pub fn pin_thread_to_core(core: usize) -> Result<(), AffinityError> {
        // `CpuSet::set` panics past the end of the set.
        if core >= CpuSet::MAX_CPU {
            return Err(AffinityError::CoreOutOfRange { core, max: CpuSet::MAX_CPU - 1 });
        }
        let mut set = CpuSet::new();
        set.set(core);
        // pid 0 is the calling thread
        sched_setaffinity(Pid::from_raw(0), &set)
            .map_err(|e| AffinityError::Cpu { core, code: e.raw_os_error() })
    }

    #[cfg(all(target_os = "linux", feature = "numa"))]
    pub fn prefer_numa_node(node: u32) -> Result<(), AffinityError> {
        use std::os::raw::c_ulong;

        const MPOL_PREFERRED: libc::c_long = 1;
        const BITS: usize = c_ulong::BITS as usize;
        // Largest node count a kernel can be configured with (NODES_SHIFT = 10).
        const MAX_NODES: usize = 1024;

        let node_idx = node as usize;
        if node_idx >= MAX_NODES {
            return Err(AffinityError::Numa { node, code: libc::EINVAL });
        }
        let mut mask = [0 as c_ulong; MAX_NODES / BITS];
        mask[node_idx / BITS] |= 1 << (node_idx % BITS);
        // The kernel only looks at `maxnode - 1` bits.
        let maxnode = (MAX_NODES + 1) as c_ulong;

        let res = unsafe {
            libc::syscall(
                libc::SYS_set_mempolicy,
                MPOL_PREFERRED,
                mask.as_ptr(),
                maxnode,
            )
        };
        if res == 0 {
            Ok(())
        } else {
            let code = std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EINVAL);
            Err(AffinityError::Numa { node, code })
        }
    }

    #[cfg(not(all(target_os = "linux", feature = "numa")))]
    pub fn prefer_numa_node(_node: u32) -> Result<(), AffinityError> {
        Ok(())
    }
}

#[cfg(windows)]
mod imp {
    use windows_sys::Win32::System::Threading::{ GetCurrentThread, SetThreadAffinityMask };

    use crate::error::AffinityError;

    pub fn pin_thread_to_core(core: usize) -> Result<(), AffinityError> {
        if core >= usize::BITS as usize {
            return Err(AffinityError::CoreOutOfRange { core, max: usize::BITS as usize - 1 });
        }
        let mask: usize = 1 << core;
        // GetCurrentThread is a pseudo-handle and needs no closing.
        let previous = unsafe { SetThreadAffinityMask(GetCurrentThread(), mask) };
        if previous == 0 {
            let code = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return Err(AffinityError::Cpu { core, code });
        }
        Ok(())
    }

    pub fn prefer_numa_node(_node: u32) -> Result<(), AffinityError> {
        Ok(())
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android", windows)))]
mod imp {
    use crate::error::AffinityError;

    pub fn pin_thread_to_core(_core: usize) -> Result<(), AffinityError> {
        Err(AffinityError::Unsupported)
    }

    pub fn prefer_numa_node(_node: u32) -> Result<(), AffinityError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numa_id_is_zero_without_numa_support() {
        let affinity = Affinity::new(3, 7);
        assert_eq!(affinity.core_id(), 3);
        if NUMA_SUPPORTED {
            assert_eq!(affinity.numa_id(), 7);
        } else {
            assert_eq!(affinity.numa_id(), 0);
        }
    }

    #[test]
    fn out_of_range_core_is_rejected_before_the_os_call() {
        let err = std::thread::spawn(|| apply_affinity(usize::MAX, 0))
            .join()
            .unwrap()
            .unwrap_err();
        if cfg!(any(target_os = "linux", target_os = "android", windows)) {
            assert!(matches!(err, AffinityError::CoreOutOfRange { core: usize::MAX, .. }));
        } else {
            assert_eq!(err, AffinityError::Unsupported);
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn pins_calling_thread_to_one_core() {
        use rustix::process::{ sched_getaffinity, Pid };

        let allowed = sched_getaffinity(Pid::from_raw(0)).unwrap();
        let core = (0..rustix::process::CpuSet::MAX_CPU)
            .find(|&cpu| allowed.is_set(cpu))
            .unwrap();

        let mask = std::thread::spawn(move || {
            imp::pin_thread_to_core(core).unwrap();
            sched_getaffinity(Pid::from_raw(0)).unwrap()
        })
        .join()
        .unwrap();

        assert_eq!(mask.count(), 1);
        assert!(mask.is_set(core));
    }

    #[cfg(all(target_os = "linux", feature = "numa"))]
    #[test]
    fn prefers_numa_node_zero() {
        let outcome = std::thread::spawn(|| imp::prefer_numa_node(0)).join().unwrap();
        assert_eq!(outcome, Ok(()));
    }

    #[cfg(all(target_os = "linux", feature = "numa"))]
    #[test]
    fn impossible_numa_node_is_an_error() {
        let err = std::thread::spawn(|| imp::prefer_numa_node(u32::MAX))
            .join()
            .unwrap()
            .unwrap_err();
        assert_eq!(err, AffinityError::Numa { node: u32::MAX, code: libc::EINVAL });
    }

    #[cfg(all(target_os = "linux", feature = "numa"))]
    #[test]
    fn applies_core_and_numa_node_together() {
        use rustix::process::{ sched_getaffinity, Pid };

        let allowed = sched_getaffinity(Pid::from_raw(0)).unwrap();
        let core = (0..rustix::process::CpuSet::MAX_CPU)
            .find(|&cpu| allowed.is_set(cpu))
            .unwrap();

        let outcome = std::thread::spawn(move || apply_affinity(core, 0)).join().unwrap();
        assert_eq!(outcome, Ok(()));

        let err = std::thread::spawn(move || apply_affinity(core, u32::MAX))
            .join()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, AffinityError::Numa { node: u32::MAX, .. }));
    }
}
