//! Executing-CPU lookup.
//!
//! [`CpuSource`] is the seam between the slab engine and the OS. The OS
//! implementation reads the CPU id with `sched_getcpu`, which glibc serves
//! from the registered restartable-sequence area when the kernel supports
//! rseq. Without rseq the id comes from a slower lookup and can go stale
//! mid-section, so the slab engine stops treating migrations as aborts.

/// Source of the id of the CPU the calling thread is running on.
pub trait CpuSource: Send + Sync {
    /// CPU id of the calling thread. May be stale by the time it returns.
    fn current_cpu(&self) -> usize;

    /// True if ids come from restartable-sequence support.
    fn is_fast(&self) -> bool;
}

impl<T: CpuSource + ?Sized> CpuSource for &T {
    fn current_cpu(&self) -> usize {
        (**self).current_cpu()
    }

    fn is_fast(&self) -> bool {
        (**self).is_fast()
    }
}

impl<T: CpuSource + ?Sized> CpuSource for std::sync::Arc<T> {
    fn current_cpu(&self) -> usize {
        (**self).current_cpu()
    }

    fn is_fast(&self) -> bool {
        (**self).is_fast()
    }
}

/// CPU ids from the operating system.
#[derive(Debug, Clone, Copy)]
pub struct OsCpuSource {
    fast: bool,
}

impl OsCpuSource {
    /// Probes the kernel for restartable-sequence support.
    #[must_use]
    pub fn detect() -> Self {
        let fast = rseq_supported();
        log::debug!("percpu-alloc: rseq support detected: {fast}");
        Self { fast }
    }

    /// An OS source that never claims rseq support.
    #[must_use]
    pub const fn fallback() -> Self {
        Self { fast: false }
    }
}

impl CpuSource for OsCpuSource {
    #[cfg(target_os = "linux")]
    fn current_cpu(&self) -> usize {
        // SAFETY: sched_getcpu takes no arguments and has no preconditions.
        let cpu = unsafe { libc::sched_getcpu() };
        usize::try_from(cpu).unwrap_or(0)
    }

    #[cfg(not(target_os = "linux"))]
    fn current_cpu(&self) -> usize {
        0
    }

    fn is_fast(&self) -> bool {
        self.fast
    }
}

/// Returns true if the kernel implements the rseq syscall.
///
/// A registration with a null area is always rejected; the errno tells us
/// whether it was rejected for being invalid (supported) or unknown
/// (`ENOSYS`).
#[cfg(target_os = "linux")]
#[must_use]
pub fn rseq_supported() -> bool {
    // SAFETY: a null rseq area with zero length is never dereferenced; the
    // kernel validates the arguments and fails with EINVAL or ENOSYS.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_rseq,
            std::ptr::null_mut::<libc::c_void>(),
            0u32,
            0i32,
            0u32,
        )
    };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ENOSYS)
}

#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn rseq_supported() -> bool {
    false
}

/// Number of CPUs configured in the system (online or not).
#[must_use]
pub fn num_configured_cpus() -> usize {
    // SAFETY: sysconf only reads a system constant.
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    match usize::try_from(n) {
        Ok(0) | Err(_) => std::thread::available_parallelism().map_or(1, |n| n.get()),
        Ok(n) => n,
    }
}
