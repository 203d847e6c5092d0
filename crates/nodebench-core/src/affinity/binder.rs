//! Node affinity binding via `pthread_setaffinity_np`.

#![allow(unsafe_code)]

use std::io;
use std::thread::JoinHandle;

use super::AffinityError;
use crate::numa::{CpuSet, NodeCpuTopology, NumaNodeId, SysfsTopology, TopologySource};

/// Handle to an OS thread that can be bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadRef(libc::pthread_t);

impl ThreadRef {
    /// The calling thread.
    #[must_use]
    pub fn current() -> Self {
        // SAFETY: pthread_self has no preconditions and always succeeds
        Self(unsafe { libc::pthread_self() })
    }

    /// A thread spawned through `std::thread`.
    ///
    /// The handle must stay joinable while it is bound.
    #[must_use]
    #[allow(clippy::unnecessary_cast)]
    pub fn of<T>(handle: &JoinHandle<T>) -> Self {
        use std::os::unix::thread::JoinHandleExt;
        Self(handle.as_pthread_t() as libc::pthread_t)
    }
}

/// Pins threads to NUMA nodes using a shared topology cache.
#[derive(Debug)]
pub struct AffinityBinder<'t, S = SysfsTopology> {
    topology: &'t NodeCpuTopology<S>,
}

impl<S> Clone for AffinityBinder<'_, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for AffinityBinder<'_, S> {}

impl<'t, S: TopologySource> AffinityBinder<'t, S> {
    /// Binder over `topology`.
    #[must_use]
    pub fn new(topology: &'t NodeCpuTopology<S>) -> Self {
        Self { topology }
    }

    /// Restrict `thread` to the CPUs of `node`.
    ///
    /// Returns the CPU set the thread is now limited to.
    ///
    /// # Errors
    ///
    /// Returns [`AffinityError::Topology`] if the node cannot be resolved and
    /// [`AffinityError::BindFailed`] if the OS rejects the mask.
    pub fn bind(&self, thread: ThreadRef, node: NumaNodeId) -> Result<CpuSet, AffinityError> {
        let cpus = self.topology.cpus_for_node(node)?;
        set_thread_affinity(thread, &cpus)
            .map_err(|source| AffinityError::BindFailed { node, source })?;
        tracing::debug!(%node, cpus = %cpus, "bound thread to NUMA node");
        Ok(cpus)
    }

    /// Restrict the calling thread to the CPUs of `node`.
    ///
    /// # Errors
    ///
    /// See [`bind`](Self::bind).
    pub fn bind_current(&self, node: NumaNodeId) -> Result<CpuSet, AffinityError> {
        self.bind(ThreadRef::current(), node)
    }

    /// The topology this binder resolves nodes with.
    #[must_use]
    pub fn topology(&self) -> &'t NodeCpuTopology<S> {
        self.topology
    }
}

#[cfg(target_os = "linux")]
fn set_thread_affinity(thread: ThreadRef, cpus: &CpuSet) -> io::Result<()> {
    use libc::{cpu_set_t, CPU_SET, CPU_SETSIZE, CPU_ZERO};
    use std::mem;

    let max_cpus = usize::try_from(CPU_SETSIZE).unwrap_or(0);

    // SAFETY: cpu_set_t is plain data; CPU_ZERO initializes it
    let mut set: cpu_set_t = unsafe { mem::zeroed() };
    // SAFETY: set is a valid cpu_set_t
    unsafe { CPU_ZERO(&mut set) };
    for cpu in cpus.iter() {
        if cpu >= max_cpus {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cpu {cpu} is beyond CPU_SETSIZE ({max_cpus})"),
            ));
        }
        // SAFETY: cpu < CPU_SETSIZE
        unsafe { CPU_SET(cpu, &mut set) };
    }

    // SAFETY: thread is a live pthread handle and set is initialized
    let rc = unsafe {
        libc::pthread_setaffinity_np(thread.0, mem::size_of::<cpu_set_t>(), &raw const set)
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}

#[cfg(not(target_os = "linux"))]
fn set_thread_affinity(_thread: ThreadRef, _cpus: &CpuSet) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "thread affinity is not supported on this platform",
    ))
}

/// CPUs the calling thread may currently run on.
///
/// # Errors
///
/// Returns the OS error if the mask cannot be read.
#[cfg(target_os = "linux")]
pub fn current_thread_cpus() -> io::Result<Vec<usize>> {
    use libc::{cpu_set_t, CPU_ISSET, CPU_SETSIZE};
    use std::mem;

    // SAFETY: cpu_set_t is plain data and sched_getaffinity fills it
    let mut set: cpu_set_t = unsafe { mem::zeroed() };
    // SAFETY: pid 0 means the calling thread; set is large enough
    let rc = unsafe { libc::sched_getaffinity(0, mem::size_of::<cpu_set_t>(), &raw mut set) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    let max_cpus = usize::try_from(CPU_SETSIZE).unwrap_or(0);
    // SAFETY: every index is below CPU_SETSIZE
    Ok((0..max_cpus).filter(|&cpu| unsafe { CPU_ISSET(cpu, &set) }).collect())
}

/// CPUs the calling thread may currently run on (unsupported here).
///
/// # Errors
///
/// Always returns [`io::ErrorKind::Unsupported`].
#[cfg(not(target_os = "linux"))]
pub fn current_thread_cpus() -> io::Result<Vec<usize>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "thread affinity is not supported on this platform",
    ))
}
