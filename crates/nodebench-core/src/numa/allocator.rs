//! # Node-Local Allocator
//!
//! Places values on a chosen NUMA node and frees them through the same
//! backend automatically.
//!
//! Backends implement [`RawNodeAlloc`]:
//!
//! - [`DirectBackend`] maps memory with `mmap` and binds it with
//!   `mbind(MPOL_PREFERRED)`, using raw libc syscalls instead of libnuma.
//! - [`PooledBackend`](super::PooledBackend) serves small layouts from a
//!   pre-warmed per-node arena.
//! - [`SystemBackend`] is the process heap, with no placement at all.
//!
//! Placement is best effort. The kernel may fall back to another node under
//! memory pressure, and a failed `mbind` is logged rather than returned.

#![allow(unsafe_code)]

use std::alloc::Layout;
use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;

use super::arena::{PoolConfig, PooledBackend};
use super::{NumaError, NumaNodeId};

/// Raw node-targeted allocation.
///
/// Implementations must return memory aligned to `layout.align()` and at
/// least `layout.size()` bytes long. Zero-sized layouts are never passed in.
pub trait RawNodeAlloc: Send + Sync + fmt::Debug {
    /// Short backend name for logs and reports.
    fn name(&self) -> &'static str;

    /// Allocate `layout` with a preference for `node`.
    ///
    /// # Errors
    ///
    /// Returns [`NumaError::AllocationFailed`] if the backend is exhausted.
    fn alloc_on_node(&self, node: NumaNodeId, layout: Layout) -> Result<NonNull<u8>, NumaError>;

    /// Return memory to the backend.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `alloc_on_node` on this backend with the same
    /// `node` and `layout`, and must not be used afterwards.
    unsafe fn free(&self, ptr: NonNull<u8>, node: NumaNodeId, layout: Layout);
}

/// Which NUMA backend places node-local data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackendKind {
    /// One `mmap` + `mbind` per allocation.
    #[default]
    Direct,
    /// Pre-warmed per-node arena.
    Pooled,
}

impl BackendKind {
    /// Lowercase name, as accepted by `FromStr`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Pooled => "pooled",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// System page size, queried once.
#[must_use]
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        #[cfg(unix)]
        {
            // SAFETY: sysconf has no preconditions
            let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if let Ok(size) = usize::try_from(size) {
                if size > 0 {
                    return size;
                }
            }
        }
        4096
    })
}

/// The process heap. Makes no placement attempt.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBackend;

impl RawNodeAlloc for SystemBackend {
    fn name(&self) -> &'static str {
        "system"
    }

    fn alloc_on_node(&self, _node: NumaNodeId, layout: Layout) -> Result<NonNull<u8>, NumaError> {
        // SAFETY: layout has non-zero size per the trait contract
        let ptr = unsafe { std::alloc::alloc(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            NumaError::AllocationFailed(format!("heap allocation of {} bytes failed", layout.size()))
        })
    }

    unsafe fn free(&self, ptr: NonNull<u8>, _node: NumaNodeId, layout: Layout) {
        std::alloc::dealloc(ptr.as_ptr(), layout);
    }
}

/// Page-granular node-local mappings via `mmap` + `mbind`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectBackend;

impl DirectBackend {
    /// Length of the mapping that backs a `size`-byte allocation.
    #[must_use]
    pub fn mapping_len(size: usize) -> usize {
        size.next_multiple_of(page_size())
    }

    /// Map `len` bytes (a multiple of the page size) preferring `node`.
    pub(crate) fn map_on_node(node: NumaNodeId, len: usize) -> Result<NonNull<u8>, NumaError> {
        #[cfg(target_os = "linux")]
        {
            // SAFETY: anonymous private mapping with no address hint
            let ptr = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(NumaError::AllocationFailed(format!(
                    "mmap of {len} bytes failed: {}",
                    std::io::Error::last_os_error()
                )));
            }

            if len >= HUGE_PAGE_SIZE {
                // SAFETY: `ptr` was just returned successfully from mmap with
                // length `len`; MADV_HUGEPAGE is advisory only.
                unsafe {
                    libc::madvise(ptr, len, libc::MADV_HUGEPAGE);
                }
            }

            bind_preferred(ptr.cast(), len, node);

            NonNull::new(ptr.cast()).ok_or_else(|| {
                NumaError::AllocationFailed("mmap returned a null mapping".to_string())
            })
        }

        #[cfg(not(target_os = "linux"))]
        {
            let _ = node;
            let layout = Layout::from_size_align(len, page_size())
                .map_err(|e| NumaError::AllocationFailed(e.to_string()))?;
            // SAFETY: layout is valid and non-zero
            let ptr = unsafe { std::alloc::alloc(layout) };
            NonNull::new(ptr).ok_or_else(|| {
                NumaError::AllocationFailed(format!("heap allocation of {len} bytes failed"))
            })
        }
    }

    /// Release a mapping made by [`map_on_node`](Self::map_on_node).
    ///
    /// # Safety
    ///
    /// `ptr` and `len` must describe exactly one live mapping.
    pub(crate) unsafe fn unmap(ptr: NonNull<u8>, len: usize) {
        #[cfg(target_os = "linux")]
        {
            libc::munmap(ptr.as_ptr().cast(), len);
        }

        #[cfg(not(target_os = "linux"))]
        {
            if let Ok(layout) = Layout::from_size_align(len, page_size()) {
                std::alloc::dealloc(ptr.as_ptr(), layout);
            }
        }
    }
}

impl RawNodeAlloc for DirectBackend {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn alloc_on_node(&self, node: NumaNodeId, layout: Layout) -> Result<NonNull<u8>, NumaError> {
        if layout.align() > page_size() {
            return Err(NumaError::AllocationFailed(format!(
                "alignment {} exceeds page size {}",
                layout.align(),
                page_size()
            )));
        }
        Self::map_on_node(node, Self::mapping_len(layout.size()))
    }

    unsafe fn free(&self, ptr: NonNull<u8>, _node: NumaNodeId, layout: Layout) {
        Self::unmap(ptr, Self::mapping_len(layout.size()));
    }
}

#[cfg(target_os = "linux")]
const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

#[cfg(target_os = "linux")]
static MBIND_WARNED: AtomicBool = AtomicBool::new(false);

/// Set a preferred-node policy on a fresh mapping. Failure only warns.
#[cfg(target_os = "linux")]
fn bind_preferred(ptr: *mut u8, len: usize, node: NumaNodeId) {
    // MPOL_PREFERRED = 1 - allocate on the node, fall back when it is full
    const MPOL_PREFERRED: i32 = 1;

    let Some(nodemask) = 1u64.checked_shl(u32::from(node.get())) else {
        tracing::warn!(%node, "node id beyond mbind mask, placement left to the kernel");
        return;
    };

    // SAFETY: `ptr`/`len` describe a mapping we own; nodemask outlives the call
    let result = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            ptr,
            len,
            MPOL_PREFERRED,
            &raw const nodemask,
            64usize, // maxnode
            0u32,    // flags
        )
    };

    if result < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOSYS) {
            return;
        }
        // Every allocation on a missing node fails the same way
        if MBIND_WARNED.swap(true, Ordering::Relaxed) {
            tracing::debug!(%node, "mbind failed (non-fatal): {err}");
        } else {
            tracing::warn!(%node, "mbind failed (non-fatal), repeats logged at debug: {err}");
        }
    }
}

/// The NUMA node backing the page that contains `ptr`.
///
/// Returns `None` when the page is not yet faulted in or the query is not
/// supported.
#[cfg(target_os = "linux")]
#[must_use]
pub fn memory_node<T: ?Sized>(ptr: *const T) -> Option<NumaNodeId> {
    let addr = ptr.cast::<u8>();
    if addr.is_null() {
        return None;
    }

    let mut status: i32 = -1;
    let page_ptr = addr.cast_mut().cast::<libc::c_void>();

    // SAFETY: move_pages with a null node list only queries status
    let result = unsafe {
        libc::syscall(
            libc::SYS_move_pages,
            0i32, // self
            1usize,
            &raw const page_ptr,
            ptr::null::<i32>(),
            &raw mut status,
            0i32,
        )
    };

    if result == 0 {
        u16::try_from(status).ok().map(NumaNodeId::new)
    } else {
        None
    }
}

/// The NUMA node backing `ptr` (non-Linux fallback, always unknown).
#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn memory_node<T: ?Sized>(_ptr: *const T) -> Option<NumaNodeId> {
    None
}

/// Allocates values on chosen nodes and hands them out as [`NodeBox`]es.
#[derive(Debug)]
pub struct NodeLocalAllocator {
    backend: Box<dyn RawNodeAlloc>,
}

impl NodeLocalAllocator {
    /// Allocator over any backend.
    #[must_use]
    pub fn from_backend(backend: Box<dyn RawNodeAlloc>) -> Self {
        Self { backend }
    }

    /// `mmap` + `mbind` per allocation.
    #[must_use]
    pub fn direct() -> Self {
        Self::from_backend(Box::new(DirectBackend))
    }

    /// Pre-warmed arenas for each of `nodes`.
    ///
    /// # Errors
    ///
    /// Returns [`NumaError::AllocationFailed`] if warming an arena fails.
    pub fn pooled(nodes: &[NumaNodeId], config: PoolConfig) -> Result<Self, NumaError> {
        Ok(Self::from_backend(Box::new(PooledBackend::new(nodes, config)?)))
    }

    /// Plain heap allocation, ignoring the node.
    #[must_use]
    pub fn system() -> Self {
        Self::from_backend(Box::new(SystemBackend))
    }

    /// Name of the backend in use.
    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Move `value` into memory preferring `node`.
    ///
    /// # Errors
    ///
    /// Returns [`NumaError::AllocationFailed`] on backend exhaustion. Retrying
    /// without freeing anything will not change the outcome.
    pub fn allocate<T>(&self, node: NumaNodeId, value: T) -> Result<NodeBox<'_, T>, NumaError> {
        let layout = Layout::new::<T>();
        let ptr = if layout.size() == 0 {
            NonNull::dangling()
        } else {
            self.backend.alloc_on_node(node, layout)?.cast::<T>()
        };

        // SAFETY: ptr is valid for writes of one T and suitably aligned
        unsafe { ptr.as_ptr().write(value) };

        Ok(NodeBox {
            ptr,
            node,
            alloc: self,
            _owns: PhantomData,
        })
    }

    /// Drop a value and return its memory. Same as dropping the box.
    pub fn deallocate<T>(&self, boxed: NodeBox<'_, T>) {
        debug_assert!(ptr::eq(self, boxed.alloc), "NodeBox freed through a foreign allocator");
        drop(boxed);
    }

    /// A placement handle for `node`.
    #[must_use]
    pub fn placement(&self, node: NumaNodeId) -> NodePlacement<'_> {
        NodePlacement { alloc: self, node }
    }

    /// # Safety
    ///
    /// `ptr` must come from `allocate::<T>` on this allocator with `node`,
    /// and the value must already be dropped or moved out.
    unsafe fn release(&self, ptr: NonNull<u8>, node: NumaNodeId, layout: Layout) {
        if layout.size() != 0 {
            self.backend.free(ptr, node, layout);
        }
    }
}

/// An allocator paired with a target node.
///
/// Containers carry one so every internal node lands on the same NUMA node
/// as the container itself.
#[derive(Debug, Clone, Copy)]
pub struct NodePlacement<'a> {
    alloc: &'a NodeLocalAllocator,
    node: NumaNodeId,
}

impl<'a> NodePlacement<'a> {
    /// Target node.
    #[must_use]
    pub fn node(&self) -> NumaNodeId {
        self.node
    }

    /// The allocator behind this placement.
    #[must_use]
    pub fn allocator(&self) -> &'a NodeLocalAllocator {
        self.alloc
    }

    /// Place `value` on this node.
    ///
    /// # Errors
    ///
    /// Returns [`NumaError::AllocationFailed`] on backend exhaustion.
    pub fn boxed<T>(&self, value: T) -> Result<NodeBox<'a, T>, NumaError> {
        self.alloc.allocate(self.node, value)
    }
}

/// Owned value living in node-local memory.
///
/// Dropping it runs `T`'s destructor and frees the memory through the
/// backend that produced it.
pub struct NodeBox<'a, T> {
    ptr: NonNull<T>,
    node: NumaNodeId,
    alloc: &'a NodeLocalAllocator,
    _owns: PhantomData<T>,
}

// SAFETY: NodeBox owns its T exclusively, like Box<T>
unsafe impl<T: Send> Send for NodeBox<'_, T> {}
// SAFETY: shared access only hands out &T
unsafe impl<T: Sync> Sync for NodeBox<'_, T> {}

impl<T> NodeBox<'_, T> {
    /// The node this value was placed on.
    #[must_use]
    pub fn node(this: &Self) -> NumaNodeId {
        this.node
    }

    /// Raw address of the value, e.g. for [`memory_node`].
    #[must_use]
    pub fn as_ptr(this: &Self) -> *const T {
        this.ptr.as_ptr()
    }

    /// Mutable raw address of the value. It stays valid while the box
    /// lives, even after the box is moved.
    pub(crate) fn as_non_null(this: &mut Self) -> NonNull<T> {
        this.ptr
    }

    /// Move the value out and free its memory.
    #[must_use]
    pub fn into_inner(this: Self) -> T {
        let this = ManuallyDrop::new(this);
        // SAFETY: the value is initialized and is read exactly once
        let value = unsafe { this.ptr.as_ptr().read() };
        // SAFETY: memory came from this allocator and the value was moved out
        unsafe { this.alloc.release(this.ptr.cast(), this.node, Layout::new::<T>()) };
        value
    }
}

impl<T> Deref for NodeBox<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: ptr is valid and initialized for the box's lifetime
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for NodeBox<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: we hold the only reference to the value
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> Drop for NodeBox<'_, T> {
    fn drop(&mut self) {
        // SAFETY: value is initialized; memory came from self.alloc with this layout
        unsafe {
            ptr::drop_in_place(self.ptr.as_ptr());
            self.alloc.release(self.ptr.cast(), self.node, Layout::new::<T>());
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for NodeBox<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeBox")
            .field("node", &self.node)
            .field("value", &**self)
            .finish()
    }
}

/// Backend wrapper that counts calls, for instrumentation and tests.
#[derive(Debug)]
pub struct CountingBackend<B> {
    inner: B,
    allocations: AtomicU64,
    frees: AtomicU64,
}

impl<B: RawNodeAlloc> CountingBackend<B> {
    /// Wrap `inner`.
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
        }
    }
}

impl<B> CountingBackend<B> {
    /// Allocation calls so far, including failed ones.
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Free calls so far.
    #[must_use]
    pub fn frees(&self) -> u64 {
        self.frees.load(Ordering::Relaxed)
    }
}

impl<B: RawNodeAlloc> RawNodeAlloc for CountingBackend<B> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn alloc_on_node(&self, node: NumaNodeId, layout: Layout) -> Result<NonNull<u8>, NumaError> {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.inner.alloc_on_node(node, layout)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, node: NumaNodeId, layout: Layout) {
        self.frees.fetch_add(1, Ordering::Relaxed);
        self.inner.free(ptr, node, layout);
    }
}

// Lets a test keep a handle to the counters after the allocator owns the backend.
impl<B: RawNodeAlloc> RawNodeAlloc for std::sync::Arc<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn alloc_on_node(&self, node: NumaNodeId, layout: Layout) -> Result<NonNull<u8>, NumaError> {
        (**self).alloc_on_node(node, layout)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, node: NumaNodeId, layout: Layout) {
        (**self).free(ptr, node, layout);
    }
}
