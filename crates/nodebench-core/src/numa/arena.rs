//! Pre-warmed per-node arena.
//!
//! Each node owns a list of large chunks mapped through [`DirectBackend`].
//! Small layouts are carved from the current chunk with a bump pointer and
//! recycled through intrusive per-size-class free lists, so steady churn
//! never reaches the kernel. Layouts too large or too strictly aligned for
//! the size classes go straight to the direct backend.

#![allow(unsafe_code)]

use std::alloc::Layout;
use std::ptr::NonNull;

use parking_lot::Mutex;

use super::allocator::{page_size, DirectBackend, RawNodeAlloc};
use super::{NumaError, NumaNodeId};

/// Granularity of the size classes.
pub const SIZE_CLASS_BYTES: usize = 16;

/// Largest layout served from the arena.
pub const MAX_POOLED_SIZE: usize = 1024;

const NUM_CLASSES: usize = MAX_POOLED_SIZE / SIZE_CLASS_BYTES;

/// Sizing for [`PooledBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Bytes per chunk, rounded up to the page size.
    pub chunk_size: usize,
    /// Chunks mapped and touched up front, per node.
    pub warm_chunks: usize,
    /// Upper bound on chunks per node. `None` grows without limit.
    pub max_chunks: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            chunk_size: 2 * 1024 * 1024,
            warm_chunks: 1,
            max_chunks: None,
        }
    }
}

/// Point-in-time arena counters for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    /// Chunks currently mapped.
    pub chunks: usize,
    /// Blocks handed out and not yet freed.
    pub live_blocks: usize,
}

fn size_class(layout: Layout) -> Option<usize> {
    if layout.size() > MAX_POOLED_SIZE || layout.align() > SIZE_CLASS_BYTES {
        return None;
    }
    Some(layout.size().max(1).div_ceil(SIZE_CLASS_BYTES) - 1)
}

const fn block_size(class: usize) -> usize {
    (class + 1) * SIZE_CLASS_BYTES
}

struct FreeBlock {
    next: Option<NonNull<FreeBlock>>,
}

#[derive(Debug)]
struct NodeArena {
    node: NumaNodeId,
    chunk_size: usize,
    max_chunks: Option<usize>,
    chunks: Vec<NonNull<u8>>,
    current: Option<usize>,
    cursor: usize,
    free_lists: [Option<NonNull<FreeBlock>>; NUM_CLASSES],
    live_blocks: usize,
}

// SAFETY: the arena exclusively owns its chunks; access is serialized by a Mutex
unsafe impl Send for NodeArena {}

impl NodeArena {
    fn new(node: NumaNodeId, config: &PoolConfig, chunk_size: usize) -> Result<Self, NumaError> {
        let mut arena = Self {
            node,
            chunk_size,
            max_chunks: config.max_chunks,
            chunks: Vec::new(),
            current: None,
            cursor: 0,
            free_lists: [None; NUM_CLASSES],
            live_blocks: 0,
        };

        for _ in 0..config.warm_chunks {
            let chunk = arena.map_chunk()?;
            prefault(chunk, chunk_size);
        }
        Ok(arena)
    }

    fn map_chunk(&mut self) -> Result<NonNull<u8>, NumaError> {
        if self.max_chunks.is_some_and(|max| self.chunks.len() >= max) {
            return Err(NumaError::AllocationFailed(format!(
                "pooled arena for node {} exhausted ({} chunks of {} bytes)",
                self.node,
                self.chunks.len(),
                self.chunk_size
            )));
        }
        let chunk = DirectBackend::map_on_node(self.node, self.chunk_size)?;
        self.chunks.push(chunk);
        Ok(chunk)
    }

    fn alloc(&mut self, class: usize) -> Result<NonNull<u8>, NumaError> {
        if let Some(block) = self.free_lists[class] {
            // SAFETY: free-list entries are blocks we wrote a FreeBlock into
            self.free_lists[class] = unsafe { block.as_ref().next };
            self.live_blocks += 1;
            return Ok(block.cast());
        }

        let size = block_size(class);
        let current = match self.current {
            Some(current) if self.cursor + size <= self.chunk_size => current,
            _ => self.advance_chunk()?,
        };

        // SAFETY: cursor + size <= chunk_size, so the block is inside the chunk
        let block = unsafe { self.chunks[current].add(self.cursor) };
        self.cursor += size;
        self.live_blocks += 1;
        Ok(block)
    }

    /// Move the bump pointer to the next chunk, mapping one if needed.
    fn advance_chunk(&mut self) -> Result<usize, NumaError> {
        let next = self.current.map_or(0, |current| current + 1);
        if next >= self.chunks.len() {
            self.map_chunk()?;
        }
        self.current = Some(next);
        self.cursor = 0;
        Ok(next)
    }

    /// # Safety
    ///
    /// `ptr` must be a live block of `class` from this arena.
    unsafe fn free(&mut self, ptr: NonNull<u8>, class: usize) {
        let block = ptr.cast::<FreeBlock>();
        block.as_ptr().write(FreeBlock {
            next: self.free_lists[class],
        });
        self.free_lists[class] = Some(block);
        self.live_blocks -= 1;
    }

    fn stats(&self) -> ArenaStats {
        ArenaStats {
            chunks: self.chunks.len(),
            live_blocks: self.live_blocks,
        }
    }
}

impl Drop for NodeArena {
    fn drop(&mut self) {
        if self.live_blocks > 0 {
            tracing::warn!(node = %self.node, live = self.live_blocks, "arena dropped with live blocks");
        }
        for chunk in self.chunks.drain(..) {
            // SAFETY: every chunk is a live mapping of chunk_size bytes
            unsafe { DirectBackend::unmap(chunk, self.chunk_size) };
        }
    }
}

/// Touch every page so the chunk is faulted in on its node up front.
fn prefault(chunk: NonNull<u8>, len: usize) {
    for offset in (0..len).step_by(page_size()) {
        // SAFETY: offset < len and the chunk is a writable mapping of len bytes
        unsafe { chunk.as_ptr().add(offset).write_volatile(0) };
    }
}

/// Pooled backend: one pre-warmed arena per configured node.
#[derive(Debug)]
pub struct PooledBackend {
    arenas: Vec<(NumaNodeId, Mutex<NodeArena>)>,
}

impl PooledBackend {
    /// Build and pre-warm an arena for each of `nodes`.
    ///
    /// # Errors
    ///
    /// Returns [`NumaError::AllocationFailed`] if the sizing is unusable or
    /// a warm chunk cannot be mapped.
    pub fn new(nodes: &[NumaNodeId], config: PoolConfig) -> Result<Self, NumaError> {
        let chunk_size = config.chunk_size.max(MAX_POOLED_SIZE).next_multiple_of(page_size());
        if config.max_chunks == Some(0) {
            return Err(NumaError::AllocationFailed(
                "pooled arena needs max_chunks of at least 1".to_string(),
            ));
        }
        if config.max_chunks.is_some_and(|max| config.warm_chunks > max) {
            return Err(NumaError::AllocationFailed(format!(
                "warm_chunks ({}) exceeds max_chunks",
                config.warm_chunks
            )));
        }

        let mut arenas: Vec<(NumaNodeId, Mutex<NodeArena>)> = Vec::with_capacity(nodes.len());
        for &node in nodes {
            if arenas.iter().any(|(n, _)| *n == node) {
                continue;
            }
            arenas.push((node, Mutex::new(NodeArena::new(node, &config, chunk_size)?)));
        }

        tracing::debug!(
            nodes = arenas.len(),
            chunk_size,
            warm_chunks = config.warm_chunks,
            "pre-warmed pooled arenas"
        );
        Ok(Self { arenas })
    }

    /// Counters for `node`'s arena, if it has one.
    #[must_use]
    pub fn stats(&self, node: NumaNodeId) -> Option<ArenaStats> {
        self.arena(node).map(|arena| arena.lock().stats())
    }

    fn arena(&self, node: NumaNodeId) -> Option<&Mutex<NodeArena>> {
        self.arenas.iter().find(|(n, _)| *n == node).map(|(_, arena)| arena)
    }
}

impl RawNodeAlloc for PooledBackend {
    fn name(&self) -> &'static str {
        "pooled"
    }

    fn alloc_on_node(&self, node: NumaNodeId, layout: Layout) -> Result<NonNull<u8>, NumaError> {
        let Some(class) = size_class(layout) else {
            return DirectBackend.alloc_on_node(node, layout);
        };
        let arena = self.arena(node).ok_or_else(|| {
            NumaError::AllocationFailed(format!("no pooled arena for node {node}"))
        })?;
        arena.lock().alloc(class)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, node: NumaNodeId, layout: Layout) {
        match (size_class(layout), self.arena(node)) {
            (Some(class), Some(arena)) => arena.lock().free(ptr, class),
            _ => DirectBackend.free(ptr, node, layout),
        }
    }
}
