//! Fixed-size pooled storage blocks.
//!
//! Structural changes happen continuously during normal operation (every
//! component add/remove is a schema change), so chunk memory is recycled
//! through a shared pool instead of round-tripping the general allocator.
//! All buffers share one layout, which lets any released buffer serve any
//! future archetype.

use std::alloc::{self, handle_alloc_error, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;

use crate::component_set::ComponentSet;

/// Total byte capacity of one chunk.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Alignment of every pooled buffer; component alignments may not exceed it.
pub const CHUNK_ALIGN: usize = 64;

fn chunk_layout() -> Layout {
    Layout::from_size_align(CHUNK_SIZE, CHUNK_ALIGN).unwrap()
}

/// A free list of uniform chunk-sized buffers shared by every archetype.
pub struct ChunkPool {
    free: SegQueue<NonNull<u8>>,
    allocated: AtomicUsize,
}

unsafe impl Send for ChunkPool {}
unsafe impl Sync for ChunkPool {}

impl ChunkPool {
    pub fn new() -> ChunkPool {
        ChunkPool {
            free: SegQueue::new(),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Take a buffer from the free list, allocating a fresh one if empty.
    ///
    /// Growth is unbounded; allocator exhaustion is fatal.
    pub(crate) fn acquire(&self) -> NonNull<u8> {
        match self.free.pop() {
            Some(ptr) => ptr,
            None => {
                let total = self.allocated.fetch_add(1, Ordering::Relaxed) + 1;
                log::debug!("chunk pool grew to {} buffers", total);
                let raw = unsafe { alloc::alloc(chunk_layout()) };
                match NonNull::new(raw) {
                    Some(ptr) => ptr,
                    None => handle_alloc_error(chunk_layout()),
                }
            }
        }
    }

    /// Return a buffer to the free list for reuse by any future archetype.
    ///
    /// # Safety
    /// `ptr` must have come from [`ChunkPool::acquire`] on this pool, must
    /// not be released twice and must not be touched again by the caller.
    pub(crate) unsafe fn release(&self, ptr: NonNull<u8>) {
        self.free.push(ptr);
    }

    /// Number of buffers this pool has ever allocated, in use or free.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Number of buffers currently waiting in the free list.
    pub fn available(&self) -> usize {
        self.free.len()
    }
}

impl Default for ChunkPool {
    fn default() -> ChunkPool {
        ChunkPool::new()
    }
}

impl Drop for ChunkPool {
    fn drop(&mut self) {
        while let Some(ptr) = self.free.pop() {
            unsafe { alloc::dealloc(ptr.as_ptr(), chunk_layout()) };
        }
    }
}

/// One fixed-capacity block of packed per-component columns.
///
/// Layout information lives on the owning archetype; a chunk only tracks its
/// buffer and how many rows are occupied. The buffer goes back to the pool
/// when the chunk is dropped.
pub struct Chunk {
    ptr: NonNull<u8>,
    len: usize,
    pool: Arc<ChunkPool>,
}

unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

impl Chunk {
    pub(crate) fn new(pool: &Arc<ChunkPool>) -> Chunk {
        Chunk {
            ptr: pool.acquire(),
            len: 0,
            pool: pool.clone(),
        }
    }

    /// Number of occupied rows in this chunk.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn set_len(&mut self, len: usize) {
        self.len = len;
    }

    /// Raw pointer to one component cell.
    ///
    /// `offset` is the column's byte offset within the buffer, `size` the
    /// component's byte size and `row` the row index inside this chunk.
    pub(crate) fn cell_ptr(&self, offset: usize, size: usize, row: usize) -> *mut u8 {
        debug_assert!(offset + size * (row + 1) <= CHUNK_SIZE);
        unsafe { self.ptr.as_ptr().add(offset + size * row) }
    }

    pub(crate) fn cell(&self, offset: usize, size: usize, row: usize) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.cell_ptr(offset, size, row), size) }
    }

    pub(crate) fn cell_mut(&mut self, offset: usize, size: usize, row: usize) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.cell_ptr(offset, size, row), size) }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // Safety: the buffer came from this pool and nothing aliases it
        // once the chunk is gone.
        unsafe { self.pool.release(self.ptr) };
    }
}

/// Compute column byte offsets and the row capacity for a component set.
///
/// Capacity starts at `CHUNK_SIZE / sum(sizes)` and shrinks until the
/// aligned columns fit in one buffer.
pub(crate) fn column_layout(set: &ComponentSet) -> (Vec<usize>, usize) {
    let stride: usize = set.iter().map(|c| c.size()).sum();
    assert!(stride > 0, "component set has no storable bytes");

    let mut capacity = CHUNK_SIZE / stride;
    assert!(
        capacity > 0,
        "component set {:?} does not fit a single row in one chunk",
        set
    );

    loop {
        let mut offsets = Vec::with_capacity(set.len());
        let mut offset = 0;
        for component in set.iter() {
            let align = component.layout().align();
            offset = (offset + align - 1) & !(align - 1);
            offsets.push(offset);
            offset += capacity * component.size();
        }
        if offset <= CHUNK_SIZE {
            return (offsets, capacity);
        }
        capacity -= 1;
        assert!(capacity > 0, "column padding exceeds the chunk size");
    }
}
