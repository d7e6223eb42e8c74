//! Memory regions: page-aligned mappings carved into blocks.
//!
//! A region owns one contiguous byte range from the OS and the
//! address-ordered free list threading through it. The pool owns the
//! regions as a chain (`Vec`), with element zero acting as the master;
//! the size index spanning all regions lives on the pool, so list
//! surgery here takes the tree as an explicit argument where both must
//! stay consistent.

use std::ptr::{self, NonNull};

use crate::PAGE_SIZE;
use crate::block::{BlockHeader, FLAG_FREE};
use crate::error::{PoolError, PoolResult};
use crate::platform;
use crate::rbtree::FreeTree;
use crate::utils::align_up;

pub(crate) struct Region {
    start: NonNull<u8>,
    size: usize,
    used: usize,
    free_list: *mut BlockHeader,
}

impl Region {
    /// Maps a new region of at least `size` bytes (rounded up to a page)
    /// holding one whole-region free block.
    pub fn new(size: usize) -> PoolResult<Region> {
        let size = align_up(size, PAGE_SIZE);
        let start = platform::map_region(size).map_err(|error| {
            tracing::warn!(size, %error, "region mapping failed");
            PoolError::OutOfMemory
        })?;

        let head = start.as_ptr().cast::<BlockHeader>();
        // SAFETY: The fresh mapping spans `size >= PAGE_SIZE` writable
        // bytes starting at `head`.
        unsafe { BlockHeader::init(head, size, FLAG_FREE) };

        tracing::debug!(start = ?start.as_ptr(), size, "region mapped");
        Ok(Region {
            start,
            size,
            used: 0,
            free_list: head,
        })
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    #[inline]
    pub fn add_used(&mut self, bytes: usize) {
        self.used += bytes;
    }

    #[inline]
    pub fn sub_used(&mut self, bytes: usize) {
        debug_assert!(self.used >= bytes);
        self.used -= bytes;
    }

    #[inline]
    pub fn start_ptr(&self) -> *mut u8 {
        self.start.as_ptr()
    }

    #[inline]
    pub fn end_ptr(&self) -> *mut u8 {
        self.start.as_ptr().wrapping_add(self.size)
    }

    /// Half-open range check.
    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        let start = self.start.as_ptr() as usize;
        addr >= start && addr < start + self.size
    }

    /// The first free block in address order, or null.
    #[inline]
    pub fn free_head(&self) -> *mut BlockHeader {
        self.free_list
    }

    /// Inserts `block` into the address-ordered free list.
    ///
    /// # Safety
    /// `block` must be a live free header inside this region and not
    /// already on the list.
    pub unsafe fn insert_free(&mut self, block: *mut BlockHeader) {
        // SAFETY: Caller guarantees `block` and every listed header are
        // live; ordering by raw address is well defined within a region.
        unsafe {
            if self.free_list.is_null() || block < self.free_list {
                (*block).set_next_free(self.free_list);
                self.free_list = block;
                return;
            }

            let mut cursor = self.free_list;
            while !(*cursor).next_free().is_null() && (*cursor).next_free() < block {
                cursor = (*cursor).next_free();
            }
            (*block).set_next_free((*cursor).next_free());
            (*cursor).set_next_free(block);
        }
    }

    /// Unlinks `block` from the free list. Returns false when the block
    /// was not listed.
    ///
    /// # Safety
    /// `block` must be a live header inside this region.
    pub unsafe fn remove_free(&mut self, block: *mut BlockHeader) -> bool {
        // SAFETY: List walk touches live listed headers only.
        unsafe {
            let mut cursor = self.free_list;
            let mut prev: *mut BlockHeader = ptr::null_mut();
            while !cursor.is_null() {
                if cursor == block {
                    if prev.is_null() {
                        self.free_list = (*cursor).next_free();
                    } else {
                        (*prev).set_next_free((*cursor).next_free());
                    }
                    return true;
                }
                prev = cursor;
                cursor = (*cursor).next_free();
            }
        }
        false
    }

    /// Stamps the boundary tag onto the allocated successor of a free
    /// `block`, if there is one. Free successors are about to be merged
    /// and size-class successors keep their LIFO link word untouched.
    ///
    /// # Safety
    /// `block` must be a live header inside this region.
    pub unsafe fn tag_successor(&self, block: *mut BlockHeader) {
        // SAFETY: The successor header, when inside the region, heads the
        // next physical block by the size invariant.
        unsafe {
            let succ = BlockHeader::end(block).cast::<BlockHeader>();
            if succ.cast::<u8>() >= self.end_ptr() {
                return;
            }
            if (*succ).is_free() || (*succ).is_size_class() {
                return;
            }
            (*succ).set_prev_free(true);
            (*succ).set_prev_size((*block).size);
        }
    }

    /// Clears the boundary tag on the successor of a freshly allocated
    /// `block`.
    ///
    /// # Safety
    /// `block` must be a live header inside this region.
    pub unsafe fn untag_successor(&self, block: *mut BlockHeader) {
        // SAFETY: As in `tag_successor`.
        unsafe {
            let succ = BlockHeader::end(block).cast::<BlockHeader>();
            if succ.cast::<u8>() >= self.end_ptr() {
                return;
            }
            if (*succ).is_free() || (*succ).is_size_class() {
                return;
            }
            (*succ).set_prev_free(false);
        }
    }

    /// Re-carves the region into one whole-region free block and returns
    /// it for re-insertion into the size index.
    ///
    /// # Safety
    /// All blocks in the region must be dead to their users.
    pub unsafe fn reset(&mut self) -> *mut BlockHeader {
        self.used = 0;
        let head = self.start.as_ptr().cast::<BlockHeader>();
        // SAFETY: The region spans `size` writable bytes at `head`.
        unsafe { BlockHeader::init(head, self.size, FLAG_FREE) };
        self.free_list = head;
        tracing::debug!(start = ?self.start.as_ptr(), size = self.size, "region reset");
        head
    }

    /// Absorbs physically adjacent free blocks, keeping `tree` consistent.
    ///
    /// Immediate coalescing on free keeps this a no-op in the steady
    /// state; the pass exists for callers that want to force a sweep.
    ///
    /// # Safety
    /// All listed headers must be live and present in `tree`.
    pub unsafe fn merge_adjacent(&mut self, tree: &mut FreeTree) {
        // SAFETY: The walk only touches live listed headers; nodes are
        // detached from the tree before their size changes and reinserted
        // afterwards, so the tree ordering never sees a stale key.
        unsafe {
            let mut cursor = self.free_list;
            while !cursor.is_null() {
                loop {
                    let next = (*cursor).next_free();
                    if next.is_null() || BlockHeader::end(cursor) != next.cast::<u8>() {
                        break;
                    }
                    tree.remove(cursor);
                    tree.remove(next);
                    (*cursor).set_next_free((*next).next_free());
                    (*cursor).size += (*next).size;
                    (*next).magic = 0;
                    tree.insert(cursor);
                    self.tag_successor(cursor);
                }
                cursor = (*cursor).next_free();
            }
        }
    }

    /// Walks the free list checking header integrity, the coalescing
    /// invariant, and the accounting identity
    /// `used + sum(free sizes) == size`.
    pub fn validate(&self) -> bool {
        let mut total_free = 0usize;
        let mut cursor = self.free_list;
        // SAFETY: Listed headers are live under the pool lock; corrupted
        // headers are caught by `validates` before their links are used.
        unsafe {
            while !cursor.is_null() {
                if !(*cursor).validates() || !(*cursor).is_free() {
                    return false;
                }
                let next = (*cursor).next_free();
                if !next.is_null() {
                    if next <= cursor {
                        tracing::warn!("free list is not address ordered");
                        return false;
                    }
                    if BlockHeader::end(cursor) == next.cast::<u8>() {
                        tracing::warn!("adjacent free blocks survived coalescing");
                        return false;
                    }
                }
                total_free += (*cursor).size;
                cursor = next;
            }
        }
        if self.used + total_free != self.size {
            tracing::warn!(
                used = self.used,
                total_free,
                size = self.size,
                "region accounting mismatch"
            );
            return false;
        }
        true
    }

    /// Pre-faults the region by read-touching one byte per page.
    pub fn warmup(&self) {
        let mut offset = 0;
        while offset < self.size {
            // SAFETY: Every touched offset is inside the mapping; volatile
            // keeps the dead read alive.
            unsafe { ptr::read_volatile(self.start.as_ptr().add(offset)) };
            offset += PAGE_SIZE;
        }
    }

    /// Number of blocks currently on the free list.
    pub fn free_block_count(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.free_list;
        // SAFETY: Listed headers are live under the pool lock.
        unsafe {
            while !cursor.is_null() {
                count += 1;
                cursor = (*cursor).next_free();
            }
        }
        count
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        tracing::debug!(start = ?self.start.as_ptr(), size = self.size, "region unmapped");
        // SAFETY: `start`/`size` describe exactly the mapping created in
        // `Region::new`; the pool is being torn down, so no block survives.
        unsafe { platform::unmap_region(self.start, self.size) };
    }
}
