//! Size classes: private LIFO free lists for hot fixed-size allocations.
//!
//! Class blocks are carved by ordinary allocations, branded with the
//! `SIZECLASS` flag, and from then on circulate only through the class's
//! own LIFO. They are deliberately kept out of the general free list and
//! the size index: coalescing a reserved batch would dissolve it.

use std::ptr::{self, NonNull};

use crate::block::BlockHeader;

pub(crate) struct SizeClass {
    /// User-visible size threshold the class serves.
    user_size: usize,
    /// Internal block size: threshold plus header, aligned.
    block_size: usize,
    /// LIFO of idle class blocks, linked through the header word.
    free: *mut BlockHeader,
    /// Blocks reserved for the class.
    total: usize,
    /// Blocks currently handed out.
    used: usize,
}

impl SizeClass {
    pub fn new(user_size: usize, block_size: usize) -> Self {
        Self {
            user_size,
            block_size,
            free: ptr::null_mut(),
            total: 0,
            used: 0,
        }
    }

    #[inline]
    pub fn user_size(&self) -> usize {
        self.user_size
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    pub fn total(&self) -> usize {
        self.total
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    #[inline]
    pub fn note_reserved(&mut self) {
        self.total += 1;
    }

    #[inline]
    pub fn note_taken(&mut self) {
        self.used += 1;
    }

    #[inline]
    pub fn note_returned(&mut self) {
        // Blocks that fell back to the general allocator while the LIFO
        // was empty were never counted out.
        self.used = self.used.saturating_sub(1);
    }

    /// Pushes `block` onto the LIFO, branding it as an idle class block.
    ///
    /// # Safety
    /// `block` must be a live allocated header that is on no other list.
    pub unsafe fn push(&mut self, block: *mut BlockHeader) {
        // SAFETY: Caller guarantees `block` is live and unlisted; flags
        // are set before the word is repurposed as the LIFO link.
        unsafe {
            (*block).set_size_class(true);
            (*block).set_prev_free(false);
            (*block).set_free(true);
            (*block).set_next_class(self.free);
        }
        self.free = block;
    }

    /// Pops the most recently returned class block, or `None` when the
    /// LIFO is empty.
    ///
    /// # Safety
    /// Listed class headers must be live (pool lock held).
    pub unsafe fn pop(&mut self) -> Option<NonNull<BlockHeader>> {
        let block = NonNull::new(self.free)?;
        // SAFETY: Caller guarantees listed headers are live.
        unsafe {
            self.free = block.as_ref().next_class();
            let header = &mut *block.as_ptr();
            header.set_free(false);
            header.set_next_class(ptr::null_mut());
        }
        Some(block)
    }

    /// Drops every list entry; used on pool reset where the underlying
    /// blocks dissolve back into whole-region free space.
    pub fn clear(&mut self) {
        self.free = ptr::null_mut();
        self.total = 0;
        self.used = 0;
    }

    /// Number of idle blocks currently on the LIFO.
    pub fn idle(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.free;
        // SAFETY: Listed class headers are live under the pool lock.
        unsafe {
            while !cursor.is_null() {
                count += 1;
                cursor = (*cursor).next_class();
            }
        }
        count
    }
}
