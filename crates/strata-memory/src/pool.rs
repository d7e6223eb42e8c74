//! The memory pool facade.
//!
//! A [`MemoryPool`] owns a chain of mapped regions, the size-ordered
//! red-black index spanning all of them, and the size-class tables. Every
//! public operation acquires the master lock once (when the pool is
//! thread-safe) and runs against the inner state; the lock is held across
//! all data-structure mutations, chain extension included.

use std::cell::UnsafeCell;
use std::mem;
use std::ptr::{self, NonNull};

use parking_lot::Mutex;

use crate::block::{BlockHeader, FLAG_FREE, HEADER_SIZE, MIN_SPLIT_SIZE};
use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult, record};
use crate::rbtree::FreeTree;
use crate::region::Region;
use crate::size_class::SizeClass;
use crate::stats::PoolUsage;
use crate::utils::{align_up, is_power_of_two};
use crate::{MAX_SIZE_CLASSES, MIN_BLOCK_SIZE};

/// A best-fit pooled allocator over a chain of mapped regions.
///
/// Blocks are carved out of page-aligned regions obtained from the OS.
/// Allocation picks the smallest sufficient free block through a
/// size-ordered red-black index; freeing coalesces immediately with both
/// physical neighbors via boundary tags. When no region can satisfy a
/// request, a new region is mapped and chained in. Optional size classes
/// keep private LIFO stacks of fixed-size blocks for hot paths.
///
/// A pool created with `thread_safe = true` serializes all operations
/// behind its master mutex and may be shared freely. A pool created with
/// `thread_safe = false` skips the lock and **must not** be shared across
/// threads.
///
/// # Examples
/// ```
/// use strata_memory::MemoryPool;
///
/// let pool = MemoryPool::new(64 * 1024, true).unwrap();
/// let ptr = pool.alloc(128).unwrap();
/// assert!(pool.contains(ptr.as_ptr()));
/// unsafe { pool.free(ptr).unwrap() };
/// assert!(pool.validate());
/// ```
pub struct MemoryPool {
    inner: UnsafeCell<PoolInner>,
    lock: Option<Mutex<()>>,
}

// SAFETY: PoolInner is plain owned data (regions, index, class tables);
// nothing in it is tied to the creating thread.
unsafe impl Send for MemoryPool {}

// SAFETY: All mutation goes through `with_inner`, which acquires the
// master mutex whenever the pool was created thread-safe. Pools created
// with `thread_safe = false` carry no lock; their documented contract is
// single-threaded use, mirroring the runtime flag of the original design.
unsafe impl Sync for MemoryPool {}

impl MemoryPool {
    /// Creates a pool with one region of `pool_size` bytes (rounded up to
    /// a page) and default alignment.
    pub fn new(pool_size: usize, thread_safe: bool) -> PoolResult<Self> {
        Self::with_config(PoolConfig {
            pool_size,
            thread_safe,
            ..PoolConfig::default()
        })
    }

    /// Creates a pool from an explicit configuration.
    pub fn with_config(config: PoolConfig) -> PoolResult<Self> {
        record(Self::build(config))
    }

    fn build(config: PoolConfig) -> PoolResult<Self> {
        if config.pool_size == 0 {
            return Err(PoolError::InvalidSize);
        }
        if !is_power_of_two(config.alignment)
            || config.alignment < mem::align_of::<BlockHeader>()
        {
            return Err(PoolError::InvalidSize);
        }

        let region = Region::new(config.pool_size)?;
        let mut tree = FreeTree::new();
        // SAFETY: The fresh region holds exactly one live free block.
        unsafe { tree.insert(region.free_head()) };

        let mut classes = Vec::new();
        for &user_size in config.size_classes.iter().take(MAX_SIZE_CLASSES) {
            if user_size == 0 {
                return Err(PoolError::InvalidSize);
            }
            let block_size =
                align_up(user_size + HEADER_SIZE, config.alignment).max(MIN_BLOCK_SIZE);
            classes.push(SizeClass::new(user_size, block_size));
        }

        let base_region_size = region.size();
        tracing::debug!(
            size = base_region_size,
            alignment = config.alignment,
            classes = classes.len(),
            "pool created"
        );

        Ok(Self {
            inner: UnsafeCell::new(PoolInner {
                regions: vec![region],
                tree,
                classes,
                alignment: config.alignment,
                base_region_size,
            }),
            lock: config.thread_safe.then(|| Mutex::new(())),
        })
    }

    /// Runs `op` on the inner state under the master lock, if any.
    fn with_inner<R>(&self, op: impl FnOnce(&mut PoolInner) -> R) -> R {
        let _guard = self.lock.as_ref().map(Mutex::lock);
        // SAFETY: Exclusive access is guaranteed by the guard above for
        // thread-safe pools and by the single-thread contract otherwise.
        let inner = unsafe { &mut *self.inner.get() };
        op(inner)
    }

    /// Allocates `size` bytes from the pool.
    ///
    /// The returned memory is uninitialized. Fails with
    /// [`PoolError::InvalidSize`] for zero-sized requests and with
    /// [`PoolError::OutOfMemory`] only after chain extension was attempted.
    pub fn alloc(&self, size: usize) -> PoolResult<NonNull<u8>> {
        record(self.with_inner(|pool| pool.alloc_user(size)))
    }

    /// Allocates `size` bytes whose address is a multiple of `align`.
    ///
    /// `align` must be a power of two. The payload address satisfies
    /// `ptr as usize % align == 0`.
    pub fn alloc_aligned(&self, size: usize, align: usize) -> PoolResult<NonNull<u8>> {
        record(self.with_inner(|pool| pool.alloc_aligned_user(size, align)))
    }

    /// Allocates `count * size` zeroed bytes, rejecting multiplications
    /// that overflow.
    pub fn calloc(&self, count: usize, size: usize) -> PoolResult<NonNull<u8>> {
        record(self.with_inner(|pool| pool.calloc_user(count, size)))
    }

    /// Allocates from the best-matching size class, falling back to the
    /// general path when no class fits or the class LIFO is empty.
    pub fn alloc_fixed(&self, size: usize) -> PoolResult<NonNull<u8>> {
        record(self.with_inner(|pool| pool.alloc_fixed_user(size)))
    }

    /// Returns a block to the pool, coalescing with free neighbors.
    ///
    /// Size-class blocks are routed back to their class automatically.
    ///
    /// # Safety
    /// `ptr` must come from an allocation on this pool that has not been
    /// freed, and must not be used afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> PoolResult<()> {
        record(self.with_inner(|pool| {
            // SAFETY: Caller upholds the allocation provenance contract.
            unsafe { pool.release(ptr) }
        }))
    }

    /// Returns a block to its size class, or to the general pool when its
    /// geometry matches no class.
    ///
    /// # Safety
    /// Same contract as [`MemoryPool::free`].
    pub unsafe fn free_fixed(&self, ptr: NonNull<u8>) -> PoolResult<()> {
        record(self.with_inner(|pool| {
            // SAFETY: Caller upholds the allocation provenance contract.
            unsafe { pool.release_fixed(ptr) }
        }))
    }

    /// Resizes an allocation.
    ///
    /// `None` behaves like [`MemoryPool::alloc`]; `new_size == 0` frees
    /// and returns `None`. A request that already fits the block returns
    /// the pointer unchanged; otherwise the payload moves to a fresh
    /// allocation.
    ///
    /// # Safety
    /// Same contract as [`MemoryPool::free`]; on success the old pointer
    /// must no longer be used unless it was returned back.
    pub unsafe fn realloc(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> PoolResult<Option<NonNull<u8>>> {
        record(self.with_inner(|pool| {
            // SAFETY: Caller upholds the allocation provenance contract.
            unsafe { pool.realloc_user(ptr, new_size) }
        }))
    }

    /// Registers a size class of `count` pre-reserved blocks serving
    /// requests up to `user_size` bytes. Returns the class index.
    pub fn add_size_class(&self, user_size: usize, count: usize) -> PoolResult<usize> {
        record(self.with_inner(|pool| pool.add_class(user_size, count)))
    }

    /// Returns every region to a single whole-region free block and
    /// empties every size class.
    ///
    /// # Safety
    /// All pointers previously handed out by this pool become dangling.
    pub unsafe fn reset(&self) {
        self.with_inner(|pool| {
            // SAFETY: Caller guarantees no allocation outlives the reset.
            unsafe { pool.reset_all() }
        });
    }

    /// Whether `ptr` points inside any region of the chain.
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.with_inner(|pool| pool.region_of(ptr).is_some())
    }

    /// Header-reported total size of the block backing `ptr`, or 0 when
    /// the pointer is foreign or its header does not validate.
    pub fn block_size(&self, ptr: *const u8) -> usize {
        self.with_inner(|pool| pool.block_size_of(ptr))
    }

    /// Full-chain integrity check: header validity, the coalescing
    /// invariant, per-region accounting, and free-list/index agreement.
    pub fn validate(&self) -> bool {
        self.with_inner(|pool| pool.validate_all())
    }

    /// Pre-faults every region by read-touching one byte per page.
    pub fn warmup(&self) {
        self.with_inner(|pool| {
            for region in &pool.regions {
                region.warmup();
            }
        });
    }

    /// Forces an adjacent-free-block merge pass over every region.
    ///
    /// Freeing coalesces immediately, so this is a no-op unless some
    /// caller deliberately staged fragments.
    pub fn defragment(&self) {
        self.with_inner(|pool| {
            pool.merge_all();
            tracing::debug!("defragment pass complete");
        });
    }

    /// Current usage aggregated over the chain.
    pub fn usage(&self) -> PoolUsage {
        self.with_inner(|pool| PoolUsage {
            capacity: pool.regions.iter().map(Region::size).sum(),
            used: pool.regions.iter().map(Region::used).sum(),
            free_blocks: pool.tree.len(),
            regions: pool.regions.len(),
        })
    }

    /// Idle block count of the size class serving `user_size`, for
    /// observability and tests.
    pub fn class_idle(&self, user_size: usize) -> usize {
        self.with_inner(|pool| {
            pool.classes
                .iter()
                .find(|class| class.user_size() == user_size)
                .map_or(0, SizeClass::idle)
        })
    }

    /// Blocks of the size class serving `user_size` currently handed out.
    pub fn class_in_use(&self, user_size: usize) -> usize {
        self.with_inner(|pool| {
            pool.classes
                .iter()
                .find(|class| class.user_size() == user_size)
                .map_or(0, SizeClass::used)
        })
    }

    /// The block-size granularity this pool was created with.
    pub fn alignment(&self) -> usize {
        self.with_inner(|pool| pool.alignment)
    }
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let usage = self.usage();
        f.debug_struct("MemoryPool")
            .field("capacity", &usage.capacity)
            .field("used", &usage.used)
            .field("regions", &usage.regions)
            .field("thread_safe", &self.lock.is_some())
            .finish_non_exhaustive()
    }
}

struct PoolInner {
    /// Region chain; element zero is the master and sizes later regions.
    regions: Vec<Region>,
    /// Size index over every free, non-size-class block in the chain.
    tree: FreeTree,
    /// Size-class table, `MAX_SIZE_CLASSES` at most.
    classes: Vec<SizeClass>,
    /// Block-size granularity.
    alignment: usize,
    /// First region's size, the floor for chain extensions.
    base_region_size: usize,
}

impl PoolInner {
    fn region_of(&self, ptr: *const u8) -> Option<usize> {
        self.regions.iter().position(|region| region.contains(ptr))
    }

    /// Shapes a user request into a block size: header added, aligned,
    /// clamped to the minimum.
    fn request_size(&self, size: usize) -> PoolResult<usize> {
        let padded = size.checked_add(HEADER_SIZE).ok_or(PoolError::InvalidSize)?;
        let aligned = padded
            .checked_add(self.alignment - 1)
            .ok_or(PoolError::InvalidSize)?
            & !(self.alignment - 1);
        Ok(aligned.max(MIN_BLOCK_SIZE))
    }

    fn alloc_user(&mut self, size: usize) -> PoolResult<NonNull<u8>> {
        if size == 0 {
            return Err(PoolError::InvalidSize);
        }
        let block_size = self.request_size(size)?;
        let (index, block) = self.take_best_fit(block_size)?;
        // SAFETY: `claim` detached the block from list and index; it is a
        // live free header in region `index`.
        unsafe { self.split_and_allocate(index, block.as_ptr(), block_size) };
        tracing::trace!(size, block_size, "alloc");
        NonNull::new(BlockHeader::payload(block.as_ptr())).ok_or(PoolError::Corruption)
    }

    fn alloc_aligned_user(&mut self, size: usize, align: usize) -> PoolResult<NonNull<u8>> {
        if size == 0 || !is_power_of_two(align) {
            return Err(PoolError::InvalidSize);
        }
        let want = self.request_size(size)?;
        // Headroom for the alignment gap plus a prefix that had to be
        // bumped up to a standalone block.
        let need = want
            .checked_add(align)
            .and_then(|value| value.checked_add(MIN_SPLIT_SIZE))
            .ok_or(PoolError::InvalidSize)?;
        let (index, block) = self.take_best_fit(need)?;
        // SAFETY: As in `alloc_user`.
        let payload = unsafe { self.carve_aligned(index, block.as_ptr(), want, align) };
        tracing::trace!(size, align, "alloc_aligned");
        payload
    }

    fn calloc_user(&mut self, count: usize, size: usize) -> PoolResult<NonNull<u8>> {
        if count == 0 || size == 0 {
            return Err(PoolError::InvalidSize);
        }
        if count > usize::MAX / size {
            return Err(PoolError::InvalidSize);
        }
        let total = count * size;
        let payload = self.alloc_user(total)?;
        // SAFETY: The payload spans at least `total` writable bytes.
        unsafe { ptr::write_bytes(payload.as_ptr(), 0, total) };
        Ok(payload)
    }

    fn alloc_fixed_user(&mut self, size: usize) -> PoolResult<NonNull<u8>> {
        if size == 0 {
            return Err(PoolError::InvalidSize);
        }
        // Smallest class whose threshold covers the request.
        let best = self
            .classes
            .iter()
            .enumerate()
            .filter(|(_, class)| class.user_size() >= size)
            .min_by_key(|(_, class)| class.user_size())
            .map(|(index, _)| index);

        let Some(index) = best else {
            return self.alloc_user(size);
        };

        // SAFETY: LIFO entries are live class headers under the lock.
        if let Some(block) = unsafe { self.classes[index].pop() } {
            self.classes[index].note_taken();
            tracing::trace!(size, class = self.classes[index].user_size(), "alloc_fixed hit");
            return NonNull::new(BlockHeader::payload(block.as_ptr())).ok_or(PoolError::Corruption);
        }

        // Empty LIFO: allocate the class geometry from the general pool
        // so a later free_fixed recognizes it by size.
        let user_size = self.classes[index].user_size();
        self.alloc_user(user_size)
    }

    /// Locates the owning region and header for a payload pointer.
    fn checked_block(&self, ptr: NonNull<u8>) -> PoolResult<(usize, *mut BlockHeader)> {
        let index = self
            .region_of(ptr.as_ptr())
            .ok_or(PoolError::InvalidPointer)?;
        let block = BlockHeader::from_payload(ptr.as_ptr());
        if (block as usize) < self.regions[index].start_ptr() as usize {
            return Err(PoolError::InvalidPointer);
        }
        // SAFETY: `block` lies inside the mapped region, so the read is
        // in-bounds; validation decides whether it is a real header.
        if !unsafe { (*block).validates() } {
            return Err(PoolError::Corruption);
        }
        // SAFETY: Validated above; a size running past the region end is
        // corruption even when the sentinel survived.
        if unsafe { BlockHeader::end(block) } > self.regions[index].end_ptr() {
            return Err(PoolError::Corruption);
        }
        Ok((index, block))
    }

    /// # Safety
    /// `ptr` must be a payload pointer produced by this pool.
    unsafe fn release(&mut self, ptr: NonNull<u8>) -> PoolResult<()> {
        let (index, block) = self.checked_block(ptr)?;
        // SAFETY: `checked_block` validated the header.
        unsafe {
            if (*block).is_size_class() {
                return self.release_class(index, block);
            }
            if (*block).is_free() {
                return Err(PoolError::DoubleFree);
            }
            self.coalesce_and_free(index, block);
        }
        Ok(())
    }

    /// # Safety
    /// `ptr` must be a payload pointer produced by this pool.
    unsafe fn release_fixed(&mut self, ptr: NonNull<u8>) -> PoolResult<()> {
        let (index, block) = self.checked_block(ptr)?;
        // SAFETY: `checked_block` validated the header.
        unsafe { self.release_class(index, block) }
    }

    /// Routes a block to the class matching its geometry, or strips the
    /// brand and frees it generally.
    ///
    /// # Safety
    /// `block` must be a validated header in region `index`.
    unsafe fn release_class(&mut self, index: usize, block: *mut BlockHeader) -> PoolResult<()> {
        // SAFETY: Caller validated `block`.
        unsafe {
            let size = (*block).size;
            if let Some(class) = self
                .classes
                .iter_mut()
                .find(|class| class.block_size() == size)
            {
                if (*block).is_free() {
                    return Err(PoolError::DoubleFree);
                }
                class.push(block);
                class.note_returned();
                tracing::trace!(block_size = size, "free_fixed");
                return Ok(());
            }

            // No class owns this geometry (an absorbed remainder enlarged
            // the block): strip the brand and coalesce normally.
            (*block).set_size_class(false);
            if (*block).is_free() {
                return Err(PoolError::DoubleFree);
            }
            self.coalesce_and_free(index, block);
            Ok(())
        }
    }

    /// # Safety
    /// `ptr` must be a payload pointer produced by this pool (when
    /// `Some`); the old pointer must not be reused after a move.
    unsafe fn realloc_user(
        &mut self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> PoolResult<Option<NonNull<u8>>> {
        let Some(ptr) = ptr else {
            return self.alloc_user(new_size).map(Some);
        };
        if new_size == 0 {
            // SAFETY: Caller upholds the provenance contract.
            unsafe { self.release(ptr)? };
            return Ok(None);
        }

        let (_, block) = self.checked_block(ptr)?;
        // SAFETY: `checked_block` validated the header; the payload copy
        // stays within both blocks' extents.
        unsafe {
            if (*block).is_free() {
                return Err(PoolError::InvalidPointer);
            }
            let usable = (*block).size - HEADER_SIZE;
            if new_size <= usable {
                return Ok(Some(ptr));
            }
            let fresh = self.alloc_user(new_size)?;
            ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), usable);
            self.release(ptr)?;
            Ok(Some(fresh))
        }
    }

    fn add_class(&mut self, user_size: usize, count: usize) -> PoolResult<usize> {
        if user_size == 0 || count == 0 {
            return Err(PoolError::InvalidSize);
        }
        if self.classes.len() >= MAX_SIZE_CLASSES {
            return Err(PoolError::OutOfMemory);
        }
        let block_size = self.request_size(user_size)?;

        let mut reserved = Vec::with_capacity(count);
        for _ in 0..count {
            match self.alloc_user(user_size) {
                Ok(payload) => reserved.push(payload),
                Err(error) => {
                    for payload in reserved {
                        // SAFETY: Allocated just above and never exposed.
                        let _ = unsafe { self.release(payload) };
                    }
                    return Err(error);
                }
            }
        }

        let mut class = SizeClass::new(user_size, block_size);
        let mut oversized = Vec::new();
        for payload in reserved {
            let block = BlockHeader::from_payload(payload.as_ptr());
            // SAFETY: Fresh allocations from our own regions.
            unsafe {
                if (*block).size == block_size {
                    class.push(block);
                    class.note_reserved();
                } else {
                    // A tail-absorbed block has a foreign geometry; it
                    // would break the class invariant, so hand it back.
                    oversized.push(payload);
                }
            }
        }
        for payload in oversized {
            // SAFETY: Allocated in this call and never exposed.
            let _ = unsafe { self.release(payload) };
        }

        let index = self.classes.len();
        tracing::debug!(user_size, block_size, reserved = class.total(), "size class added");
        self.classes.push(class);
        Ok(index)
    }

    /// # Safety
    /// Every pointer handed out by the pool becomes dangling.
    unsafe fn reset_all(&mut self) {
        let Self {
            regions,
            tree,
            classes,
            ..
        } = self;
        tree.clear();
        for region in regions.iter_mut() {
            // SAFETY: Caller promises all blocks are dead; each region
            // collapses into one free block which re-seeds the index.
            unsafe {
                let head = region.reset();
                tree.insert(head);
            }
        }
        for class in classes.iter_mut() {
            class.clear();
        }
        tracing::debug!("pool reset");
    }

    fn merge_all(&mut self) {
        let Self { regions, tree, .. } = self;
        for region in regions.iter_mut() {
            // SAFETY: Listed headers are live; the index is kept in step
            // inside the merge pass.
            unsafe { region.merge_adjacent(tree) };
        }
    }

    fn validate_all(&self) -> bool {
        let mut free_blocks = 0;
        for region in &self.regions {
            if !region.validate() {
                return false;
            }
            free_blocks += region.free_block_count();
        }
        if free_blocks != self.tree.len() {
            tracing::warn!(
                listed = free_blocks,
                indexed = self.tree.len(),
                "free lists and size index disagree"
            );
            return false;
        }
        true
    }

    fn block_size_of(&self, ptr: *const u8) -> usize {
        let Some(ptr) = NonNull::new(ptr.cast_mut()) else {
            return 0;
        };
        match self.checked_block(ptr) {
            // SAFETY: `checked_block` validated the header.
            Ok((_, block)) => unsafe { (*block).size },
            Err(_) => 0,
        }
    }

    /// Claims the best-fitting free block, forcing a merge pass and then
    /// extending the chain when the current regions cannot serve.
    fn take_best_fit(&mut self, block_size: usize) -> PoolResult<(usize, NonNull<BlockHeader>)> {
        if let Some(found) = self.claim(block_size) {
            return Ok(found);
        }

        self.merge_all();
        if let Some(found) = self.claim(block_size) {
            return Ok(found);
        }

        let region_size = self.base_region_size.max(block_size);
        let region = Region::new(region_size)?;
        // SAFETY: The fresh region holds exactly one live free block.
        unsafe { self.tree.insert(region.free_head()) };
        tracing::debug!(
            size = region.size(),
            regions = self.regions.len() + 1,
            "chain extended"
        );
        self.regions.push(region);

        self.claim(block_size).ok_or(PoolError::OutOfMemory)
    }

    /// Detaches the best-fit block from the index and its region's list.
    fn claim(&mut self, block_size: usize) -> Option<(usize, NonNull<BlockHeader>)> {
        // SAFETY: Index nodes are live free headers under the lock.
        let block = NonNull::new(unsafe { self.tree.best_fit(block_size) })?;
        let Some(index) = self.region_of(block.as_ptr().cast::<u8>()) else {
            tracing::warn!("size index references a block outside the chain");
            return None;
        };
        // SAFETY: `block` is a live free header in region `index`.
        unsafe {
            self.tree.remove(block.as_ptr());
            let removed = self.regions[index].remove_free(block.as_ptr());
            debug_assert!(removed, "free block missing from its region list");
        }
        Some((index, block))
    }

    /// Shrinks a claimed block to `block_size`, returning the remainder
    /// to the free structures when it can stand alone, and marks the
    /// block allocated.
    ///
    /// # Safety
    /// `block` must be a claimed (detached, still flagged free) header in
    /// region `index` with `size >= block_size`.
    unsafe fn split_and_allocate(
        &mut self,
        index: usize,
        block: *mut BlockHeader,
        block_size: usize,
    ) {
        let Self { regions, tree, .. } = self;
        let region = &mut regions[index];
        // SAFETY: Caller guarantees the claimed block; the remainder
        // header is carved inside the block's own extent.
        unsafe {
            let total = (*block).size;
            debug_assert!(total >= block_size);
            let remainder = total - block_size;

            if remainder >= MIN_SPLIT_SIZE {
                (*block).size = block_size;
                let tail = BlockHeader::end(block).cast::<BlockHeader>();
                BlockHeader::init(tail, remainder, FLAG_FREE);
                region.insert_free(tail);
                tree.insert(tail);
                region.tag_successor(tail);
            } else {
                // The whole block is absorbed; its successor no longer
                // borders free space.
                region.untag_successor(block);
            }

            (*block).set_free(false);
            (*block).set_prev_free(false);
            region.add_used((*block).size);
        }
    }

    /// Carves an aligned allocation out of a claimed block: an optional
    /// prefix fragment, the aligned block itself, and an optional suffix
    /// fragment.
    ///
    /// # Safety
    /// `block` must be a claimed header in region `index` sized by
    /// `alloc_aligned_user`'s reservation.
    unsafe fn carve_aligned(
        &mut self,
        index: usize,
        block: *mut BlockHeader,
        want: usize,
        align: usize,
    ) -> PoolResult<NonNull<u8>> {
        let Self { regions, tree, .. } = self;
        let region = &mut regions[index];
        // SAFETY: All carving stays inside the claimed block's extent;
        // fragment floors keep every header able to stand alone.
        unsafe {
            let raw = block;
            let total = (*raw).size;
            let user_min = raw.cast::<u8>().add(HEADER_SIZE) as usize;

            let mut aligned_user = align_up(user_min, align);
            let mut prefix = aligned_user - user_min;
            if prefix > 0 && prefix < MIN_SPLIT_SIZE {
                // Too thin to stand alone: move to the next aligned slot
                // that leaves a whole prefix block.
                aligned_user = align_up(user_min + (MIN_SPLIT_SIZE - prefix), align);
                prefix = aligned_user - user_min;
            }
            debug_assert!(prefix == 0 || prefix >= MIN_SPLIT_SIZE);

            let header_at = (aligned_user - HEADER_SIZE) as *mut BlockHeader;
            let avail = total - prefix;
            debug_assert!(avail >= want, "aligned reservation underestimated");

            let mut used_total = want;
            let mut suffix = avail - used_total;
            if suffix > 0 && suffix < MIN_SPLIT_SIZE {
                used_total += suffix;
                suffix = 0;
            }

            if prefix > 0 {
                BlockHeader::init(raw, prefix, FLAG_FREE);
                region.insert_free(raw);
                tree.insert(raw);
            }

            BlockHeader::init(header_at, used_total, 0);
            if prefix > 0 {
                (*header_at).set_prev_free(true);
                (*header_at).set_prev_size(prefix);
            }

            if suffix > 0 {
                let tail = BlockHeader::end(header_at).cast::<BlockHeader>();
                BlockHeader::init(tail, suffix, FLAG_FREE);
                region.insert_free(tail);
                tree.insert(tail);
                region.tag_successor(tail);
            } else {
                region.untag_successor(header_at);
            }

            region.add_used(used_total);
            NonNull::new(BlockHeader::payload(header_at)).ok_or(PoolError::Corruption)
        }
    }

    /// Computes the final coalesced extent (backward through the boundary
    /// tag, forward through successor absorption), then inserts the
    /// merged block once. The index is keyed on size, so nodes are always
    /// detached before their size changes.
    ///
    /// # Safety
    /// `block` must be a validated, allocated, non-size-class header in
    /// region `index`.
    unsafe fn coalesce_and_free(&mut self, index: usize, block: *mut BlockHeader) {
        let Self { regions, tree, .. } = self;
        let region = &mut regions[index];
        // SAFETY: Neighbor navigation stays inside the region; every
        // absorbed header is validated before its links are touched.
        unsafe {
            region.sub_used((*block).size);
            tracing::trace!(size = (*block).size, "free");

            let mut base = block;
            let mut extent = (*block).size;

            if (*block).is_prev_free() {
                let prev_size = (*block).prev_size();
                let pred = block.cast::<u8>().wrapping_sub(prev_size).cast::<BlockHeader>();
                let in_range = pred.cast::<u8>() >= region.start_ptr() && pred < block;
                if in_range
                    && (*pred).validates()
                    && (*pred).is_free()
                    && !(*pred).is_size_class()
                    && (*pred).size == prev_size
                {
                    tree.remove(pred);
                    let removed = region.remove_free(pred);
                    debug_assert!(removed, "free predecessor missing from region list");
                    (*block).magic = 0;
                    base = pred;
                    extent += prev_size;
                } else {
                    tracing::warn!("stale boundary tag, skipping backward merge");
                    debug_assert!(false, "PREV_FREE set but predecessor does not qualify");
                }
            }

            loop {
                let succ = base.cast::<u8>().add(extent).cast::<BlockHeader>();
                if succ.cast::<u8>() >= region.end_ptr() {
                    break;
                }
                if !(*succ).validates() {
                    tracing::warn!("invalid successor header, stopping forward merge");
                    break;
                }
                if !(*succ).is_free() || (*succ).is_size_class() {
                    break;
                }
                tree.remove(succ);
                let removed = region.remove_free(succ);
                debug_assert!(removed, "free successor missing from region list");
                extent += (*succ).size;
                (*succ).magic = 0;
            }

            BlockHeader::init(base, extent, FLAG_FREE);
            region.insert_free(base);
            tree.insert(base);
            region.tag_successor(base);
        }
    }
}
