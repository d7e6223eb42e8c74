//! Split, coalescing, and double-free behavior.

use strata_memory::{MemoryPool, PoolError, last_error};

#[test]
fn split_then_coalesce_back_to_one_block() {
    let pool = MemoryPool::new(8192, true).unwrap();

    let p1 = pool.alloc(100).unwrap();
    let p2 = pool.alloc(100).unwrap();
    let p3 = pool.alloc(100).unwrap();
    assert!(pool.validate());
    assert!(pool.usage().free_blocks >= 1);

    unsafe {
        pool.free(p2).unwrap();
        pool.free(p1).unwrap();
        pool.free(p3).unwrap();
    }

    // Everything merged back: one free block spanning the whole region.
    let usage = pool.usage();
    assert_eq!(usage.used, 0);
    assert_eq!(usage.free_blocks, 1);
    assert_eq!(usage.capacity, 8192);
    assert!(pool.validate());
}

#[test]
fn interleaved_frees_never_leave_adjacent_free_blocks() {
    let pool = MemoryPool::new(32 * 1024, true).unwrap();

    let mut ptrs = Vec::new();
    for _ in 0..24 {
        ptrs.push(pool.alloc(200).unwrap());
    }

    // Free every other block, then the rest; validate after each step so
    // an adjacency violation is pinned to the call that caused it.
    for index in (0..ptrs.len()).step_by(2) {
        unsafe { pool.free(ptrs[index]).unwrap() };
        assert!(pool.validate());
    }
    for index in (1..ptrs.len()).step_by(2) {
        unsafe { pool.free(ptrs[index]).unwrap() };
        assert!(pool.validate());
    }

    let usage = pool.usage();
    assert_eq!(usage.used, 0);
    assert_eq!(usage.free_blocks, 1);
}

#[test]
fn double_free_is_rejected_without_mutation() {
    let pool = MemoryPool::new(4096, true).unwrap();
    let p = pool.alloc(16).unwrap();

    unsafe {
        pool.free(p).unwrap();
        let before = pool.usage();
        assert_eq!(pool.free(p).unwrap_err(), PoolError::DoubleFree);
        assert_eq!(last_error(), Some(PoolError::DoubleFree));
        assert_eq!(pool.usage(), before);
    }
    assert!(pool.validate());
}

#[test]
fn defragment_is_a_no_op_after_immediate_coalescing() {
    let pool = MemoryPool::new(16 * 1024, true).unwrap();
    let a = pool.alloc(500).unwrap();
    let b = pool.alloc(500).unwrap();
    unsafe { pool.free(a).unwrap() };

    let before = pool.usage();
    pool.defragment();
    assert_eq!(pool.usage(), before);
    assert!(pool.validate());

    unsafe { pool.free(b).unwrap() };
    pool.defragment();
    assert_eq!(pool.usage().free_blocks, 1);
}

#[test]
fn alloc_reuses_coalesced_space() {
    let pool = MemoryPool::new(8192, true).unwrap();

    // Fill most of the region with three mid-size blocks.
    let a = pool.alloc(2000).unwrap();
    let b = pool.alloc(2000).unwrap();
    let c = pool.alloc(2000).unwrap();

    unsafe {
        pool.free(a).unwrap();
        pool.free(b).unwrap();
    }

    // A request larger than either hole alone must fit the merged one
    // without extending the chain.
    let big = pool.alloc(3600).unwrap();
    assert_eq!(pool.usage().regions, 1);

    unsafe {
        pool.free(big).unwrap();
        pool.free(c).unwrap();
    }
    assert_eq!(pool.usage().free_blocks, 1);
}

#[test]
fn reset_restores_every_region() {
    let pool = MemoryPool::new(4096, true).unwrap();
    let mut held = Vec::new();
    for _ in 0..4 {
        held.push(pool.alloc(1000).unwrap());
    }
    // The fourth allocation no longer fit the first region.
    assert_eq!(pool.usage().regions, 2);

    unsafe { pool.reset() };
    let usage = pool.usage();
    assert_eq!(usage.used, 0);
    assert_eq!(usage.free_blocks, usage.regions);
    assert!(pool.validate());
}
