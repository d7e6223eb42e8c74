//! Property tests: `validate()` must hold after every public call.

use std::ptr::NonNull;

use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use strata_memory::MemoryPool;

#[derive(Debug, Clone, Copy)]
enum Op {
    Alloc(usize),
    AllocAligned(usize, u32),
    Calloc(usize, usize),
    AllocFixed(usize),
    Free(usize),
    Realloc(usize, usize),
    Defragment,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1usize..2048).prop_map(Op::Alloc),
        ((1usize..512), (0u32..9)).prop_map(|(size, shift)| Op::AllocAligned(size, shift)),
        ((1usize..16), (1usize..64)).prop_map(|(count, size)| Op::Calloc(count, size)),
        (1usize..256).prop_map(Op::AllocFixed),
        any::<usize>().prop_map(Op::Free),
        (any::<usize>(), 1usize..2048).prop_map(|(slot, size)| Op::Realloc(slot, size)),
        Just(Op::Defragment),
    ]
}

/// Replays `ops` against `pool`, asserting full-chain validity after
/// every call, and returns the pointers still live.
fn drive(pool: &MemoryPool, ops: &[Op]) -> Result<Vec<NonNull<u8>>, TestCaseError> {
    let mut live: Vec<NonNull<u8>> = Vec::new();

    for &op in ops {
        match op {
            Op::Alloc(size) => {
                if let Ok(ptr) = pool.alloc(size) {
                    live.push(ptr);
                }
            }
            Op::AllocAligned(size, shift) => {
                if let Ok(ptr) = pool.alloc_aligned(size, 1 << shift) {
                    prop_assert_eq!(ptr.as_ptr() as usize % (1 << shift), 0);
                    live.push(ptr);
                }
            }
            Op::Calloc(count, size) => {
                if let Ok(ptr) = pool.calloc(count, size) {
                    live.push(ptr);
                }
            }
            Op::AllocFixed(size) => {
                if let Ok(ptr) = pool.alloc_fixed(size) {
                    live.push(ptr);
                }
            }
            Op::Free(slot) => {
                if !live.is_empty() {
                    let ptr = live.swap_remove(slot % live.len());
                    unsafe { pool.free(ptr).unwrap() };
                }
            }
            Op::Realloc(slot, size) => {
                if !live.is_empty() {
                    let index = slot % live.len();
                    match unsafe { pool.realloc(Some(live[index]), size) } {
                        Ok(Some(ptr)) => live[index] = ptr,
                        Ok(None) => {
                            live.swap_remove(index);
                        }
                        // A failed realloc leaves the block untouched.
                        Err(_) => {}
                    }
                }
            }
            Op::Defragment => pool.defragment(),
        }
        prop_assert!(pool.validate(), "pool invalid after {:?}", op);
    }

    Ok(live)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn accounting_balances_without_size_classes(
        ops in prop::collection::vec(op_strategy(), 1..120)
    ) {
        let pool = MemoryPool::new(64 * 1024, false).unwrap();
        let live = drive(&pool, &ops)?;

        for ptr in live {
            unsafe { pool.free(ptr).unwrap() };
        }
        prop_assert!(pool.validate());
        prop_assert_eq!(pool.usage().used, 0);
        prop_assert_eq!(pool.usage().free_blocks, pool.usage().regions);
    }

    #[test]
    fn invariants_hold_with_a_size_class(
        ops in prop::collection::vec(op_strategy(), 1..120)
    ) {
        let pool = MemoryPool::new(64 * 1024, false).unwrap();
        pool.add_size_class(128, 8).unwrap();
        let reserved_floor = pool.usage().used;

        let live = drive(&pool, &ops)?;
        for ptr in live {
            unsafe { pool.free(ptr).unwrap() };
        }

        prop_assert!(pool.validate());
        // Class-held blocks stay accounted to the pool; everything else
        // must have drained.
        prop_assert!(pool.usage().used >= reserved_floor);
    }
}
