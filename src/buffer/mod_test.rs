use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use super::*;

fn small_pool() -> (BufferPool, MapId) {
    let mut pool = BufferPool::new(512, 512 * 100);
    let map = pool.new_map(None, MapIo::Vol);
    (pool, map)
}

#[test]
fn test_get_release() {
    let (mut pool, map) = small_pool();

    let a = pool.get(map, 10).unwrap();
    assert_eq!(pool.index(a), 10);
    assert_eq!(pool.state(a), BufState::Empty);
    assert_eq!(pool.count(a), 2); // caller + hash

    // Hit returns the same buffer.
    let b = pool.get(map, 10).unwrap();
    assert_eq!(a, b);
    assert_eq!(pool.count(a), 3);
    pool.release(b);

    // Peek does not allocate.
    assert_eq!(pool.peek(map, 10), Some(a));
    pool.release(a);
    assert_eq!(pool.peek(map, 11), None);

    pool.release(a);
    assert_eq!(pool.count(a), 1); // hash keeps it cached
    assert_eq!(pool.live_count(), 1);
}

#[test]
fn test_state_lists() {
    let (mut pool, map) = small_pool();

    let a = pool.get(map, 3).unwrap();
    pool.mark_dirty(a, 0);
    assert!(pool.state(a).is_dirty());
    assert_eq!(pool.dirty_count(map, 0), 1);
    assert_eq!(pool.dirty_count(map, 1), 0);

    // Re-dirty for the next delta moves lists, never duplicates.
    pool.mark_dirty(a, 1);
    assert_eq!(pool.dirty_count(map, 0), 0);
    assert_eq!(pool.dirty_count(map, 1), 1);

    pool.set_clean(a);
    assert_eq!(pool.dirty_count(map, 1), 0);
    assert_eq!(pool.state(a), BufState::Clean);

    pool.mark_unify_dirty(a, 0);
    assert_eq!(pool.map(map).unify_dirty.len(), 1);
    assert!(pool.already_unify_dirty(a, 0));
    assert!(!pool.already_unify_dirty(a, 1));
    assert!(!pool.already_dirty(a, 0));

    pool.end_io_vol(a, false);
    assert_eq!(pool.map(map).unify_dirty.len(), 0);
    pool.release(a);
}

#[test]
fn test_pool_bounds_and_eviction() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_pool_bounds_and_eviction {}", seed);

    let (mut pool, map) = small_pool(); // cap is MIN_BUFFERS = 100

    // Fill with idle cached buffers, then keep allocating; the
    // evictor must hold the pool at its cap.
    for block in 0..1000 {
        let id = pool.get(map, block).unwrap();
        pool.release(id);
        assert!(pool.live_count() <= 100);
    }

    // Random get/release churn never exceeds the cap either.
    let mut held: Vec<BufId> = vec![];
    for _i in 0..1000 {
        if rng.gen::<bool>() || held.is_empty() {
            let block = rng.gen::<u64>() % 500;
            held.push(pool.get(map, block as BlockNum).unwrap());
        } else {
            let id = held.remove(rng.gen::<usize>() % held.len());
            pool.release(id);
        }
        assert!(pool.live_count() <= 100);
    }
    for id in held {
        pool.release(id);
    }
}

#[test]
fn test_pool_exhaustion() {
    let (mut pool, map) = small_pool();

    // Hold every buffer; dirty buffers never evict, held ones cannot.
    let held: Vec<BufId> = (0..100).map(|b| pool.get(map, b).unwrap()).collect();
    for &id in held.iter() {
        pool.mark_dirty(id, 0);
    }
    assert!(pool.get(map, 1000).is_err());

    for &id in held.iter() {
        pool.set_clean(id);
        pool.release(id);
    }
    // Now eviction can make room again.
    let id = pool.get(map, 1000).unwrap();
    pool.release(id);
}

#[test]
fn test_end_io_error_path() {
    let (mut pool, map) = small_pool();

    let a = pool.get(map, 7).unwrap();
    pool.mark_dirty(a, 0);
    pool.end_io_vol(a, true);
    // Error path returns the buffer to empty so the next read
    // re-fetches.
    assert_eq!(pool.state(a), BufState::Empty);
    pool.release(a);
}

#[test]
fn test_forget_dirty() {
    let (mut pool, map) = small_pool();

    let a = pool.get(map, 9).unwrap();
    pool.mark_dirty(a, 0);
    pool.forget_dirty(a);
    assert_eq!(pool.state(a), BufState::Clean);
    assert!(!pool.is_hashed(a));
    assert_eq!(pool.peek(map, 9), None);
    pool.release(a);
}

#[test]
fn test_fork_for_delta() {
    let (mut pool, map) = small_pool();

    let a = pool.get(map, 42).unwrap();
    {
        let data = pool.data(a);
        data.borrow_mut().fill(0xaa);
    }
    let same = pool.fork_for_delta(a, 0).unwrap();
    assert_eq!(same, a);
    assert!(pool.already_dirty(a, 0));

    // Same delta again: no fork.
    let same = pool.fork_for_delta(a, 2).unwrap();
    assert_eq!(same, a);

    // Different delta: fork. Old buffer is unhashed and keeps its
    // dirty state for delta 0; the clone takes over the hash slot.
    let b = pool.fork_for_delta(a, 1).unwrap();
    assert_ne!(a, b);
    assert!(!pool.is_hashed(a));
    assert!(pool.is_hashed(b));
    assert!(pool.already_dirty(a, 0));
    assert!(pool.already_dirty(b, 1));
    assert_eq!(pool.index(b), 42);
    assert_eq!(pool.peek(map, 42), Some(b));
    pool.release(b); // drop the peek ref

    // Clone starts with a copy of the original's data.
    {
        let data = pool.data(b);
        assert!(data.borrow().iter().all(|&x| x == 0xaa));
        data.borrow_mut().fill(0xbb);
    }
    {
        let data = pool.data(a);
        assert!(data.borrow().iter().all(|&x| x == 0xaa));
    }

    // Backend finishes with the original: cleaned and freed.
    pool.end_io_file(a, false);

    pool.set_clean(b);
    pool.release(b);
}

#[test]
fn test_truncate_range() {
    let (mut pool, map) = small_pool();

    for block in 0..8 {
        let id = pool.get(map, block).unwrap();
        let data = pool.data(id);
        data.borrow_mut().fill(0xee);
        pool.mark_dirty(id, 0);
        pool.release(id);
    }
    for &id in pool.map(map).dirty[0].clone().iter() {
        pool.set_clean(id);
    }

    // Truncate from byte 512*2+100: zero the tail of block 2, drop
    // blocks 3 and up.
    pool.truncate_range(map, 512 * 2 + 100, u64::MAX >> 1, 0);
    for block in 0..3 {
        assert!(pool.peek(map, block).is_some(), "block {}", block);
        let id = pool.peek(map, block).unwrap();
        pool.release(id);
        pool.release(id);
    }
    for block in 3..8 {
        assert_eq!(pool.peek(map, block), None, "block {}", block);
    }

    let id = pool.get(map, 2).unwrap();
    let data = pool.data(id);
    assert!(data.borrow()[..100].iter().all(|&x| x == 0xee));
    assert!(data.borrow()[100..].iter().all(|&x| x == 0));
    pool.release(id);
}
