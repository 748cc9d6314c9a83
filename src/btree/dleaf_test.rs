use rand::prelude::random;

use super::*;
use crate::btree::WriteStep;
use crate::fs::test_fs;
use crate::fs::Fs;
use crate::types::KEY_LIMIT;

const BS: usize = 4096;

fn fresh_leaf() -> Vec<u8> {
    let mut leaf = vec![0_u8; BS];
    DLEAF_OPS.leaf_init(BS, &mut leaf);
    leaf
}

fn write_range(fs: &mut Fs, leaf: &mut [u8], bottom: Key, limit: Key, start: Key, count: u64) -> WriteStep {
    let mut rq = DleafReq::write(start, count);
    let step = leaf_write(fs, bottom, limit, leaf, &mut rq).unwrap();
    assert_eq!(rq.seg_idx, rq.segs.len());
    step
}

fn read_range(leaf: &[u8], bottom: Key, limit: Key, start: Key, len: u64) -> Vec<BlockSeg> {
    let mut rq = DleafReq::read(start, len, 16);
    leaf_read(bottom, limit, leaf, &mut rq);
    rq.segs
}

#[test]
fn test_dleaf_init_sniff() {
    let leaf = fresh_leaf();
    assert!(DLEAF_OPS.leaf_sniff(BS, &leaf));
    assert!(DLEAF_OPS.leaf_can_free(BS, &leaf));
    assert_eq!(DLEAF_OPS.entries_per_leaf(BS), 255);
    assert_eq!(DLEAF_OPS.magic(), MAGIC_DLEAF2);

    let mut bad = fresh_leaf();
    bad[0] = 0;
    assert!(!DLEAF_OPS.leaf_sniff(BS, &bad));

    // A nonzero count whose last entry is not a sentinel fails sniff.
    let mut bad = fresh_leaf();
    raw_set_count(&mut bad, 1);
    raw_put(&mut bad, 0, 0, 0, 77);
    assert!(!DLEAF_OPS.leaf_sniff(BS, &bad));
}

#[test]
fn test_dleaf_write_read_round_trip() {
    let seed: u64 = random();
    println!("test_dleaf_write_read_round_trip {}", seed);
    let mut fs = test_fs("test-dleaf-write", seed, 1024);
    fs.backend = true;
    fs.marshal_delta = fs.delta;

    let mut leaf = fresh_leaf();
    let step = write_range(&mut fs, &mut leaf, 0, KEY_LIMIT, 0, 4);
    assert!(!step.need_split);
    assert_eq!(step.remaining, 0);
    assert!(DLEAF_OPS.leaf_sniff(BS, &leaf));

    // Readback: one data segment of four blocks, then hole to limit.
    let segs = read_range(&leaf, 0, 100, 0, 8);
    assert_eq!(segs.len(), 2);
    assert_eq!(segs[0].count, 4);
    assert!(!segs[0].is_hole());
    assert_eq!(segs[1].count, 4);
    assert!(segs[1].is_hole());

    // The extents table carries the version-tagged sentinel.
    let table = extents(&leaf);
    assert_eq!(table.last().unwrap().physical, 0);
    assert_eq!(table.last().unwrap().logical, 4);
    assert!(table.iter().all(|ex| ex.version == 0));
    DLEAF_OPS.leaf_dump(BS, &leaf);
}

#[test]
fn test_dleaf_sparse_hole_inside() {
    let seed: u64 = random();
    println!("test_dleaf_sparse_hole_inside {}", seed);
    let mut fs = test_fs("test-dleaf-sparse", seed, 1024);
    fs.backend = true;
    fs.marshal_delta = fs.delta;

    let mut leaf = fresh_leaf();
    write_range(&mut fs, &mut leaf, 0, KEY_LIMIT, 0, 2);
    write_range(&mut fs, &mut leaf, 0, KEY_LIMIT, 10, 3);

    let segs = read_range(&leaf, 0, KEY_LIMIT, 0, 13);
    assert_eq!(segs.len(), 3);
    assert_eq!((segs[0].count, segs[0].is_hole()), (2, false));
    assert_eq!((segs[1].count, segs[1].is_hole()), (8, true));
    assert_eq!((segs[2].count, segs[2].is_hole()), (3, false));

    // Overwrite across the hole boundary.
    write_range(&mut fs, &mut leaf, 0, KEY_LIMIT, 1, 10);
    let segs = read_range(&leaf, 0, KEY_LIMIT, 0, 13);
    let total: u64 = segs.iter().map(|s| s.count as u64).sum();
    assert_eq!(total, 13);
    assert!(!segs[0].is_hole());
    assert!(segs.iter().take_while(|s| !s.is_hole()).map(|s| s.count as u64).sum::<u64>() >= 11);
}

#[test]
fn test_dleaf_split_merge_idempotent() {
    let seed: u64 = random();
    println!("test_dleaf_split_merge_idempotent {}", seed);
    let mut fs = test_fs("test-dleaf-split", seed, 1024);
    fs.backend = true;
    fs.marshal_delta = fs.delta;

    let mut leaf = fresh_leaf();
    // Three separate extents plus sentinel.
    write_range(&mut fs, &mut leaf, 0, KEY_LIMIT, 0, 2);
    write_range(&mut fs, &mut leaf, 0, KEY_LIMIT, 10, 2);
    write_range(&mut fs, &mut leaf, 0, KEY_LIMIT, 20, 2);
    let before = leaf.clone();

    let mut right = fresh_leaf();
    let pivot = DLEAF_OPS.leaf_split(BS, 10, &mut leaf, &mut right);
    assert_eq!(pivot, 10);
    assert!(DLEAF_OPS.leaf_sniff(BS, &leaf));
    assert!(DLEAF_OPS.leaf_sniff(BS, &right));
    // Left half ends in a fresh sentinel at the pivot.
    let table = extents(&leaf);
    assert_eq!(table.last().unwrap().logical, 10);
    assert_eq!(table.last().unwrap().physical, 0);

    // Merge reconstructs the original leaf byte for byte.
    assert!(DLEAF_OPS.leaf_merge(BS, &mut leaf, &mut right));
    assert_eq!(&leaf[..], &before[..]);
}

#[test]
fn test_dleaf_merge_cases() {
    let seed: u64 = random();
    println!("test_dleaf_merge_cases {}", seed);
    let mut fs = test_fs("test-dleaf-merge", seed, 1024);
    fs.backend = true;
    fs.marshal_delta = fs.delta;

    // Empty right side merges away.
    let mut left = fresh_leaf();
    write_range(&mut fs, &mut left, 0, KEY_LIMIT, 0, 2);
    let before = left.clone();
    let mut right = fresh_leaf();
    assert!(DLEAF_OPS.leaf_merge(BS, &mut left, &mut right));
    assert_eq!(&left[..], &before[..]);

    // Empty left side takes the right side verbatim.
    let mut left = fresh_leaf();
    let mut right = fresh_leaf();
    write_range(&mut fs, &mut right, 8, KEY_LIMIT, 8, 2);
    let expect = right.clone();
    assert!(DLEAF_OPS.leaf_merge(BS, &mut left, &mut right));
    assert_eq!(&left[8..], &expect[8..]);
}

#[test]
fn test_dleaf_chop() {
    let seed: u64 = random();
    println!("test_dleaf_chop {}", seed);
    let mut fs = test_fs("test-dleaf-chop", seed, 1024);
    fs.backend = true;
    fs.marshal_delta = fs.delta;

    let mut leaf = fresh_leaf();
    write_range(&mut fs, &mut leaf, 0, KEY_LIMIT, 0, 16);
    let freeblocks = fs.alloc.freeblocks;

    // Truncate from block 4 to the end of the keyspace.
    let modified = DLEAF_OPS.leaf_chop(&mut fs, 4, KEY_LIMIT, &mut leaf).unwrap();
    assert!(modified);
    assert!(DLEAF_OPS.leaf_sniff(BS, &leaf));

    let segs = read_range(&leaf, 0, KEY_LIMIT, 0, 16);
    assert_eq!((segs[0].count, segs[0].is_hole()), (4, false));
    assert!(segs[1].is_hole());

    // Chopped blocks are deferred, logged, not freed synchronously.
    assert_eq!(fs.alloc.freeblocks, freeblocks);
    let mut deferred = 0;
    fs.defree
        .walk(|val| {
            deferred += crate::wal::unpack_bfree(val).1;
            Ok(())
        })
        .unwrap();
    assert_eq!(deferred, 12);

    // Chopping a pure hole changes nothing.
    let modified = DLEAF_OPS.leaf_chop(&mut fs, 8, KEY_LIMIT, &mut leaf).unwrap();
    assert!(!modified);
}
