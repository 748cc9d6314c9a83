use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use super::*;
use crate::fs::test_fs;
use crate::iattr::{IattrData, Present};

fn raw_bnode(blocksize: usize) -> Vec<u8> {
    let mut data = vec![0_u8; blocksize];
    bnode_init(&mut data);
    data
}

#[test]
fn test_bnode_index_ops() {
    let mut node = raw_bnode(4096);
    assert!(bnode_sniff(&node));
    assert_eq!(bcount(&node), 0);
    assert_eq!(entries_per_node(4096), 255);

    // Root-style init: two children separated at key 100.
    bnode_init_root(&mut node, 2, 11, 22, 100);
    assert_eq!(bcount(&node), 2);
    assert_eq!(bnode_block(&node, 0), 11);
    assert_eq!(bnode_block(&node, 1), 22);
    assert_eq!(bnode_key(&node, 1), 100);

    // Entry zero's key is never compared.
    assert_eq!(bnode_lookup(&node, 0), 0);
    assert_eq!(bnode_lookup(&node, 99), 0);
    assert_eq!(bnode_lookup(&node, 100), 1);
    assert_eq!(bnode_lookup(&node, u64::MAX >> 16), 1);

    bnode_add_index(&mut node, 2, 33, 200);
    bnode_add_index(&mut node, 2, 44, 150);
    assert_eq!(bcount(&node), 4);
    assert_eq!(bnode_key(&node, 2), 150);
    assert_eq!(bnode_block(&node, 2), 44);
    assert_eq!(bnode_key(&node, 3), 200);
    assert_eq!(bnode_lookup(&node, 180), 2);

    bnode_remove_index(&mut node, 1, 2);
    assert_eq!(bcount(&node), 2);
    assert_eq!(bnode_key(&node, 1), 200);
    assert_eq!(bnode_block(&node, 1), 33);
}

#[test]
fn test_bnode_split_merge() {
    let mut src = raw_bnode(4096);
    bnode_init_root(&mut src, 2, 1, 2, 10);
    bnode_add_index(&mut src, 2, 3, 20);
    bnode_add_index(&mut src, 3, 4, 30);

    let mut dst = raw_bnode(4096);
    let before = src.clone();
    bnode_split_at(&mut src, 2, &mut dst);
    assert_eq!(bcount(&src), 2);
    assert_eq!(bcount(&dst), 2);
    assert_eq!(bnode_key(&dst, 0), 20);
    assert_eq!(bnode_block(&dst, 1), 4);

    // Merge reconstructs the original entry run.
    assert!(bnode_merge_nodes(&mut src, &dst, 255));
    bnode_set_count(&mut dst, 0);
    assert_eq!(&src[..], &before[..]);

    // Merge refuses when the combined count exceeds capacity.
    let mut tiny_into = raw_bnode(4096);
    bnode_init_root(&mut tiny_into, 2, 1, 2, 10);
    let mut tiny_from = raw_bnode(4096);
    bnode_init_root(&mut tiny_from, 2, 3, 4, 30);
    assert!(!bnode_merge_nodes(&mut tiny_into, &tiny_from, 3));
}

fn attrs_for(inum: u64) -> IattrData {
    let mut attrs = IattrData::regular(0o100644, 0, 0);
    attrs.present |= Present::VERSION;
    attrs.version = inum;
    attrs
}

#[test]
fn test_btree_write_read_depth() {
    let seed: u64 = random();
    println!("test_btree_write_read_depth {}", seed);
    let mut fs = test_fs("test-btree-write-read", seed, 4096);
    fs.backend = true;
    fs.marshal_delta = fs.delta;

    assert_eq!(fs.super_block.iroot.depth, 1);

    // Sparse inums pad the dictionary, so each leaf takes only a few
    // dozen of them; enough leaves split the root and grow the tree
    // past depth one.
    let count = 7000_u64;
    for i in 0..count {
        let inum = i * 64;
        fs.itable_write(inum, &attrs_for(inum)).unwrap();
    }
    assert!(fs.super_block.iroot.depth >= 2, "depth {}", fs.super_block.iroot.depth);

    for i in 0..count {
        let inum = i * 64;
        let attrs = fs.itable_read(inum).unwrap();
        assert_eq!(attrs.version, inum, "inum {}", inum);
    }
    assert!(fs.itable_read(3).is_err());

    // Overwrite is a read-back of the last write.
    let mut attrs = attrs_for(64);
    attrs.version = 0xdead;
    fs.itable_write(64, &attrs).unwrap();
    assert_eq!(fs.itable_read(64).unwrap().version, 0xdead);
}

#[test]
fn test_btree_chop_depth_laws() {
    let seed: u64 = random();
    println!("test_btree_chop_depth_laws {}", seed);
    let mut fs = test_fs("test-btree-chop", seed, 4096);
    fs.backend = true;
    fs.marshal_delta = fs.delta;

    for i in 0..7000_u64 {
        let inum = i * 64;
        fs.itable_write(inum, &attrs_for(inum)).unwrap();
    }
    let deep = fs.super_block.iroot.depth;
    assert!(deep >= 2);

    // Chop everything above the first slot group: merges shrink the
    // tree back to a single level and the root moves to the surviving
    // subtree.
    let mut root = fs.super_block.iroot;
    btree_chop(&mut fs, &mut root, &ileaf::ITABLE_OPS, 64, KEY_LIMIT).unwrap();
    fs.super_block.iroot = root;

    assert_eq!(fs.super_block.iroot.depth, 1, "chop did not collapse depth");
    assert_eq!(fs.itable_read(0).unwrap().version, 0);
    for i in 1..7000_u64 {
        assert!(fs.itable_read(i * 64).is_err(), "inum {}", i * 64);
    }

    // Depth never goes below one.
    let mut root = fs.super_block.iroot;
    btree_chop(&mut fs, &mut root, &ileaf::ITABLE_OPS, 0, KEY_LIMIT).unwrap();
    fs.super_block.iroot = root;
    assert_eq!(fs.super_block.iroot.depth, 1);
}

#[test]
fn test_btree_traverse_ranges() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_btree_traverse_ranges {}", seed);
    let mut fs = test_fs("test-btree-traverse", seed, 4096);
    fs.backend = true;
    fs.marshal_delta = fs.delta;

    let mut inums: Vec<u64> = (0..500).map(|_| rng.gen::<u64>() % 100_000).collect();
    inums.sort_unstable();
    inums.dedup();
    for &inum in inums.iter() {
        fs.itable_write(inum, &attrs_for(inum)).unwrap();
    }

    // Enumerate sees exactly the written inums, in order.
    let mut seen = vec![];
    fs.enumerate_inodes(0, KEY_LIMIT, |inum, attrs| {
        assert_eq!(attrs.version, inum);
        seen.push(inum);
        Ok(())
    })
    .unwrap();
    assert_eq!(seen, inums);

    // Range-limited traversal stops at the limit.
    let mut seen = vec![];
    fs.enumerate_inodes(0, 50_000, |inum, _| {
        seen.push(inum);
        Ok(())
    })
    .unwrap();
    let expect: Vec<u64> = inums.iter().copied().filter(|&i| i < 50_000).collect();
    assert_eq!(seen, expect);

    // find_free skips every allocated slot, returning the lowest gap.
    let free = fs.find_free_inum(0).unwrap();
    assert!(!inums.contains(&free));
    let expect = (0..).find(|i| !inums.contains(i)).unwrap();
    assert_eq!(free, expect);
}

#[test]
fn test_alloc_free_empty_btree() {
    let seed: u64 = random();
    println!("test_alloc_free_empty_btree {}", seed);
    let mut fs = test_fs("test-btree-empty", seed, 1024);
    fs.backend = true;
    fs.marshal_delta = fs.delta;

    let freeblocks = fs.alloc.freeblocks;
    let root = alloc_empty_btree(&mut fs, &dleaf::DLEAF_OPS).unwrap();
    assert!(root.has_root());
    assert_eq!(root.depth, 1);
    assert_eq!(fs.alloc.freeblocks, freeblocks - 2);

    // Both blocks are freshly dirty, so teardown cancels the
    // allocations immediately instead of deferring.
    free_empty_btree(&mut fs, &dleaf::DLEAF_OPS, root).unwrap();
    assert_eq!(fs.alloc.freeblocks, freeblocks);

    // A clean tree (as after a unified commit) frees through the
    // defer queues instead.
    let root = alloc_empty_btree(&mut fs, &dleaf::DLEAF_OPS).unwrap();
    fs.backend = false;
    fs.sync().unwrap();
    fs.backend = true;
    fs.marshal_delta = fs.delta;
    let freeblocks = fs.alloc.freeblocks;
    free_empty_btree(&mut fs, &dleaf::DLEAF_OPS, root).unwrap();
    assert_eq!(fs.alloc.freeblocks, freeblocks);
    assert!(!fs.defree.is_empty());
    assert!(!fs.deunify.is_empty());
}
