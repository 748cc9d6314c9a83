use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use super::*;
use crate::fs::test_fs;
use crate::iattr::IattrData;
use crate::inode::InodeId;

const BS: u64 = 4096;

fn new_file(fs: &mut Fs, goal: u64) -> InodeId {
    fs.create_inode(goal, IattrData::regular(0o100644, 0, 0))
        .unwrap()
}

#[test]
fn test_write_read_cache() {
    let seed: u64 = random();
    println!("test_write_read_cache {}", seed);
    let mut fs = test_fs("test-filemap-rw", seed, 4096);

    let id = new_file(&mut fs, 64);
    let data: Vec<u8> = (0..10000_u32).map(|i| i as u8).collect();
    assert_eq!(fs.write(id, 0, &data).unwrap(), data.len());
    assert_eq!(fs.icache.get(id).attrs.size, 10000);

    // Reads are served from the dirty cache before any commit.
    let mut readback = vec![0_u8; 10000];
    assert_eq!(fs.read(id, 0, &mut readback).unwrap(), 10000);
    assert_eq!(readback, data);

    // Unaligned writes read-modify-write the partial blocks.
    assert_eq!(fs.write(id, 100, &[0xee_u8; 50]).unwrap(), 50);
    let mut readback = vec![0_u8; 200];
    fs.read(id, 0, &mut readback).unwrap();
    assert_eq!(&readback[..100], &data[..100]);
    assert!(readback[100..150].iter().all(|&x| x == 0xee));
    assert_eq!(&readback[150..], &data[150..200]);

    // Reads clamp at the end of file.
    let mut readback = vec![0_u8; 100];
    assert_eq!(fs.read(id, 9990, &mut readback).unwrap(), 10);
    assert_eq!(fs.read(id, 20000, &mut readback).unwrap(), 0);

    // Delayed allocation: no extent tree until the delta flushes.
    assert!(!fs.icache.get(id).btree.has_root());
    fs.commit().unwrap();
    assert!(fs.icache.get(id).btree.has_root());
}

#[test]
fn test_write_past_maxbytes() {
    let seed: u64 = random();
    println!("test_write_past_maxbytes {}", seed);
    let mut fs = test_fs("test-filemap-maxbytes", seed, 1024);

    let id = new_file(&mut fs, 64);
    let max = fs.super_block.s_maxbytes;
    let err = fs.write(id, max, &[0_u8; 1]).err().unwrap();
    assert!(matches!(err, crate::Error::TooBig(_, _)), "{}", err);
}

#[test]
fn test_extents_after_flush() {
    let seed: u64 = random();
    println!("test_extents_after_flush {}", seed);
    let mut fs = test_fs("test-filemap-extents", seed, 4096);

    let id = new_file(&mut fs, 64);
    fs.write(id, 0, &[0x61_u8; 4096 * 4]).unwrap();
    fs.commit().unwrap();

    // Four contiguous dirty blocks map to data segments.
    let segs = fs.map_region_read(id, 0, 4, 16).unwrap();
    let data_blocks: u64 = segs
        .iter()
        .filter(|seg| !seg.is_hole())
        .map(|seg| seg.count as u64)
        .sum();
    assert_eq!(data_blocks, 4);

    // Drop the cache; reads now travel through the extent map and the
    // device.
    let map = fs.icache.get(id).map;
    fs.pool.invalidate(map);
    let mut readback = vec![0_u8; 4096 * 4];
    fs.read(id, 0, &mut readback).unwrap();
    assert!(readback.iter().all(|&x| x == 0x61));
}

#[test]
fn test_sparse_write_hole_read() {
    let seed: u64 = random();
    println!("test_sparse_write_hole_read {}", seed);
    let mut fs = test_fs("test-filemap-sparse", seed, 4096);

    let id = new_file(&mut fs, 65);
    fs.write(id, 1 << 20, &[0x7a_u8; 4096]).unwrap();
    fs.commit().unwrap();

    // 256 blocks of hole, then the data.
    let segs = fs.map_region_read(id, 0, 257, 16).unwrap();
    assert!(segs[0].is_hole());
    assert_eq!(segs[0].count, 256);
    let data_blocks: u64 = segs
        .iter()
        .filter(|seg| !seg.is_hole())
        .map(|seg| seg.count as u64)
        .sum();
    assert_eq!(data_blocks, 1);

    // Hole reads come back zero-filled, through a cold cache.
    let map = fs.icache.get(id).map;
    fs.pool.invalidate(map);
    let mut readback = vec![0xff_u8; 8192];
    fs.read(id, 0, &mut readback).unwrap();
    assert!(readback.iter().all(|&x| x == 0));
    let mut readback = vec![0_u8; 4096];
    fs.read(id, 1 << 20, &mut readback).unwrap();
    assert!(readback.iter().all(|&x| x == 0x7a));
}

#[test]
fn test_truncate_partial_and_chop() {
    let seed: u64 = random();
    println!("test_truncate_partial_and_chop {}", seed);
    let mut fs = test_fs("test-filemap-trunc", seed, 4096);

    let id = new_file(&mut fs, 64);
    fs.write(id, 0, &[0x42_u8; 4096 * 4]).unwrap();
    fs.commit().unwrap();

    // Truncate mid-block: size shrinks, the partial block's tail is
    // zeroed, and the extents beyond are chopped at the next commit.
    fs.truncate(id, BS + 100).unwrap();
    assert_eq!(fs.icache.get(id).attrs.size, BS + 100);
    fs.commit().unwrap();

    let segs = fs.map_region_read(id, 2, 2, 16).unwrap();
    assert!(segs.iter().all(|seg| seg.is_hole()));

    let map = fs.icache.get(id).map;
    fs.pool.invalidate(map);
    let mut readback = vec![0xff_u8; 200];
    assert_eq!(fs.read(id, BS, &mut readback).unwrap(), 100);
    assert!(readback[..100].iter().all(|&x| x == 0x42));

    // Growing the file again exposes a hole over the chopped range.
    fs.write(id, 3 * BS, &[0x43_u8; 4096]).unwrap();
    fs.commit().unwrap();
    let mut readback = vec![0xff_u8; 4096];
    fs.read(id, 2 * BS, &mut readback).unwrap();
    assert!(readback.iter().all(|&x| x == 0));
}

#[test]
fn test_overwrite_returns_blocks() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_overwrite_returns_blocks {}", seed);
    let mut fs = test_fs("test-filemap-overwrite", seed, 1024);

    let id = new_file(&mut fs, 64);
    let mut model = vec![0_u8; 16 * 4096];
    fs.write(id, 0, &model).unwrap();
    fs.sync().unwrap();
    let freeblocks = fs.alloc.freeblocks;

    // Rewrite random ranges; every committed overwrite frees the
    // replaced extents. Free space may carry one cycle's worth of
    // deferred blocks (log blocks, redirected bnodes) but must not
    // drift.
    for iter in 0..20 {
        let pos = rng.gen::<u64>() % (15 * 4096);
        let len = 1 + rng.gen::<usize>() % 4096;
        let chunk: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        model[pos as usize..pos as usize + len].copy_from_slice(&chunk);
        fs.write(id, pos, &chunk).unwrap();
        fs.sync().unwrap();
        let drift = fs.alloc.freeblocks.abs_diff(freeblocks);
        assert!(drift <= 16, "iteration {}: {} drifted from {}",
                iter, fs.alloc.freeblocks, freeblocks);
    }

    let mut readback = vec![0_u8; 16 * 4096];
    fs.read(id, 0, &mut readback).unwrap();
    assert_eq!(readback, model);
}
