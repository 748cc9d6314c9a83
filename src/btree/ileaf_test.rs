use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use super::*;
use crate::fs::test_fs;

const BS: usize = 4096;

fn fresh_leaf() -> Vec<u8> {
    let mut leaf = vec![0_u8; BS];
    ITABLE_OPS.leaf_init(BS, &mut leaf);
    leaf
}

fn attr_bytes(tag: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| tag ^ i as u8).collect()
}

#[test]
fn test_ileaf_init_sniff() {
    let leaf = fresh_leaf();
    assert!(ITABLE_OPS.leaf_sniff(BS, &leaf));
    assert!(ITABLE_OPS.leaf_can_free(BS, &leaf));
    assert!(!ATABLE_OPS.leaf_sniff(BS, &leaf));
    assert_eq!(ITABLE_OPS.entries_per_leaf(BS), 64);

    let mut oleaf = vec![0_u8; BS];
    ATABLE_OPS.leaf_init(BS, &mut oleaf);
    assert!(ATABLE_OPS.leaf_sniff(BS, &oleaf));
    assert_eq!(ATABLE_OPS.magic(), MAGIC_OLEAF);
}

#[test]
fn test_ileaf_write_lookup_resize() {
    let mut leaf = fresh_leaf();

    let a = attr_bytes(0x11, 20);
    leaf_write(&mut leaf, 5, &a).unwrap();
    assert_eq!(leaf_read(&leaf, 5).unwrap(), &a[..]);
    assert!(leaf_read(&leaf, 4).is_none());
    assert!(leaf_read(&leaf, 6).is_none());

    // Writing a lower inum shifts the later record.
    let b = attr_bytes(0x22, 30);
    leaf_write(&mut leaf, 2, &b).unwrap();
    assert_eq!(leaf_read(&leaf, 2).unwrap(), &b[..]);
    assert_eq!(leaf_read(&leaf, 5).unwrap(), &a[..]);

    // Grow and shrink in place.
    let c = attr_bytes(0x33, 40);
    leaf_write(&mut leaf, 2, &c).unwrap();
    assert_eq!(leaf_read(&leaf, 2).unwrap(), &c[..]);
    assert_eq!(leaf_read(&leaf, 5).unwrap(), &a[..]);
    let d = attr_bytes(0x44, 3);
    leaf_write(&mut leaf, 2, &d).unwrap();
    assert_eq!(leaf_read(&leaf, 2).unwrap(), &d[..]);
    assert_eq!(leaf_read(&leaf, 5).unwrap(), &a[..]);

    assert!(ITABLE_OPS.leaf_sniff(BS, &leaf));
    assert!(!ITABLE_OPS.leaf_can_free(BS, &leaf));
    ITABLE_OPS.leaf_dump(BS, &leaf);
}

#[test]
fn test_ileaf_no_space() {
    let mut leaf = fresh_leaf();

    // A record bigger than the leaf's free space must be refused.
    let big = attr_bytes(0x55, BS);
    assert!(leaf_write(&mut leaf, 0, &big).is_none());

    // Fill with records until the leaf refuses; it must stay sane.
    let chunk = attr_bytes(0x66, 200);
    let mut stored = 0;
    for inum in 0.. {
        match leaf_write(&mut leaf, inum, &chunk) {
            Some(()) => stored += 1,
            None => break,
        }
    }
    assert!(stored > 10);
    assert!(ITABLE_OPS.leaf_sniff(BS, &leaf));
    for inum in 0..stored {
        assert_eq!(leaf_read(&leaf, inum).unwrap(), &chunk[..]);
    }
}

#[test]
fn test_ileaf_find_free_enumerate() {
    let mut leaf = fresh_leaf();
    for inum in [0_u64, 1, 2, 5, 6] {
        leaf_write(&mut leaf, inum, &attr_bytes(inum as u8, 8)).unwrap();
    }

    assert_eq!(find_free(&leaf, 1 << 48, 0, 1 << 40), Some(3));
    assert_eq!(find_free(&leaf, 1 << 48, 4, 1 << 40), Some(4));
    assert_eq!(find_free(&leaf, 1 << 48, 5, 1 << 40), Some(7));
    // A limit below the first gap finds nothing.
    assert_eq!(find_free(&leaf, 3, 0, 3), None);

    let mut seen = vec![];
    enumerate(&leaf, 0, 1 << 40, &mut |inum, attrs| {
        assert_eq!(attrs, &attr_bytes(inum as u8, 8)[..]);
        seen.push(inum);
        Ok(())
    })
    .unwrap();
    assert_eq!(seen, vec![0, 1, 2, 5, 6]);

    let mut seen = vec![];
    enumerate(&leaf, 2, 4, &mut |inum, _| {
        seen.push(inum);
        Ok(())
    })
    .unwrap();
    assert_eq!(seen, vec![2, 5]);
}

#[test]
fn test_ileaf_split_merge_idempotent() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_ileaf_split_merge_idempotent {}", seed);

    let mut leaf = fresh_leaf();
    for inum in 0..20_u64 {
        let len = 4 + (rng.gen::<usize>() % 40);
        leaf_write(&mut leaf, inum, &attr_bytes(inum as u8, len)).unwrap();
    }
    let before = leaf.clone();

    let mut right = fresh_leaf();
    let pivot = ITABLE_OPS.leaf_split(BS, 10, &mut leaf, &mut right);
    assert_eq!(pivot, 10);
    assert!(ITABLE_OPS.leaf_sniff(BS, &leaf));
    for inum in 0..10_u64 {
        assert!(leaf_read(&leaf, inum).is_some());
    }
    for inum in 10..20_u64 {
        assert_eq!(
            leaf_read(&right, inum).unwrap(),
            leaf_read(&before, inum).unwrap()
        );
    }

    // Merging right back into left restores the leaf byte for byte.
    assert!(ITABLE_OPS.leaf_merge(BS, &mut leaf, &mut right));
    for inum in 0..20_u64 {
        assert_eq!(
            leaf_read(&leaf, inum).unwrap(),
            leaf_read(&before, inum).unwrap(),
            "inum {}",
            inum
        );
    }
    assert_eq!(&leaf[..], &before[..]);
}

#[test]
fn test_ileaf_split_at_base_bumps() {
    let mut leaf = fresh_leaf();
    for inum in 0..4_u64 {
        leaf_write(&mut leaf, inum, &attr_bytes(inum as u8, 16)).unwrap();
    }
    let mut right = fresh_leaf();
    // A hint equal to ibase must not produce two leaves with the same
    // base.
    let pivot = ITABLE_OPS.leaf_split(BS, 0, &mut leaf, &mut right);
    assert!(pivot > 0);
}

#[test]
fn test_ileaf_merge_with_gap() {
    let mut left = fresh_leaf();
    for inum in 0..3_u64 {
        leaf_write(&mut left, inum, &attr_bytes(inum as u8, 12)).unwrap();
    }
    let mut right = fresh_leaf();
    set_ibase(&mut right, 64);
    for inum in 64..66_u64 {
        leaf_write(&mut right, inum, &attr_bytes(inum as u8, 12)).unwrap();
    }

    // The left dictionary grows across the 3..64 gap.
    assert!(ITABLE_OPS.leaf_merge(BS, &mut left, &mut right));
    for inum in 0..3_u64 {
        assert_eq!(leaf_read(&left, inum).unwrap(), &attr_bytes(inum as u8, 12)[..]);
    }
    for inum in 3..64_u64 {
        assert!(leaf_read(&left, inum).is_none());
    }
    for inum in 64..66_u64 {
        assert_eq!(leaf_read(&left, inum).unwrap(), &attr_bytes(inum as u8, 12)[..]);
    }
}

#[test]
fn test_ileaf_chop() {
    let seed: u64 = random();
    println!("test_ileaf_chop {}", seed);
    let mut fs = test_fs("test-ileaf-chop", seed, 1024);

    let mut leaf = fresh_leaf();
    for inum in 0..10_u64 {
        leaf_write(&mut leaf, inum, &attr_bytes(inum as u8, 16)).unwrap();
    }

    // Chop a middle range; records around it survive.
    let modified = ITABLE_OPS.leaf_chop(&mut fs, 3, 4, &mut leaf).unwrap();
    assert!(modified);
    assert!(ITABLE_OPS.leaf_sniff(BS, &leaf));
    for inum in 0..3_u64 {
        assert_eq!(leaf_read(&leaf, inum).unwrap(), &attr_bytes(inum as u8, 16)[..]);
    }
    for inum in 3..7_u64 {
        assert!(leaf_read(&leaf, inum).is_none(), "inum {}", inum);
    }
    for inum in 7..10_u64 {
        assert_eq!(leaf_read(&leaf, inum).unwrap(), &attr_bytes(inum as u8, 16)[..]);
    }

    // Chopping the tail trims the dictionary.
    ITABLE_OPS.leaf_chop(&mut fs, 7, 1 << 40, &mut leaf).unwrap();
    assert_eq!(icount(&leaf), 3);
    ITABLE_OPS.leaf_chop(&mut fs, 0, 1 << 40, &mut leaf).unwrap();
    assert!(ITABLE_OPS.leaf_can_free(BS, &leaf));
}
