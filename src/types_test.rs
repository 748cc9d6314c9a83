use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use super::*;

#[test]
fn test_root_pack() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_root_pack {}", seed);

    assert_eq!(Root::unpack(NO_ROOT.pack()), NO_ROOT);
    assert!(!NO_ROOT.has_root());

    for _i in 0..1000 {
        let root = Root {
            block: (rng.gen::<u64>() & ADDR_MASK) as BlockNum,
            depth: rng.gen::<u16>(),
        };
        assert_eq!(Root::unpack(root.pack()), root);
    }
}

#[test]
fn test_encode48() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_encode48 {}", seed);

    for _i in 0..1000 {
        let val = rng.gen::<u64>() & ADDR_MASK;
        let mut buf = vec![];
        encode48(&mut buf, val);
        assert_eq!(buf.len(), 6);
        assert_eq!(decode48(&buf), val);
    }
}

#[test]
fn test_seg_total_count() {
    let segs = vec![BlockSeg::new(10, 4), BlockSeg::hole(2), BlockSeg::new(20, 1)];
    assert_eq!(seg_total_count(&segs), 7);
    assert!(segs[1].is_hole());
    assert!(!segs[0].is_hole());
}

#[test]
fn test_delta_slot() {
    assert_eq!(delta_slot(0), 0);
    assert_eq!(delta_slot(1), 1);
    assert_eq!(delta_slot(2), 0);
    assert_eq!(delta_slot(7), 1);
}
