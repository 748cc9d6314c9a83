use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use super::*;
use crate::types::ADDR_MASK;

fn random_super(rng: &mut SmallRng) -> SuperBlock {
    SuperBlock {
        blockbits: 9 + rng.gen::<u32>() % 8,
        volblocks: rng.gen(),
        logchain: (rng.gen::<u64>() & ADDR_MASK) as i64,
        logcount: rng.gen(),
        freeblocks: rng.gen(),
        unify: rng.gen(),
        version: rng.gen(),
        volmap_root: rng.gen(),
        logmap_root: rng.gen(),
        iroot: Root::unpack(rng.gen()),
        oroot: Root::unpack(rng.gen()),
        vtable_root: rng.gen(),
        bitmap_root: rng.gen(),
        s_maxbytes: rng.gen(),
    }
}

#[test]
fn test_super_round_trip() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_super_round_trip {}", seed);

    for _i in 0..500 {
        let sb = random_super(&mut rng);
        let buf = sb.encode(4096);
        assert_eq!(buf.len(), 4096);
        let decoded = SuperBlock::decode(&buf).unwrap();
        assert_eq!(decoded, sb);

        // Bit-exact re-encode.
        assert_eq!(decoded.encode(4096), buf);
    }
}

#[test]
fn test_super_decode_errors() {
    let sb = SuperBlock {
        blockbits: 12,
        ..SuperBlock::default()
    };
    let mut buf = sb.encode(4096);

    buf[0] ^= 0xff;
    assert!(SuperBlock::decode(&buf).is_err());
    buf[0] ^= 0xff;
    assert!(SuperBlock::decode(&buf).is_ok());

    // Implausible block size.
    buf[16..20].copy_from_slice(&100_u32.to_be_bytes());
    assert!(SuperBlock::decode(&buf).is_err());

    // Short buffer.
    assert!(SuperBlock::decode(&buf[..50]).is_err());
}

#[test]
fn test_super_store_load() {
    use std::env;

    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_super_store_load {}", seed);

    let loc = {
        let mut loc = env::temp_dir();
        loc.push(format!("test-super-store-{}", seed));
        loc.into_os_string()
    };
    let dev = crate::dev::Dev::create(&loc, 12, 1 << 20).unwrap();

    let mut sb = random_super(&mut rng);
    sb.blockbits = 12;
    sb.store(&dev).unwrap();
    assert_eq!(SuperBlock::load(&dev).unwrap(), sb);

    std::fs::remove_file(&loc).ok();
}
