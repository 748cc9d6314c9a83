use super::*;
use crate::iattr::IattrData;

fn cached_inode(cache: &mut InodeCache, inum: Inum) -> InodeId {
    let id = cache.add_slot(Inode::new(inum, 0));
    cache
        .insert_locked4(id, inum, |other| other.inum == inum)
        .unwrap();
    id
}

#[test]
fn test_cache_lookup_insert() {
    let mut cache = InodeCache::default();
    let a = cached_inode(&mut cache, 64);
    assert_eq!(cache.get(a).count(), 1);
    assert!(cache.get(a).state.contains(InodeState::NEW));

    let found = cache.ilookup5(64, |inode| inode.inum == 64).unwrap();
    assert_eq!(found, a);
    assert_eq!(cache.get(a).count(), 2);
    assert!(cache.ilookup5(65, |inode| inode.inum == 65).is_none());
    assert_eq!(cache.find_id(64), Some(a));

    // A second live inode with the same inum is refused.
    let b = cache.add_slot(Inode::new(64, 0));
    let err = cache.insert_locked4(b, 64, |other| other.inum == 64).err().unwrap();
    assert!(matches!(err, crate::Error::Busy(_, _)), "{}", err);
    cache.remove_slot(b);

    // An inode in FREEING no longer blocks insertion.
    cache.get_mut(a).state = InodeState::FREEING;
    let c = cache.add_slot(Inode::new(64, 0));
    cache.insert_locked4(c, 64, |other| other.inum == 64).unwrap();

    assert_eq!(cache.live_count(), 2);
}

#[test]
fn test_refcount_lifecycle() {
    let mut cache = InodeCache::default();
    let id = cached_inode(&mut cache, 100);

    cache.ihold(id);
    assert_eq!(cache.get(id).count(), 2);
    assert!(!cache.iput_ref(id));
    assert!(cache.iput_ref(id));
    assert_eq!(cache.get(id).count(), 0);

    // Dirty inodes may be revived from count zero.
    cache.get_mut(id).state = InodeState::DIRTY;
    cache.iget_ref(id);
    assert_eq!(cache.get(id).count(), 1);

    assert!(cache.iput_ref(id));
    cache.unhash(id);
    assert_eq!(cache.find_id(100), None);
    cache.remove_slot(id);
    assert_eq!(cache.live_count(), 0);
}

#[test]
#[should_panic]
fn test_iget_freeing_panics() {
    let mut cache = InodeCache::default();
    let id = cached_inode(&mut cache, 7);
    cache.get_mut(id).state = InodeState::FREEING;
    cache.iget_ref(id);
}

#[test]
fn test_iattr_fork_two_slots() {
    let mut inode = Inode::new(64, 0);
    inode.attrs = IattrData::regular(0o100644, 0, 0);
    inode.attrs.size = 100;

    // First dirty of delta 4: the regular-file rule snapshots into
    // the previous slot so a backend flushing delta 3 sees stable
    // attributes.
    inode.iattrdirty(4);
    inode.attrs.size = 200;
    assert_eq!(inode.ddc[1].idata.unwrap().size, 100);

    // Same delta again: no new snapshot.
    inode.ddc[1].idata = None;
    inode.iattrdirty(4);
    assert!(inode.ddc[1].idata.is_none());

    // Next delta: the pre-change state forks into slot 4 & 1 == 0.
    inode.iattrdirty(5);
    inode.attrs.size = 300;
    assert_eq!(inode.ddc[0].idata.unwrap().size, 200);

    // Backend reads delta 4's snapshot from the fork; the slot is
    // reset after the read.
    let idata = inode.iattr_read_and_clear(4);
    assert_eq!(idata.size, 200);
    assert!(inode.ddc[0].idata.is_none());

    // Backend reads delta 5: the live attributes were not re-dirtied,
    // so they are used and the fork state clears.
    let idata = inode.iattr_read_and_clear(5);
    assert_eq!(idata.size, 300);
    let idata = inode.iattr_read_and_clear(6);
    assert_eq!(idata.size, 300);
}

#[test]
fn test_idata_btree_bit() {
    use crate::iattr::Present;
    use crate::types::Root;

    let mut inode = Inode::new(64, 0);
    inode.attrs = IattrData::regular(0o100644, 0, 0);
    assert!(!inode.idata().present.contains(Present::DATA_BTREE));

    inode.btree = Root::new(42, 1);
    let idata = inode.idata();
    assert!(idata.present.contains(Present::DATA_BTREE));
    assert_eq!(idata.btree.block, 42);
}
