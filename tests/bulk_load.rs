use std::sync::Arc;

use amberdb::index::fbtree::TreeBuilder;
use amberdb::index::overlay::Overlay;
use amberdb::ixkey::IxSpec;
use amberdb::stor::Stor;
use amberdb::{OverIter, RecordBuilder};
use bytes::Bytes;

const N: u32 = 100_000;

#[test]
fn bulk_load_one_hundred_thousand_keys() {
    let store = Arc::new(Stor::heap(16 * 1024 * 1024));
    let mut builder = TreeBuilder::new(store.clone());
    let mut offs = Vec::with_capacity(N as usize);
    let mut last_size = store.size();
    for i in 0..N {
        let key = format!("key{i:08}");
        let mut rb = RecordBuilder::new();
        rb.add(Bytes::from(key.clone()));
        let off = store.save_sized(rb.build().as_bytes());
        builder.add(Bytes::from(key), off).unwrap();
        offs.push(off);
        let size = store.size();
        assert!(size >= last_size, "store must only grow");
        last_size = size;
    }
    let tree = builder.finish(Arc::new(IxSpec::new(vec![0])));

    // search finds every inserted offset
    for (i, off) in offs.iter().enumerate() {
        let key = format!("key{i:08}");
        assert_eq!(tree.lookup(key.as_bytes()), Some(*off), "key {key}");
    }
    assert_eq!(tree.lookup(b"key-none"), None);

    // iteration returns all keys in order
    let (count, _, _) = tree.check(&mut |_| {}).unwrap();
    assert_eq!(count, N as usize);
    let mut it = OverIter::new(Overlay::for_tree(tree));
    let mut n = 0u32;
    it.next();
    while !it.eof() {
        assert_eq!(it.cur().unwrap().0, format!("key{n:08}").as_bytes());
        n += 1;
        it.next();
    }
    assert_eq!(n, N);
}
