use amberdb::{Database, DbError, Index, Record, RecordBuilder, Schema};
use bytes::Bytes;

fn rec(fields: &[&str]) -> Record {
    let mut b = RecordBuilder::new();
    for f in fields {
        b.add(Bytes::copy_from_slice(f.as_bytes()));
    }
    b.build()
}

fn setup() -> Database {
    let db = Database::heap();
    db.create_table(Schema::new("t", &["a", "b"], vec![Index::key(&["a"])]))
        .unwrap();
    db
}

fn scan_keys(db: &Database, table: &str) -> Vec<String> {
    let rt = db.new_read_tran();
    let mut it = rt.iter(table, 0).unwrap();
    let mut out = Vec::new();
    it.next();
    while !it.eof() {
        let (k, _) = it.cur().unwrap();
        out.push(String::from_utf8_lossy(k).into_owned());
        it.next();
    }
    out
}

#[test]
fn output_and_read_back() {
    let db = setup();
    let mut ut = db.new_update_tran().unwrap();
    ut.output("t", rec(&["1", "x"])).unwrap();
    ut.output("t", rec(&["2", "y"])).unwrap();
    // the writer sees its own rows; a snapshot reader does not
    let (r, _) = ut.get("t", 0, b"1").unwrap().unwrap();
    assert_eq!(r.field(1), b"x");
    assert!(db.new_read_tran().get("t", 0, b"1").unwrap().is_none());
    ut.commit().unwrap();

    let rt = db.new_read_tran();
    let (r, _) = rt.get("t", 0, b"1").unwrap().unwrap();
    assert_eq!(r.field(1), b"x");
    assert_eq!(rt.get_info("t"), Some((2, (r.len() * 2) as u64)));
    assert_eq!(scan_keys(&db, "t"), vec!["1", "2"]);
    db.close();
}

#[test]
fn update_and_delete() {
    let db = setup();
    let mut ut = db.new_update_tran().unwrap();
    let off1 = ut.output("t", rec(&["1", "x"])).unwrap();
    ut.output("t", rec(&["2", "y"])).unwrap();
    ut.commit().unwrap();

    let mut ut = db.new_update_tran().unwrap();
    let off1b = ut.update("t", off1, rec(&["1", "xx"])).unwrap();
    assert_ne!(off1, off1b);
    ut.commit().unwrap();

    let rt = db.new_read_tran();
    let (r, off) = rt.get("t", 0, b"1").unwrap().unwrap();
    assert_eq!(off, off1b);
    assert_eq!(r.field(1), b"xx");

    let mut ut = db.new_update_tran().unwrap();
    ut.delete("t", off1b).unwrap();
    ut.commit().unwrap();
    assert_eq!(scan_keys(&db, "t"), vec!["2"]);
    db.close();
}

#[test]
fn duplicate_key_fails_action_not_transaction() {
    let db = setup();
    let mut ut = db.new_update_tran().unwrap();
    ut.output("t", rec(&["1", "x"])).unwrap();
    ut.commit().unwrap();

    let mut ut = db.new_update_tran().unwrap();
    let err = ut.output("t", rec(&["1", "other"])).unwrap_err();
    assert!(matches!(err, DbError::DuplicateKey { .. }));
    // the transaction is still usable
    ut.output("t", rec(&["3", "z"])).unwrap();
    ut.commit().unwrap();
    assert_eq!(scan_keys(&db, "t"), vec!["1", "3"]);
    db.close();
}

#[test]
fn committed_write_conflicts_with_overlapping_read() {
    let db = setup();
    let ut1 = db.new_update_tran().unwrap();
    let mut ut2 = db.new_update_tran().unwrap();
    ut2.output("t", rec(&["3", "w"])).unwrap();
    ut2.commit().unwrap();

    // ut1 overlaps ut2 and reads a range covering its write
    let mut ut1 = ut1;
    let err = ut1.iter_range("t", 0, b"1", b"5").unwrap_err();
    assert!(matches!(err, DbError::Conflict(_)));
    assert!(matches!(ut1.commit(), Err(DbError::Conflict(_))));
    db.close();
}

#[test]
fn write_write_same_key_aborts_exactly_one() {
    let db = setup();
    let mut ut1 = db.new_update_tran().unwrap();
    let mut ut2 = db.new_update_tran().unwrap();

    let r1 = ut1.output("t", rec(&["10", "p"]));
    let r2 = ut2.output("t", rec(&["10", "q"]));
    let c1 = r1.and_then(|_| ut1.commit());
    let c2 = r2.and_then(|_| ut2.commit());

    assert!(
        c1.is_ok() != c2.is_ok(),
        "exactly one of the writers must win: {c1:?} / {c2:?}"
    );
    let rt = db.new_read_tran();
    let (r, _) = rt.get("t", 0, b"10").unwrap().unwrap();
    let b = r.field(1).to_vec();
    if c1.is_ok() {
        assert_eq!(b, b"p");
    } else {
        assert_eq!(b, b"q");
    }
    db.close();
}

#[test]
fn read_write_overlap_aborts_at_least_one() {
    let db = setup();
    {
        let mut ut = db.new_update_tran().unwrap();
        ut.output("t", rec(&["3", "v"])).unwrap();
        ut.commit().unwrap();
    }
    let mut ut1 = db.new_update_tran().unwrap();
    let mut ut2 = db.new_update_tran().unwrap();

    let read = ut1.iter_range("t", 0, b"1", b"5").map(|_| ());
    let write = ut2
        .output("t", rec(&["4", "w"]))
        .map(|_| ());
    let c1 = read.and_then(|_| ut1.commit());
    let c2 = write.and_then(|_| ut2.commit());
    assert!(
        c1.is_err() || c2.is_err(),
        "overlapping read/write must abort at least one"
    );
    db.close();
}

#[test]
fn max_trans_is_enforced() {
    let db = setup();
    let mut trans = Vec::new();
    for _ in 0..200 {
        trans.push(db.new_update_tran().unwrap());
    }
    assert!(matches!(
        db.new_update_tran(),
        Err(DbError::TooManyTrans)
    ));
    let t = trans.pop().unwrap();
    t.abort("make room");
    db.new_update_tran().unwrap();
    drop(trans);
    db.close();
}

#[test]
fn abort_discards_writes() {
    let db = setup();
    let mut ut = db.new_update_tran().unwrap();
    ut.output("t", rec(&["1", "x"])).unwrap();
    ut.abort("changed my mind");
    assert!(scan_keys(&db, "t").is_empty());

    // dropping without commit aborts too
    {
        let mut ut = db.new_update_tran().unwrap();
        ut.output("t", rec(&["2", "y"])).unwrap();
    }
    assert!(scan_keys(&db, "t").is_empty());
    assert!(db.transactions().is_empty());
    db.close();
}

#[test]
fn foreign_keys_block_and_allow() {
    let db = Database::heap();
    db.create_table(Schema::new("hdr", &["id", "name"], vec![Index::key(&["id"])]))
        .unwrap();
    db.create_table(Schema::new(
        "lines",
        &["ln", "hdr_id", "qty"],
        vec![
            Index::key(&["ln"]),
            Index::index(&["hdr_id"]).with_fk("hdr", &["id"]),
        ],
    ))
    .unwrap();

    let mut ut = db.new_update_tran().unwrap();
    let hdr_off = ut.output("hdr", rec(&["h1", "first"])).unwrap();
    ut.commit().unwrap();

    // a line pointing at a missing header is blocked
    let mut ut = db.new_update_tran().unwrap();
    let err = ut.output("lines", rec(&["l1", "nope", "5"])).unwrap_err();
    assert!(matches!(err, DbError::FkeyBlock(_)));
    ut.output("lines", rec(&["l1", "h1", "5"])).unwrap();
    // empty foreign key values are exempt
    ut.output("lines", rec(&["l2", "", "6"])).unwrap();
    ut.commit().unwrap();

    // deleting a referenced header is blocked
    let mut ut = db.new_update_tran().unwrap();
    let err = ut.delete("hdr", hdr_off).unwrap_err();
    assert!(matches!(err, DbError::FkeyBlock(_)));
    ut.abort("blocked");

    // delete the line, then the header delete goes through
    let mut ut = db.new_update_tran().unwrap();
    let (_, l1_off) = ut.get("lines", 0, b"l1").unwrap().unwrap();
    ut.delete("lines", l1_off).unwrap();
    ut.delete("hdr", hdr_off).unwrap();
    ut.commit().unwrap();
    db.close();
}

#[test]
fn unique_index_allows_empty_values() {
    let db = Database::heap();
    db.create_table(Schema::new(
        "u",
        &["id", "email"],
        vec![Index::key(&["id"]), Index::unique(&["email"])],
    ))
    .unwrap();
    let mut ut = db.new_update_tran().unwrap();
    ut.output("u", rec(&["1", "a@x"])).unwrap();
    ut.output("u", rec(&["2", ""])).unwrap();
    ut.output("u", rec(&["3", ""])).unwrap();
    let err = ut.output("u", rec(&["4", "a@x"])).unwrap_err();
    assert!(matches!(err, DbError::DuplicateKey { .. }));
    ut.commit().unwrap();
    db.close();
}

#[test]
fn secondary_index_lookup() {
    let db = Database::heap();
    db.create_table(Schema::new(
        "people",
        &["id", "city"],
        vec![Index::key(&["id"]), Index::index(&["city"])],
    ))
    .unwrap();
    let mut ut = db.new_update_tran().unwrap();
    ut.output("people", rec(&["1", "rome"])).unwrap();
    ut.output("people", rec(&["2", "oslo"])).unwrap();
    ut.output("people", rec(&["3", "rome"])).unwrap();
    ut.commit().unwrap();

    let rt = db.new_read_tran();
    // non-unique index entries carry key-field uniquifiers; scan by prefix
    let mut it = rt.iter_range("people", 1, b"rome", b"rome\xff").unwrap();
    let mut ids = Vec::new();
    it.next();
    while !it.eof() {
        let (_, off) = it.cur().unwrap();
        ids.push(rt.read_record(off).field(0).to_vec());
        it.next();
    }
    assert_eq!(ids, vec![b"1".to_vec(), b"3".to_vec()]);
    db.close();
}

#[test]
fn iterator_modified_after_own_write() {
    let db = setup();
    let mut ut = db.new_update_tran().unwrap();
    ut.output("t", rec(&["1", "x"])).unwrap();
    let mut it = ut.iter("t", 0).unwrap();
    it.next();
    assert!(!it.modified());
    ut.output("t", rec(&["2", "y"])).unwrap();
    assert!(it.modified());
    it.seek(b"2");
    assert!(!it.modified());
    assert_eq!(it.cur().unwrap().0, b"2");
    ut.commit().unwrap();
    db.close();
}
