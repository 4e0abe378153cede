//! Crash-consistency: a file whose header disagrees with its contents is
//! recovered from the newest valid state block; corrupted blocks are
//! rejected by their checksums.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};

use amberdb::{Database, Index, Record, RecordBuilder, Schema};
use bytes::Bytes;
use tempfile::TempDir;

fn rec(fields: &[&str]) -> Record {
    let mut b = RecordBuilder::new();
    for f in fields {
        b.add(Bytes::copy_from_slice(f.as_bytes()));
    }
    b.build()
}

fn populate(path: &std::path::Path, rows: usize) -> Vec<String> {
    let db = Database::create(path).unwrap();
    db.create_table(Schema::new("t", &["a", "b"], vec![Index::key(&["a"])]))
        .unwrap();
    let mut ut = db.new_update_tran().unwrap();
    let mut keys = Vec::new();
    for i in 0..rows {
        let k = format!("r{i:05}");
        ut.output("t", rec(&[&k, "payload"])).unwrap();
        keys.push(k);
    }
    ut.commit().unwrap();
    db.close();
    keys
}

fn scan_keys(db: &Database) -> Vec<String> {
    let rt = db.new_read_tran();
    let mut it = rt.iter("t", 0).unwrap();
    let mut out = Vec::new();
    it.next();
    while !it.eof() {
        out.push(String::from_utf8_lossy(it.cur().unwrap().0).into_owned());
        it.next();
    }
    out
}

/// Make the file look like the process died: append garbage and put a
/// stale size in the header.
fn simulate_crash(path: &std::path::Path) {
    let mut f = OpenOptions::new().read(true).write(true).open(path).unwrap();
    f.seek(SeekFrom::End(0)).unwrap();
    f.write_all(&[0xabu8; 4096]).unwrap();
    f.seek(SeekFrom::Start(8)).unwrap();
    f.write_all(&[13, 0, 0, 0, 0]).unwrap();
    f.sync_all().unwrap();
}

#[test]
fn recovery_scans_back_to_last_good_state() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("crash.amber");
    let keys = populate(&path, 500);
    simulate_crash(&path);

    let db = Database::open(&path).unwrap();
    assert_eq!(scan_keys(&db), keys);
    db.full_check().unwrap();

    // the recovered database keeps working
    let mut ut = db.new_update_tran().unwrap();
    ut.output("t", rec(&["zzz", "after recovery"])).unwrap();
    ut.commit().unwrap();
    db.close();

    let db = Database::open(&path).unwrap();
    assert_eq!(scan_keys(&db).len(), keys.len() + 1);
    db.close();
}

#[test]
fn corrupting_a_record_fails_the_full_check() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("flip.amber");
    populate(&path, 100);

    // flip a 16-byte span in the record area; block padding is at most a
    // few bytes, so some live record bytes are hit
    {
        let mut f = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let mut span = [0u8; 16];
        f.seek(SeekFrom::Start(200)).unwrap();
        f.read_exact(&mut span).unwrap();
        for b in &mut span {
            *b ^= 0x55;
        }
        f.seek(SeekFrom::Start(200)).unwrap();
        f.write_all(&span).unwrap();
        f.sync_all().unwrap();
    }

    let db = Database::open_with(
        &path,
        amberdb::DbOptions {
            check_on_open: false,
            ..Default::default()
        },
        true,
    )
    .unwrap();
    assert!(db.full_check().is_err());
    db.close();
}

#[test]
fn no_valid_state_means_open_fails() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("hopeless.amber");
    populate(&path, 10);

    // stale header plus every state block clobbered: nothing to recover
    {
        let mut f = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let len = f.metadata().unwrap().len();
        let mut buf = vec![0u8; len as usize];
        f.seek(SeekFrom::Start(0)).unwrap();
        f.read_exact(&mut buf).unwrap();
        let tag = b"amdbSt01";
        let mut at = 13;
        while at + tag.len() <= buf.len() {
            if &buf[at..at + tag.len()] == tag {
                buf[at] ^= 0xff;
            }
            at += 1;
        }
        buf[8..13].copy_from_slice(&[13, 0, 0, 0, 0]);
        f.seek(SeekFrom::Start(0)).unwrap();
        f.write_all(&buf).unwrap();
        f.sync_all().unwrap();
    }
    assert!(Database::open(&path).is_err());
}

#[test]
fn zeroed_header_size_is_refused() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("marked.amber");
    populate(&path, 10);
    {
        let mut f = OpenOptions::new().write(true).open(&path).unwrap();
        f.seek(SeekFrom::Start(8)).unwrap();
        f.write_all(&[0u8; 5]).unwrap();
        f.sync_all().unwrap();
    }
    let err = Database::open(&path).unwrap_err();
    assert!(err.to_string().contains("corrupt"));
}
