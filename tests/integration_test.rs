//! End-to-end scenarios over real database files created through the public
//! API: create, DDL, insert, scan, filter, overflow, crash recovery.

use anyhow::Result;
use pretty_assertions::assert_eq;

use sharcdb::btree::cursor::SeekResult;
use sharcdb::database::Row;
use sharcdb::sql_value::SqlValue::{self, Blob, Int, Null, Real, Text};
use sharcdb::{Database, Filter};

fn text(s: &str) -> SqlValue {
    Text(s.to_string())
}

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn scan_all(db: &Database, table: &str) -> Result<Vec<Row>> {
    let mut out = Vec::new();
    for row in db.reader(table)? {
        out.push(row?);
    }
    Ok(out)
}

#[test]
fn test_header_round_trip() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("empty.db");
    {
        let _db = Database::create(&path, 4096)?;
    }
    let bytes = std::fs::read(&path)?;
    assert_eq!(&bytes[..16], b"SQLite format 3\0");
    assert_eq!(bytes.len(), 4096);

    let report = sharcdb::validator::validate_file(&path)?;
    assert!(report.is_valid(), "{:?}", report.issues);
    assert_eq!(report.page_size, Some(4096));
    assert_eq!(report.file_pages, Some(1));

    let db = Database::open(&path)?;
    assert_eq!(db.page_size(), 4096);
    assert_eq!(db.header().page_count, 1);
    assert_eq!(
        db.header().text_encoding,
        sharcdb::dbheader::TextEncoding::Utf8
    );
    assert!(db.schema().tables.is_empty());
    Ok(())
}

#[test]
fn test_insert_scan_delete_users() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("users.db");
    let mut db = Database::create(&path, 4096)?;
    {
        let mut w = db.writer()?;
        w.execute_ddl(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, age INTEGER)",
        )?;
        w.insert("users", &[Int(1), text("alice"), Int(30)])?;
        w.insert("users", &[Int(2), text("bob"), Int(25)])?;
        w.insert("users", &[Int(3), text("carol"), Int(40)])?;
    }

    let rows = scan_all(&db, "users")?;
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].rowid, 1);
    assert_eq!(rows[0].values[1].as_text().map(String::as_str), Some("alice"));
    assert_eq!(rows[0].values, vec![Int(1), text("alice"), Int(30)]);
    assert_eq!(rows[1].values, vec![Int(2), text("bob"), Int(25)]);
    assert_eq!(rows[2].values, vec![Int(3), text("carol"), Int(40)]);

    assert!(db.writer()?.delete("users", 2)?);
    let rows = scan_all(&db, "users")?;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].values, vec![Int(1), text("alice"), Int(30)]);
    assert_eq!(rows[1].values, vec![Int(3), text("carol"), Int(40)]);

    // Deleting again reports absence.
    assert!(!db.writer()?.delete("users", 2)?);

    // The file stays readable after reopen.
    drop(db);
    let db = Database::open(&path)?;
    let rows = scan_all(&db, "users")?;
    assert_eq!(rows.len(), 2);
    Ok(())
}

#[test]
fn test_not_null_and_duplicate_rowid_roll_back_cleanly() -> Result<()> {
    let mut db = Database::open(":memory:")?;
    {
        let mut w = db.writer()?;
        w.execute_ddl("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")?;
        w.insert("t", &[Int(1), text("a")])?;
        assert!(matches!(
            w.insert("t", &[Int(2), Null]),
            Err(sharcdb::tx::Error::NotNullViolation { .. })
        ));
        assert!(matches!(
            w.insert("t", &[Int(1), text("dup")]),
            Err(sharcdb::tx::Error::DuplicateRowid(1))
        ));
    }
    assert_eq!(scan_all(&db, "t")?.len(), 1);
    Ok(())
}

#[test]
fn test_rowid_assignment_and_max_rowid() -> Result<()> {
    let mut db = Database::open(":memory:")?;
    let mut assigned = Vec::new();
    {
        let mut w = db.writer()?;
        w.execute_ddl("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)")?;
        assigned.push(w.insert("t", &[Null, text("first")])?);
        assigned.push(w.insert("t", &[Null, text("second")])?);
        assigned.push(w.insert("t", &[Int(i64::MAX), text("edge")])?);
    }
    assert_eq!(assigned, vec![1, 2, i64::MAX]);

    let rows = scan_all(&db, "t")?;
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[2].rowid, i64::MAX);
    assert_eq!(rows[2].values, vec![Int(i64::MAX), text("edge")]);

    // The next automatic rowid would overflow.
    assert!(matches!(
        db.writer()?.insert("t", &[Null, text("boom")]),
        Err(sharcdb::tx::Error::RowidOverflow)
    ));
    Ok(())
}

#[test]
fn test_filters_over_mixed_types() -> Result<()> {
    let mut db = Database::open(":memory:")?;
    {
        let mut w = db.writer()?;
        w.execute_ddl("CREATE TABLE data (id INTEGER PRIMARY KEY, val INT, text_val TEXT)")?;
        w.insert("data", &[Int(1), Null, Null])?;
        w.insert("data", &[Int(2), Int(0), text("")])?;
        w.insert("data", &[Int(3), Int(42), text("hello")])?;
        w.insert("data", &[Int(4), Int(-1), text("世界")])?;
        w.insert("data", &[Int(5), Int(i64::MAX), text("x")])?;
    }

    let ids = |filter: &Filter| -> Result<Vec<i64>> {
        let mut out = Vec::new();
        for row in db.reader_filtered("data", filter)? {
            out.push(row?.rowid);
        }
        Ok(out)
    };

    assert_eq!(ids(&Filter::column("val").is_null())?, vec![1]);
    assert_eq!(ids(&Filter::column("val").eq(Filter::literal(0)))?, vec![2]);
    assert_eq!(ids(&Filter::column("val").between(-1, 42))?, vec![2, 3, 4]);
    assert_eq!(ids(&Filter::column("val").in_set([Int(0), Int(42)]))?, vec![2, 3]);
    assert_eq!(ids(&Filter::column("text_val").starts_with("he"))?, vec![3]);
    assert_eq!(ids(&Filter::column("text_val").contains("界"))?, vec![4]);
    assert_eq!(
        ids(&Filter::column("val")
            .ge(Filter::literal(0))
            .and(Filter::column("val").lt(Filter::literal(100))))?,
        vec![2, 3]
    );
    Ok(())
}

#[test]
fn test_projection_and_rowid_alias() -> Result<()> {
    let mut db = Database::open(":memory:")?;
    {
        let mut w = db.writer()?;
        w.execute_ddl("CREATE TABLE t (id INTEGER PRIMARY KEY, a TEXT, b INT)")?;
        w.insert("t", &[Null, text("x"), Int(10)])?;
    }
    let mut reader = db.reader_projected("t", &["b", "id"])?;
    let row = reader.next_row()?.unwrap();
    // Projection reorders, and the alias column reads back as the rowid.
    assert_eq!(row.values, vec![Int(10), Int(1)]);
    Ok(())
}

#[test]
fn test_multipage_tree_scan_and_seek() -> Result<()> {
    init_logs();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("big.db");
    let mut db = Database::create(&path, 512)?;
    {
        let mut w = db.writer()?;
        w.execute_ddl("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)")?;
        let mut tx = w.transaction()?;
        for i in 1..=1000i64 {
            tx.insert("t", &[Int(i), text(&format!("row-{i:04}"))])?;
        }
        tx.commit()?;
    }
    assert!(db.header().page_count > 10, "tree spans many pages");

    // Forward scan: every rowid, strictly ascending.
    let rows = scan_all(&db, "t")?;
    assert_eq!(rows.len(), 1000);
    for (i, row) in rows.iter().enumerate() {
        assert_eq!(row.rowid, i as i64 + 1);
        assert_eq!(row.values[1], text(&format!("row-{:04}", i + 1)));
    }

    // Backward scan.
    let mut cur = db.table_cursor("t")?;
    assert!(cur.seek_last()?);
    let mut seen = Vec::new();
    loop {
        seen.push(cur.rowid()?);
        if !cur.prev()? {
            break;
        }
    }
    assert_eq!(seen.len(), 1000);
    assert_eq!(seen[0], 1000);
    assert_eq!(*seen.last().unwrap(), 1);

    // Point seeks, hits and misses.
    let mut cur = db.table_cursor("t")?;
    assert_eq!(cur.seek_rowid(500)?, SeekResult::Found);
    assert_eq!(cur.rowid()?, 500);
    assert_eq!(cur.seek_rowid(1001)?, SeekResult::NotFound);

    // Reopen and make sure the multi-level tree still reads.
    drop(db);
    let db = Database::open(&path)?;
    assert_eq!(scan_all(&db, "t")?.len(), 1000);
    Ok(())
}

#[test]
fn test_overflow_round_trip_and_freelist_reuse() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("overflow.db");
    let mut db = Database::create(&path, 4096)?;
    let big = "A".repeat(20_000);
    {
        let mut w = db.writer()?;
        w.execute_ddl("CREATE TABLE blobs (id INTEGER PRIMARY KEY, data TEXT)")?;
        w.insert("blobs", &[Int(1), text(&big)])?;
    }

    // At 4 KiB pages the local-payload clamp keeps 3,637 bytes in the leaf
    // cell and spills 16,368, an overflow chain of exactly 4 pages.
    let pages_with_row = db.header().page_count;
    assert!(pages_with_row >= 6, "root + leaf + 4 overflow, got {pages_with_row}");

    let rows = scan_all(&db, "blobs")?;
    assert_eq!(rows[0].values[1], text(&big));

    // Deleting frees the whole chain onto the freelist.
    assert!(db.writer()?.delete("blobs", 1)?);
    assert!(db.header().freelist_count >= 4, "freelist holds the chain");
    let pages_after_delete = db.header().page_count;

    // A small insert reuses freed pages instead of growing the file.
    db.writer()?.insert("blobs", &[Int(2), text("small")])?;
    assert_eq!(db.header().page_count, pages_after_delete);
    let file_len = std::fs::metadata(&path)?.len();
    assert_eq!(file_len, pages_after_delete as u64 * 4096);
    Ok(())
}

#[test]
fn test_reinsert_is_bit_identical_to_single_insert() -> Result<()> {
    // Two databases with identical histories except one inserts, deletes and
    // re-inserts the same row inside its transaction.
    let dir = tempfile::tempdir()?;
    let build = |name: &str, churn: bool| -> Result<Vec<u8>> {
        let path = dir.path().join(name);
        let mut db = Database::create(&path, 4096)?;
        db.writer()?
            .execute_ddl("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)")?;
        {
            let mut w = db.writer()?;
            let mut tx = w.transaction()?;
            tx.insert("t", &[Int(7), text("payload")])?;
            if churn {
                tx.delete("t", 7)?;
                tx.insert("t", &[Int(7), text("payload")])?;
            }
            tx.commit()?;
        }
        drop(db);
        Ok(std::fs::read(dir.path().join(name))?)
    };
    let plain = build("once.db", false)?;
    let churned = build("churn.db", true)?;
    assert_eq!(plain, churned);
    Ok(())
}

#[test]
fn test_rollback_restores_bytes_exactly() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("rb.db");
    let mut db = Database::create(&path, 4096)?;
    db.writer()?
        .execute_ddl("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)")?;
    db.writer()?.insert("t", &[Int(1), text("keep")])?;
    let before = std::fs::read(&path)?;

    {
        let mut w = db.writer()?;
        let mut tx = w.transaction()?;
        for i in 2..=50 {
            tx.insert("t", &[Int(i), text("discard")])?;
        }
        tx.rollback()?;
    }
    assert_eq!(std::fs::read(&path)?, before);
    assert!(!sharcdb::journal::journal_path(&path).exists());
    assert_eq!(scan_all(&db, "t")?.len(), 1);
    Ok(())
}

#[test]
fn test_crash_between_journal_and_commit_recovers() -> Result<()> {
    init_logs();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("crash.db");
    let mut db = Database::create(&path, 512)?;
    db.writer()?
        .execute_ddl("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)")?;
    let snapshot = std::fs::read(&path)?;

    {
        let mut w = db.writer()?;
        let mut tx = w.transaction()?;
        for i in 1..=1000i64 {
            tx.insert("t", &[Int(i), text(&format!("v{i}"))])?;
        }
        // Kill the process model: journal is hot, write-back half done.
        tx.commit_interrupted(3)?;
    }
    drop(db);

    // The file is torn right now, and the journal exists.
    assert!(sharcdb::journal::journal_path(&path).exists());
    assert_ne!(std::fs::read(&path)?, snapshot);

    // Opening replays the journal and deletes it.
    let db = Database::open(&path)?;
    assert!(!sharcdb::journal::journal_path(&path).exists());
    assert_eq!(std::fs::read(&path)?, snapshot);
    assert_eq!(scan_all(&db, "t")?.len(), 0);
    Ok(())
}

#[test]
fn test_crash_before_any_write_back_recovers() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("crash0.db");
    let mut db = Database::create(&path, 512)?;
    db.writer()?
        .execute_ddl("CREATE TABLE t (id INTEGER PRIMARY KEY)")?;
    let snapshot = std::fs::read(&path)?;
    {
        let mut w = db.writer()?;
        let mut tx = w.transaction()?;
        for i in 1..=100i64 {
            tx.insert("t", &[Int(i)])?;
        }
        tx.commit_interrupted(0)?;
    }
    drop(db);
    let _db = Database::open(&path)?;
    assert_eq!(std::fs::read(&path)?, snapshot);
    Ok(())
}

#[test]
fn test_secondary_index_maintenance_and_seek() -> Result<()> {
    let mut db = Database::open(":memory:")?;
    {
        let mut w = db.writer()?;
        w.execute_ddl("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")?;
        w.insert("users", &[Int(1), text("carol")])?;
        w.insert("users", &[Int(2), text("alice")])?;
        w.execute_ddl("CREATE INDEX idx_users_name ON users (name)")?;
        w.insert("users", &[Int(3), text("bob")])?;
    }

    // The index yields (name, rowid) entries in name order, including both
    // backfilled and post-creation rows.
    let mut cur = db.index_cursor("idx_users_name")?;
    let mut entries = Vec::new();
    while cur.next()? {
        let rec = cur.record()?;
        entries.push((rec.get_text(0)?.to_string(), rec.get_i64(1)?));
    }
    assert_eq!(
        entries,
        vec![
            ("alice".to_string(), 2),
            ("bob".to_string(), 3),
            ("carol".to_string(), 1)
        ]
    );

    // Exact key seek finds; a between-keys seek lands on the first greater.
    let mut cur = db.index_cursor("idx_users_name")?;
    assert_eq!(cur.seek_key(&[text("bob"), Int(3)])?, SeekResult::Found);
    assert_eq!(
        cur.seek_key(&[text("azzz")])?,
        SeekResult::NotFound
    );
    let rec = cur.record()?;
    assert_eq!(rec.get_text(0)?, "bob");

    // Deleting a row removes its index entry.
    db.writer()?.delete("users", 3)?;
    let mut cur = db.index_cursor("idx_users_name")?;
    let mut names = Vec::new();
    while cur.next()? {
        names.push(cur.record()?.get_text(0)?.to_string());
    }
    assert_eq!(names, vec!["alice".to_string(), "carol".to_string()]);
    Ok(())
}

#[test]
fn test_update_rewrites_row_and_indexes() -> Result<()> {
    let mut db = Database::open(":memory:")?;
    {
        let mut w = db.writer()?;
        w.execute_ddl("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT, score REAL)")?;
        w.execute_ddl("CREATE INDEX idx_t_name ON t (name)")?;
        w.insert("t", &[Int(1), text("old"), Real(1.5)])?;
        w.update("t", 1, &[Null, text("new"), Real(2.5)])?;
    }
    let rows = scan_all(&db, "t")?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].values, vec![Int(1), text("new"), Real(2.5)]);

    let mut cur = db.index_cursor("idx_t_name")?;
    let mut names = Vec::new();
    while cur.next()? {
        names.push(cur.record()?.get_text(0)?.to_string());
    }
    assert_eq!(names, vec!["new".to_string()]);

    assert!(matches!(
        db.writer()?.update("t", 99, &[Null, text("x"), Null]),
        Err(sharcdb::tx::Error::RowNotFound(99))
    ));
    Ok(())
}

#[test]
fn test_blob_and_real_round_trip() -> Result<()> {
    let mut db = Database::open(":memory:")?;
    {
        let mut w = db.writer()?;
        w.execute_ddl("CREATE TABLE t (id INTEGER PRIMARY KEY, b BLOB, r REAL)")?;
        w.insert("t", &[Null, Blob(vec![0, 1, 2, 0xff]), Real(-0.125)])?;
        w.insert("t", &[Null, Blob(vec![]), Real(f64::MAX)])?;
    }
    let rows = scan_all(&db, "t")?;
    assert_eq!(rows[0].values[1], Blob(vec![0, 1, 2, 0xff]));
    assert_eq!(rows[0].values[2], Real(-0.125));
    assert_eq!(rows[1].values[1], Blob(vec![]));
    assert_eq!(rows[1].values[2], Real(f64::MAX));
    Ok(())
}

#[test]
fn test_empty_table_scan_and_seek() -> Result<()> {
    let mut db = Database::open(":memory:")?;
    db.writer()?
        .execute_ddl("CREATE TABLE empty (id INTEGER PRIMARY KEY)")?;
    assert_eq!(scan_all(&db, "empty")?.len(), 0);
    let mut cur = db.table_cursor("empty")?;
    assert_eq!(cur.seek_rowid(1)?, SeekResult::NotFound);
    assert!(!cur.seek_first()?);
    Ok(())
}

#[test]
fn test_unknown_names_error() -> Result<()> {
    let mut db = Database::open(":memory:")?;
    db.writer()?
        .execute_ddl("CREATE TABLE t (id INTEGER PRIMARY KEY)")?;
    assert!(db.reader("nope").is_err());
    assert!(db
        .reader_filtered("t", &Filter::column("ghost").is_null())
        .is_err());
    assert!(db.writer()?.insert("nope", &[Null]).is_err());
    Ok(())
}

#[test]
fn test_cursor_invalidated_by_commit() -> Result<()> {
    let mut db = Database::open(":memory:")?;
    {
        let mut w = db.writer()?;
        w.execute_ddl("CREATE TABLE t (id INTEGER PRIMARY KEY)")?;
        w.insert("t", &[Int(1)])?;
    }
    let mut cur = db.table_cursor("t")?;
    assert!(cur.next()?);
    db.writer()?.insert("t", &[Int(2)])?;
    assert!(matches!(
        cur.next(),
        Err(sharcdb::btree::Error::Invalidated)
    ));
    Ok(())
}

#[test]
fn test_page_cache_and_prefetch_observable() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("cached.db");
    {
        let mut db = Database::create(&path, 512)?;
        let mut w = db.writer()?;
        w.execute_ddl("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)")?;
        let mut tx = w.transaction()?;
        for i in 1..=500i64 {
            tx.insert("t", &[Int(i), text("some row text to fill pages")])?;
        }
        tx.commit()?;
    }
    let db = Database::open(&path)?; // defaults: 64-page cache, prefetch on
    let _ = scan_all(&db, "t")?;
    let stats = db.cache_stats().expect("cache configured");
    assert!(stats.prefetched > 0, "sequential scan triggers prefetch");
    let _ = scan_all(&db, "t")?;
    let stats2 = db.cache_stats().unwrap();
    assert!(stats2.hits > stats.hits, "second scan hits the cache");
    Ok(())
}

/// Argon2id costs small enough for tests; production callers keep the
/// defaults.
fn cheap_kdf() -> sharcdb::crypto::KdfOptions {
    sharcdb::crypto::KdfOptions {
        memory_kib: 64,
        iterations: 1,
        parallelism: 1,
        salt: b"integration-salt".to_vec(),
    }
}

#[test]
fn test_encrypted_database_round_trip() -> Result<()> {
    use sharcdb::crypto::EncryptionOptions;
    use sharcdb::OpenOptions;

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("secret.db");
    let enc = EncryptionOptions::new(b"master-key".to_vec())
        .page_size(4096)
        .kdf(cheap_kdf());
    {
        let mut db = Database::create_with(
            &path,
            4096,
            OpenOptions::new().writable(true).encryption(enc.clone()),
        )?;
        let mut w = db.writer()?;
        w.execute_ddl("CREATE TABLE s (id INTEGER PRIMARY KEY, v TEXT)")?;
        w.insert("s", &[Int(1), text("hidden")])?;
    }

    // The raw file carries no plaintext magic.
    let raw = std::fs::read(&path)?;
    assert_ne!(&raw[..16], b"SQLite format 3\0");

    let db = Database::open_with(&path, OpenOptions::new().encryption(enc))?;
    let rows = scan_all(&db, "s")?;
    assert_eq!(rows[0].values, vec![Int(1), text("hidden")]);

    // The wrong key fails to authenticate rather than returning garbage.
    let wrong = EncryptionOptions::new(b"wrong".to_vec())
        .page_size(4096)
        .kdf(cheap_kdf());
    assert!(Database::open_with(&path, OpenOptions::new().encryption(wrong)).is_err());
    Ok(())
}

#[test]
fn test_encrypted_database_crash_recovery() -> Result<()> {
    use sharcdb::crypto::EncryptionOptions;
    use sharcdb::OpenOptions;

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("enc-crash.db");
    let enc = EncryptionOptions::new(b"key".to_vec())
        .page_size(512)
        .kdf(cheap_kdf());
    let opts = || OpenOptions::new().writable(true).encryption(enc.clone());

    let mut db = Database::create_with(&path, 512, opts())?;
    db.writer()?
        .execute_ddl("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)")?;
    db.writer()?.insert("t", &[Int(1), text("committed")])?;
    let snapshot = std::fs::read(&path)?;

    {
        let mut w = db.writer()?;
        let mut tx = w.transaction()?;
        for i in 2..=200i64 {
            tx.insert("t", &[Int(i), text("lost")])?;
        }
        tx.commit_interrupted(2)?;
    }
    drop(db);
    assert!(sharcdb::journal::journal_path(&path).exists());

    // Recovery re-seals the pre-images; the file round-trips exactly and
    // still decrypts.
    let db = Database::open_with(&path, opts())?;
    assert!(!sharcdb::journal::journal_path(&path).exists());
    assert_eq!(std::fs::read(&path)?, snapshot);
    let rows = scan_all(&db, "t")?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].values[1], text("committed"));
    Ok(())
}

#[test]
fn test_reopen_without_cache_or_with_mmap() -> Result<()> {
    use sharcdb::OpenOptions;
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("plain.db");
    {
        let mut db = Database::create(&path, 4096)?;
        let mut w = db.writer()?;
        w.execute_ddl("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)")?;
        w.insert("t", &[Int(1), text("x")])?;
    }
    let db = Database::open_with(&path, OpenOptions::new().page_cache_capacity(0))?;
    assert!(db.cache_stats().is_none());
    assert_eq!(scan_all(&db, "t")?.len(), 1);
    drop(db);

    let db = Database::open_with(&path, OpenOptions::new().memory_map(true))?;
    assert_eq!(scan_all(&db, "t")?.len(), 1);
    Ok(())
}
