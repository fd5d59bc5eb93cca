//! Persistent index store backed by SQLite.
//!
//! Durably holds file records, the tokenized document table, posting lists,
//! the IDF table, the vector logical-delete bitmap, and a small metadata
//! blob. The store is single-process: the connection stays open for the
//! engine's lifetime and nothing else may write the file.
//!
//! Two write patterns are exposed, per the indexing pipeline's needs:
//! bulk insert for initial indexing (single transaction, prepared
//! statements) and point updates for incremental changes.
//!
//! A schema version lives in `PRAGMA user_version`; opening a newer-version
//! or unreadable file reports [`StoreError::Corrupt`], which the engine
//! treats as non-fatal and rebuilds from source.

use std::{
  collections::HashMap,
  path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info, warn};

use crate::domain::{FileRecord, Language};

/// Current schema version written to `PRAGMA user_version`.
const SCHEMA_VERSION: i64 = 1;

/// Forward migrations, indexed by the version they migrate *from*.
/// `MIGRATIONS[0]` creates the v1 schema on a fresh database.
const MIGRATIONS: &[&str] = &[
  "
  CREATE TABLE meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
  );
  CREATE TABLE files (
    path       TEXT PRIMARY KEY,
    abs_path   TEXT NOT NULL,
    size       INTEGER NOT NULL,
    hash       TEXT NOT NULL,
    language   TEXT,
    preview    TEXT NOT NULL,
    indexed_at TEXT NOT NULL
  );
  CREATE TABLE documents (
    path   TEXT PRIMARY KEY,
    length INTEGER NOT NULL,
    norm   REAL NOT NULL
  );
  CREATE TABLE postings (
    term TEXT NOT NULL,
    path TEXT NOT NULL,
    tf   INTEGER NOT NULL,
    PRIMARY KEY (term, path)
  );
  CREATE INDEX postings_by_path ON postings(path);
  CREATE TABLE terms (
    term TEXT PRIMARY KEY,
    df   INTEGER NOT NULL,
    idf  REAL NOT NULL
  );
  CREATE TABLE deleted_slots (
    slot INTEGER PRIMARY KEY
  );
  ",
];

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("store failed validation: {0}")]
  Corrupt(String),

  #[error("store I/O error: {0}")]
  Io(#[from] std::io::Error),
}

// ============================================================================
// Write Payloads
// ============================================================================

/// Everything the store persists for one indexed document.
#[derive(Debug)]
pub struct DocumentWrite<'a> {
  pub record: &'a FileRecord,
  pub preview: &'a str,
  /// Insertion-ordered `(term, tf)` pairs.
  pub tf: &'a [(String, u32)],
  pub length: u32,
  pub norm: f64,
}

/// A document row as reloaded from disk.
#[derive(Debug, Clone)]
pub struct StoredDocument {
  pub path: String,
  pub length: u32,
  pub norm: f64,
}

/// Per-file metadata used to decorate search results.
#[derive(Debug, Clone)]
pub struct FileMeta {
  pub language: Option<Language>,
  pub preview: String,
}

// ============================================================================
// IndexStore
// ============================================================================

/// Open handle to the on-disk index database.
pub struct IndexStore {
  conn: Connection,
  path: Option<PathBuf>,
}

impl IndexStore {
  /// Open (or create) the store at `path`, creating parent directories and
  /// applying forward migrations.
  pub fn open(path: &Path) -> Result<Self, StoreError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    let mut store = Self {
      conn,
      path: Some(path.to_path_buf()),
    };
    store.initialize()?;
    info!(path = %path.display(), "Index store opened");
    Ok(store)
  }

  /// In-memory store for tests.
  pub fn open_in_memory() -> Result<Self, StoreError> {
    let conn = Connection::open_in_memory()?;
    let mut store = Self { conn, path: None };
    store.initialize()?;
    Ok(store)
  }

  fn initialize(&mut self) -> Result<(), StoreError> {
    // Any failure to read pragmas on an existing file means the artifact is
    // not a database we can use.
    self
      .conn
      .pragma_update(None, "journal_mode", "WAL")
      .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    self.conn.pragma_update(None, "foreign_keys", "ON")?;

    let mut version: i64 = self
      .conn
      .pragma_query_value(None, "user_version", |row| row.get(0))
      .map_err(|e| StoreError::Corrupt(e.to_string()))?;

    if version > SCHEMA_VERSION {
      return Err(StoreError::Corrupt(format!(
        "schema version {version} is newer than supported {SCHEMA_VERSION}"
      )));
    }

    while version < SCHEMA_VERSION {
      let migration = MIGRATIONS[version as usize];
      debug!(from = version, to = version + 1, "Applying store migration");
      let tx = self.conn.transaction()?;
      tx.execute_batch(migration)
        .map_err(|e| StoreError::Corrupt(format!("migration from v{version} failed: {e}")))?;
      tx.pragma_update(None, "user_version", version + 1)?;
      tx.commit()?;
      version += 1;
    }

    Ok(())
  }

  /// Path of the backing file, if not in-memory.
  pub fn path(&self) -> Option<&Path> {
    self.path.as_deref()
  }

  // ==========================================================================
  // Metadata
  // ==========================================================================

  pub fn meta_get(&self, key: &str) -> Result<Option<String>, StoreError> {
    let value = self
      .conn
      .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| row.get(0))
      .optional()?;
    Ok(value)
  }

  pub fn meta_set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
    self.conn.execute(
      "INSERT INTO meta (key, value) VALUES (?1, ?2)
       ON CONFLICT(key) DO UPDATE SET value = excluded.value",
      params![key, value],
    )?;
    Ok(())
  }

  // ==========================================================================
  // File Records
  // ==========================================================================

  /// `path → content hash` for scan diffing.
  pub fn file_hashes(&self) -> Result<HashMap<String, String>, StoreError> {
    let mut stmt = self.conn.prepare("SELECT path, hash FROM files")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
    let mut hashes = HashMap::new();
    for row in rows {
      let (path, hash) = row?;
      hashes.insert(path, hash);
    }
    Ok(hashes)
  }

  /// Per-file language and preview, for decorating results.
  pub fn file_meta(&self) -> Result<HashMap<String, FileMeta>, StoreError> {
    let mut stmt = self.conn.prepare("SELECT path, language, preview FROM files")?;
    let rows = stmt.query_map([], |row| {
      Ok((
        row.get::<_, String>(0)?,
        row.get::<_, Option<String>>(1)?,
        row.get::<_, String>(2)?,
      ))
    })?;
    let mut meta = HashMap::new();
    for row in rows {
      let (path, language, preview) = row?;
      meta.insert(
        path,
        FileMeta {
          language: language.as_deref().and_then(Language::from_str_tag),
          preview,
        },
      );
    }
    Ok(meta)
  }

  pub fn file_record(&self, path: &str) -> Result<Option<FileRecord>, StoreError> {
    let record = self
      .conn
      .query_row(
        "SELECT path, abs_path, size, hash, language, indexed_at FROM files WHERE path = ?1",
        params![path],
        row_to_record,
      )
      .optional()?;
    Ok(record)
  }

  pub fn file_count(&self) -> Result<usize, StoreError> {
    let count: i64 = self.conn.query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?;
    Ok(count as usize)
  }

  // ==========================================================================
  // Bulk Insert
  // ==========================================================================

  /// Insert many documents inside a single transaction.
  ///
  /// Used for initial indexing and full rebuilds; batching statements here
  /// is an order of magnitude faster than per-row commits.
  pub fn bulk_insert(&mut self, docs: &[DocumentWrite<'_>]) -> Result<(), StoreError> {
    let tx = self.conn.transaction()?;
    {
      let mut file_stmt = tx.prepare(
        "INSERT INTO files (path, abs_path, size, hash, language, preview, indexed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(path) DO UPDATE SET
           abs_path = excluded.abs_path, size = excluded.size, hash = excluded.hash,
           language = excluded.language, preview = excluded.preview, indexed_at = excluded.indexed_at",
      )?;
      let mut doc_stmt = tx.prepare(
        "INSERT INTO documents (path, length, norm) VALUES (?1, ?2, ?3)
         ON CONFLICT(path) DO UPDATE SET length = excluded.length, norm = excluded.norm",
      )?;
      let mut del_postings = tx.prepare("DELETE FROM postings WHERE path = ?1")?;
      let mut posting_stmt = tx.prepare("INSERT INTO postings (term, path, tf) VALUES (?1, ?2, ?3)")?;

      for doc in docs {
        insert_file_row(&mut file_stmt, doc)?;
        doc_stmt.execute(params![doc.record.path, doc.length, doc.norm])?;
        del_postings.execute(params![doc.record.path])?;
        for (term, tf) in doc.tf {
          posting_stmt.execute(params![term, doc.record.path, tf])?;
        }
      }
    }
    tx.commit()?;
    debug!(documents = docs.len(), "Bulk insert committed");
    Ok(())
  }

  // ==========================================================================
  // Point Updates
  // ==========================================================================

  /// Insert or replace a single document and its postings.
  pub fn upsert_document(&mut self, doc: &DocumentWrite<'_>) -> Result<(), StoreError> {
    self.bulk_insert(std::slice::from_ref(doc))
  }

  /// Wipe every document-derived table ahead of a full rebuild.
  pub fn clear_documents(&mut self) -> Result<(), StoreError> {
    let tx = self.conn.transaction()?;
    tx.execute("DELETE FROM postings", [])?;
    tx.execute("DELETE FROM documents", [])?;
    tx.execute("DELETE FROM files", [])?;
    tx.execute("DELETE FROM terms", [])?;
    tx.commit()?;
    Ok(())
  }

  /// Remove a document, its postings, and its file record.
  pub fn remove_document(&mut self, path: &str) -> Result<(), StoreError> {
    let tx = self.conn.transaction()?;
    tx.execute("DELETE FROM postings WHERE path = ?1", params![path])?;
    tx.execute("DELETE FROM documents WHERE path = ?1", params![path])?;
    tx.execute("DELETE FROM files WHERE path = ?1", params![path])?;
    tx.commit()?;
    Ok(())
  }

  /// Replace the whole IDF table.
  ///
  /// Every term's idf shifts whenever the document count changes, so the
  /// table is rewritten per batch rather than per term.
  pub fn replace_terms<'a>(&mut self, terms: impl Iterator<Item = (&'a str, u64, f64)>) -> Result<(), StoreError> {
    let tx = self.conn.transaction()?;
    {
      tx.execute("DELETE FROM terms", [])?;
      let mut stmt = tx.prepare("INSERT INTO terms (term, df, idf) VALUES (?1, ?2, ?3)")?;
      for (term, df, idf) in terms {
        stmt.execute(params![term, df as i64, idf])?;
      }
    }
    tx.commit()?;
    Ok(())
  }

  // ==========================================================================
  // Loading
  // ==========================================================================

  pub fn load_documents(&self) -> Result<Vec<StoredDocument>, StoreError> {
    let mut stmt = self.conn.prepare("SELECT path, length, norm FROM documents")?;
    let rows = stmt.query_map([], |row| {
      Ok(StoredDocument {
        path: row.get(0)?,
        length: row.get(1)?,
        norm: row.get(2)?,
      })
    })?;
    let mut docs = Vec::new();
    for row in rows {
      docs.push(row?);
    }
    Ok(docs)
  }

  /// Postings in original insertion order (rowid order).
  pub fn load_postings(&self) -> Result<Vec<(String, String, u32)>, StoreError> {
    let mut stmt = self
      .conn
      .prepare("SELECT term, path, tf FROM postings ORDER BY rowid")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
    let mut postings = Vec::new();
    for row in rows {
      postings.push(row?);
    }
    Ok(postings)
  }

  pub fn load_terms(&self) -> Result<Vec<(String, u64, f64)>, StoreError> {
    let mut stmt = self.conn.prepare("SELECT term, df, idf FROM terms")?;
    let rows = stmt.query_map([], |row| {
      Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64, row.get(2)?))
    })?;
    let mut terms = Vec::new();
    for row in rows {
      terms.push(row?);
    }
    Ok(terms)
  }

  // ==========================================================================
  // Logical-Delete Bitmap
  // ==========================================================================

  pub fn replace_deleted_slots(&mut self, slots: impl Iterator<Item = usize>) -> Result<(), StoreError> {
    let tx = self.conn.transaction()?;
    {
      tx.execute("DELETE FROM deleted_slots", [])?;
      let mut stmt = tx.prepare("INSERT INTO deleted_slots (slot) VALUES (?1)")?;
      for slot in slots {
        stmt.execute(params![slot as i64])?;
      }
    }
    tx.commit()?;
    Ok(())
  }

  pub fn deleted_slots(&self) -> Result<Vec<usize>, StoreError> {
    let mut stmt = self.conn.prepare("SELECT slot FROM deleted_slots ORDER BY slot")?;
    let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
    let mut slots = Vec::new();
    for row in rows {
      slots.push(row? as usize);
    }
    Ok(slots)
  }
}

fn insert_file_row(stmt: &mut rusqlite::Statement<'_>, doc: &DocumentWrite<'_>) -> Result<(), StoreError> {
  let record = doc.record;
  stmt.execute(params![
    record.path,
    record.abs_path.to_string_lossy(),
    record.size as i64,
    record.hash,
    record.language.map(|l| l.as_str()),
    doc.preview,
    record.indexed_at.to_rfc3339(),
  ])?;
  Ok(())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRecord> {
  let language: Option<String> = row.get(4)?;
  let indexed_at: String = row.get(5)?;
  Ok(FileRecord {
    path: row.get(0)?,
    abs_path: PathBuf::from(row.get::<_, String>(1)?),
    size: row.get::<_, i64>(2)? as u64,
    hash: row.get(3)?,
    language: language.as_deref().and_then(Language::from_str_tag),
    indexed_at: indexed_at
      .parse::<DateTime<Utc>>()
      .unwrap_or_else(|e| {
        warn!(error = %e, "Unparseable indexed_at, substituting now");
        Utc::now()
      }),
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn record(path: &str, hash: &str) -> FileRecord {
    FileRecord {
      path: path.to_string(),
      abs_path: PathBuf::from("/repo").join(path),
      size: 42,
      hash: hash.to_string(),
      language: Some(Language::Rust),
      indexed_at: Utc::now(),
    }
  }

  fn doc_write<'a>(record: &'a FileRecord, tf: &'a [(String, u32)]) -> DocumentWrite<'a> {
    let length = tf.iter().map(|(_, c)| c).sum();
    DocumentWrite {
      record,
      preview: "preview",
      tf,
      length,
      norm: 1.0,
    }
  }

  #[test]
  fn test_open_creates_schema() {
    let store = IndexStore::open_in_memory().unwrap();
    assert_eq!(store.file_count().unwrap(), 0);
    assert!(store.load_documents().unwrap().is_empty());
  }

  #[test]
  fn test_meta_round_trip() {
    let mut store = IndexStore::open_in_memory().unwrap();
    assert_eq!(store.meta_get("dimensions").unwrap(), None);
    store.meta_set("dimensions", "768").unwrap();
    store.meta_set("dimensions", "1024").unwrap();
    assert_eq!(store.meta_get("dimensions").unwrap(), Some("1024".to_string()));
  }

  #[test]
  fn test_bulk_insert_and_reload() {
    let mut store = IndexStore::open_in_memory().unwrap();
    let rec_a = record("a.rs", "hash-a");
    let rec_b = record("b.rs", "hash-b");
    let tf_a = vec![("login".to_string(), 2), ("auth".to_string(), 1)];
    let tf_b = vec![("database".to_string(), 1)];

    store
      .bulk_insert(&[doc_write(&rec_a, &tf_a), doc_write(&rec_b, &tf_b)])
      .unwrap();

    assert_eq!(store.file_count().unwrap(), 2);
    let hashes = store.file_hashes().unwrap();
    assert_eq!(hashes.get("a.rs"), Some(&"hash-a".to_string()));

    let postings = store.load_postings().unwrap();
    assert_eq!(postings.len(), 3);
    // Insertion order preserved.
    assert_eq!(postings[0], ("login".to_string(), "a.rs".to_string(), 2));

    let reloaded = store.file_record("a.rs").unwrap().unwrap();
    assert_eq!(reloaded.language, Some(Language::Rust));
    assert_eq!(reloaded.size, 42);
  }

  #[test]
  fn test_upsert_replaces_postings() {
    let mut store = IndexStore::open_in_memory().unwrap();
    let rec = record("a.rs", "v1");
    let tf_v1 = vec![("old".to_string(), 1)];
    store.upsert_document(&doc_write(&rec, &tf_v1)).unwrap();

    let rec_v2 = record("a.rs", "v2");
    let tf_v2 = vec![("new".to_string(), 3)];
    store.upsert_document(&doc_write(&rec_v2, &tf_v2)).unwrap();

    let postings = store.load_postings().unwrap();
    assert_eq!(postings, vec![("new".to_string(), "a.rs".to_string(), 3)]);
    assert_eq!(store.file_hashes().unwrap().get("a.rs"), Some(&"v2".to_string()));
  }

  #[test]
  fn test_remove_document_clears_all_tables() {
    let mut store = IndexStore::open_in_memory().unwrap();
    let rec = record("a.rs", "h");
    let tf = vec![("term".to_string(), 1)];
    store.upsert_document(&doc_write(&rec, &tf)).unwrap();

    store.remove_document("a.rs").unwrap();
    assert_eq!(store.file_count().unwrap(), 0);
    assert!(store.load_postings().unwrap().is_empty());
    assert!(store.load_documents().unwrap().is_empty());
  }

  #[test]
  fn test_terms_table_replacement() {
    let mut store = IndexStore::open_in_memory().unwrap();
    store
      .replace_terms([("auth", 2u64, 1.5f64), ("login", 1, 2.0)].into_iter())
      .unwrap();
    let mut terms = store.load_terms().unwrap();
    terms.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(terms.len(), 2);
    assert_eq!(terms[0].0, "auth");
    assert_eq!(terms[0].1, 2);

    store.replace_terms([("auth", 3u64, 1.2f64)].into_iter()).unwrap();
    let terms = store.load_terms().unwrap();
    assert_eq!(terms.len(), 1);
  }

  #[test]
  fn test_deleted_slots_round_trip() {
    let mut store = IndexStore::open_in_memory().unwrap();
    store.replace_deleted_slots([3usize, 1, 7].into_iter()).unwrap();
    assert_eq!(store.deleted_slots().unwrap(), vec![1, 3, 7]);
    store.replace_deleted_slots(std::iter::empty()).unwrap();
    assert!(store.deleted_slots().unwrap().is_empty());
  }

  #[test]
  fn test_open_corrupted_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.db");
    std::fs::write(&path, b"definitely not a sqlite database, just bytes").unwrap();

    let result = IndexStore::open(&path);
    assert!(matches!(result, Err(StoreError::Corrupt(_))));
  }

  #[test]
  fn test_persistence_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.db");
    {
      let mut store = IndexStore::open(&path).unwrap();
      let rec = record("a.rs", "h");
      let tf = vec![("term".to_string(), 1)];
      store.upsert_document(&doc_write(&rec, &tf)).unwrap();
    }
    let store = IndexStore::open(&path).unwrap();
    assert_eq!(store.file_count().unwrap(), 1);
  }
}
