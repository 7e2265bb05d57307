//! SQLite catalog
//!
//! One table, one row per key. The catalog is the source of truth for which
//! keys exist; blob files are only reachable through a row's `filename`.
//!
//! The connection is not shared: the engine owns the catalog behind its
//! instance lock, so no statement here needs its own transaction beyond
//! SQLite's per-statement atomicity.

use crate::types::{CatalogRow, ItemInfo};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tiercache_common::clock::unix_timestamp;
use tracing::debug;

/// SQLite caps bound parameters per statement; batch statements are chunked
const MAX_BATCH: usize = 500;

const SCHEMA: &str = "
create table if not exists items (
    key         text    not null primary key,
    value       blob,
    filename    text,
    size        integer not null default 0,
    mod_time    integer not null,
    access_time integer not null,
    extra       blob
);
create index if not exists items_access_time_idx on items(access_time);
create index if not exists items_size_idx on items(size);
";

const INFO_COLUMNS: &str = "key, filename, size, mod_time, access_time, extra";
const FULL_COLUMNS: &str = "key, filename, size, mod_time, access_time, extra, value";

/// Catalog row reference used by trims: key, filename and size
pub(crate) type RowRef = (String, Option<String>, u64);

pub(crate) struct Catalog {
    conn: Connection,
    path: PathBuf,
}

impl Catalog {
    /// Open (or create) the catalog database
    pub(crate) fn open(path: impl AsRef<Path>) -> rusqlite::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "wal", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "normal")?;
        conn.execute_batch(SCHEMA)?;
        // Fail now rather than on first use if the file is not a database
        conn.query_row("select count(*) from items", [], |row| row.get::<_, i64>(0))?;
        debug!("Opened catalog at {:?} (journal_mode={})", path, mode);
        Ok(Self { conn, path })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    // ---- Writes ----

    /// Insert or replace the row for `key`, stamping both timestamps
    ///
    /// Exactly one of `value` / `filename` is expected to be set.
    pub(crate) fn upsert(
        &self,
        key: &str,
        value: Option<&[u8]>,
        filename: Option<&str>,
        size: u64,
        extra: Option<&[u8]>,
    ) -> rusqlite::Result<()> {
        let now = unix_timestamp();
        let mut stmt = self.conn.prepare_cached(
            "insert or replace into items (key, value, filename, size, mod_time, access_time, extra)
             values (?1, ?2, ?3, ?4, ?5, ?5, ?6)",
        )?;
        stmt.execute(params![key, value, filename, to_sql_size(size), now, extra])?;
        Ok(())
    }

    pub(crate) fn touch(&self, key: &str) -> rusqlite::Result<i64> {
        let now = unix_timestamp();
        let mut stmt = self
            .conn
            .prepare_cached("update items set access_time = ?1 where key = ?2")?;
        stmt.execute(params![now, key])?;
        Ok(now)
    }

    pub(crate) fn touch_many(&self, keys: &[&str]) -> rusqlite::Result<i64> {
        let now = unix_timestamp();
        for chunk in keys.chunks(MAX_BATCH) {
            let sql = format!(
                "update items set access_time = ? where key in ({})",
                placeholders(chunk.len())
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let now_param: &dyn rusqlite::ToSql = &now;
            let args = std::iter::once(now_param)
                .chain(chunk.iter().map(|k| k as &dyn rusqlite::ToSql));
            stmt.execute(params_from_iter(args))?;
        }
        Ok(now)
    }

    #[cfg(test)]
    pub(crate) fn set_access_time(&self, key: &str, time: i64) -> rusqlite::Result<()> {
        self.conn.execute(
            "update items set access_time = ?1 where key = ?2",
            params![time, key],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> rusqlite::Result<()> {
        self.conn.execute_batch(sql)
    }

    pub(crate) fn delete(&self, key: &str) -> rusqlite::Result<bool> {
        let mut stmt = self.conn.prepare_cached("delete from items where key = ?1")?;
        Ok(stmt.execute([key])? > 0)
    }

    pub(crate) fn delete_many<S: AsRef<str>>(&self, keys: &[S]) -> rusqlite::Result<usize> {
        let mut deleted = 0;
        for chunk in keys.chunks(MAX_BATCH) {
            let sql = format!("delete from items where key in ({})", placeholders(chunk.len()));
            let mut stmt = self.conn.prepare(&sql)?;
            deleted += stmt.execute(params_from_iter(chunk.iter().map(AsRef::<str>::as_ref)))?;
        }
        Ok(deleted)
    }

    pub(crate) fn delete_all(&self) -> rusqlite::Result<usize> {
        self.conn.execute("delete from items", [])
    }

    pub(crate) fn delete_larger_than(&self, size: u64) -> rusqlite::Result<usize> {
        let mut stmt = self
            .conn
            .prepare_cached("delete from items where size > ?1")?;
        stmt.execute([to_sql_size(size)])
    }

    pub(crate) fn delete_earlier_than(&self, time: i64) -> rusqlite::Result<usize> {
        let mut stmt = self
            .conn
            .prepare_cached("delete from items where access_time < ?1")?;
        stmt.execute([time])
    }

    /// Fold the WAL back into the main database file
    pub(crate) fn checkpoint(&self) -> rusqlite::Result<()> {
        self.conn
            .query_row("pragma wal_checkpoint(truncate)", [], |_| Ok(()))
    }

    // ---- Reads ----

    pub(crate) fn get(&self, key: &str, with_value: bool) -> rusqlite::Result<Option<CatalogRow>> {
        let columns = if with_value { FULL_COLUMNS } else { INFO_COLUMNS };
        let sql = format!("select {columns} from items where key = ?1");
        let mut stmt = self.conn.prepare_cached(&sql)?;
        stmt.query_row([key], |row| read_row(row, with_value))
            .optional()
    }

    pub(crate) fn get_many(&self, keys: &[&str], with_value: bool) -> rusqlite::Result<Vec<CatalogRow>> {
        let columns = if with_value { FULL_COLUMNS } else { INFO_COLUMNS };
        let mut rows = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(MAX_BATCH) {
            let sql = format!(
                "select {columns} from items where key in ({})",
                placeholders(chunk.len())
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let mapped = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                read_row(row, with_value)
            })?;
            for row in mapped {
                rows.push(row?);
            }
        }
        Ok(rows)
    }

    /// Filename of a row; `None` if the row is missing or inline
    pub(crate) fn filename(&self, key: &str) -> rusqlite::Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare_cached("select filename from items where key = ?1")?;
        let found: Option<Option<String>> = stmt.query_row([key], |row| row.get(0)).optional()?;
        Ok(found.flatten())
    }

    pub(crate) fn filenames(&self, keys: &[&str]) -> rusqlite::Result<Vec<String>> {
        let mut names = Vec::new();
        for chunk in keys.chunks(MAX_BATCH) {
            let sql = format!(
                "select filename from items where filename is not null and key in ({})",
                placeholders(chunk.len())
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let mapped = stmt.query_map(params_from_iter(chunk.iter()), |row| row.get(0))?;
            for name in mapped {
                names.push(name?);
            }
        }
        Ok(names)
    }

    pub(crate) fn filenames_larger_than(&self, size: u64) -> rusqlite::Result<Vec<String>> {
        let mut stmt = self.conn.prepare_cached(
            "select filename from items where size > ?1 and filename is not null",
        )?;
        stmt.query_map([to_sql_size(size)], |row| row.get(0))?
            .collect()
    }

    pub(crate) fn filenames_earlier_than(&self, time: i64) -> rusqlite::Result<Vec<String>> {
        let mut stmt = self.conn.prepare_cached(
            "select filename from items where access_time < ?1 and filename is not null",
        )?;
        stmt.query_map([time], |row| row.get(0))?.collect()
    }

    /// Least recently accessed rows first
    ///
    /// Rows with equal access time are ordered by insertion (rowid), so
    /// items written in the same second go oldest write first.
    pub(crate) fn lru_page(&self, limit: usize) -> rusqlite::Result<Vec<RowRef>> {
        let mut stmt = self.conn.prepare_cached(
            "select key, filename, size from items
             order by access_time asc, rowid asc limit ?1",
        )?;
        stmt.query_map([i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
            Ok((row.get(0)?, row.get(1)?, from_sql_size(row.get(2)?)))
        })?
        .collect()
    }

    /// Every (key, filename) pair for file-backed rows
    pub(crate) fn file_rows(&self) -> rusqlite::Result<Vec<(String, String)>> {
        let mut stmt = self
            .conn
            .prepare_cached("select key, filename from items where filename is not null")?;
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect()
    }

    pub(crate) fn exists(&self, key: &str) -> rusqlite::Result<bool> {
        let mut stmt = self
            .conn
            .prepare_cached("select count(key) from items where key = ?1")?;
        let count: i64 = stmt.query_row([key], |row| row.get(0))?;
        Ok(count > 0)
    }

    pub(crate) fn count(&self) -> rusqlite::Result<u64> {
        let mut stmt = self.conn.prepare_cached("select count(*) from items")?;
        let count: i64 = stmt.query_row([], |row| row.get(0))?;
        Ok(from_sql_size(count))
    }

    pub(crate) fn total_size(&self) -> rusqlite::Result<u64> {
        let mut stmt = self
            .conn
            .prepare_cached("select coalesce(sum(size), 0) from items")?;
        let total: i64 = stmt.query_row([], |row| row.get(0))?;
        Ok(from_sql_size(total))
    }
}

fn read_row(row: &Row<'_>, with_value: bool) -> rusqlite::Result<CatalogRow> {
    let info = ItemInfo {
        key: row.get(0)?,
        filename: row.get(1)?,
        size: from_sql_size(row.get(2)?),
        mod_time: row.get(3)?,
        access_time: row.get(4)?,
        extended_data: row.get(5)?,
    };
    let inline_value = if with_value { row.get(6)? } else { None };
    Ok(CatalogRow { info, inline_value })
}

fn placeholders(n: usize) -> String {
    let mut s = "?,".repeat(n);
    s.pop();
    s
}

fn to_sql_size(size: u64) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}

fn from_sql_size(size: i64) -> u64 {
    u64::try_from(size).unwrap_or(0)
}
