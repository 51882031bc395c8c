use super::models::*;
use super::sqlite::Store;
use crate::error::{Error, Result};
use crate::hasher::ConfirmationHash;
use ahash::AHashMap;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use tracing::debug;

const FILE_COLUMNS: &str = "id, path, size, modified, fingerprint, confirm_primary, \
     confirm_secondary, status, missing_scans, last_seen_scan, first_seen, last_updated";

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        id: row.get(0)?,
        path: row.get(1)?,
        size: row.get::<_, i64>(2)? as u64,
        modified: row.get(3)?,
        fingerprint: row.get::<_, Option<i64>>(4)?.map(|v| v as u64),
        confirm_primary: row.get(5)?,
        confirm_secondary: row.get(6)?,
        status: row.get(7)?,
        missing_scans: row.get::<_, i64>(8)? as u32,
        last_seen_scan: row.get(9)?,
        first_seen: row.get(10)?,
        last_updated: row.get(11)?,
    })
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl Store {
    // ── Files ────────────────────────────────────────────────────

    /// Insert or update a record keyed by path. `first_seen` survives updates.
    /// Returns the row id.
    pub fn upsert(&self, file: &FileRecord) -> Result<i64> {
        let now = now();
        let id = self.connection().prepare_cached(
            "INSERT INTO files \
             (path, size, modified, fingerprint, confirm_primary, confirm_secondary, \
              status, missing_scans, last_seen_scan, first_seen, last_updated) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9, ?9) \
             ON CONFLICT(path) DO UPDATE SET \
                 size = excluded.size, \
                 modified = excluded.modified, \
                 fingerprint = excluded.fingerprint, \
                 confirm_primary = excluded.confirm_primary, \
                 confirm_secondary = excluded.confirm_secondary, \
                 status = excluded.status, \
                 missing_scans = 0, \
                 last_seen_scan = excluded.last_seen_scan, \
                 last_updated = excluded.last_updated \
             RETURNING id",
        )?
        .query_row(
            params![
                file.path,
                file.size as i64,
                file.modified,
                file.fingerprint.map(|f| f as i64),
                file.confirm_primary,
                file.confirm_secondary,
                file.status,
                file.last_seen_scan,
                now,
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_file(&self, id: i64) -> Result<Option<FileRecord>> {
        let sql = format!("SELECT {} FROM files WHERE id = ?1", FILE_COLUMNS);
        Ok(self
            .connection()
            .prepare_cached(&sql)?
            .query_row(params![id], file_from_row)
            .optional()?)
    }

    pub fn get_file_by_path(&self, path: &str) -> Result<Option<FileRecord>> {
        let sql = format!("SELECT {} FROM files WHERE path = ?1", FILE_COLUMNS);
        Ok(self
            .connection()
            .prepare_cached(&sql)?
            .query_row(params![path], file_from_row)
            .optional()?)
    }

    /// Existing records for the given paths, keyed by path. Unknown paths are absent.
    pub fn files_by_paths<'a>(
        &self,
        paths: impl IntoIterator<Item = &'a str>,
    ) -> Result<AHashMap<String, FileRecord>> {
        let mut found = AHashMap::new();
        for path in paths {
            if let Some(record) = self.get_file_by_path(path)? {
                found.insert(record.path.clone(), record);
            }
        }
        Ok(found)
    }

    /// Non-missing records sharing `fingerprint`, earliest first, excluding `exclude_path`.
    pub fn lookup_by_fingerprint(
        &self,
        fingerprint: u64,
        exclude_path: Option<&str>,
    ) -> Result<Vec<FileRecord>> {
        let sql = format!(
            "SELECT {} FROM files \
             WHERE fingerprint = ?1 AND status != 'missing' AND path != ?2 \
             ORDER BY first_seen, id",
            FILE_COLUMNS
        );
        let mut stmt = self.connection().prepare_cached(&sql)?;
        let files = stmt
            .query_map(
                params![fingerprint as i64, exclude_path.unwrap_or("")],
                file_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(files)
    }

    /// Record that a file was observed by scan `scan_epoch` without changes.
    pub fn touch_seen(&self, file_id: i64, scan_epoch: i64) -> Result<()> {
        self.connection()
            .prepare_cached(
                "UPDATE files SET last_seen_scan = ?1, missing_scans = 0 WHERE id = ?2",
            )?
            .execute(params![scan_epoch, file_id])?;
        Ok(())
    }

    pub fn store_confirmation(&self, file_id: i64, confirmation: &ConfirmationHash) -> Result<()> {
        self.connection()
            .prepare_cached(
                "UPDATE files SET confirm_primary = ?1, confirm_secondary = ?2, \
                 last_updated = ?3 WHERE id = ?4",
            )?
            .execute(params![
                confirmation.primary,
                confirmation.secondary,
                now(),
                file_id
            ])?;
        Ok(())
    }

    /// Forget the hashes of a record whose content is about to be re-examined.
    /// A duplicate falls back to present; its link must already be gone.
    pub fn clear_hashes(&self, file_id: i64) -> Result<()> {
        self.connection()
            .prepare_cached(
                "UPDATE files SET fingerprint = NULL, confirm_primary = NULL, \
                 confirm_secondary = NULL, \
                 status = CASE WHEN status = 'duplicate' THEN 'present' ELSE status END, \
                 last_updated = ?1 WHERE id = ?2",
            )?
            .execute(params![now(), file_id])?;
        Ok(())
    }

    /// Records not observed since before `scan_epoch`, including already-missing ones.
    pub fn unseen_files(&self, scan_epoch: i64) -> Result<Vec<FileRecord>> {
        let sql = format!(
            "SELECT {} FROM files WHERE last_seen_scan < ?1 ORDER BY path",
            FILE_COLUMNS
        );
        let mut stmt = self.connection().prepare(&sql)?;
        let files = stmt
            .query_map(params![scan_epoch], file_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(files)
    }

    /// Mark paths as missing after a completed scan did not observe them.
    ///
    /// Each call counts one more consecutive missing scan. Links are dropped and
    /// a missing canonical hands its group to its earliest duplicate. Returns the
    /// number of files that were not already missing.
    pub fn mark_missing(&self, paths: &[String]) -> Result<usize> {
        let mut newly_missing = 0;
        for path in paths {
            let Some(record) = self.get_file_by_path(path)? else {
                continue;
            };
            match record.status {
                FileStatus::Missing => {}
                FileStatus::Duplicate => {
                    self.clear_duplicate_link(record.id)?;
                    newly_missing += 1;
                }
                FileStatus::Present => {
                    self.promote_dependents(record.id)?;
                    newly_missing += 1;
                }
            }
            self.connection()
                .prepare_cached(
                    "UPDATE files SET status = 'missing', missing_scans = missing_scans + 1, \
                     last_updated = ?1 WHERE id = ?2",
                )?
                .execute(params![now(), record.id])?;
        }
        debug!("Marked {} files missing ({} paths unseen)", newly_missing, paths.len());
        Ok(newly_missing)
    }

    /// Delete rows that have been missing for at least `min_missing_scans` scans.
    pub fn purge_missing(&self, min_missing_scans: u32) -> Result<usize> {
        let ids: Vec<i64> = self
            .connection()
            .prepare(
                "SELECT id FROM files WHERE status = 'missing' AND missing_scans >= ?1",
            )?
            .query_map(params![min_missing_scans as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for id in &ids {
            self.promote_dependents(*id)?;
            self.connection()
                .prepare_cached("DELETE FROM files WHERE id = ?1")?
                .execute(params![id])?;
        }
        debug!("Purged {} long-missing files", ids.len());
        Ok(ids.len())
    }

    pub fn list_files(&self, filter: &FileFilter) -> Result<Vec<FileRecord>> {
        let mut sql = format!("SELECT {} FROM files WHERE 1 = 1", FILE_COLUMNS);
        let mut values: Vec<Value> = Vec::new();
        if let Some(status) = filter.status {
            values.push(Value::Text(status.as_str().to_string()));
            sql.push_str(&format!(" AND status = ?{}", values.len()));
        }
        if let Some(needle) = &filter.path_contains {
            values.push(Value::Text(needle.clone()));
            sql.push_str(&format!(" AND instr(path, ?{}) > 0", values.len()));
        }
        if let Some(min_size) = filter.min_size {
            values.push(Value::Integer(min_size as i64));
            sql.push_str(&format!(" AND size >= ?{}", values.len()));
        }
        if let Some(fingerprint) = filter.fingerprint {
            values.push(Value::Integer(fingerprint as i64));
            sql.push_str(&format!(" AND fingerprint = ?{}", values.len()));
        }
        sql.push_str(" ORDER BY path");
        if let Some(limit) = filter.limit {
            values.push(Value::Integer(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", values.len()));
            values.push(Value::Integer(filter.offset as i64));
            sql.push_str(&format!(" OFFSET ?{}", values.len()));
        }

        let mut stmt = self.connection().prepare(&sql)?;
        let files = stmt
            .query_map(params_from_iter(values), file_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(files)
    }

    // ── Duplicate Links ──────────────────────────────────────────

    /// Link `file_id` to the canonical record `canonical_id` and mark it duplicate.
    ///
    /// A duplicate target is resolved to its own canonical so links never chain,
    /// and any records that pointed at `file_id` follow it into the group.
    pub fn commit_duplicate(&self, file_id: i64, canonical_id: i64) -> Result<DuplicateLink> {
        let target = self.canonical_of(canonical_id)?.unwrap_or(canonical_id);
        if target == file_id {
            return Err(Error::Other(format!(
                "refusing to link file {} to itself",
                file_id
            )));
        }
        let now = now();
        self.connection()
            .prepare_cached("UPDATE duplicates SET duplicate_of = ?1 WHERE duplicate_of = ?2")?
            .execute(params![target, file_id])?;
        self.connection()
            .prepare_cached(
                "INSERT INTO duplicates (file_id, duplicate_of, linked_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(file_id) DO UPDATE SET duplicate_of = excluded.duplicate_of, \
                 linked_at = excluded.linked_at",
            )?
            .execute(params![file_id, target, now])?;
        self.connection()
            .prepare_cached(
                "UPDATE files SET status = 'duplicate', last_updated = ?1 WHERE id = ?2",
            )?
            .execute(params![now, file_id])?;
        Ok(DuplicateLink {
            file_id,
            duplicate_of: target,
        })
    }

    /// The canonical `file_id` is linked to, if it is a duplicate.
    pub fn canonical_of(&self, file_id: i64) -> Result<Option<i64>> {
        Ok(self
            .connection()
            .prepare_cached("SELECT duplicate_of FROM duplicates WHERE file_id = ?1")?
            .query_row(params![file_id], |row| row.get(0))
            .optional()?)
    }

    pub fn clear_duplicate_link(&self, file_id: i64) -> Result<bool> {
        let removed = self
            .connection()
            .prepare_cached("DELETE FROM duplicates WHERE file_id = ?1")?
            .execute(params![file_id])?;
        Ok(removed > 0)
    }

    /// Records linked to `canonical_id`, earliest first.
    pub fn dependents_of(&self, canonical_id: i64) -> Result<Vec<FileRecord>> {
        let sql = format!(
            "SELECT {} FROM files WHERE id IN \
             (SELECT file_id FROM duplicates WHERE duplicate_of = ?1) \
             ORDER BY first_seen, id",
            FILE_COLUMNS
        );
        let mut stmt = self.connection().prepare_cached(&sql)?;
        let files = stmt
            .query_map(params![canonical_id], file_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(files)
    }

    /// Hand the group of `canonical_id` to its earliest duplicate.
    ///
    /// Returns the new canonical id, or `None` when nothing was linked.
    pub fn promote_dependents(&self, canonical_id: i64) -> Result<Option<i64>> {
        let dependents = self.dependents_of(canonical_id)?;
        let Some(heir) = dependents.first() else {
            return Ok(None);
        };
        self.clear_duplicate_link(heir.id)?;
        self.connection()
            .prepare_cached(
                "UPDATE files SET status = 'present', last_updated = ?1 WHERE id = ?2",
            )?
            .execute(params![now(), heir.id])?;
        self.connection()
            .prepare_cached("UPDATE duplicates SET duplicate_of = ?1 WHERE duplicate_of = ?2")?
            .execute(params![heir.id, canonical_id])?;
        debug!(
            "Promoted {} to canonical in place of file {}",
            heir.path, canonical_id
        );
        Ok(Some(heir.id))
    }

    pub fn duplicate_links(&self) -> Result<Vec<DuplicateLink>> {
        let mut stmt = self
            .connection()
            .prepare("SELECT file_id, duplicate_of FROM duplicates ORDER BY file_id")?;
        let links = stmt
            .query_map([], |row| {
                Ok(DuplicateLink {
                    file_id: row.get(0)?,
                    duplicate_of: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(links)
    }

    /// Every duplicate group, largest waste first.
    pub fn duplicate_groups(&self) -> Result<Vec<DuplicateGroup>> {
        let canonical_ids: Vec<i64> = self
            .connection()
            .prepare("SELECT DISTINCT duplicate_of FROM duplicates")?
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut groups = Vec::with_capacity(canonical_ids.len());
        for canonical_id in canonical_ids {
            let Some(canonical) = self.get_file(canonical_id)? else {
                continue;
            };
            let duplicates = self.dependents_of(canonical_id)?;
            let wasted_bytes = canonical.size * duplicates.len() as u64;
            groups.push(DuplicateGroup {
                canonical,
                duplicates,
                wasted_bytes,
            });
        }
        groups.sort_by(|a, b| {
            b.wasted_bytes
                .cmp(&a.wasted_bytes)
                .then_with(|| a.canonical.path.cmp(&b.canonical.path))
        });
        Ok(groups)
    }

    // ── Stats & Metadata ─────────────────────────────────────────

    pub fn stats_snapshot(&self) -> Result<StatsSnapshot> {
        let (total_files, total_size): (i64, i64) = self.connection().query_row(
            "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM files WHERE status != 'missing'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let duplicate_groups: i64 = self.connection().query_row(
            "SELECT COUNT(DISTINCT duplicate_of) FROM duplicates",
            [],
            |row| row.get(0),
        )?;
        Ok(StatsSnapshot {
            total_files: total_files as u64,
            total_size: total_size as u64,
            duplicate_groups: duplicate_groups as u64,
        })
    }

    /// Start a new scan pass and return its epoch stamp.
    pub fn begin_scan_epoch(&self) -> Result<i64> {
        let epoch = self
            .connection()
            .query_row(
                "UPDATE metadata SET scan_count = scan_count + 1 WHERE id = 1 \
                 RETURNING scan_count",
                [],
                |row| row.get(0),
            )?;
        Ok(epoch)
    }

    /// Copy the current stats into the metadata row.
    pub fn refresh_metadata(&self, scanned: bool) -> Result<StatsSnapshot> {
        let stats = self.stats_snapshot()?;
        self.connection().execute(
            "UPDATE metadata SET total_files = ?1, total_size = ?2, duplicate_groups = ?3, \
             last_scan = CASE WHEN ?4 THEN ?5 ELSE last_scan END WHERE id = 1",
            params![
                stats.total_files as i64,
                stats.total_size as i64,
                stats.duplicate_groups as i64,
                scanned,
                now()
            ],
        )?;
        Ok(stats)
    }

    pub fn metadata(&self) -> Result<WorkspaceMetadata> {
        Ok(self.connection().query_row(
            "SELECT workspace_name, created_at, last_scan, total_files, total_size, \
                    duplicate_groups, scan_count \
             FROM metadata WHERE id = 1",
            [],
            |row| {
                Ok(WorkspaceMetadata {
                    workspace_name: row.get(0)?,
                    created_at: row.get(1)?,
                    last_scan: row.get(2)?,
                    total_files: row.get::<_, i64>(3)? as u64,
                    total_size: row.get::<_, i64>(4)? as u64,
                    duplicate_groups: row.get::<_, i64>(5)? as u64,
                    scan_count: row.get(6)?,
                })
            },
        )?)
    }

    // ── Directories ──────────────────────────────────────────────

    /// Returns false when the directory was already part of the scan set.
    pub fn add_directory(&self, path: &str) -> Result<bool> {
        let added = self.connection().execute(
            "INSERT OR IGNORE INTO directories (path, added_at) VALUES (?1, ?2)",
            params![path, now()],
        )?;
        Ok(added > 0)
    }

    pub fn remove_directory(&self, path: &str) -> Result<bool> {
        let removed = self
            .connection()
            .execute("DELETE FROM directories WHERE path = ?1", params![path])?;
        Ok(removed > 0)
    }

    pub fn list_directories(&self) -> Result<Vec<DirectoryEntry>> {
        let mut stmt = self.connection().prepare(
            "SELECT id, path, added_at, last_scanned FROM directories ORDER BY added_at, id",
        )?;
        let dirs = stmt
            .query_map([], |row| {
                Ok(DirectoryEntry {
                    id: row.get(0)?,
                    path: row.get(1)?,
                    added_at: row.get(2)?,
                    last_scanned: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(dirs)
    }

    pub fn mark_directories_scanned(&self, paths: &[String]) -> Result<()> {
        let now = now();
        let mut stmt = self
            .connection()
            .prepare_cached("UPDATE directories SET last_scanned = ?1 WHERE path = ?2")?;
        for path in paths {
            stmt.execute(params![now, path])?;
        }
        Ok(())
    }
}
