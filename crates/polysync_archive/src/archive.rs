//! SQLite-backed archive.

use crate::error::{ArchiveError, ArchiveResult};
use polysync_types::{ChangeType, MappingId, MemberId};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use tracing::debug;

const IGNORED_TABLE: &str = "tbl_ignored_conflicts";
const DATA_TABLE: &str = "tbl_data";
const CHANGES_PREFIX: &str = "tbl_changes_";

/// One persisted mapping entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedChange {
    /// Row id.
    pub id: i64,
    /// Uid of the item at the member.
    pub uid: String,
    /// Mapping the entry belongs to.
    pub mapping_id: MappingId,
    /// Member owning the entry.
    pub member_id: MemberId,
}

/// One ignored-conflict ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IgnoredConflict {
    /// Mapping that was in conflict.
    pub mapping_id: MappingId,
    /// Changetype of one of its entries at the time.
    pub changetype: ChangeType,
}

/// Durable store of mapping identity.
pub struct Archive {
    conn: Connection,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for Archive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archive").field("path", &self.path).finish()
    }
}

impl Archive {
    /// Opens or creates the archive file at `path`.
    pub fn open(path: &Path) -> ArchiveResult<Self> {
        let conn = Connection::open(path).map_err(|source| ArchiveError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "opened archive");
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    /// Opens a throwaway in-memory archive.
    pub fn open_in_memory() -> ArchiveResult<Self> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
            path: None,
        })
    }

    /// Returns the backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Saves a mapping entry of `objtype`.
    ///
    /// With `id == 0` a new row is inserted and its id returned. If
    /// `mapping_id` is also `0`, the new row id becomes the mapping id; the
    /// caller stamps its in-memory mapping with the returned id. Otherwise
    /// the existing row is updated in place and `id` is returned.
    pub fn save_change(
        &mut self,
        objtype: &str,
        id: i64,
        uid: &str,
        mapping_id: MappingId,
        member_id: MemberId,
    ) -> ArchiveResult<i64> {
        let table = changes_table(objtype)?;
        self.ensure_changes_table(&table)?;

        if id != 0 {
            let updated = self.conn.execute(
                &format!("UPDATE {table} SET uid = ?1, mappingid = ?2, memberid = ?3 WHERE id = ?4"),
                params![uid, mapping_id, member_id, id],
            )?;
            if updated == 0 {
                return Err(ArchiveError::NotFound {
                    objtype: objtype.to_string(),
                    id,
                });
            }
            debug!(objtype, id, uid, mapping_id, member_id, "updated archived change");
            return Ok(id);
        }

        let tx = self.conn.transaction()?;
        tx.execute(
            &format!("INSERT INTO {table} (uid, mappingid, memberid) VALUES (?1, ?2, ?3)"),
            params![uid, mapping_id, member_id],
        )?;
        let new_id = tx.last_insert_rowid();
        if mapping_id == 0 {
            tx.execute(
                &format!("UPDATE {table} SET mappingid = ?1 WHERE id = ?1"),
                params![new_id],
            )?;
        }
        tx.commit()?;

        debug!(objtype, id = new_id, uid, mapping_id, member_id, "inserted archived change");
        Ok(new_id)
    }

    /// Removes a mapping entry. Missing rows and tables are not an error.
    pub fn delete_change(&mut self, objtype: &str, id: i64) -> ArchiveResult<()> {
        let table = changes_table(objtype)?;
        if !self.has_table(&table)? {
            return Ok(());
        }
        self.conn
            .execute(&format!("DELETE FROM {table} WHERE id = ?1"), params![id])?;
        debug!(objtype, id, "deleted archived change");
        Ok(())
    }

    /// Loads every entry of `objtype`, ordered by mapping id then row id.
    pub fn load_changes(&self, objtype: &str) -> ArchiveResult<Vec<ArchivedChange>> {
        let table = changes_table(objtype)?;
        if !self.has_table(&table)? {
            return Ok(Vec::new());
        }

        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, uid, mappingid, memberid FROM {table} ORDER BY mappingid, id"
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok(ArchivedChange {
                id: row.get(0)?,
                uid: row.get(1)?,
                mapping_id: row.get(2)?,
                member_id: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Records that the user ignored a conflict on `mapping_id`.
    pub fn save_ignored_conflict(
        &mut self,
        objtype: &str,
        mapping_id: MappingId,
        changetype: ChangeType,
    ) -> ArchiveResult<()> {
        self.conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {IGNORED_TABLE} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    objtype TEXT NOT NULL,
                    mappingid INTEGER NOT NULL,
                    changetype INTEGER NOT NULL
                )"
            ),
            [],
        )?;
        self.conn.execute(
            &format!(
                "INSERT INTO {IGNORED_TABLE} (objtype, mappingid, changetype) VALUES (?1, ?2, ?3)"
            ),
            params![objtype, mapping_id, changetype.to_code()],
        )?;
        debug!(objtype, mapping_id, ?changetype, "saved ignored conflict");
        Ok(())
    }

    /// Loads the ignored-conflict ledger of `objtype`.
    pub fn load_ignored_conflicts(&self, objtype: &str) -> ArchiveResult<Vec<IgnoredConflict>> {
        if !self.has_table(IGNORED_TABLE)? {
            return Ok(Vec::new());
        }

        let mut stmt = self.conn.prepare(&format!(
            "SELECT mappingid, changetype FROM {IGNORED_TABLE} WHERE objtype = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![objtype], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut ledger = Vec::new();
        for row in rows {
            let (mapping_id, code) = row?;
            let changetype = ChangeType::from_code(code)
                .ok_or_else(|| ArchiveError::Corrupt(format!("unknown changetype code {code}")))?;
            ledger.push(IgnoredConflict {
                mapping_id,
                changetype,
            });
        }
        Ok(ledger)
    }

    /// Clears the ignored-conflict ledger of `objtype`.
    pub fn flush_ignored_conflicts(&mut self, objtype: &str) -> ArchiveResult<()> {
        if !self.has_table(IGNORED_TABLE)? {
            return Ok(());
        }
        self.conn.execute(
            &format!("DELETE FROM {IGNORED_TABLE} WHERE objtype = ?1"),
            params![objtype],
        )?;
        Ok(())
    }

    /// Stores an opaque blob for an item, replacing any previous one.
    pub fn save_data(&mut self, objtype: &str, uid: &str, data: &[u8]) -> ArchiveResult<()> {
        self.conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {DATA_TABLE} (
                    objtype TEXT NOT NULL,
                    uid TEXT NOT NULL,
                    data BLOB NOT NULL,
                    PRIMARY KEY (objtype, uid)
                )"
            ),
            [],
        )?;
        self.conn.execute(
            &format!("INSERT OR REPLACE INTO {DATA_TABLE} (objtype, uid, data) VALUES (?1, ?2, ?3)"),
            params![objtype, uid, data],
        )?;
        Ok(())
    }

    /// Loads the blob stored for an item.
    pub fn load_data(&self, objtype: &str, uid: &str) -> ArchiveResult<Option<Vec<u8>>> {
        if !self.has_table(DATA_TABLE)? {
            return Ok(None);
        }
        let data: Option<Vec<u8>> = self
            .conn
            .query_row(
                &format!("SELECT data FROM {DATA_TABLE} WHERE objtype = ?1 AND uid = ?2"),
                params![objtype, uid],
                |row| row.get(0),
            )
            .optional()?;
        Ok(data)
    }

    /// Finds the object type an archived uid belongs to.
    pub fn get_objtype(&self, uid: &str) -> ArchiveResult<Option<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'tbl\\_changes\\_%' ESCAPE '\\' ORDER BY name",
        )?;
        let tables = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        for table in tables {
            let found = self
                .conn
                .query_row(
                    &format!("SELECT 1 FROM {table} WHERE uid = ?1 LIMIT 1"),
                    params![uid],
                    |_| Ok(()),
                )
                .optional()?;
            if found.is_some() {
                return Ok(table.strip_prefix(CHANGES_PREFIX).map(str::to_string));
            }
        }
        Ok(None)
    }

    fn ensure_changes_table(&self, table: &str) -> ArchiveResult<()> {
        self.conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    uid TEXT NOT NULL,
                    mappingid INTEGER NOT NULL,
                    memberid INTEGER NOT NULL
                )"
            ),
            [],
        )?;
        Ok(())
    }

    fn has_table(&self, table: &str) -> ArchiveResult<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

fn changes_table(objtype: &str) -> ArchiveResult<String> {
    let valid = !objtype.is_empty()
        && objtype
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(ArchiveError::InvalidObjType(objtype.to_string()));
    }
    Ok(format!("{CHANGES_PREFIX}{objtype}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load() {
        let mut archive = Archive::open_in_memory().unwrap();
        let id = archive.save_change("contact", 0, "uid1", 5, 1).unwrap();
        assert!(id > 0);

        let rows = archive.load_changes("contact").unwrap();
        assert_eq!(
            rows,
            vec![ArchivedChange {
                id,
                uid: "uid1".into(),
                mapping_id: 5,
                member_id: 1,
            }]
        );
    }

    #[test]
    fn update_in_place() {
        let mut archive = Archive::open_in_memory().unwrap();
        let id = archive.save_change("contact", 0, "uid1", 5, 1).unwrap();
        let same = archive.save_change("contact", id, "uid2", 6, 2).unwrap();
        assert_eq!(same, id);

        let rows = archive.load_changes("contact").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].uid, "uid2");
        assert_eq!(rows[0].mapping_id, 6);
        assert_eq!(rows[0].member_id, 2);
    }

    #[test]
    fn update_missing_row_fails() {
        let mut archive = Archive::open_in_memory().unwrap();
        let err = archive.save_change("contact", 99, "uid", 1, 1).unwrap_err();
        assert!(matches!(err, ArchiveError::NotFound { id: 99, .. }));
    }

    #[test]
    fn insert_without_mapping_stamps_row_id() {
        let mut archive = Archive::open_in_memory().unwrap();
        let first = archive.save_change("event", 0, "e1", 0, 1).unwrap();
        let second = archive.save_change("event", 0, "e2", first, 2).unwrap();

        let rows = archive.load_changes("event").unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.mapping_id == first));
        assert_ne!(first, second);
    }

    #[test]
    fn load_orders_by_mapping() {
        let mut archive = Archive::open_in_memory().unwrap();
        archive.save_change("note", 0, "c", 3, 1).unwrap();
        archive.save_change("note", 0, "a", 1, 1).unwrap();
        archive.save_change("note", 0, "d", 3, 2).unwrap();
        archive.save_change("note", 0, "b", 1, 2).unwrap();

        let uids: Vec<_> = archive
            .load_changes("note")
            .unwrap()
            .into_iter()
            .map(|r| r.uid)
            .collect();
        assert_eq!(uids, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn objtypes_are_separate() {
        let mut archive = Archive::open_in_memory().unwrap();
        archive.save_change("contact", 0, "x", 1, 1).unwrap();
        assert!(archive.load_changes("event").unwrap().is_empty());
        assert_eq!(archive.get_objtype("x").unwrap().as_deref(), Some("contact"));
        assert_eq!(archive.get_objtype("nope").unwrap(), None);
    }

    #[test]
    fn delete_change() {
        let mut archive = Archive::open_in_memory().unwrap();
        archive.delete_change("contact", 1).unwrap();

        let id = archive.save_change("contact", 0, "x", 1, 1).unwrap();
        archive.delete_change("contact", id).unwrap();
        assert!(archive.load_changes("contact").unwrap().is_empty());
    }

    #[test]
    fn invalid_objtype_rejected() {
        let mut archive = Archive::open_in_memory().unwrap();
        for bad in ["", "contact; DROP TABLE x", "a-b"] {
            assert!(matches!(
                archive.save_change(bad, 0, "x", 1, 1),
                Err(ArchiveError::InvalidObjType(_))
            ));
        }
    }

    #[test]
    fn ignored_conflict_ledger() {
        let mut archive = Archive::open_in_memory().unwrap();
        assert!(archive.load_ignored_conflicts("contact").unwrap().is_empty());
        archive.flush_ignored_conflicts("contact").unwrap();

        archive
            .save_ignored_conflict("contact", 4, ChangeType::Modified)
            .unwrap();
        archive
            .save_ignored_conflict("contact", 4, ChangeType::Deleted)
            .unwrap();
        archive
            .save_ignored_conflict("event", 9, ChangeType::Added)
            .unwrap();

        let ledger = archive.load_ignored_conflicts("contact").unwrap();
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger[1].changetype, ChangeType::Deleted);

        archive.flush_ignored_conflicts("contact").unwrap();
        assert!(archive.load_ignored_conflicts("contact").unwrap().is_empty());
        assert_eq!(archive.load_ignored_conflicts("event").unwrap().len(), 1);
    }

    #[test]
    fn data_blobs() {
        let mut archive = Archive::open_in_memory().unwrap();
        assert_eq!(archive.load_data("contact", "x").unwrap(), None);

        archive.save_data("contact", "x", b"one").unwrap();
        archive.save_data("contact", "x", b"two").unwrap();
        assert_eq!(archive.load_data("contact", "x").unwrap().as_deref(), Some(&b"two"[..]));
        assert_eq!(archive.load_data("event", "x").unwrap(), None);
    }
}
