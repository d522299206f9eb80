use crate::error::{Result, VaultError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use ulid::Ulid;

/// Role tag for a principal. Admin only unlocks the global stats surface;
/// the core enforces ownership, not roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            other => Err(VaultError::Internal(format!("unknown role: {}", other))),
        }
    }
}

/// Sharing state of a stored object. Private objects are visible only to
/// their owner; public objects may be fetched by anyone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Private,
    Public,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Private => "private",
            Visibility::Public => "public",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "private" => Ok(Visibility::Private),
            "public" => Ok(Visibility::Public),
            other => Err(VaultError::Internal(format!(
                "unknown visibility: {}",
                other
            ))),
        }
    }
}

/// An account with a remaining storage budget. `quota_remaining` is signed:
/// it may only dip below zero transiently inside a transaction, never after
/// a completed operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub name: String,
    pub role: Role,
    pub quota_remaining: i64,
    pub quota_total: i64,
    pub created_at: DateTime<Utc>,
}

/// Metadata for one physical payload. Exactly one record exists per
/// (owner, fingerprint) pair; `ref_count` tracks how many logical uploads
/// point at it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub id: String,
    pub owner_id: String,
    pub fingerprint: String,
    pub filename: String,
    pub mime_type: String,
    pub size: i64,
    pub ref_count: i64,
    pub visibility: Visibility,
    pub download_count: i64,
    pub blob_path: String,
    pub created_at: DateTime<Utc>,
}

/// Per-principal storage usage, before and after deduplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageStats {
    pub physical_bytes: i64,
    pub logical_bytes: i64,
    pub savings_bytes: i64,
    pub savings_percent: f64,
}

/// System-wide totals for the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalStats {
    pub total_objects: i64,
    pub total_physical_bytes: i64,
    pub total_principals: i64,
}

/// SQLite-backed persistence collaborator. Opens a fresh connection per
/// call (WAL mode, busy timeout) so callers on different tasks do not
/// share connection state; single-statement updates and explicit
/// transactions provide the atomicity the quota and refcount invariants
/// require.
pub struct MetadataStore {
    db_path: PathBuf,
}

impl MetadataStore {
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let store = Self {
            db_path: data_dir.join("vault.db"),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn get_conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS principals (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                role TEXT NOT NULL,
                quota_remaining INTEGER NOT NULL,
                quota_total INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        // UNIQUE(owner_id, fingerprint) backs the one-object-per-content
        // dedup contract at the storage layer.
        conn.execute(
            "CREATE TABLE IF NOT EXISTS objects (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                filename TEXT NOT NULL,
                mime_type TEXT NOT NULL,
                size INTEGER NOT NULL,
                ref_count INTEGER NOT NULL DEFAULT 1,
                visibility TEXT NOT NULL DEFAULT 'private',
                download_count INTEGER NOT NULL DEFAULT 0,
                blob_path TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (owner_id, fingerprint),
                FOREIGN KEY (owner_id) REFERENCES principals(id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_objects_owner
             ON objects(owner_id, created_at)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_objects_visibility
             ON objects(visibility)",
            [],
        )?;

        Ok(())
    }

    // === Principals ===

    pub fn create_principal(&self, name: &str, role: Role, quota_bytes: i64) -> Result<Principal> {
        if name.trim().is_empty() {
            return Err(VaultError::InvalidRequest(
                "principal name cannot be empty".to_string(),
            ));
        }

        let principal = Principal {
            id: Ulid::new().to_string(),
            name: name.to_string(),
            role,
            quota_remaining: quota_bytes,
            quota_total: quota_bytes,
            created_at: Utc::now(),
        };

        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO principals (id, name, role, quota_remaining, quota_total, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                principal.id,
                principal.name,
                principal.role.as_str(),
                principal.quota_remaining,
                principal.quota_total,
                principal.created_at.to_rfc3339(),
            ],
        )?;

        Ok(principal)
    }

    pub fn get_principal(&self, id: &str) -> Result<Option<Principal>> {
        let conn = self.get_conn()?;
        let row: Option<(String, String, i64, i64, String)> = conn
            .query_row(
                "SELECT name, role, quota_remaining, quota_total, created_at
                 FROM principals WHERE id = ?1",
                [id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((name, role, quota_remaining, quota_total, created_at)) => Ok(Some(Principal {
                id: id.to_string(),
                name,
                role: Role::parse(&role)?,
                quota_remaining,
                quota_total,
                created_at: parse_timestamp(&created_at)?,
            })),
            None => Ok(None),
        }
    }

    pub fn get_principal_by_name(&self, name: &str) -> Result<Option<Principal>> {
        let conn = self.get_conn()?;
        let id: Option<String> = conn
            .query_row("SELECT id FROM principals WHERE name = ?1", [name], |row| {
                row.get(0)
            })
            .optional()?;

        match id {
            Some(id) => self.get_principal(&id),
            None => Ok(None),
        }
    }

    // === Quota ===

    /// Conditional quota debit: one atomic statement, succeeds only when
    /// the remaining budget covers the amount.
    pub fn try_debit_quota(&self, principal_id: &str, amount: i64) -> Result<bool> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "UPDATE principals SET quota_remaining = quota_remaining - ?1
             WHERE id = ?2 AND quota_remaining >= ?1",
            params![amount, principal_id],
        )?;
        Ok(affected > 0)
    }

    pub fn credit_quota(&self, principal_id: &str, amount: i64) -> Result<()> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "UPDATE principals SET quota_remaining = quota_remaining + ?1 WHERE id = ?2",
            params![amount, principal_id],
        )?;
        if affected == 0 {
            return Err(VaultError::PrincipalNotFound(principal_id.to_string()));
        }
        Ok(())
    }

    pub fn quota_remaining(&self, principal_id: &str) -> Result<i64> {
        let conn = self.get_conn()?;
        conn.query_row(
            "SELECT quota_remaining FROM principals WHERE id = ?1",
            [principal_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| VaultError::PrincipalNotFound(principal_id.to_string()))
    }

    // === Objects ===

    pub fn insert_object(&self, object: &ObjectRecord) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO objects (
                id, owner_id, fingerprint, filename, mime_type, size,
                ref_count, visibility, download_count, blob_path, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                object.id,
                object.owner_id,
                object.fingerprint,
                object.filename,
                object.mime_type,
                object.size,
                object.ref_count,
                object.visibility.as_str(),
                object.download_count,
                object.blob_path,
                object.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_object(&self, id: &str) -> Result<Option<ObjectRecord>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE id = ?1",
            ObjectRecord::SELECT_COLUMNS
        ))?;
        let object = stmt
            .query_row([id], ObjectRecord::from_row)
            .optional()?;
        Ok(object)
    }

    pub fn find_object(&self, owner_id: &str, fingerprint: &str) -> Result<Option<ObjectRecord>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE owner_id = ?1 AND fingerprint = ?2",
            ObjectRecord::SELECT_COLUMNS
        ))?;
        let object = stmt
            .query_row([owner_id, fingerprint], ObjectRecord::from_row)
            .optional()?;
        Ok(object)
    }

    /// Duplicate admission: bump the reference count and refund the
    /// provisional quota charge in one transaction.
    pub fn increment_ref_and_credit(
        &self,
        object_id: &str,
        owner_id: &str,
        amount: i64,
    ) -> Result<i64> {
        let mut conn = self.get_conn()?;
        // Immediate: take the write lock up front so the transaction never
        // has to upgrade mid-flight under concurrent writers.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let affected = tx.execute(
            "UPDATE objects SET ref_count = ref_count + 1 WHERE id = ?1",
            [object_id],
        )?;
        if affected == 0 {
            return Err(VaultError::NotFound);
        }

        tx.execute(
            "UPDATE principals SET quota_remaining = quota_remaining + ?1 WHERE id = ?2",
            params![amount, owner_id],
        )?;

        let ref_count: i64 = tx.query_row(
            "SELECT ref_count FROM objects WHERE id = ?1",
            [object_id],
            |row| row.get(0),
        )?;

        tx.commit()?;
        Ok(ref_count)
    }

    /// Decrement a reference that is not the last one. Returns false when
    /// the guard does not hold (ref_count is already 1, or no such row).
    pub fn decrement_ref(&self, object_id: &str) -> Result<bool> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "UPDATE objects SET ref_count = ref_count - 1
             WHERE id = ?1 AND ref_count > 1",
            [object_id],
        )?;
        Ok(affected > 0)
    }

    /// Last-reference release: delete the metadata row and credit the
    /// owner's quota in the same transaction. Metadata is the source of
    /// truth for quota correctness; physical deletion happens afterwards.
    pub fn delete_object_and_credit(
        &self,
        object_id: &str,
        owner_id: &str,
        amount: i64,
    ) -> Result<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let affected = tx.execute("DELETE FROM objects WHERE id = ?1", [object_id])?;
        if affected == 0 {
            return Err(VaultError::NotFound);
        }

        tx.execute(
            "UPDATE principals SET quota_remaining = quota_remaining + ?1 WHERE id = ?2",
            params![amount, owner_id],
        )?;

        tx.commit()?;
        Ok(())
    }

    // === Visibility ===

    /// Owner-scoped visibility update. Returns false when the object does
    /// not exist or the caller is not the owner.
    pub fn set_visibility(
        &self,
        object_id: &str,
        owner_id: &str,
        visibility: Visibility,
    ) -> Result<bool> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "UPDATE objects SET visibility = ?1 WHERE id = ?2 AND owner_id = ?3",
            params![visibility.as_str(), object_id, owner_id],
        )?;
        Ok(affected > 0)
    }

    /// Count a public fetch and return the object, atomically. Private and
    /// missing objects both come back as None so existence never leaks.
    pub fn record_public_fetch(&self, object_id: &str) -> Result<Option<ObjectRecord>> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let affected = tx.execute(
            "UPDATE objects SET download_count = download_count + 1
             WHERE id = ?1 AND visibility = 'public'",
            [object_id],
        )?;
        if affected == 0 {
            return Ok(None);
        }

        let object = tx
            .prepare(&format!(
                "{} WHERE id = ?1",
                ObjectRecord::SELECT_COLUMNS
            ))?
            .query_row([object_id], ObjectRecord::from_row)?;

        tx.commit()?;
        Ok(Some(object))
    }

    // === Listing and stats ===

    pub fn list_objects(&self, owner_id: &str) -> Result<Vec<ObjectRecord>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE owner_id = ?1 ORDER BY created_at DESC",
            ObjectRecord::SELECT_COLUMNS
        ))?;

        let rows = stmt.query_map([owner_id], ObjectRecord::from_row)?;

        let mut objects = Vec::new();
        for row in rows {
            objects.push(row?);
        }
        Ok(objects)
    }

    /// Physical vs logical usage for one owner: logical counts every
    /// reference, physical counts stored bytes once.
    pub fn storage_stats(&self, owner_id: &str) -> Result<StorageStats> {
        let conn = self.get_conn()?;
        let (physical, logical): (i64, i64) = conn.query_row(
            "SELECT COALESCE(SUM(size), 0), COALESCE(SUM(size * ref_count), 0)
             FROM objects WHERE owner_id = ?1",
            [owner_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let savings = logical - physical;
        let percent = if logical > 0 {
            savings as f64 / logical as f64 * 100.0
        } else {
            0.0
        };

        Ok(StorageStats {
            physical_bytes: physical,
            logical_bytes: logical,
            savings_bytes: savings,
            savings_percent: percent,
        })
    }

    pub fn global_stats(&self) -> Result<GlobalStats> {
        let conn = self.get_conn()?;
        let (total_objects, total_physical_bytes): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM objects",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let total_principals: i64 =
            conn.query_row("SELECT COUNT(*) FROM principals", [], |row| row.get(0))?;

        Ok(GlobalStats {
            total_objects,
            total_physical_bytes,
            total_principals,
        })
    }
}

impl ObjectRecord {
    const SELECT_COLUMNS: &'static str =
        "SELECT id, owner_id, fingerprint, filename, mime_type, size,
                ref_count, visibility, download_count, blob_path, created_at
         FROM objects";

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let visibility: String = row.get(7)?;
        let created_at: String = row.get(10)?;

        Ok(ObjectRecord {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            fingerprint: row.get(2)?,
            filename: row.get(3)?,
            mime_type: row.get(4)?,
            size: row.get(5)?,
            ref_count: row.get(6)?,
            visibility: Visibility::parse(&visibility)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
            download_count: row.get(8)?,
            blob_path: row.get(9)?,
            created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?
                .with_timezone(&chrono::Utc),
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| VaultError::Internal(format!("invalid timestamp in database: {}", e)))
}
