//! SQLite-backed UID counters

use crate::{StoreError, StoreResult};
use async_trait::async_trait;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;
use tracing::{debug, info, trace};
use uidtrack_core::{CoreResult, UidCounter, UidValidity};

/// Snapshot of a counter row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterState {
    pub uid_validity: u64,
    pub last_uid: u64,
    /// Bumped on every successful write to the row
    pub version: u64,
}

#[derive(Debug, sqlx::FromRow)]
struct CounterRow {
    uid_validity: i64,
    last_uid: i64,
    version: i64,
}

impl From<CounterRow> for CounterState {
    fn from(row: CounterRow) -> Self {
        Self {
            uid_validity: row.uid_validity as u64,
            last_uid: row.last_uid as u64,
            version: row.version as u64,
        }
    }
}

/// Database holding one UID counter per mailbox
#[derive(Clone)]
pub struct UidStore {
    pool: Pool<Sqlite>,
}

impl UidStore {
    /// Open or create a store at the given path
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite:{}?mode=rwc", path.display());
        info!("Opening UID store at {}", path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let store = Self { pool };
        store.initialize().await?;

        Ok(store)
    }

    /// Open an in-memory store (for testing)
    pub async fn open_memory() -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.initialize().await?;

        Ok(store)
    }

    async fn initialize(&self) -> StoreResult<()> {
        debug!("Initializing UID store schema");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS uid_counters (
                mailbox TEXT PRIMARY KEY,
                uid_validity INTEGER NOT NULL,
                last_uid INTEGER NOT NULL DEFAULT 0,
                version INTEGER NOT NULL DEFAULT 0,
                created_at TEXT DEFAULT (datetime('now')),
                updated_at TEXT DEFAULT (datetime('now'))
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get the counter for a mailbox, creating it with a fresh UIDVALIDITY
    /// if the mailbox has none yet
    pub async fn counter(&self, mailbox: &str) -> StoreResult<SqliteUidCounter> {
        let validity = UidValidity::generate(None);

        let inserted = sqlx::query(
            r#"
            INSERT INTO uid_counters (mailbox, uid_validity, last_uid, version)
            VALUES (?, ?, 0, 0)
            ON CONFLICT(mailbox) DO NOTHING
            "#,
        )
        .bind(mailbox)
        .bind(validity.get() as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted > 0 {
            info!("Created UID counter for {} (UIDVALIDITY {})", mailbox, validity);
        }

        self.load(mailbox).await
    }

    /// Start a new UID epoch for a recreated mailbox.
    ///
    /// The new UIDVALIDITY is strictly greater than the old one and the
    /// counter restarts at zero. Counters handed out before this call fail
    /// from then on.
    pub async fn recreate(&self, mailbox: &str) -> StoreResult<SqliteUidCounter> {
        let old = self.counter(mailbox).await?;
        let validity = UidValidity::generate(Some(old.uid_validity));

        sqlx::query(
            r#"
            UPDATE uid_counters SET
                uid_validity = ?,
                last_uid = 0,
                version = version + 1,
                updated_at = datetime('now')
            WHERE mailbox = ?
            "#,
        )
        .bind(validity.get() as i64)
        .bind(mailbox)
        .execute(&self.pool)
        .await?;

        info!(
            "Recreated UID counter for {}: UIDVALIDITY {} -> {}",
            mailbox, old.uid_validity, validity
        );
        self.load(mailbox).await
    }

    /// Delete a mailbox's counter, returning whether it existed
    pub async fn delete(&self, mailbox: &str) -> StoreResult<bool> {
        let deleted = sqlx::query("DELETE FROM uid_counters WHERE mailbox = ?")
            .bind(mailbox)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }

    async fn load(&self, mailbox: &str) -> StoreResult<SqliteUidCounter> {
        let state = read_state(&self.pool, mailbox).await?;
        let uid_validity = UidValidity::new(state.uid_validity).ok_or_else(|| {
            StoreError::DatabaseError(format!("zero UIDVALIDITY stored for {}", mailbox))
        })?;

        Ok(SqliteUidCounter {
            pool: self.pool.clone(),
            mailbox: mailbox.to_string(),
            uid_validity,
        })
    }
}

async fn read_state(pool: &Pool<Sqlite>, mailbox: &str) -> StoreResult<CounterState> {
    let row: Option<CounterRow> = sqlx::query_as(
        "SELECT uid_validity, last_uid, version FROM uid_counters WHERE mailbox = ?",
    )
    .bind(mailbox)
    .fetch_optional(pool)
    .await?;

    row.map(CounterState::from)
        .ok_or_else(|| StoreError::MailboxNotFound(mailbox.to_string()))
}

/// Durable UID counter for one mailbox.
///
/// Every increment is a single conditional `UPDATE` guarded by the row's
/// version, so two writers that read the same state cannot both succeed.
#[derive(Clone)]
pub struct SqliteUidCounter {
    pool: Pool<Sqlite>,
    mailbox: String,
    uid_validity: UidValidity,
}

impl SqliteUidCounter {
    pub fn mailbox(&self) -> &str {
        &self.mailbox
    }

    /// Read the current row
    pub async fn state(&self) -> StoreResult<CounterState> {
        let state = read_state(&self.pool, &self.mailbox).await?;
        self.check_epoch(&state)?;
        Ok(state)
    }

    /// Advance the counter only if the row still matches `expected`
    pub async fn increment_from(&self, expected: CounterState) -> StoreResult<u64> {
        if expected.last_uid >= i64::MAX as u64 {
            return Err(StoreError::Exhausted(self.mailbox.clone()));
        }

        let updated: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE uid_counters SET
                last_uid = last_uid + 1,
                version = version + 1,
                updated_at = datetime('now')
            WHERE mailbox = ? AND uid_validity = ? AND version = ?
            RETURNING last_uid
            "#,
        )
        .bind(&self.mailbox)
        .bind(self.uid_validity.get() as i64)
        .bind(expected.version as i64)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(last_uid) => {
                trace!("Advanced {} to UID {}", self.mailbox, last_uid);
                Ok(last_uid as u64)
            }
            None => {
                // Distinguish a lost race from a vanished or recreated mailbox
                self.state().await?;
                debug!(
                    "UID counter for {} moved past version {}",
                    self.mailbox, expected.version
                );
                Err(StoreError::Conflict {
                    expected_version: expected.version,
                })
            }
        }
    }

    fn check_epoch(&self, state: &CounterState) -> StoreResult<()> {
        if state.uid_validity != self.uid_validity.get() {
            return Err(StoreError::Superseded {
                mailbox: self.mailbox.clone(),
                stale: self.uid_validity.get(),
                current: state.uid_validity,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl UidCounter for SqliteUidCounter {
    async fn increment(&self) -> CoreResult<u64> {
        let state = self.state().await?;
        Ok(self.increment_from(state).await?)
    }

    async fn last_uid(&self) -> CoreResult<u64> {
        Ok(self.state().await?.last_uid)
    }

    fn uid_validity(&self) -> UidValidity {
        self.uid_validity
    }
}
