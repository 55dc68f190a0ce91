//! Persistence for bbqscan.
//!
//! Two stores live here:
//! - [`ResultStore`] / [`CsvResultStore`]: the durable result tables, one per
//!   page-group plus the combined table at the run root.
//! - [`Storage`]: a libSQL ledger recording runs, the last state reached by each
//!   page-group, and cached classification answers.

mod migrations;
pub mod table;

use std::path::Path;

use bbqscan_shared::{BbqScanError, PageGroupState, Result, RunId};
use chrono::Utc;
use libsql::{Connection, Database, params};

pub use table::{CsvResultStore, LOOSE_GROUP, ResultStore, StoreKey};

/// File name of the ledger database inside a run root.
pub const LEDGER_FILE_NAME: &str = ".bbqscan.db";

fn storage_err(e: impl std::fmt::Display) -> BbqScanError {
    BbqScanError::Storage(e.to_string())
}

/// Ledger handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

/// A recorded run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub id: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub outcome: Option<String>,
    pub stats_json: Option<String>,
}

/// The last known state of one page-group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupStateRecord {
    pub group_key: String,
    pub state: PageGroupState,
    pub row_count: Option<u64>,
    pub updated_at: String,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| BbqScanError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` for reporting only.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(BbqScanError::Storage(format!(
                "no ledger at {}",
                path.display()
            )));
        }
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        BbqScanError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(BbqScanError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Run operations
    // -----------------------------------------------------------------------

    /// Record the start of a run under `root`. Returns the new run ID.
    pub async fn insert_run(&self, root: &str) -> Result<RunId> {
        self.check_writable()?;
        let id = RunId::new();
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO runs (id, root, started_at) VALUES (?1, ?2, ?3)",
                params![id.to_string(), root, now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(id)
    }

    /// Mark a run finished with an outcome label and optional stats.
    pub async fn finish_run(
        &self,
        run_id: &RunId,
        outcome: &str,
        stats_json: Option<&str>,
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE runs SET finished_at = ?1, outcome = ?2, stats_json = ?3 WHERE id = ?4",
                params![now.as_str(), outcome, stats_json, run_id.to_string()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// The most recently started run under `root`.
    pub async fn last_run(&self, root: &str) -> Result<Option<RunRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, started_at, finished_at, outcome, stats_json FROM runs
                 WHERE root = ?1 ORDER BY started_at DESC, id DESC LIMIT 1",
                params![root],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(RunRecord {
                id: row.get::<String>(0).map_err(storage_err)?,
                started_at: row.get::<String>(1).map_err(storage_err)?,
                finished_at: row.get::<String>(2).ok(),
                outcome: row.get::<String>(3).ok(),
                stats_json: row.get::<String>(4).ok(),
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    // -----------------------------------------------------------------------
    // Page-group state ledger
    // -----------------------------------------------------------------------

    /// Record the state a page-group just reached (upserts).
    pub async fn set_group_state(
        &self,
        root: &str,
        group_key: &str,
        state: PageGroupState,
        run_id: Option<&RunId>,
        row_count: Option<u64>,
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO page_groups (root, group_key, state, run_id, row_count, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(root, group_key) DO UPDATE SET
                   state = excluded.state,
                   run_id = excluded.run_id,
                   row_count = COALESCE(excluded.row_count, page_groups.row_count),
                   updated_at = excluded.updated_at",
                params![
                    root,
                    group_key,
                    state.as_str(),
                    run_id.map(|id| id.to_string()),
                    row_count.map(|c| c as i64),
                    now.as_str(),
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// All page-group states under `root`, ordered by key.
    pub async fn list_group_states(&self, root: &str) -> Result<Vec<GroupStateRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT group_key, state, row_count, updated_at FROM page_groups
                 WHERE root = ?1 ORDER BY group_key",
                params![root],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let state: String = row.get(1).map_err(storage_err)?;
            results.push(GroupStateRecord {
                group_key: row.get::<String>(0).map_err(storage_err)?,
                state: state.parse()?,
                row_count: row.get::<i64>(2).ok().map(|c| c as u64),
                updated_at: row.get::<String>(3).map_err(storage_err)?,
            });
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Classification cache
    // -----------------------------------------------------------------------

    /// Get a cached classification answer.
    pub async fn get_classification_cache(
        &self,
        batch_hash: &str,
        model_id: &str,
    ) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT result_json FROM classification_cache
                 WHERE batch_hash = ?1 AND model_id = ?2",
                params![batch_hash, model_id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row.get::<String>(0).map_err(storage_err)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// Store a classification answer in the cache (upserts).
    pub async fn set_classification_cache(
        &self,
        batch_hash: &str,
        model_id: &str,
        result_json: &str,
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO classification_cache (batch_hash, model_id, result_json, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(batch_hash, model_id) DO UPDATE SET
                   result_json = excluded.result_json,
                   created_at = excluded.created_at",
                params![batch_hash, model_id, result_json, now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}
