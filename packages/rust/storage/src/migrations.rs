//! SQL migrations for the run ledger database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: runs, page_groups, classification_cache",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per orchestrated run
CREATE TABLE IF NOT EXISTS runs (
    id          TEXT PRIMARY KEY,
    root        TEXT NOT NULL,
    started_at  TEXT NOT NULL,
    finished_at TEXT,
    outcome     TEXT,
    stats_json  TEXT
);

CREATE INDEX IF NOT EXISTS idx_runs_root ON runs(root);

-- Last state reached by each page-group under a run root
CREATE TABLE IF NOT EXISTS page_groups (
    root       TEXT NOT NULL,
    group_key  TEXT NOT NULL,
    state      TEXT NOT NULL,
    run_id     TEXT REFERENCES runs(id),
    row_count  INTEGER,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (root, group_key)
);

-- Count-valid classification batch answers
CREATE TABLE IF NOT EXISTS classification_cache (
    batch_hash  TEXT NOT NULL,
    model_id    TEXT NOT NULL,
    result_json TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    PRIMARY KEY (batch_hash, model_id)
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
