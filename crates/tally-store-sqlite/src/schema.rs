//! SQL schema for the tally SQLite store.
//!
//! Executed once at connection startup. Future migrations will be gated on
//! `PRAGMA user_version`.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`, so
/// opening an existing store is not an error.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- One row per candidate. Frozen once retired; never deleted here.
CREATE TABLE IF NOT EXISTS subjects (
    subject_id           INTEGER PRIMARY KEY,
    object_id            TEXT,
    tally_t0             REAL    NOT NULL DEFAULT 0,
    tally_t1             REAL    NOT NULL DEFAULT 0,
    classification_count INTEGER NOT NULL DEFAULT 0,
    retired              INTEGER NOT NULL DEFAULT 0,
    created_at           TEXT    NOT NULL,
    updated_at           TEXT    NOT NULL,
    retired_at           TEXT,
    exported_at          TEXT,
    CHECK (classification_count >= 0),
    CHECK (retired IN (0, 1))
);

-- Raw classification events; the id is the dedup and resume key.
CREATE TABLE IF NOT EXISTS classifications (
    id          INTEGER PRIMARY KEY,
    subject_id  INTEGER NOT NULL,
    t0          TEXT    NOT NULL,   -- number or 'None'
    t1          TEXT,               -- number, 'None', or NULL when absent
    user_id     TEXT,
    object_id   TEXT,
    processed   INTEGER NOT NULL DEFAULT 0,
    outcome     TEXT,               -- 'created' | 'updated' | 'skipped_retired'
    recorded_at TEXT    NOT NULL,   -- ISO 8601 UTC; store-assigned
    CHECK (processed IN (0, 1)),
    CHECK ((processed = 0) = (outcome IS NULL))
);

CREATE INDEX IF NOT EXISTS classifications_subject_idx
    ON classifications(subject_id);
CREATE INDEX IF NOT EXISTS classifications_unprocessed_idx
    ON classifications(id) WHERE processed = 0;
CREATE INDEX IF NOT EXISTS subjects_pending_idx
    ON subjects(retired, classification_count);

PRAGMA user_version = 1;
";
