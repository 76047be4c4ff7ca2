//! SQL schema for the scopecfg SQLite store.
//!
//! Executed once at connection startup. Future migrations will be gated on
//! `PRAGMA user_version`.

/// Full schema DDL; idempotent thanks to `CREATE ... IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS config_keys (
    key             TEXT PRIMARY KEY,
    description     TEXT NOT NULL DEFAULT '',
    declared_type   TEXT NOT NULL,   -- 'string' | 'number' | 'boolean' | 'json' | 'array'
    category        TEXT NOT NULL DEFAULT '',
    allowed_scopes  TEXT NOT NULL DEFAULT '[]',   -- JSON array of dimensions
    default_json    TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

-- Records are append-only. The only UPDATE ever issued flips is_active off
-- and stamps the deactivation columns.
CREATE TABLE IF NOT EXISTS config_values (
    record_id        TEXT PRIMARY KEY,
    config_key       TEXT NOT NULL REFERENCES config_keys(key),
    scope_dimension  TEXT NOT NULL,   -- 'global' | 'persona' | 'agent' | 'workflow'
    scope_value      TEXT NOT NULL DEFAULT '',
    value_json       TEXT NOT NULL,
    version          INTEGER NOT NULL CHECK (version >= 1),
    effective_from   TEXT NOT NULL,   -- fixed-width RFC 3339 UTC
    is_active        INTEGER NOT NULL DEFAULT 1,
    created_at       TEXT NOT NULL,
    created_by       TEXT NOT NULL,
    deactivated_at   TEXT,
    deactivated_by   TEXT,
    UNIQUE (config_key, scope_dimension, scope_value, version)
);

CREATE INDEX IF NOT EXISTS config_values_effective_idx
    ON config_values(config_key, effective_from);
CREATE INDEX IF NOT EXISTS config_keys_category_idx ON config_keys(category);

PRAGMA user_version = 1;
";
