pub const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- sites table
CREATE TABLE IF NOT EXISTS sites (
    hostname TEXT PRIMARY KEY NOT NULL,
    last_sync TEXT,
    active INTEGER NOT NULL DEFAULT 0,
    api_key TEXT,
    notes TEXT
);

-- datasets table
CREATE TABLE IF NOT EXISTS datasets (
    id TEXT PRIMARY KEY NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    payload_ref TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    enabled INTEGER NOT NULL DEFAULT 1,
    kind TEXT NOT NULL,
    source_site TEXT NOT NULL REFERENCES sites(hostname) ON DELETE CASCADE,
    frontend_link TEXT
);

CREATE INDEX IF NOT EXISTS idx_datasets_source_site ON datasets(source_site);

-- filter_lists table
CREATE TABLE IF NOT EXISTS filter_lists (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    category TEXT NOT NULL,
    serialized_data TEXT NOT NULL,
    is_default INTEGER NOT NULL DEFAULT 0,
    owner_id INTEGER
);

CREATE INDEX IF NOT EXISTS idx_filter_lists_category ON filter_lists(category);
"#;
