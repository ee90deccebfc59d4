use rusqlite::Connection;

use crate::error::Result;

const SCHEMA_VERSION: i32 = 1;

/// How long a connection waits on another process's write lock before the
/// write surfaces as a conflict.
const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

pub fn init_schema(conn: &Connection) -> Result<()> {
    let current_version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if current_version == 0 {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY CHECK (id LIKE 'task_%'),
                owner_id TEXT NOT NULL,
                parent_id TEXT REFERENCES tasks(id) CHECK (parent_id LIKE 'task_%'),
                title TEXT NOT NULL,
                completed INTEGER NOT NULL DEFAULT 0,
                completed_at TEXT,
                completion_percentage INTEGER NOT NULL DEFAULT 0
                    CHECK (completion_percentage BETWEEN 0 AND 100),
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                CHECK (parent_id IS NULL OR parent_id != id)
            );

            CREATE TABLE IF NOT EXISTS task_dependencies (
                id TEXT PRIMARY KEY CHECK (id LIKE 'dep_%'),
                owner_id TEXT NOT NULL,
                dependent_id TEXT NOT NULL REFERENCES tasks(id) CHECK (dependent_id LIKE 'task_%'),
                prerequisite_id TEXT NOT NULL REFERENCES tasks(id) CHECK (prerequisite_id LIKE 'task_%'),
                kind TEXT NOT NULL DEFAULT 'finish_to_start'
                    CHECK (kind IN ('finish_to_start', 'start_to_start', 'finish_to_finish', 'start_to_finish')),
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                CHECK (dependent_id != prerequisite_id)
            );

            CREATE TABLE IF NOT EXISTS owner_graphs (
                owner_id TEXT PRIMARY KEY,
                version INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_owner ON tasks(owner_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_id);
            CREATE INDEX IF NOT EXISTS idx_deps_dependent
                ON task_dependencies(dependent_id) WHERE active = 1;
            CREATE INDEX IF NOT EXISTS idx_deps_prerequisite
                ON task_dependencies(prerequisite_id) WHERE active = 1;
            CREATE UNIQUE INDEX IF NOT EXISTS idx_deps_active_pair
                ON task_dependencies(dependent_id, prerequisite_id) WHERE active = 1;

            PRAGMA journal_mode = WAL;
            "#,
        )?;

        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    }

    Ok(())
}

pub fn open_db(path: &std::path::Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    configure(&conn)?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Per-connection settings; not persisted in the database file.
pub(crate) fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(())
}
