//! Table layout and connection pragmas.

use rusqlite::Connection;

pub const SCHEMA_VERSION: u32 = 1;

/// WAL journaling plus a busy timeout so concurrent writers queue instead of failing.
pub fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA busy_timeout = 5000;
        PRAGMA foreign_keys = ON;
        ",
    )
}

/// Idempotent schema application.
pub fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS faces (
            identity_id TEXT PRIMARY KEY NOT NULL,
            dimension   INTEGER NOT NULL,
            vector      BLOB NOT NULL,
            quality     REAL NOT NULL,
            enrolled_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS attendance (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            identity_id TEXT NOT NULL,
            course_id   TEXT NOT NULL,
            day         TEXT NOT NULL,
            status      TEXT NOT NULL
                        CHECK (status IN ('present', 'late', 'absent', 'excused')),
            first_seen  TEXT NOT NULL,
            last_seen   TEXT NOT NULL,
            confidence  REAL,
            method      TEXT NOT NULL,
            updated_at  TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (identity_id, course_id, day)
        );

        CREATE INDEX IF NOT EXISTS idx_attendance_course_day ON attendance (course_id, day);
        CREATE INDEX IF NOT EXISTS idx_attendance_day ON attendance (day);
        ",
    )?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}

pub fn read_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
}
