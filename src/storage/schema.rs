//! Database schema definitions
//!
//! This module contains all SQL schema definitions for the Market-Harvest database.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Current state of every item, one row per item id
CREATE TABLE IF NOT EXISTS items (
    id INTEGER PRIMARY KEY,
    appid INTEGER NOT NULL DEFAULT 0,
    game TEXT,
    name TEXT,
    market_hash_name TEXT,
    steam_market_url TEXT,
    sell_reference_price REAL NOT NULL DEFAULT 0,
    sell_min_price REAL NOT NULL DEFAULT 0,
    buy_max_price REAL NOT NULL DEFAULT 0,
    sell_num INTEGER NOT NULL DEFAULT 0,
    buy_num INTEGER NOT NULL DEFAULT 0,
    transacted_num INTEGER NOT NULL DEFAULT 0,
    goods_info TEXT NOT NULL DEFAULT '{}',
    updated_at TEXT NOT NULL
);

-- One row per observation, never updated
CREATE TABLE IF NOT EXISTS items_price_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    item_id INTEGER NOT NULL,
    sell_reference_price REAL NOT NULL DEFAULT 0,
    sell_min_price REAL NOT NULL DEFAULT 0,
    buy_max_price REAL NOT NULL DEFAULT 0,
    sell_num INTEGER NOT NULL DEFAULT 0,
    buy_num INTEGER NOT NULL DEFAULT 0,
    transacted_num INTEGER NOT NULL DEFAULT 0,
    recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_item_time ON items_price_history(item_id, recorded_at);
CREATE INDEX IF NOT EXISTS idx_recorded_at ON items_price_history(recorded_at);
"#;

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        initialize_schema(&conn).unwrap();
        let result = initialize_schema(&conn);

        assert!(result.is_ok());
    }

    #[test]
    fn test_tables_and_indexes_exist_after_init() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();

        for (kind, name) in [
            ("table", "items"),
            ("table", "items_price_history"),
            ("index", "idx_item_time"),
        ] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = ?1 AND name = ?2",
                    [kind, name],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "{} {} should exist", kind, name);
        }
    }
}
