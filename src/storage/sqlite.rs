//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the ItemStore trait.

use crate::storage::schema::initialize_schema;
use crate::storage::traits::{ItemStore, StorageError, StorageResult};
use crate::storage::ItemRecord;
use crate::HarvestError;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

const UPSERT_ITEM_SQL: &str = "
    INSERT INTO items (id, appid, game, name, market_hash_name, steam_market_url,
        sell_reference_price, sell_min_price, buy_max_price, sell_num, buy_num,
        transacted_num, goods_info, updated_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
    ON CONFLICT(id) DO UPDATE SET
        appid = excluded.appid,
        game = excluded.game,
        name = excluded.name,
        market_hash_name = excluded.market_hash_name,
        steam_market_url = excluded.steam_market_url,
        sell_reference_price = excluded.sell_reference_price,
        sell_min_price = excluded.sell_min_price,
        buy_max_price = excluded.buy_max_price,
        sell_num = excluded.sell_num,
        buy_num = excluded.buy_num,
        transacted_num = excluded.transacted_num,
        goods_info = excluded.goods_info,
        updated_at = excluded.updated_at";

const INSERT_HISTORY_SQL: &str = "
    INSERT INTO items_price_history (item_id, sell_reference_price, sell_min_price,
        buy_max_price, sell_num, buy_num, transacted_num, recorded_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)";

/// Summary of what the database currently holds
#[derive(Debug, Clone, PartialEq)]
pub struct StoredStatistics {
    pub items: u64,
    pub history_rows: u64,
    pub last_updated: Option<String>,
}

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Connection,
    price_history: bool,
}

impl SqliteStorage {
    /// Creates a new SqliteStorage instance
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    /// * `price_history` - Whether batches also append price history rows
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStorage)` - Successfully opened/created database
    /// * `Err(HarvestError)` - Failed to open database
    pub fn new(path: &Path, price_history: bool) -> Result<Self, HarvestError> {
        let conn = Connection::open(path)?;

        // Configure SQLite for better performance
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self {
            conn,
            price_history,
        })
    }

    /// Creates an in-memory database (for testing)
    #[cfg(test)]
    pub fn new_in_memory(price_history: bool) -> Result<Self, HarvestError> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn,
            price_history,
        })
    }

    pub fn get_item(&self, id: i64) -> StorageResult<Option<ItemRecord>> {
        let item = self
            .conn
            .query_row(
                "SELECT id, appid, game, name, market_hash_name, steam_market_url,
                 sell_reference_price, sell_min_price, buy_max_price, sell_num, buy_num,
                 transacted_num, goods_info
                 FROM items WHERE id = ?1",
                params![id],
                item_from_row,
            )
            .optional()?;
        Ok(item)
    }

    /// Returns the `updated_at` stamp of an item
    pub fn get_updated_at(&self, id: i64) -> StorageResult<Option<String>> {
        let stamp = self
            .conn
            .query_row(
                "SELECT updated_at FROM items WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(stamp)
    }

    pub fn count_items(&self) -> StorageResult<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn count_history(&self) -> StorageResult<u64> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM items_price_history", [], |row| {
                    row.get(0)
                })?;
        Ok(count as u64)
    }

    pub fn count_history_for(&self, item_id: i64) -> StorageResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM items_price_history WHERE item_id = ?1",
            params![item_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn statistics(&self) -> StorageResult<StoredStatistics> {
        let last_updated: Option<String> =
            self.conn
                .query_row("SELECT MAX(updated_at) FROM items", [], |row| row.get(0))?;

        Ok(StoredStatistics {
            items: self.count_items()?,
            history_rows: self.count_history()?,
            last_updated,
        })
    }
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<ItemRecord> {
    let goods_info: String = row.get(12)?;
    Ok(ItemRecord {
        id: row.get(0)?,
        appid: row.get(1)?,
        game: row.get(2)?,
        name: row.get(3)?,
        market_hash_name: row.get(4)?,
        steam_market_url: row.get(5)?,
        sell_reference_price: row.get(6)?,
        sell_min_price: row.get(7)?,
        buy_max_price: row.get(8)?,
        sell_num: row.get(9)?,
        buy_num: row.get(10)?,
        transacted_num: row.get(11)?,
        goods_info: serde_json::from_str(&goods_info).unwrap_or_default(),
    })
}

impl ItemStore for SqliteStorage {
    fn persist_batch(
        &mut self,
        batch: &[ItemRecord],
        observed_at: DateTime<Utc>,
    ) -> StorageResult<usize> {
        let stamp = observed_at.to_rfc3339();
        let tx = self.conn.transaction()?;

        {
            let mut upsert = tx.prepare_cached(UPSERT_ITEM_SQL)?;
            for item in batch {
                let goods_info = serde_json::to_string(&item.goods_info)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                upsert.execute(params![
                    item.id,
                    item.appid,
                    item.game,
                    item.name,
                    item.market_hash_name,
                    item.steam_market_url,
                    item.sell_reference_price,
                    item.sell_min_price,
                    item.buy_max_price,
                    item.sell_num,
                    item.buy_num,
                    item.transacted_num,
                    goods_info,
                    stamp,
                ])?;
            }

            if self.price_history {
                let mut history = tx.prepare_cached(INSERT_HISTORY_SQL)?;
                for item in batch {
                    history.execute(params![
                        item.id,
                        item.sell_reference_price,
                        item.sell_min_price,
                        item.buy_max_price,
                        item.sell_num,
                        item.buy_num,
                        item.transacted_num,
                        stamp,
                    ])?;
                }
            }
        }

        // Dropping an uncommitted transaction rolls it back
        tx.commit()?;
        Ok(batch.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn item(id: i64, price: f64) -> ItemRecord {
        ItemRecord {
            name: Some(format!("Item {}", id)),
            game: Some("csgo".to_string()),
            sell_min_price: price,
            sell_num: 3,
            goods_info: json!({"icon_url": format!("https://cdn.example.com/{}.png", id)}),
            ..ItemRecord::with_id(id)
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_create_in_memory() {
        let storage = SqliteStorage::new_in_memory(true);
        assert!(storage.is_ok());
    }

    #[test]
    fn test_persist_batch_writes_both_tables() {
        let mut storage = SqliteStorage::new_in_memory(true).unwrap();
        let written = storage
            .persist_batch(&[item(1, 1.5), item(2, 2.5)], at(0))
            .unwrap();

        assert_eq!(written, 2);
        assert_eq!(storage.count_items().unwrap(), 2);
        assert_eq!(storage.count_history().unwrap(), 2);

        let stored = storage.get_item(2).unwrap().unwrap();
        assert_eq!(stored, item(2, 2.5));
    }

    #[test]
    fn test_upsert_overwrites_and_history_appends() {
        let mut storage = SqliteStorage::new_in_memory(true).unwrap();
        storage.persist_batch(&[item(7, 1.0)], at(0)).unwrap();
        storage.persist_batch(&[item(7, 4.0)], at(60)).unwrap();

        assert_eq!(storage.count_items().unwrap(), 1);
        assert_eq!(storage.count_history_for(7).unwrap(), 2);
        assert_eq!(storage.get_item(7).unwrap().unwrap().sell_min_price, 4.0);
        assert_eq!(
            storage.get_updated_at(7).unwrap().as_deref(),
            Some(at(60).to_rfc3339().as_str())
        );
    }

    #[test]
    fn test_replaying_batch_is_idempotent() {
        let mut storage = SqliteStorage::new_in_memory(false).unwrap();
        let batch: Vec<_> = (1..=50).map(|id| item(id, id as f64 / 10.0)).collect();

        storage.persist_batch(&batch, at(5)).unwrap();
        let first: Vec<_> = (1..=50)
            .map(|id| (storage.get_item(id).unwrap(), storage.get_updated_at(id).unwrap()))
            .collect();

        storage.persist_batch(&batch, at(5)).unwrap();
        let second: Vec<_> = (1..=50)
            .map(|id| (storage.get_item(id).unwrap(), storage.get_updated_at(id).unwrap()))
            .collect();

        assert_eq!(first, second);
        assert_eq!(storage.count_items().unwrap(), 50);
    }

    #[test]
    fn test_history_can_be_disabled() {
        let mut storage = SqliteStorage::new_in_memory(false).unwrap();
        storage.persist_batch(&[item(1, 1.0)], at(0)).unwrap();
        assert_eq!(storage.count_items().unwrap(), 1);
        assert_eq!(storage.count_history().unwrap(), 0);
    }

    #[test]
    fn test_failed_batch_rolls_back() {
        let mut storage = SqliteStorage::new_in_memory(true).unwrap();
        storage.persist_batch(&[item(1, 1.0)], at(0)).unwrap();

        // Break the history table so the second half of the transaction fails
        storage
            .conn
            .execute_batch("DROP TABLE items_price_history;")
            .unwrap();

        let result = storage.persist_batch(&[item(1, 9.0), item(2, 2.0)], at(10));
        assert!(result.is_err());

        // Neither the upsert of item 1 nor the insert of item 2 survived
        assert_eq!(storage.count_items().unwrap(), 1);
        assert_eq!(storage.get_item(1).unwrap().unwrap().sell_min_price, 1.0);
        assert!(storage.get_item(2).unwrap().is_none());
    }

    #[test]
    fn test_batch_with_unparseable_price_still_commits() {
        let mut storage = SqliteStorage::new_in_memory(true).unwrap();
        let mut batch: Vec<ItemRecord> = (1..=198).map(|id| item(id, 1.0)).collect();
        let odd = crate::crawler::normalize_item(&json!({"id": 199, "sell_min_price": "NaN"}))
            .unwrap();
        batch.push(odd);

        assert_eq!(storage.persist_batch(&batch, at(0)).unwrap(), 199);
        assert_eq!(storage.count_items().unwrap(), 199);
        assert_eq!(storage.get_item(199).unwrap().unwrap().sell_min_price, 0.0);
    }

    #[test]
    fn test_statistics() {
        let mut storage = SqliteStorage::new_in_memory(true).unwrap();
        let empty = storage.statistics().unwrap();
        assert_eq!(empty.items, 0);
        assert_eq!(empty.last_updated, None);

        storage.persist_batch(&[item(1, 1.0)], at(0)).unwrap();
        storage.persist_batch(&[item(2, 1.0)], at(30)).unwrap();

        let stats = storage.statistics().unwrap();
        assert_eq!(stats.items, 2);
        assert_eq!(stats.history_rows, 2);
        assert_eq!(stats.last_updated, Some(at(30).to_rfc3339()));
    }
}
