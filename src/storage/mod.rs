//! Storage module for persisting item records
//!
//! This module handles all database operations, including:
//! - SQLite database initialization and schema management
//! - Transactional batch upserts into the current-state table
//! - Append-only price history rows
//! - Summary queries for the `--stats` mode

mod schema;
mod sqlite;
mod traits;

pub use sqlite::{SqliteStorage, StoredStatistics};
pub use traits::{DiscardStore, ItemStore, StorageError, StorageResult};

use crate::HarvestError;
use std::path::Path;

/// Opens (or creates) the item database
///
/// # Arguments
///
/// * `path` - Path to the SQLite database file
/// * `price_history` - Whether batches also append price history rows
pub fn open_storage(path: &Path, price_history: bool) -> Result<SqliteStorage, HarvestError> {
    SqliteStorage::new(path, price_history)
}

/// A normalized marketplace item
#[derive(Debug, Clone, PartialEq)]
pub struct ItemRecord {
    pub id: i64,
    pub appid: i64,
    pub game: Option<String>,
    pub name: Option<String>,
    pub market_hash_name: Option<String>,
    pub steam_market_url: Option<String>,
    pub sell_reference_price: f64,
    pub sell_min_price: f64,
    pub buy_max_price: f64,
    pub sell_num: i64,
    pub buy_num: i64,
    pub transacted_num: i64,

    /// Raw metadata blob as delivered upstream
    pub goods_info: serde_json::Value,
}

impl ItemRecord {
    /// A record with only an id set; everything else is empty or zero
    pub fn with_id(id: i64) -> Self {
        Self {
            id,
            appid: 0,
            game: None,
            name: None,
            market_hash_name: None,
            steam_market_url: None,
            sell_reference_price: 0.0,
            sell_min_price: 0.0,
            buy_max_price: 0.0,
            sell_num: 0,
            buy_num: 0,
            transacted_num: 0,
            goods_info: serde_json::Value::Object(Default::default()),
        }
    }
}
