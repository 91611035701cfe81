//! Statistics about the stored data
//!
//! This module loads and displays what the item database currently holds.

use crate::storage::{SqliteStorage, StoredStatistics};
use crate::HarvestError;
use std::path::Path;

/// Opens the database at `path` and loads its statistics
///
/// # Arguments
///
/// * `path` - Path to the SQLite database file
///
/// # Returns
///
/// * `Ok(StoredStatistics)` - Successfully loaded statistics
/// * `Err(HarvestError)` - Failed to open or query the database
pub fn load_statistics(path: &Path) -> Result<StoredStatistics, HarvestError> {
    if !path.exists() {
        return Err(HarvestError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("database {} does not exist", path.display()),
        )));
    }

    let storage = SqliteStorage::new(path, false)?;
    Ok(storage.statistics()?)
}

/// Renders statistics as the text printed by `--stats`
pub fn render_statistics(stats: &StoredStatistics) -> String {
    let mut out = String::new();
    out.push_str("=== Stored Data ===\n\n");
    out.push_str(&format!("  Items: {}\n", stats.items));
    out.push_str(&format!("  Price history rows: {}\n", stats.history_rows));

    let per_item = if stats.items > 0 {
        stats.history_rows as f64 / stats.items as f64
    } else {
        0.0
    };
    out.push_str(&format!("  History rows per item: {:.1}\n", per_item));
    out.push_str(&format!(
        "  Last updated: {}\n",
        stats.last_updated.as_deref().unwrap_or("never")
    ));
    out
}

/// Prints statistics to stdout
pub fn print_statistics(stats: &StoredStatistics) {
    print!("{}", render_statistics(stats));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ItemRecord, ItemStore};
    use chrono::Utc;
    use tempfile::TempDir;

    #[test]
    fn test_load_statistics_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("market.db");

        {
            let mut storage = SqliteStorage::new(&path, true).unwrap();
            let batch: Vec<_> = (1..=3).map(ItemRecord::with_id).collect();
            storage.persist_batch(&batch, Utc::now()).unwrap();
        }

        let stats = load_statistics(&path).unwrap();
        assert_eq!(stats.items, 3);
        assert_eq!(stats.history_rows, 3);
        assert!(stats.last_updated.is_some());
    }

    #[test]
    fn test_missing_database_is_an_error() {
        let dir = TempDir::new().unwrap();
        let result = load_statistics(&dir.path().join("absent.db"));
        assert!(matches!(result, Err(HarvestError::Io(_))));
    }

    #[test]
    fn test_render_empty_statistics() {
        let text = render_statistics(&StoredStatistics {
            items: 0,
            history_rows: 0,
            last_updated: None,
        });
        assert!(text.contains("Items: 0"));
        assert!(text.contains("Last updated: never"));
    }
}
