//! Output module for run summaries and stored-data statistics
//!
//! This module handles:
//! - Rendering the end-of-run summary of a harvest
//! - Loading and displaying statistics from the item database

pub mod stats;
mod summary;

pub use stats::{load_statistics, print_statistics, render_statistics};
pub use summary::{print_summary, render_summary};
