//! `conform-store`: transactional sinks for consolidated output.
//!
//! Implements the engine's `Sink` trait over a SQLite database and over a
//! directory of CSV files.

pub mod csv_dir;
pub mod sqlite;

pub use csv_dir::{CsvDirSink, CsvLayout};
pub use sqlite::SqliteSink;
