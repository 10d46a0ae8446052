//! `conform-consolidate`: master-data consolidation engine.
//!
//! Receives a pre-loaded dimension and fact set, clusters duplicate entities,
//! picks one canonical id per cluster, remaps fact foreign keys and verifies
//! the result before committing to a caller-supplied sink. CSV loading and
//! snapshot files are the only IO here; databases live in `conform-store`.

pub mod audit;
pub mod backup;
pub mod canonical;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod load;
pub mod mapping;
pub mod model;
pub mod normalize;
pub mod remap;
pub mod sink;
pub mod summary;
pub mod verify;

pub use audit::{AuditEntry, AuditLog, AuditOp};
pub use backup::{BackupManager, DirSnapshotStore, MemorySnapshotStore, Snapshot, SnapshotStore};
pub use cluster::KeyRelation;
pub use config::ConsolidateConfig;
pub use engine::{analyze, dry_run, run, Consolidator, Plan};
pub use error::ConsolidateError;
pub use load::{load_csv_entities, load_csv_facts};
pub use model::{ConsolidateInput, ConsolidateResult, Entity, FactRecord, RunStatus};
pub use sink::{MemorySink, Sink, SinkState, Transaction};
