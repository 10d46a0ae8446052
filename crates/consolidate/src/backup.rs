//! Pre-mutation snapshots and where they are kept.

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};

use crate::error::ConsolidateError;
use crate::model::{ConsolidateInput, Entity, FactRecord};

static SNAPSHOT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Write-once copy of the dimension and facts as they were before a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    id: String,
    taken_at: DateTime<Utc>,
    entities: Vec<Entity>,
    facts: Vec<FactRecord>,
}

impl Snapshot {
    pub fn capture(entities: &[Entity], facts: &[FactRecord]) -> Self {
        let taken_at = Utc::now();
        // Sequence suffix keeps ids distinct within one clock tick.
        let seq = SNAPSHOT_SEQ.fetch_add(1, Ordering::Relaxed);
        Self {
            id: format!("{}_{seq}", taken_at.format("%Y%m%d_%H%M%S_%6f")),
            taken_at,
            entities: entities.to_vec(),
            facts: facts.to_vec(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn facts(&self) -> &[FactRecord] {
        &self.facts
    }
}

/// Durable home for snapshots. Persisting never overwrites an earlier one.
pub trait SnapshotStore {
    /// Returns a human-readable location for the stored snapshot.
    fn persist(&mut self, snapshot: &Snapshot) -> Result<String, ConsolidateError>;
}

#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: Vec<Snapshot>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    pub fn latest(&self) -> Option<&Snapshot> {
        self.snapshots.last()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn persist(&mut self, snapshot: &Snapshot) -> Result<String, ConsolidateError> {
        if self.snapshots.iter().any(|s| s.id == snapshot.id) {
            return Err(ConsolidateError::BackupWrite(format!(
                "snapshot {} already stored",
                snapshot.id
            )));
        }
        self.snapshots.push(snapshot.clone());
        Ok(format!("memory:{}", snapshot.id))
    }
}

/// Writes `dimension_BACKUP_<id>.csv` and `facts_BACKUP_<id>.csv` into a directory.
#[derive(Debug, Clone)]
pub struct DirSnapshotStore {
    dir: PathBuf,
}

impl DirSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dimension_path(&self, snapshot: &Snapshot) -> PathBuf {
        self.dir.join(format!("dimension_BACKUP_{}.csv", snapshot.id))
    }

    pub fn facts_path(&self, snapshot: &Snapshot) -> PathBuf {
        self.dir.join(format!("facts_BACKUP_{}.csv", snapshot.id))
    }
}

impl SnapshotStore for DirSnapshotStore {
    fn persist(&mut self, snapshot: &Snapshot) -> Result<String, ConsolidateError> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            ConsolidateError::BackupWrite(format!("{}: {}", self.dir.display(), e))
        })?;
        let dimension = self.dimension_path(snapshot);
        write_entities_csv(&dimension, &snapshot.entities)?;
        if let Err(e) = write_facts_csv(&self.facts_path(snapshot), &snapshot.facts) {
            // A dimension file without its facts file is not a usable snapshot.
            if let Err(rm) = fs::remove_file(&dimension) {
                log::warn!("cannot remove partial snapshot {}: {rm}", dimension.display());
            }
            return Err(e);
        }
        Ok(self.dir.display().to_string())
    }
}

fn create_new(path: &Path) -> Result<csv::Writer<fs::File>, ConsolidateError> {
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| ConsolidateError::BackupWrite(format!("{}: {}", path.display(), e)))?;
    Ok(csv::Writer::from_writer(file))
}

fn write_entities_csv(path: &Path, entities: &[Entity]) -> Result<(), ConsolidateError> {
    let backup_err = |e: csv::Error| ConsolidateError::BackupWrite(format!("{}: {}", path.display(), e));
    let attrs: BTreeSet<&str> = entities
        .iter()
        .flat_map(|e| e.attributes.keys().map(String::as_str))
        .collect();

    let mut wtr = create_new(path)?;
    let mut header = vec!["id", "name"];
    header.extend(attrs.iter().copied());
    wtr.write_record(&header).map_err(backup_err)?;
    for e in entities {
        let mut row = vec![e.id.as_str(), e.name.as_str()];
        row.extend(attrs.iter().map(|k| e.attributes.get(*k).map(String::as_str).unwrap_or("")));
        wtr.write_record(&row).map_err(backup_err)?;
    }
    wtr.flush()
        .map_err(|e| ConsolidateError::BackupWrite(format!("{}: {}", path.display(), e)))
}

fn write_facts_csv(path: &Path, facts: &[FactRecord]) -> Result<(), ConsolidateError> {
    let backup_err = |e: csv::Error| ConsolidateError::BackupWrite(format!("{}: {}", path.display(), e));
    let fields: BTreeSet<&str> = facts
        .iter()
        .flat_map(|f| f.fields.keys().map(String::as_str))
        .collect();

    let mut wtr = create_new(path)?;
    let mut header = vec!["record_id"];
    header.extend(fields.iter().copied());
    wtr.write_record(&header).map_err(backup_err)?;
    for f in facts {
        let mut row = vec![f.record_id.as_str()];
        row.extend(fields.iter().map(|k| f.get(k).unwrap_or("")));
        wtr.write_record(&row).map_err(backup_err)?;
    }
    wtr.flush()
        .map_err(|e| ConsolidateError::BackupWrite(format!("{}: {}", path.display(), e)))
}

/// Takes and restores snapshots through a [`SnapshotStore`].
pub struct BackupManager<'a> {
    store: &'a mut dyn SnapshotStore,
}

impl<'a> BackupManager<'a> {
    pub fn new(store: &'a mut dyn SnapshotStore) -> Self {
        Self { store }
    }

    /// Capture and persist. Nothing has been mutated if this fails.
    pub fn take(&mut self, entities: &[Entity], facts: &[FactRecord]) -> Result<Snapshot, ConsolidateError> {
        let snapshot = Snapshot::capture(entities, facts);
        let location = self.store.persist(&snapshot)?;
        log::info!(
            "snapshot {} taken at {} ({} entities, {} facts) -> {}",
            snapshot.id,
            snapshot.taken_at().to_rfc3339(),
            snapshot.entities.len(),
            snapshot.facts.len(),
            location
        );
        Ok(snapshot)
    }

    /// The state a snapshot captured, as a fresh input.
    pub fn restore(snapshot: &Snapshot) -> ConsolidateInput {
        ConsolidateInput {
            entities: snapshot.entities.clone(),
            facts: snapshot.facts.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn facts() -> Vec<FactRecord> {
        vec![FactRecord {
            record_id: "ord_1".into(),
            fields: BTreeMap::from([("product_id".to_string(), "8d0d".to_string())]),
        }]
    }

    #[test]
    fn memory_store_keeps_snapshot() {
        let entities = vec![Entity::new("8d0d", "Nintendo Switch")];
        let mut store = MemorySnapshotStore::new();
        let snapshot = BackupManager::new(&mut store).take(&entities, &facts()).unwrap();
        assert_eq!(store.latest().map(Snapshot::id), Some(snapshot.id()));

        let restored = BackupManager::restore(&snapshot);
        assert_eq!(restored.entities, entities);
        assert_eq!(restored.facts, facts());
    }

    #[test]
    fn memory_store_refuses_same_snapshot_twice() {
        let snapshot = Snapshot::capture(&[], &[]);
        let mut store = MemorySnapshotStore::new();
        store.persist(&snapshot).unwrap();
        let err = store.persist(&snapshot).unwrap_err();
        assert!(matches!(err, ConsolidateError::BackupWrite(_)));
    }

    #[test]
    fn dir_store_writes_csv_files() {
        let tmp = tempfile::tempdir().unwrap();
        let mut entity = Entity::new("8d0d", "Nintendo Switch");
        entity.attributes.insert("brand".into(), "Nintendo".into());
        let snapshot = Snapshot::capture(&[entity], &facts());

        let mut store = DirSnapshotStore::new(tmp.path().join("backups"));
        store.persist(&snapshot).unwrap();

        let dim = fs::read_to_string(store.dimension_path(&snapshot)).unwrap();
        assert_eq!(dim, "id,name,brand\n8d0d,Nintendo Switch,Nintendo\n");
        let fact = fs::read_to_string(store.facts_path(&snapshot)).unwrap();
        assert_eq!(fact, "record_id,product_id\nord_1,8d0d\n");
    }

    #[test]
    fn dir_store_never_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        let snapshot = Snapshot::capture(&[], &[]);
        let mut store = DirSnapshotStore::new(tmp.path());
        store.persist(&snapshot).unwrap();
        let err = store.persist(&snapshot).unwrap_err();
        assert!(matches!(err, ConsolidateError::BackupWrite(_)));
    }

    #[test]
    fn dir_store_leaves_no_half_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let snapshot = Snapshot::capture(&[Entity::new("8d0d", "Nintendo Switch")], &facts());
        let mut store = DirSnapshotStore::new(tmp.path());
        // Occupy the facts path so only the second write fails.
        fs::write(store.facts_path(&snapshot), "taken").unwrap();

        let err = store.persist(&snapshot).unwrap_err();
        assert!(matches!(err, ConsolidateError::BackupWrite(_)));
        assert!(!store.dimension_path(&snapshot).exists());
        assert_eq!(fs::read_to_string(store.facts_path(&snapshot)).unwrap(), "taken");
    }

    #[test]
    fn snapshot_ids_are_distinct_and_timestamped() {
        let before = Utc::now();
        let a = Snapshot::capture(&[], &[]);
        let b = Snapshot::capture(&[], &[]);
        assert_ne!(a.id(), b.id());
        assert!(a.taken_at() >= before && b.taken_at() >= a.taken_at());
        let stamp = a.taken_at().format("%Y%m%d_%H%M%S").to_string();
        assert!(a.id().starts_with(&stamp), "{} vs {stamp}", a.id());
    }
}
