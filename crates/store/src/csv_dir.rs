// Consolidated tables as CSV files in a directory

use std::collections::BTreeSet;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};

use conform_consolidate::model::ChangeEntry;
use conform_consolidate::{AuditEntry, ConsolidateConfig, ConsolidateError, Entity, FactRecord, Sink};

const STAGING_DIR: &str = ".conform-staging";
const CHANGES_FILE: &str = "consolidation_changes.csv";
const AUDIT_FILE: &str = "consolidation_audit.csv";

fn sink_err(path: &Path, e: impl Display) -> ConsolidateError {
    ConsolidateError::Sink(format!("{}: {}", path.display(), e))
}

/// Column and file names used when writing, normally taken from the run config
/// so the output directory can be read back with the same config.
#[derive(Debug, Clone)]
pub struct CsvLayout {
    pub entities_file: String,
    pub entity_id: String,
    pub entity_name: String,
    pub facts_file: String,
    pub record_id: String,
}

impl CsvLayout {
    pub fn from_config(config: &ConsolidateConfig) -> Self {
        let file_name = |path: &str, fallback: &str| {
            Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| fallback.to_string())
        };
        Self {
            entities_file: file_name(&config.entities.file, "entities.csv"),
            entity_id: config.entities.columns.id.clone(),
            entity_name: config.entities.columns.name.clone(),
            facts_file: file_name(&config.facts.file, "facts.csv"),
            record_id: config
                .facts
                .record_id
                .clone()
                .unwrap_or_else(|| "record_id".to_string()),
        }
    }
}

impl Default for CsvLayout {
    fn default() -> Self {
        Self {
            entities_file: "entities.csv".into(),
            entity_id: "id".into(),
            entity_name: "name".into(),
            facts_file: "facts.csv".into(),
            record_id: "record_id".into(),
        }
    }
}

/// Sink writing into a staging directory; `commit` renames each staged file
/// over its final name, `rollback` deletes the staging directory.
#[derive(Debug)]
pub struct CsvDirSink {
    dir: PathBuf,
    layout: CsvLayout,
    staged: Option<Vec<String>>,
}

impl CsvDirSink {
    pub fn new(dir: impl Into<PathBuf>, layout: CsvLayout) -> Self {
        Self {
            dir: dir.into(),
            layout,
            staged: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn staging(&self) -> PathBuf {
        self.dir.join(STAGING_DIR)
    }

    /// Open a writer on a staged file and remember it for commit.
    fn stage_file(&mut self, name: &str) -> Result<csv::Writer<fs::File>, ConsolidateError> {
        let staging = self.staging();
        let staged = self
            .staged
            .as_mut()
            .ok_or_else(|| ConsolidateError::Sink("write outside a transaction".into()))?;
        let path = staging.join(name);
        let wtr = csv::Writer::from_path(&path).map_err(|e| sink_err(&path, e))?;
        if !staged.iter().any(|n| n == name) {
            staged.push(name.to_string());
        }
        Ok(wtr)
    }

    /// Existing committed rows of an append-only table, header excluded.
    fn committed_rows(&self, name: &str) -> Result<Vec<csv::StringRecord>, ConsolidateError> {
        let path = self.dir.join(name);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut rdr = csv::Reader::from_path(&path).map_err(|e| sink_err(&path, e))?;
        rdr.records()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| sink_err(&path, e))
    }
}

fn flush(mut wtr: csv::Writer<fs::File>, path: &Path) -> Result<(), ConsolidateError> {
    wtr.flush().map_err(|e| sink_err(path, e))
}

impl Sink for CsvDirSink {
    fn begin(&mut self) -> Result<(), ConsolidateError> {
        if self.staged.is_some() {
            return Err(ConsolidateError::Sink("transaction already open".into()));
        }
        let staging = self.staging();
        if staging.exists() {
            log::warn!("removing stale staging directory {}", staging.display());
            fs::remove_dir_all(&staging).map_err(|e| sink_err(&staging, e))?;
        }
        fs::create_dir_all(&staging).map_err(|e| sink_err(&staging, e))?;
        self.staged = Some(Vec::new());
        Ok(())
    }

    fn write_entities(&mut self, entities: &[Entity]) -> Result<(), ConsolidateError> {
        let name = self.layout.entities_file.clone();
        let path = self.staging().join(&name);
        let mut wtr = self.stage_file(&name)?;

        let attrs: BTreeSet<&str> = entities
            .iter()
            .flat_map(|e| e.attributes.keys().map(String::as_str))
            .collect();
        let mut header = vec![self.layout.entity_id.as_str(), self.layout.entity_name.as_str()];
        header.extend(attrs.iter().copied());
        wtr.write_record(&header).map_err(|e| sink_err(&path, e))?;
        for e in entities {
            let mut row = vec![e.id.as_str(), e.name.as_str()];
            row.extend(attrs.iter().map(|k| e.attributes.get(*k).map(String::as_str).unwrap_or("")));
            wtr.write_record(&row).map_err(|e| sink_err(&path, e))?;
        }
        flush(wtr, &path)
    }

    fn write_facts(&mut self, facts: &[FactRecord]) -> Result<(), ConsolidateError> {
        let name = self.layout.facts_file.clone();
        let path = self.staging().join(&name);
        let mut wtr = self.stage_file(&name)?;

        let fields: BTreeSet<&str> = facts
            .iter()
            .flat_map(|f| f.fields.keys().map(String::as_str))
            .collect();
        let mut header = vec![self.layout.record_id.as_str()];
        header.extend(fields.iter().copied());
        wtr.write_record(&header).map_err(|e| sink_err(&path, e))?;
        for f in facts {
            let mut row = vec![f.record_id.as_str()];
            row.extend(fields.iter().map(|k| f.get(k).unwrap_or("")));
            wtr.write_record(&row).map_err(|e| sink_err(&path, e))?;
        }
        flush(wtr, &path)
    }

    fn write_changes(&mut self, changes: &[ChangeEntry]) -> Result<(), ConsolidateError> {
        let path = self.staging().join(CHANGES_FILE);
        let previous = self.committed_rows(CHANGES_FILE)?;
        let mut wtr = self.stage_file(CHANGES_FILE)?;

        wtr.write_record(["field", "old_id", "new_id", "affected_count"])
            .map_err(|e| sink_err(&path, e))?;
        for record in &previous {
            wtr.write_record(record).map_err(|e| sink_err(&path, e))?;
        }
        for c in changes {
            let count = c.affected_count.to_string();
            wtr.write_record([c.field.as_str(), c.old_id.as_str(), c.new_id.as_str(), count.as_str()])
                .map_err(|e| sink_err(&path, e))?;
        }
        flush(wtr, &path)
    }

    fn write_audit(&mut self, entries: &[AuditEntry]) -> Result<(), ConsolidateError> {
        let path = self.staging().join(AUDIT_FILE);
        let previous = self.committed_rows(AUDIT_FILE)?;
        let mut wtr = self.stage_file(AUDIT_FILE)?;

        wtr.write_record([
            "seq",
            "timestamp",
            "operation",
            "subject_id",
            "field",
            "before_value",
            "after_value",
        ])
        .map_err(|e| sink_err(&path, e))?;
        for record in &previous {
            wtr.write_record(record).map_err(|e| sink_err(&path, e))?;
        }
        for a in entries {
            wtr.write_record([
                a.seq.to_string(),
                a.timestamp.to_rfc3339(),
                a.operation.to_string(),
                a.subject_id.clone(),
                a.field.clone(),
                a.before_value.clone(),
                a.after_value.clone(),
            ])
            .map_err(|e| sink_err(&path, e))?;
        }
        flush(wtr, &path)
    }

    fn commit(&mut self) -> Result<(), ConsolidateError> {
        let staged = self
            .staged
            .take()
            .ok_or_else(|| ConsolidateError::Sink("commit without begin".into()))?;
        let staging = self.staging();
        for name in &staged {
            let from = staging.join(name);
            let to = self.dir.join(name);
            fs::rename(&from, &to).map_err(|e| sink_err(&to, e))?;
        }
        fs::remove_dir_all(&staging).map_err(|e| sink_err(&staging, e))?;
        log::info!("wrote {} file(s) to {}", staged.len(), self.dir.display());
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), ConsolidateError> {
        self.staged = None;
        let staging = self.staging();
        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(|e| sink_err(&staging, e))?;
        }
        Ok(())
    }
}
