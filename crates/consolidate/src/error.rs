use std::fmt;

use crate::model::VerificationReport;

#[derive(Debug)]
pub enum ConsolidateError {
    /// TOML parse / deserialization error.
    ConfigParse(String),
    /// Config validation error (empty foreign keys, bad rewrite rule, etc.).
    ConfigValidation(String),
    /// Missing required column in input data.
    MissingColumn { source: String, column: String },
    /// A name that cannot be normalized (control characters, invalid UTF-8).
    Normalization { entity_id: String, reason: String },
    /// Overrides assert more than one canonical id for a single class.
    EquivalenceConflict { members: Vec<String>, targets: Vec<String> },
    /// An id was never seen while building classes.
    MappingIncomplete { id: String },
    /// Post-remap verification failed. Carries every offending id/name.
    IntegrityViolation(Box<VerificationReport>),
    /// Snapshot could not be persisted. Raised before any mutation.
    BackupWrite(String),
    /// Sink refused a write, commit, or rollback.
    Sink(String),
    /// IO error (file read, etc.).
    Io(String),
}

impl ConsolidateError {
    /// True for errors raised before the snapshot is taken.
    pub fn is_pre_mutation(&self) -> bool {
        matches!(
            self,
            Self::ConfigParse(_)
                | Self::ConfigValidation(_)
                | Self::MissingColumn { .. }
                | Self::Normalization { .. }
                | Self::EquivalenceConflict { .. }
                | Self::BackupWrite(_)
        )
    }
}

impl fmt::Display for ConsolidateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigParse(msg) => write!(f, "config parse error: {msg}"),
            Self::ConfigValidation(msg) => write!(f, "config validation error: {msg}"),
            Self::MissingColumn { source, column } => {
                write!(f, "{source}: missing column '{column}'")
            }
            Self::Normalization { entity_id, reason } => {
                write!(f, "entity '{entity_id}': cannot normalize name: {reason}")
            }
            Self::EquivalenceConflict { members, targets } => write!(
                f,
                "overrides disagree on canonical id for class [{}]: targets {}",
                members.join(", "),
                targets.join(" vs ")
            ),
            Self::MappingIncomplete { id } => {
                write!(f, "id '{id}' is not present in the dimension")
            }
            Self::IntegrityViolation(report) => {
                write!(f, "integrity violation:")?;
                if !report.orphans.is_empty() {
                    let ids: Vec<String> = report
                        .orphans
                        .iter()
                        .map(|o| format!("{}={} ({} refs)", o.field, o.id, o.references))
                        .collect();
                    write!(f, " orphans [{}]", ids.join(", "))?;
                }
                if !report.duplicate_names.is_empty() {
                    let names: Vec<String> = report
                        .duplicate_names
                        .iter()
                        .map(|d| format!("'{}' ({})", d.name, d.ids.join("/")))
                        .collect();
                    write!(f, " duplicate names [{}]", names.join(", "))?;
                }
                if !report.duplicate_ids.is_empty() {
                    write!(f, " duplicate ids [{}]", report.duplicate_ids.join(", "))?;
                }
                if !report.mapping_conflicts.is_empty() {
                    let ids: Vec<String> = report
                        .mapping_conflicts
                        .iter()
                        .map(|c| format!("{} -> {}", c.id, c.canonical_ids.join("|")))
                        .collect();
                    write!(f, " mapping conflicts [{}]", ids.join(", "))?;
                }
                Ok(())
            }
            Self::BackupWrite(msg) => write!(f, "backup write failed: {msg}"),
            Self::Sink(msg) => write!(f, "sink error: {msg}"),
            Self::Io(msg) => write!(f, "IO error: {msg}"),
        }
    }
}

impl std::error::Error for ConsolidateError {}
