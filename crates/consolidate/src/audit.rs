//! Append-only record of every mutation made during a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOp {
    /// Fact foreign key rewritten to a canonical id.
    RemapForeignKey,
    /// Denormalized fact name rewritten to the canonical name.
    RewriteFactName,
    /// Non-canonical (or repeated) dimension row removed.
    RemoveEntityRow,
    /// Blank canonical name filled from another class member.
    RenameEntity,
    /// Empty canonical attribute filled from another class member.
    FillAttribute,
}

impl std::fmt::Display for AuditOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RemapForeignKey => write!(f, "remap_foreign_key"),
            Self::RewriteFactName => write!(f, "rewrite_fact_name"),
            Self::RemoveEntityRow => write!(f, "remove_entity_row"),
            Self::RenameEntity => write!(f, "rename_entity"),
            Self::FillAttribute => write!(f, "fill_attribute"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub operation: AuditOp,
    /// Record id for fact edits, entity id for dimension edits.
    pub subject_id: String,
    /// Column touched (`product_id`, `name`, ...).
    pub field: String,
    pub before_value: String,
    pub after_value: String,
}

/// Entries are ordered by `seq`; timestamps never go backwards.
#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    entries: Vec<AuditEntry>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        operation: AuditOp,
        subject_id: &str,
        field: &str,
        before_value: &str,
        after_value: &str,
    ) {
        let now = Utc::now();
        let timestamp = match self.entries.last() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        };
        self.entries.push(AuditEntry {
            seq: self.entries.len() as u64 + 1,
            timestamp,
            operation,
            subject_id: subject_id.to_string(),
            field: field.to_string(),
            before_value: before_value.to_string(),
            after_value: after_value.to_string(),
        });
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self, operation: AuditOp) -> usize {
        self.entries.iter().filter(|e| e.operation == operation).count()
    }

    pub fn into_entries(self) -> Vec<AuditEntry> {
        self.entries
    }
}
