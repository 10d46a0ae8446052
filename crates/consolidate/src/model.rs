use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::audit::AuditEntry;

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// A single dimension row. `id` is expected unique but may repeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    /// Empty when the source had no name.
    pub name: String,
    pub attributes: BTreeMap<String, String>,
}

impl Entity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            attributes: BTreeMap::new(),
        }
    }
}

/// A fact row. Foreign-key fields are named by configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactRecord {
    pub record_id: String,
    pub fields: BTreeMap<String, String>,
}

impl FactRecord {
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }
}

/// Pre-loaded dimension + facts for one run.
#[derive(Debug, Clone, Default)]
pub struct ConsolidateInput {
    pub entities: Vec<Entity>,
    pub facts: Vec<FactRecord>,
}

// ---------------------------------------------------------------------------
// Clustering
// ---------------------------------------------------------------------------

/// Which relation caused two ids to be unioned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeReason {
    SameId,
    ExactName,
    NormalizedName,
    Override,
    /// A pluggable key relation, by name.
    Custom(String),
}

impl std::fmt::Display for MergeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SameId => write!(f, "same_id"),
            Self::ExactName => write!(f, "exact_name"),
            Self::NormalizedName => write!(f, "normalized_name"),
            Self::Override => write!(f, "override"),
            Self::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

/// A duplicate cluster before a canonical id is chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cluster {
    pub members: BTreeSet<String>,
    pub reasons: BTreeSet<MergeReason>,
}

/// Which precedence step picked the canonical id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionRule {
    Singleton,
    Override,
    Frequency,
    Lexicographic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EquivalenceClass {
    pub members: BTreeSet<String>,
    pub canonical_id: String,
    pub rule: SelectionRule,
    pub reasons: BTreeSet<MergeReason>,
}

impl EquivalenceClass {
    pub fn is_duplicate(&self) -> bool {
        self.members.len() > 1
    }
}

// ---------------------------------------------------------------------------
// Remapping
// ---------------------------------------------------------------------------

/// One `(old, new)` edge with the number of fact fields rewritten along it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub field: String,
    pub old_id: String,
    pub new_id: String,
    pub affected_count: usize,
}

/// A fact reference to an id the dimension has never contained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanRef {
    pub field: String,
    pub id: String,
    pub references: usize,
    /// First few record ids carrying the reference.
    pub sample_records: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RemapReport {
    pub records_scanned: usize,
    pub records_changed: usize,
    pub null_references: usize,
    pub names_rewritten: usize,
    pub changes: Vec<ChangeEntry>,
    /// Unknown ids found while remapping (left untouched).
    pub orphans: Vec<OrphanRef>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DimensionReport {
    pub rows_in: usize,
    pub rows_out: usize,
    pub rows_removed: usize,
    pub names_filled: usize,
    pub attributes_filled: usize,
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateName {
    pub name: String,
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappingConflict {
    pub id: String,
    pub canonical_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub orphans: Vec<OrphanRef>,
    pub duplicate_names: Vec<DuplicateName>,
    pub duplicate_ids: Vec<String>,
    pub mapping_conflicts: Vec<MappingConflict>,
}

impl VerificationReport {
    pub fn is_clean(&self) -> bool {
        self.orphans.is_empty()
            && self.duplicate_names.is_empty()
            && self.duplicate_ids.is_empty()
            && self.mapping_conflicts.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Analysis (read-only)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct IdGroup {
    pub id: String,
    pub occurrences: usize,
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NameGroup {
    pub name: String,
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VariantGroup {
    pub key: String,
    pub variants: Vec<String>,
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub total_rows: usize,
    pub unique_ids: usize,
    pub unique_names: usize,
    pub unique_keys: usize,
    pub duplicate_ids: Vec<IdGroup>,
    pub duplicate_names: Vec<NameGroup>,
    pub name_variants: Vec<VariantGroup>,
    pub classes: Vec<EquivalenceClass>,
}

// ---------------------------------------------------------------------------
// Summary + Output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Committed,
    DryRun,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Committed => write!(f, "committed"),
            Self::DryRun => write!(f, "dry_run"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsolidateSummary {
    pub entities_in: usize,
    pub entities_out: usize,
    pub classes: usize,
    pub duplicate_classes: usize,
    pub ids_remapped: usize,
    pub facts_scanned: usize,
    pub facts_changed: usize,
    pub references_changed: usize,
    pub orphans: usize,
    pub duplicate_names: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsolidateMeta {
    pub config_name: String,
    pub engine_version: String,
    pub run_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsolidateResult {
    pub meta: ConsolidateMeta,
    pub status: RunStatus,
    pub summary: ConsolidateSummary,
    pub clusters: Vec<EquivalenceClass>,
    pub mapping: Vec<(String, String)>,
    pub changes: Vec<ChangeEntry>,
    pub verification: VerificationReport,
    #[serde(skip)]
    pub audit: Vec<AuditEntry>,
    /// Consolidated state, as handed to the sink.
    #[serde(skip)]
    pub entities: Vec<Entity>,
    #[serde(skip)]
    pub facts: Vec<FactRecord>,
}
