use std::collections::{BTreeMap, BTreeSet};

use crate::audit::AuditLog;
use crate::backup::{BackupManager, SnapshotStore};
use crate::canonical::{select_canonical, ReferenceCounts};
use crate::cluster::{ClusterBuilder, KeyRelation};
use crate::config::ConsolidateConfig;
use crate::error::ConsolidateError;
use crate::mapping::MappingStore;
use crate::model::{
    AnalysisReport, ConsolidateInput, ConsolidateMeta, ConsolidateResult, DimensionReport, Entity,
    EquivalenceClass, FactRecord, IdGroup, NameGroup, RemapReport, RunStatus, VariantGroup,
    VerificationReport,
};
use crate::normalize::{NormKey, Normalizer};
use crate::remap::{consolidate_dimension, FactRemapper};
use crate::sink::{Sink, Transaction};
use crate::summary::compute_summary;
use crate::verify::IntegrityVerifier;

/// Everything decided before the first mutation.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Index-aligned with the input entities.
    pub keys: Vec<NormKey>,
    pub classes: Vec<EquivalenceClass>,
    pub mapping: MappingStore,
}

/// Output of applying a plan to a working copy.
struct Applied {
    entities: Vec<Entity>,
    facts: Vec<FactRecord>,
    dimension: DimensionReport,
    remap: RemapReport,
    verification: VerificationReport,
}

/// Consolidation driver. Extra key relations can be plugged in before running.
pub struct Consolidator<'a> {
    config: &'a ConsolidateConfig,
    relations: Vec<&'a dyn KeyRelation>,
}

impl<'a> Consolidator<'a> {
    pub fn new(config: &'a ConsolidateConfig) -> Self {
        Self {
            config,
            relations: Vec::new(),
        }
    }

    pub fn with_relation(mut self, relation: &'a dyn KeyRelation) -> Self {
        self.relations.push(relation);
        self
    }

    /// Normalize, cluster, select canonicals and build the mapping. Pure.
    pub fn plan(&self, input: &ConsolidateInput) -> Result<Plan, ConsolidateError> {
        let normalizer = Normalizer::new(&self.config.normalize.rewrites)?;
        let keys = normalizer.normalize_all(&input.entities)?;

        let mut builder =
            ClusterBuilder::new(self.config.relations.clone()).with_overrides(&self.config.overrides);
        for relation in &self.relations {
            builder = builder.with_relation(*relation);
        }
        let clusters = builder.build(&input.entities, &keys);

        let counts = ReferenceCounts::from_facts(&input.facts, &self.config.facts.foreign_keys);
        let classes = select_canonical(&clusters, &self.config.overrides, Some(&counts))?;
        let mapping = MappingStore::build(&classes);

        log::info!(
            "plan: {} entity row(s), {} class(es), {} id(s) to remap",
            input.entities.len(),
            classes.len(),
            mapping.remapped().len()
        );
        Ok(Plan {
            keys,
            classes,
            mapping,
        })
    }

    /// Snapshot, remap inside a sink transaction, verify, then commit.
    ///
    /// Verification failure rolls the sink back and returns
    /// `IntegrityViolation`; the persisted snapshot stays authoritative.
    pub fn run(
        &self,
        input: &ConsolidateInput,
        sink: &mut dyn Sink,
        snapshots: &mut dyn SnapshotStore,
    ) -> Result<ConsolidateResult, ConsolidateError> {
        let plan = self.plan(input)?;

        let snapshot = BackupManager::new(snapshots).take(&input.entities, &input.facts)?;
        let mut tx = Transaction::begin(sink, snapshot)?;
        let snapshot_id = tx.snapshot().id().to_string();

        // Any `?` from here on drops `tx`, which rolls the sink back.
        let applied = self.apply(&plan, input, tx.audit_mut())?;
        if !applied.verification.is_clean() {
            tx.rollback()?;
            return Err(ConsolidateError::IntegrityViolation(Box::new(applied.verification)));
        }

        tx.stage(&applied.entities, &applied.facts, &applied.remap.changes)?;
        let audit = tx.commit()?;

        Ok(self.result(plan, applied, audit, RunStatus::Committed, Some(snapshot_id)))
    }

    /// Same pipeline as `run`, without snapshot or sink. Verification
    /// findings are reported, not raised.
    pub fn dry_run(&self, input: &ConsolidateInput) -> Result<ConsolidateResult, ConsolidateError> {
        let plan = self.plan(input)?;
        let mut audit = AuditLog::new();
        let applied = self.apply(&plan, input, &mut audit)?;
        Ok(self.result(plan, applied, audit.into_entries(), RunStatus::DryRun, None))
    }

    fn apply(
        &self,
        plan: &Plan,
        input: &ConsolidateInput,
        audit: &mut AuditLog,
    ) -> Result<Applied, ConsolidateError> {
        let foreign_keys = &self.config.facts.foreign_keys;

        let (entities, dimension) = consolidate_dimension(&input.entities, &plan.mapping, audit)?;

        let mut facts = input.facts.clone();
        let remap = FactRemapper::new(&plan.mapping, foreign_keys)
            .with_policy(self.config.remap.on_unknown)
            .with_canonical_names(&entities)
            .remap(&mut facts, audit)?;

        let verification = IntegrityVerifier::new(foreign_keys).check(&entities, &facts, &plan.mapping);

        Ok(Applied {
            entities,
            facts,
            dimension,
            remap,
            verification,
        })
    }

    fn result(
        &self,
        plan: Plan,
        applied: Applied,
        audit: Vec<crate::audit::AuditEntry>,
        status: RunStatus,
        snapshot_id: Option<String>,
    ) -> ConsolidateResult {
        let summary = compute_summary(
            &plan.classes,
            &applied.dimension,
            &applied.remap,
            &applied.verification,
        );
        log::info!(
            "{}: {} -> {} entities, {} fact record(s) changed ({status})",
            self.config.name,
            summary.entities_in,
            summary.entities_out,
            summary.facts_changed
        );

        ConsolidateResult {
            meta: ConsolidateMeta {
                config_name: self.config.name.clone(),
                engine_version: env!("CARGO_PKG_VERSION").to_string(),
                run_at: chrono::Utc::now().to_rfc3339(),
                snapshot_id,
            },
            status,
            summary,
            mapping: plan.mapping.remapped(),
            clusters: plan.classes,
            changes: applied.remap.changes,
            verification: applied.verification,
            audit,
            entities: applied.entities,
            facts: applied.facts,
        }
    }

    /// Read-only duplicate analysis of the dimension.
    pub fn analyze(&self, input: &ConsolidateInput) -> Result<AnalysisReport, ConsolidateError> {
        let plan = self.plan(input)?;
        let entities = &input.entities;

        let mut by_id: BTreeMap<&str, (usize, Vec<String>)> = BTreeMap::new();
        let mut by_name: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        let mut by_key: BTreeMap<&str, (Vec<String>, BTreeSet<&str>)> = BTreeMap::new();

        for (e, key) in entities.iter().zip(&plan.keys) {
            let id_entry = by_id.entry(e.id.as_str()).or_insert_with(|| (0, Vec::new()));
            id_entry.0 += 1;
            if !id_entry.1.contains(&e.name) {
                id_entry.1.push(e.name.clone());
            }

            if !e.name.trim().is_empty() {
                by_name.entry(e.name.as_str()).or_default().insert(e.id.as_str());
            }
            if key.is_empty() {
                continue;
            }
            let variants = by_key.entry(key.as_str()).or_default();
            if !variants.0.contains(&e.name) {
                variants.0.push(e.name.clone());
            }
            variants.1.insert(e.id.as_str());
        }

        let unique_ids = by_id.len();
        let unique_names = by_name.len();
        let unique_keys = by_key.len();

        let duplicate_ids = by_id
            .into_iter()
            .filter(|(_, (n, _))| *n > 1)
            .map(|(id, (occurrences, names))| IdGroup {
                id: id.to_string(),
                occurrences,
                names,
            })
            .collect();
        let duplicate_names = by_name
            .into_iter()
            .filter(|(_, ids)| ids.len() > 1)
            .map(|(name, ids)| NameGroup {
                name: name.to_string(),
                ids: ids.into_iter().map(String::from).collect(),
            })
            .collect();
        let name_variants = by_key
            .into_iter()
            .filter(|(_, (variants, _))| variants.len() > 1)
            .map(|(key, (variants, ids))| VariantGroup {
                key: key.to_string(),
                variants,
                ids: ids.into_iter().map(String::from).collect(),
            })
            .collect();

        Ok(AnalysisReport {
            total_rows: entities.len(),
            unique_ids,
            unique_names,
            unique_keys,
            duplicate_ids,
            duplicate_names,
            name_variants,
            classes: plan.classes.into_iter().filter(|c| c.is_duplicate()).collect(),
        })
    }
}

/// Run consolidation per config against a sink.
pub fn run(
    config: &ConsolidateConfig,
    input: &ConsolidateInput,
    sink: &mut dyn Sink,
    snapshots: &mut dyn SnapshotStore,
) -> Result<ConsolidateResult, ConsolidateError> {
    Consolidator::new(config).run(input, sink, snapshots)
}

pub fn dry_run(
    config: &ConsolidateConfig,
    input: &ConsolidateInput,
) -> Result<ConsolidateResult, ConsolidateError> {
    Consolidator::new(config).dry_run(input)
}

pub fn analyze(
    config: &ConsolidateConfig,
    input: &ConsolidateInput,
) -> Result<AnalysisReport, ConsolidateError> {
    Consolidator::new(config).analyze(input)
}
