//! Applying the mapping: fact foreign keys and the dimension itself.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::audit::{AuditLog, AuditOp};
use crate::config::{ForeignKey, UnknownIdPolicy};
use crate::error::ConsolidateError;
use crate::mapping::MappingStore;
use crate::model::{ChangeEntry, DimensionReport, Entity, FactRecord, OrphanRef, RemapReport};

const ORPHAN_SAMPLES: usize = 5;

// ---------------------------------------------------------------------------
// Facts
// ---------------------------------------------------------------------------

pub struct FactRemapper<'a> {
    mapping: &'a MappingStore,
    foreign_keys: &'a [ForeignKey],
    policy: UnknownIdPolicy,
    names: HashMap<&'a str, &'a str>,
}

impl<'a> FactRemapper<'a> {
    pub fn new(mapping: &'a MappingStore, foreign_keys: &'a [ForeignKey]) -> Self {
        Self {
            mapping,
            foreign_keys,
            policy: UnknownIdPolicy::default(),
            names: HashMap::new(),
        }
    }

    pub fn with_policy(mut self, policy: UnknownIdPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Names used to rewrite `name_field` columns, keyed by canonical id.
    pub fn with_canonical_names(mut self, dimension: &'a [Entity]) -> Self {
        self.names = dimension
            .iter()
            .filter(|e| !e.name.is_empty())
            .map(|e| (e.id.as_str(), e.name.as_str()))
            .collect();
        self
    }

    /// Single pass over `facts`, rewriting foreign keys in place.
    pub fn remap(
        &self,
        facts: &mut [FactRecord],
        audit: &mut AuditLog,
    ) -> Result<RemapReport, ConsolidateError> {
        let mut report = RemapReport {
            records_scanned: facts.len(),
            ..RemapReport::default()
        };
        let mut changes: BTreeMap<(String, String, String), usize> = BTreeMap::new();
        let mut orphans: BTreeMap<(String, String), (usize, Vec<String>)> = BTreeMap::new();

        for fact in facts.iter_mut() {
            let mut touched = false;

            for fk in self.foreign_keys {
                let Some(current) = fact.fields.get(&fk.field).cloned() else {
                    continue;
                };
                if current.is_empty() {
                    report.null_references += 1;
                    continue;
                }

                let canonical = match self.mapping.resolve(&current) {
                    Ok(c) => c,
                    Err(err) => {
                        if self.policy == UnknownIdPolicy::FailFast {
                            log::error!(
                                "record {}: {}={} unknown to dimension (fail_fast)",
                                fact.record_id, fk.field, current
                            );
                            return Err(err);
                        }
                        let entry = orphans
                            .entry((fk.field.clone(), current.clone()))
                            .or_insert_with(|| (0, Vec::new()));
                        entry.0 += 1;
                        if entry.1.len() < ORPHAN_SAMPLES {
                            entry.1.push(fact.record_id.clone());
                        }
                        continue;
                    }
                };

                if canonical != current {
                    audit.record(
                        AuditOp::RemapForeignKey,
                        &fact.record_id,
                        &fk.field,
                        &current,
                        canonical,
                    );
                    fact.fields.insert(fk.field.clone(), canonical.to_string());
                    *changes
                        .entry((fk.field.clone(), current.clone(), canonical.to_string()))
                        .or_insert(0) += 1;
                    touched = true;
                }

                if let Some(name_field) = &fk.name_field {
                    if let Some(&name) = self.names.get(canonical) {
                        if let Some(old_name) = fact.fields.get_mut(name_field) {
                            if old_name.as_str() != name {
                                audit.record(
                                    AuditOp::RewriteFactName,
                                    &fact.record_id,
                                    name_field,
                                    old_name.as_str(),
                                    name,
                                );
                                *old_name = name.to_string();
                                report.names_rewritten += 1;
                                touched = true;
                            }
                        }
                    }
                }
            }

            if touched {
                report.records_changed += 1;
            }
        }

        report.changes = changes
            .into_iter()
            .map(|((field, old_id, new_id), affected_count)| ChangeEntry {
                field,
                old_id,
                new_id,
                affected_count,
            })
            .collect();
        report.orphans = orphans
            .into_iter()
            .map(|((field, id), (references, sample_records))| OrphanRef {
                field,
                id,
                references,
                sample_records,
            })
            .collect();

        for orphan in &report.orphans {
            log::warn!(
                "{}={} referenced by {} record(s) but absent from dimension",
                orphan.field, orphan.id, orphan.references
            );
        }
        log::info!(
            "remapped {} of {} fact record(s) across {} edge(s)",
            report.records_changed,
            report.records_scanned,
            report.changes.len()
        );
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Dimension
// ---------------------------------------------------------------------------

/// Reduce the dimension to one row per canonical id, first appearance order.
pub fn consolidate_dimension(
    entities: &[Entity],
    mapping: &MappingStore,
    audit: &mut AuditLog,
) -> Result<(Vec<Entity>, DimensionReport), ConsolidateError> {
    // First non-blank name and attribute values seen anywhere in each class.
    let mut class_names: HashMap<&str, &str> = HashMap::new();
    let mut class_attrs: HashMap<&str, BTreeMap<&str, &str>> = HashMap::new();
    for e in entities {
        let canonical = mapping.resolve(&e.id)?;
        if !e.name.trim().is_empty() {
            class_names.entry(canonical).or_insert(e.name.as_str());
        }
        let attrs = class_attrs.entry(canonical).or_default();
        for (key, value) in &e.attributes {
            if !value.is_empty() {
                attrs.entry(key.as_str()).or_insert(value.as_str());
            }
        }
    }

    let mut out: Vec<Entity> = Vec::new();
    let mut emitted: HashSet<&str> = HashSet::new();
    let mut report = DimensionReport {
        rows_in: entities.len(),
        ..DimensionReport::default()
    };

    for e in entities {
        let canonical = mapping.resolve(&e.id)?;
        if e.id == canonical && emitted.insert(canonical) {
            out.push(e.clone());
            continue;
        }
        audit.record(AuditOp::RemoveEntityRow, &e.id, "name", &e.name, canonical);
        report.rows_removed += 1;
    }

    for row in out.iter_mut() {
        if row.name.trim().is_empty() {
            if let Some(&name) = class_names.get(row.id.as_str()) {
                audit.record(AuditOp::RenameEntity, &row.id, "name", &row.name, name);
                row.name = name.to_string();
                report.names_filled += 1;
            }
        }
        let Some(attrs) = class_attrs.get(row.id.as_str()) else { continue };
        for (&key, &value) in attrs {
            let current = row.attributes.get(key).map(String::as_str).unwrap_or("");
            if current.is_empty() {
                audit.record(AuditOp::FillAttribute, &row.id, key, current, value);
                row.attributes.insert(key.to_string(), value.to_string());
                report.attributes_filled += 1;
            }
        }
    }

    report.rows_out = out.len();
    log::info!(
        "dimension: {} row(s) in, {} out, {} removed",
        report.rows_in,
        report.rows_out,
        report.rows_removed
    );
    Ok((out, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EquivalenceClass, SelectionRule};
    use std::collections::BTreeSet;

    fn store(classes: &[(&[&str], &str)]) -> MappingStore {
        let classes: Vec<EquivalenceClass> = classes
            .iter()
            .map(|(members, canonical)| EquivalenceClass {
                members: members.iter().map(|s| s.to_string()).collect(),
                canonical_id: canonical.to_string(),
                rule: SelectionRule::Lexicographic,
                reasons: BTreeSet::new(),
            })
            .collect();
        MappingStore::build(&classes)
    }

    fn fact(id: &str, product_id: &str, product_name: &str) -> FactRecord {
        FactRecord {
            record_id: id.into(),
            fields: BTreeMap::from([
                ("product_id".to_string(), product_id.to_string()),
                ("product_name".to_string(), product_name.to_string()),
            ]),
        }
    }

    #[test]
    fn rewrites_and_counts_edges() {
        let mapping = store(&[(&["8d0d", "8e5d", "e682"], "e682")]);
        let fks = [ForeignKey::new("product_id")];
        let mut facts = vec![
            fact("o1", "8d0d", "Nintendo Switch"),
            fact("o2", "8d0d", "Nintendo Switch"),
            fact("o3", "8e5d", "Nintendo Switch"),
            fact("o4", "e682", "Nintendo Switch"),
        ];
        let mut audit = AuditLog::new();
        let report = FactRemapper::new(&mapping, &fks).remap(&mut facts, &mut audit).unwrap();

        assert!(facts.iter().all(|f| f.get("product_id") == Some("e682")));
        assert_eq!(report.records_changed, 3);
        assert_eq!(report.changes.len(), 2);
        assert_eq!(report.changes[0].old_id, "8d0d");
        assert_eq!(report.changes[0].affected_count, 2);
        assert_eq!(report.changes[1].old_id, "8e5d");
        assert_eq!(audit.count(AuditOp::RemapForeignKey), 3);
    }

    #[test]
    fn unknown_ids_are_flagged_not_touched() {
        let mapping = store(&[(&["a"], "a")]);
        let fks = [ForeignKey::new("product_id")];
        let mut facts = vec![fact("o1", "zzzz", ""), fact("o2", "zzzz", ""), fact("o3", "", "")];
        let mut audit = AuditLog::new();
        let report = FactRemapper::new(&mapping, &fks).remap(&mut facts, &mut audit).unwrap();

        assert_eq!(facts[0].get("product_id"), Some("zzzz"));
        assert_eq!(report.orphans.len(), 1);
        assert_eq!(report.orphans[0].id, "zzzz");
        assert_eq!(report.orphans[0].references, 2);
        assert_eq!(report.orphans[0].sample_records, vec!["o1", "o2"]);
        assert_eq!(report.null_references, 1);
        assert!(audit.is_empty());
    }

    #[test]
    fn fail_fast_stops_on_unknown() {
        let mapping = store(&[(&["a"], "a")]);
        let fks = [ForeignKey::new("product_id")];
        let mut facts = vec![fact("o1", "zzzz", "")];
        let mut audit = AuditLog::new();
        let err = FactRemapper::new(&mapping, &fks)
            .with_policy(UnknownIdPolicy::FailFast)
            .remap(&mut facts, &mut audit)
            .unwrap_err();
        assert!(matches!(err, ConsolidateError::MappingIncomplete { .. }));
    }

    #[test]
    fn denormalized_names_follow_canonical() {
        let mapping = store(&[(&["2a50", "891b"], "891b")]);
        let dimension = vec![Entity::new("891b", "27in 4K gaming monitor")];
        let fks = [ForeignKey {
            field: "product_id".into(),
            name_field: Some("product_name".into()),
        }];
        let mut facts = vec![
            fact("o1", "2a50", "27inches 4k gaming monitor"),
            fact("o2", "891b", "27in 4K gaming monitor"),
        ];
        let mut audit = AuditLog::new();
        let report = FactRemapper::new(&mapping, &fks)
            .with_canonical_names(&dimension)
            .remap(&mut facts, &mut audit)
            .unwrap();
        assert_eq!(facts[0].get("product_name"), Some("27in 4K gaming monitor"));
        assert_eq!(report.names_rewritten, 1);
        assert_eq!(report.records_changed, 1);
        assert_eq!(audit.count(AuditOp::RewriteFactName), 1);
    }

    #[test]
    fn dimension_keeps_first_canonical_row() {
        let mapping = store(&[(&["8d0d", "e682"], "e682"), (&["54ed"], "54ed")]);
        let entities = vec![
            Entity::new("8d0d", "Nintendo Switch"),
            Entity::new("e682", "Nintendo Switch"),
            Entity::new("54ed", "Sony PlayStation 5"),
            Entity::new("e682", "Nintendo Switch OLED"),
        ];
        let mut audit = AuditLog::new();
        let (out, report) = consolidate_dimension(&entities, &mapping, &mut audit).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].id, "e682");
        assert_eq!(out[0].name, "Nintendo Switch");
        assert_eq!(out[1].id, "54ed");
        assert_eq!(report.rows_removed, 2);
        assert_eq!(audit.count(AuditOp::RemoveEntityRow), 2);
    }

    #[test]
    fn blank_canonical_name_is_filled() {
        let mapping = store(&[(&["a", "b"], "a")]);
        let entities = vec![Entity::new("a", ""), Entity::new("b", "Razer Pro Gaming Headset")];
        let mut audit = AuditLog::new();
        let (out, report) = consolidate_dimension(&entities, &mapping, &mut audit).unwrap();
        assert_eq!(out[0].name, "Razer Pro Gaming Headset");
        assert_eq!(report.names_filled, 1);
        assert_eq!(audit.count(AuditOp::RenameEntity), 1);
    }

    #[test]
    fn missing_attributes_are_filled_in_input_order() {
        let mapping = store(&[(&["a", "b", "c"], "a")]);
        let mut a = Entity::new("a", "Mouse");
        a.attributes.insert("brand".into(), "".into());
        let mut b = Entity::new("b", "Mouse");
        b.attributes.insert("brand".into(), "Dell".into());
        b.attributes.insert("color".into(), "black".into());
        let mut c = Entity::new("c", "Mouse");
        c.attributes.insert("brand".into(), "Logitech".into());
        let mut audit = AuditLog::new();
        let (out, report) = consolidate_dimension(&[a, b, c], &mapping, &mut audit).unwrap();
        assert_eq!(out[0].attributes.get("brand").map(String::as_str), Some("Dell"));
        assert_eq!(out[0].attributes.get("color").map(String::as_str), Some("black"));
        assert_eq!(report.attributes_filled, 2);
        assert_eq!(audit.count(AuditOp::FillAttribute), 2);
    }
}
