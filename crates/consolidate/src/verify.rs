//! Post-remap integrity checks. Reports only; never repairs.

use std::collections::{BTreeMap, HashSet};

use crate::config::ForeignKey;
use crate::error::ConsolidateError;
use crate::mapping::MappingStore;
use crate::model::{DuplicateName, Entity, FactRecord, OrphanRef, VerificationReport};

const ORPHAN_SAMPLES: usize = 5;

pub struct IntegrityVerifier<'a> {
    foreign_keys: &'a [ForeignKey],
}

impl<'a> IntegrityVerifier<'a> {
    pub fn new(foreign_keys: &'a [ForeignKey]) -> Self {
        Self { foreign_keys }
    }

    pub fn check(
        &self,
        dimension: &[Entity],
        facts: &[FactRecord],
        mapping: &MappingStore,
    ) -> VerificationReport {
        let report = VerificationReport {
            orphans: self.orphans(dimension, facts, mapping),
            duplicate_names: duplicate_names(dimension),
            duplicate_ids: duplicate_ids(dimension),
            mapping_conflicts: mapping.conflicts(),
        };
        if report.is_clean() {
            log::info!("verification passed: {} dimension row(s), {} fact record(s)", dimension.len(), facts.len());
        } else {
            log::warn!(
                "verification failed: {} orphan(s), {} duplicate name(s), {} duplicate id(s), {} mapping conflict(s)",
                report.orphans.len(),
                report.duplicate_names.len(),
                report.duplicate_ids.len(),
                report.mapping_conflicts.len()
            );
        }
        report
    }

    /// Run every check; any finding becomes an `IntegrityViolation`.
    pub fn verify(
        &self,
        dimension: &[Entity],
        facts: &[FactRecord],
        mapping: &MappingStore,
    ) -> Result<VerificationReport, ConsolidateError> {
        let report = self.check(dimension, facts, mapping);
        if report.is_clean() {
            Ok(report)
        } else {
            Err(ConsolidateError::IntegrityViolation(Box::new(report)))
        }
    }

    /// Foreign keys that are not canonical ids of the consolidated dimension.
    fn orphans(
        &self,
        dimension: &[Entity],
        facts: &[FactRecord],
        mapping: &MappingStore,
    ) -> Vec<OrphanRef> {
        let ids: HashSet<&str> = dimension.iter().map(|e| e.id.as_str()).collect();
        let mut found: BTreeMap<(&str, &str), (usize, Vec<String>)> = BTreeMap::new();

        for fact in facts {
            for fk in self.foreign_keys {
                let Some(value) = fact.get(&fk.field) else { continue };
                if value.is_empty() {
                    continue;
                }
                // A known but non-canonical id means remapping never ran on it.
                let canonical = !mapping.contains(value) || mapping.is_canonical(value);
                if ids.contains(value) && canonical {
                    continue;
                }
                let entry = found
                    .entry((fk.field.as_str(), value))
                    .or_insert_with(|| (0, Vec::new()));
                entry.0 += 1;
                if entry.1.len() < ORPHAN_SAMPLES {
                    entry.1.push(fact.record_id.clone());
                }
            }
        }

        found
            .into_iter()
            .map(|((field, id), (references, sample_records))| OrphanRef {
                field: field.to_string(),
                id: id.to_string(),
                references,
                sample_records,
            })
            .collect()
    }
}

/// Exact non-blank names held by more than one row.
fn duplicate_names(dimension: &[Entity]) -> Vec<DuplicateName> {
    let mut by_name: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for e in dimension {
        if e.name.trim().is_empty() {
            continue;
        }
        by_name.entry(e.name.as_str()).or_default().push(e.id.clone());
    }
    by_name
        .into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .map(|(name, ids)| DuplicateName {
            name: name.to_string(),
            ids,
        })
        .collect()
}

fn duplicate_ids(dimension: &[Entity]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut dups: Vec<String> = dimension
        .iter()
        .filter(|e| !seen.insert(e.id.as_str()))
        .map(|e| e.id.clone())
        .collect();
    dups.sort();
    dups.dedup();
    dups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EquivalenceClass, SelectionRule};
    use std::collections::BTreeSet;

    fn mapping(classes: &[(&[&str], &str)]) -> MappingStore {
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

    fn fact(id: &str, fk: &str) -> FactRecord {
        FactRecord {
            record_id: id.into(),
            fields: BTreeMap::from([("product_id".to_string(), fk.to_string())]),
        }
    }

    #[test]
    fn clean_state_passes() {
        let fks = [ForeignKey::new("product_id")];
        let m = mapping(&[(&["8d0d", "e682"], "e682")]);
        let dim = vec![Entity::new("e682", "Nintendo Switch")];
        let facts = vec![fact("o1", "e682"), fact("o2", "")];
        let report = IntegrityVerifier::new(&fks).verify(&dim, &facts, &m).unwrap();
        assert!(report.is_clean());
    }

    #[test]
    fn unknown_and_stale_ids_are_orphans() {
        let fks = [ForeignKey::new("product_id")];
        let m = mapping(&[(&["8d0d", "e682"], "e682")]);
        let dim = vec![Entity::new("e682", "Nintendo Switch")];
        let facts = vec![fact("o1", "zzzz"), fact("o2", "8d0d"), fact("o3", "zzzz")];
        let err = IntegrityVerifier::new(&fks).verify(&dim, &facts, &m).unwrap_err();
        let ConsolidateError::IntegrityViolation(report) = err else {
            panic!("expected integrity violation");
        };
        let ids: Vec<(&str, usize)> = report.orphans.iter().map(|o| (o.id.as_str(), o.references)).collect();
        assert_eq!(ids, vec![("8d0d", 1), ("zzzz", 2)]);
    }

    #[test]
    fn duplicate_names_and_ids_reported() {
        let fks = [ForeignKey::new("product_id")];
        let m = mapping(&[(&["a"], "a"), (&["b"], "b")]);
        let dim = vec![
            Entity::new("a", "Dell Gaming Mouse"),
            Entity::new("b", "Dell Gaming Mouse"),
            Entity::new("b", "Other"),
        ];
        let report = IntegrityVerifier::new(&fks).check(&dim, &[], &m);
        assert_eq!(report.duplicate_names.len(), 1);
        assert_eq!(report.duplicate_names[0].ids, vec!["a", "b"]);
        assert_eq!(report.duplicate_ids, vec!["b"]);
    }

    #[test]
    fn blank_names_are_not_duplicates() {
        let fks = [ForeignKey::new("product_id")];
        let m = mapping(&[(&["a"], "a"), (&["b"], "b")]);
        let dim = vec![Entity::new("a", ""), Entity::new("b", "")];
        assert!(IntegrityVerifier::new(&fks).check(&dim, &[], &m).is_clean());
    }

    #[test]
    fn mapping_conflicts_surface() {
        let fks = [ForeignKey::new("product_id")];
        let m = mapping(&[(&["a", "b"], "a"), (&["b", "c"], "c")]);
        let dim = vec![Entity::new("a", "A"), Entity::new("c", "C")];
        let report = IntegrityVerifier::new(&fks).check(&dim, &[], &m);
        assert_eq!(report.mapping_conflicts.len(), 1);
        assert_eq!(report.mapping_conflicts[0].id, "b");
    }
}
