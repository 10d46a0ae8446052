use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::config::ForeignKey;
use crate::error::ConsolidateError;
use crate::model::{Cluster, EquivalenceClass, FactRecord, SelectionRule};

/// How often each id is referenced across all foreign-key fields.
#[derive(Debug, Clone, Default)]
pub struct ReferenceCounts {
    counts: HashMap<String, usize>,
}

impl ReferenceCounts {
    pub fn from_facts(facts: &[FactRecord], foreign_keys: &[ForeignKey]) -> Self {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for fact in facts {
            for fk in foreign_keys {
                match fact.get(&fk.field) {
                    Some(v) if !v.is_empty() => *counts.entry(v.to_string()).or_insert(0) += 1,
                    _ => {}
                }
            }
        }
        Self { counts }
    }

    pub fn get(&self, id: &str) -> usize {
        self.counts.get(id).copied().unwrap_or(0)
    }
}

/// Pick one canonical id per cluster.
///
/// Precedence: an override target inside the class, then the most
/// referenced member (smallest id on ties), then the smallest id.
pub fn select_canonical(
    clusters: &[Cluster],
    overrides: &BTreeMap<String, String>,
    counts: Option<&ReferenceCounts>,
) -> Result<Vec<EquivalenceClass>, ConsolidateError> {
    clusters
        .iter()
        .map(|cluster| select_one(cluster, overrides, counts))
        .collect()
}

fn select_one(
    cluster: &Cluster,
    overrides: &BTreeMap<String, String>,
    counts: Option<&ReferenceCounts>,
) -> Result<EquivalenceClass, ConsolidateError> {
    let members = &cluster.members;
    let smallest = match members.iter().next() {
        Some(id) => id.clone(),
        None => {
            return Err(ConsolidateError::ConfigValidation("empty cluster".into()));
        }
    };

    let class = |canonical_id: String, rule: SelectionRule| EquivalenceClass {
        members: members.clone(),
        canonical_id,
        rule,
        reasons: cluster.reasons.clone(),
    };

    if let Some(target) = override_target(members, overrides)? {
        return Ok(class(target, SelectionRule::Override));
    }

    if members.len() == 1 {
        return Ok(class(smallest, SelectionRule::Singleton));
    }

    if let Some(counts) = counts {
        // BTreeSet iterates in byte order; strict `>` keeps the smallest id on ties.
        let mut best: Option<(&String, usize)> = None;
        for id in members {
            let n = counts.get(id);
            if n > 0 && best.map_or(true, |(_, b)| n > b) {
                best = Some((id, n));
            }
        }
        if let Some((id, _)) = best {
            return Ok(class(id.clone(), SelectionRule::Frequency));
        }
    }

    Ok(class(smallest, SelectionRule::Lexicographic))
}

/// Resolve the override target for a class, following chains inside it.
fn override_target(
    members: &BTreeSet<String>,
    overrides: &BTreeMap<String, String>,
) -> Result<Option<String>, ConsolidateError> {
    let conflict = |targets: Vec<String>| ConsolidateError::EquivalenceConflict {
        members: members.iter().cloned().collect(),
        targets,
    };

    let mut targets: BTreeSet<String> = BTreeSet::new();
    for id in members {
        let Some(first) = overrides.get(id) else { continue };
        if !members.contains(first) {
            continue;
        }

        let mut end = first;
        let mut visited: BTreeSet<&String> = BTreeSet::from([id]);
        while let Some(next) = overrides.get(end) {
            if next == end || !members.contains(next) {
                break;
            }
            if !visited.insert(end) {
                return Err(conflict(visited.into_iter().cloned().collect()));
            }
            end = next;
        }
        targets.insert(end.clone());
    }

    match targets.len() {
        0 => Ok(None),
        1 => Ok(targets.into_iter().next()),
        _ => Err(conflict(targets.into_iter().collect())),
    }
}
