//! Duplicate clustering over entity ids.
//!
//! Every distinct id gets a stable arena index (first appearance). Relations
//! are key-based: entities sharing a key under any enabled relation are
//! unioned. The resulting partition is independent of input order.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::config::RelationConfig;
use crate::model::{Cluster, Entity, MergeReason};
use crate::normalize::NormKey;

// ---------------------------------------------------------------------------
// Union-find
// ---------------------------------------------------------------------------

/// Array-backed disjoint set with path compression and union by rank.
#[derive(Debug, Clone, Default)]
pub struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    pub fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut cur = x;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    /// Returns false when `a` and `b` were already joined.
    pub fn union(&mut self, a: usize, b: usize) -> bool {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return false;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] = self.rank[ra].saturating_add(1);
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Pluggable relations
// ---------------------------------------------------------------------------

/// Extra equivalence relation: entities yielding the same key are merged.
pub trait KeyRelation {
    fn name(&self) -> &str;
    fn key(&self, entity: &Entity, normalized: &NormKey) -> Option<String>;
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct ClusterBuilder<'a> {
    relations: RelationConfig,
    overrides: Option<&'a BTreeMap<String, String>>,
    custom: Vec<&'a dyn KeyRelation>,
}

impl<'a> ClusterBuilder<'a> {
    pub fn new(relations: RelationConfig) -> Self {
        Self {
            relations,
            overrides: None,
            custom: Vec::new(),
        }
    }

    pub fn with_overrides(mut self, overrides: &'a BTreeMap<String, String>) -> Self {
        self.overrides = Some(overrides);
        self
    }

    pub fn with_relation(mut self, relation: &'a dyn KeyRelation) -> Self {
        self.custom.push(relation);
        self
    }

    /// Partition entity ids. `keys` must be index-aligned with `entities`.
    pub fn build(&self, entities: &[Entity], keys: &[NormKey]) -> Vec<Cluster> {
        debug_assert_eq!(entities.len(), keys.len());

        // Intern ids. Duplicate rows share an index, which is the same-id relation.
        let mut index: HashMap<&str, usize> = HashMap::new();
        let mut ids: Vec<&str> = Vec::new();
        let mut row_idx: Vec<usize> = Vec::with_capacity(entities.len());
        let mut same_id: Vec<bool> = Vec::new();
        for e in entities {
            let i = match index.get(e.id.as_str()) {
                Some(&i) => {
                    same_id[i] = true;
                    i
                }
                None => {
                    let i = ids.len();
                    index.insert(e.id.as_str(), i);
                    ids.push(e.id.as_str());
                    same_id.push(false);
                    i
                }
            };
            row_idx.push(i);
        }

        let mut uf = UnionFind::new(ids.len());
        // (index, reason) pairs; attributed to roots after all unions.
        let mut merges: Vec<(usize, MergeReason)> = Vec::new();
        for (i, dup) in same_id.iter().enumerate() {
            if *dup {
                merges.push((i, MergeReason::SameId));
            }
        }

        let union_by_key = |uf: &mut UnionFind,
                            merges: &mut Vec<(usize, MergeReason)>,
                            reason: MergeReason,
                            key_of: &dyn Fn(usize) -> Option<String>| {
            let mut first: HashMap<String, usize> = HashMap::new();
            for (row, &i) in row_idx.iter().enumerate() {
                let Some(key) = key_of(row) else { continue };
                match first.get(&key) {
                    Some(&j) => {
                        if uf.union(i, j) {
                            merges.push((i, reason.clone()));
                        }
                    }
                    None => {
                        first.insert(key, i);
                    }
                }
            }
        };

        if self.relations.exact_name {
            // Blank names carry no identity. Judged on the raw name, not the
            // key, so a rewrite to "" cannot split identical names.
            union_by_key(&mut uf, &mut merges, MergeReason::ExactName, &|row| {
                let name = &entities[row].name;
                (!name.trim().is_empty()).then(|| name.clone())
            });
        }

        if self.relations.normalized_name {
            union_by_key(&mut uf, &mut merges, MergeReason::NormalizedName, &|row| {
                (!keys[row].is_empty()).then(|| keys[row].as_str().to_string())
            });
        }

        for relation in &self.custom {
            let reason = MergeReason::Custom(relation.name().to_string());
            union_by_key(&mut uf, &mut merges, reason, &|row| {
                relation.key(&entities[row], &keys[row])
            });
        }

        if self.relations.overrides {
            if let Some(overrides) = self.overrides {
                for (old, target) in overrides {
                    match (index.get(old.as_str()), index.get(target.as_str())) {
                        (Some(&a), Some(&b)) => {
                            if uf.union(a, b) {
                                merges.push((a, MergeReason::Override));
                            }
                        }
                        _ => log::warn!(
                            "override {old} -> {target} ignored: id not present in dimension"
                        ),
                    }
                }
            }
        }

        // Collect by root.
        let mut groups: HashMap<usize, Cluster> = HashMap::new();
        for (i, id) in ids.iter().enumerate() {
            let root = uf.find(i);
            groups
                .entry(root)
                .or_insert_with(|| Cluster {
                    members: BTreeSet::new(),
                    reasons: BTreeSet::new(),
                })
                .members
                .insert((*id).to_string());
        }
        for (i, reason) in merges {
            let root = uf.find(i);
            if let Some(cluster) = groups.get_mut(&root) {
                cluster.reasons.insert(reason);
            }
        }

        let mut clusters: Vec<Cluster> = groups.into_values().collect();
        clusters.sort_by(|a, b| a.members.iter().next().cmp(&b.members.iter().next()));

        log::debug!(
            "clustered {} rows into {} classes ({} with duplicates)",
            entities.len(),
            clusters.len(),
            clusters.iter().filter(|c| c.members.len() > 1).count()
        );
        clusters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RewriteRule;
    use crate::normalize::Normalizer;

    fn build(entities: &[Entity]) -> Vec<Cluster> {
        let keys = Normalizer::default().normalize_all(entities).unwrap();
        ClusterBuilder::new(RelationConfig::default()).build(entities, &keys)
    }

    fn members(c: &Cluster) -> Vec<&str> {
        c.members.iter().map(String::as_str).collect()
    }

    #[test]
    fn union_find_basics() {
        let mut uf = UnionFind::new(4);
        assert!(uf.union(0, 1));
        assert!(uf.union(2, 3));
        assert!(!uf.union(1, 0));
        assert!(uf.union(1, 3));
        let r = uf.find(0);
        assert!((0..4).all(|i| uf.find(i) == r));
    }

    #[test]
    fn same_id_rows_share_a_class() {
        let entities = vec![
            Entity::new("a1", "Dell Gaming Mouse"),
            Entity::new("a1", "Dell Mouse"),
            Entity::new("b2", "JBL Quantum 100"),
        ];
        let clusters = build(&entities);
        assert_eq!(clusters.len(), 2);
        assert_eq!(members(&clusters[0]), vec!["a1"]);
        assert!(clusters[0].reasons.contains(&MergeReason::SameId));
        assert!(clusters[1].reasons.is_empty());
    }

    #[test]
    fn exact_and_normalized_names_merge() {
        let entities = vec![
            Entity::new("e682", "Nintendo Switch"),
            Entity::new("8d0d", "Nintendo Switch"),
            Entity::new("b5f7", "nintendo  switch "),
            Entity::new("54ed", "Sony PlayStation 5"),
        ];
        let clusters = build(&entities);
        assert_eq!(clusters.len(), 2);
        assert_eq!(members(&clusters[1]), vec!["8d0d", "b5f7", "e682"]);
        assert!(clusters[1].reasons.contains(&MergeReason::ExactName));
        assert!(clusters[1].reasons.contains(&MergeReason::NormalizedName));
    }

    #[test]
    fn transitive_through_shared_id() {
        // x and y share no name, but both are tied to id "m" under different names.
        let entities = vec![
            Entity::new("x", "Alpha"),
            Entity::new("m", "Alpha"),
            Entity::new("m", "Beta"),
            Entity::new("y", "beta"),
        ];
        let clusters = build(&entities);
        assert_eq!(clusters.len(), 1);
        assert_eq!(members(&clusters[0]), vec!["m", "x", "y"]);
    }

    #[test]
    fn blank_names_never_merge() {
        let entities = vec![Entity::new("a", ""), Entity::new("b", ""), Entity::new("c", "  ")];
        let clusters = build(&entities);
        assert_eq!(clusters.len(), 3);
    }

    #[test]
    fn exact_names_merge_when_rewrite_empties_the_key() {
        let entities = vec![Entity::new("a", "N/A"), Entity::new("b", "N/A")];
        let rules = [RewriteRule { from: "n/a".into(), to: String::new() }];
        let keys = Normalizer::new(&rules).unwrap().normalize_all(&entities).unwrap();
        assert!(keys.iter().all(NormKey::is_empty));
        let clusters = ClusterBuilder::new(RelationConfig::default()).build(&entities, &keys);
        assert_eq!(clusters.len(), 1);
        assert_eq!(members(&clusters[0]), vec!["a", "b"]);
        assert!(clusters[0].reasons.contains(&MergeReason::ExactName));
        assert!(!clusters[0].reasons.contains(&MergeReason::NormalizedName));
    }

    #[test]
    fn relations_can_be_disabled() {
        let entities = vec![Entity::new("a", "Foo Bar"), Entity::new("b", "foo bar")];
        let keys = Normalizer::default().normalize_all(&entities).unwrap();
        let relations = RelationConfig {
            normalized_name: false,
            ..RelationConfig::default()
        };
        let clusters = ClusterBuilder::new(relations).build(&entities, &keys);
        assert_eq!(clusters.len(), 2);
    }

    #[test]
    fn override_relation_merges_unrelated_names() {
        let entities = vec![
            Entity::new("2a50", "27inches 4k gaming monitor"),
            Entity::new("891b", "27in 4K gaming monitor"),
        ];
        let keys = Normalizer::default().normalize_all(&entities).unwrap();
        let overrides = BTreeMap::from([("2a50".to_string(), "891b".to_string())]);
        let clusters = ClusterBuilder::new(RelationConfig::default())
            .with_overrides(&overrides)
            .build(&entities, &keys);
        assert_eq!(clusters.len(), 1);
        assert!(clusters[0].reasons.contains(&MergeReason::Override));
    }

    #[test]
    fn override_to_absent_id_is_ignored() {
        let entities = vec![Entity::new("a", "One"), Entity::new("b", "Two")];
        let keys = Normalizer::default().normalize_all(&entities).unwrap();
        let overrides = BTreeMap::from([("a".to_string(), "zzzz".to_string())]);
        let clusters = ClusterBuilder::new(RelationConfig::default())
            .with_overrides(&overrides)
            .build(&entities, &keys);
        assert_eq!(clusters.len(), 2);
    }

    struct SkuPrefix;

    impl KeyRelation for SkuPrefix {
        fn name(&self) -> &str {
            "sku_prefix"
        }

        fn key(&self, entity: &Entity, _normalized: &NormKey) -> Option<String> {
            entity.attributes.get("sku").map(|s| s.chars().take(3).collect())
        }
    }

    #[test]
    fn custom_relation_plugs_in() {
        let mut a = Entity::new("a", "Widget");
        a.attributes.insert("sku".into(), "ABC-1".into());
        let mut b = Entity::new("b", "Gadget");
        b.attributes.insert("sku".into(), "ABC-2".into());
        let entities = vec![a, b, Entity::new("c", "Gizmo")];
        let keys = Normalizer::default().normalize_all(&entities).unwrap();
        let relation = SkuPrefix;
        let clusters = ClusterBuilder::new(RelationConfig::default())
            .with_relation(&relation)
            .build(&entities, &keys);
        assert_eq!(clusters.len(), 2);
        assert!(clusters[0]
            .reasons
            .contains(&MergeReason::Custom("sku_prefix".into())));
    }
}
