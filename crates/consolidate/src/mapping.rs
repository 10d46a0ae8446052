use std::collections::{BTreeMap, BTreeSet};

use crate::error::ConsolidateError;
use crate::model::{EquivalenceClass, MappingConflict};

/// Total `id -> canonical_id` function over every clustered id.
#[derive(Debug, Clone, Default)]
pub struct MappingStore {
    map: BTreeMap<String, String>,
    conflicts: BTreeMap<String, BTreeSet<String>>,
}

impl MappingStore {
    pub fn build(classes: &[EquivalenceClass]) -> Self {
        let mut store = Self::default();
        for class in classes {
            // Canonical first so it always maps to itself.
            store.insert(&class.canonical_id, &class.canonical_id);
            for member in &class.members {
                store.insert(member, &class.canonical_id);
            }
        }
        if !store.conflicts.is_empty() {
            log::warn!("{} id(s) claimed by more than one class", store.conflicts.len());
        }
        store
    }

    fn insert(&mut self, id: &str, canonical: &str) {
        match self.map.get(id) {
            None => {
                self.map.insert(id.to_string(), canonical.to_string());
            }
            Some(existing) if existing == canonical => {}
            Some(existing) => {
                let entry = self.conflicts.entry(id.to_string()).or_default();
                entry.insert(existing.clone());
                entry.insert(canonical.to_string());
            }
        }
    }

    pub fn resolve(&self, id: &str) -> Result<&str, ConsolidateError> {
        self.map
            .get(id)
            .map(String::as_str)
            .ok_or_else(|| ConsolidateError::MappingIncomplete { id: id.to_string() })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.map.contains_key(id)
    }

    pub fn is_canonical(&self, id: &str) -> bool {
        self.map.get(id).is_some_and(|c| c == id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Non-identity `(old, new)` pairs in id order.
    pub fn remapped(&self) -> Vec<(String, String)> {
        self.map
            .iter()
            .filter(|(old, new)| old != new)
            .map(|(old, new)| (old.clone(), new.clone()))
            .collect()
    }

    /// Ids resolved to more than one canonical id.
    pub fn conflicts(&self) -> Vec<MappingConflict> {
        self.conflicts
            .iter()
            .map(|(id, targets)| MappingConflict {
                id: id.clone(),
                canonical_ids: targets.iter().cloned().collect(),
            })
            .collect()
    }
}
