//! Name normalization: the key used by the normalized-name relation.

use serde::Serialize;

use crate::config::RewriteRule;
use crate::error::ConsolidateError;
use crate::model::Entity;

/// Normalized form of a display name. The empty key never merges.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NormKey(String);

impl NormKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for NormKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lower-case, trim, collapse whitespace runs, then apply rewrite rules in order.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    rewrites: Vec<(String, String)>,
}

impl Normalizer {
    pub fn new(rules: &[RewriteRule]) -> Result<Self, ConsolidateError> {
        let mut rewrites = Vec::with_capacity(rules.len());
        for rule in rules {
            let from = collapse(&rule.from);
            if from.is_empty() {
                return Err(ConsolidateError::ConfigValidation(format!(
                    "rewrite rule '{}' -> '{}' has an empty pattern",
                    rule.from, rule.to
                )));
            }
            rewrites.push((from, collapse(&rule.to)));
        }
        Ok(Self { rewrites })
    }

    pub fn normalize(&self, name: &str) -> Result<NormKey, String> {
        if let Some(c) = name.chars().find(|c| c.is_control() && !c.is_whitespace()) {
            return Err(format!("control character U+{:04X}", c as u32));
        }

        let mut key = collapse(name);
        for (from, to) in &self.rewrites {
            if key.contains(from.as_str()) {
                key = key.replace(from.as_str(), to);
            }
        }
        // A rewrite to an empty string can leave stray spaces behind.
        if !self.rewrites.is_empty() {
            key = collapse(&key);
        }
        Ok(NormKey(key))
    }

    /// Normalize every entity name. Output is index-aligned with `entities`.
    pub fn normalize_all(&self, entities: &[Entity]) -> Result<Vec<NormKey>, ConsolidateError> {
        entities
            .iter()
            .map(|e| {
                self.normalize(&e.name)
                    .map_err(|reason| ConsolidateError::Normalization {
                        entity_id: e.id.clone(),
                        reason,
                    })
            })
            .collect()
    }
}

/// Normalize with no rewrite rules.
pub fn normalize(name: &str) -> Result<NormKey, String> {
    Normalizer::default().normalize(name)
}

fn collapse(s: &str) -> String {
    s.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(from: &str, to: &str) -> RewriteRule {
        RewriteRule { from: from.into(), to: to.into() }
    }

    #[test]
    fn case_and_whitespace() {
        assert_eq!(normalize("  Nintendo   SWITCH ").unwrap().as_str(), "nintendo switch");
        assert_eq!(normalize("Tab\tand\nnewline").unwrap().as_str(), "tab and newline");
    }

    #[test]
    fn blank_names_are_empty_key() {
        assert!(normalize("").unwrap().is_empty());
        assert!(normalize("   \t ").unwrap().is_empty());
    }

    #[test]
    fn control_characters_rejected() {
        let err = normalize("bad\u{0}name").unwrap_err();
        assert!(err.contains("U+0000"));
    }

    #[test]
    fn rewrite_rules_apply_after_collapse() {
        let n = Normalizer::new(&[rule("Inches", "in")]).unwrap();
        assert_eq!(
            n.normalize("27inches 4k gaming monitor").unwrap(),
            n.normalize("27in 4K  gaming monitor").unwrap()
        );
    }

    #[test]
    fn rewrite_to_empty_recollapses() {
        let n = Normalizer::new(&[rule("the", "")]).unwrap();
        assert_eq!(n.normalize("The Witcher").unwrap().as_str(), "witcher");
    }

    #[test]
    fn empty_pattern_rejected() {
        let err = Normalizer::new(&[rule("  ", "x")]).unwrap_err();
        assert!(err.to_string().contains("empty pattern"));
    }

    #[test]
    fn normalize_all_reports_entity() {
        let entities = vec![Entity::new("a1", "ok"), Entity::new("b2", "x\u{7}y")];
        let err = Normalizer::default().normalize_all(&entities).unwrap_err();
        assert!(err.to_string().contains("'b2'"));
    }
}
