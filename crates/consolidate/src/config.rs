use std::collections::{BTreeMap, HashSet};

use serde::Deserialize;

use crate::error::ConsolidateError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ConsolidateConfig {
    pub name: String,
    pub entities: EntitySource,
    pub facts: FactSource,
    /// `old_id -> target_id`. Highest-priority canonicalization input.
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
    /// Optional CSV of `old_id,target_id` rows merged into `overrides`.
    #[serde(default)]
    pub overrides_file: Option<String>,
    #[serde(default)]
    pub relations: RelationConfig,
    #[serde(default)]
    pub normalize: NormalizeConfig,
    #[serde(default)]
    pub remap: RemapConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct EntitySource {
    pub file: String,
    pub columns: EntityColumns,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntityColumns {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FactSource {
    pub file: String,
    /// Column used as the record id. Row number (1-based) when absent.
    #[serde(default)]
    pub record_id: Option<String>,
    pub foreign_keys: Vec<ForeignKey>,
}

/// A fact column holding an entity id.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ForeignKey {
    pub field: String,
    /// Denormalized display-name column kept in step with `field`.
    #[serde(default)]
    pub name_field: Option<String>,
}

impl ForeignKey {
    pub fn new(field: impl Into<String>) -> Self {
        Self { field: field.into(), name_field: None }
    }
}

// ---------------------------------------------------------------------------
// Relations + Normalization
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RelationConfig {
    #[serde(default = "default_true")]
    pub exact_name: bool,
    #[serde(default = "default_true")]
    pub normalized_name: bool,
    /// Overrides also union their two ids.
    #[serde(default = "default_true")]
    pub overrides: bool,
}

impl Default for RelationConfig {
    fn default() -> Self {
        Self {
            exact_name: true,
            normalized_name: true,
            overrides: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NormalizeConfig {
    #[serde(default)]
    pub rewrites: Vec<RewriteRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RewriteRule {
    pub from: String,
    pub to: String,
}

// ---------------------------------------------------------------------------
// Remap + Backup + Output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownIdPolicy {
    /// Record unknown ids as orphans and keep going.
    #[default]
    Accumulate,
    /// Abort remapping on the first unknown id.
    FailFast,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemapConfig {
    #[serde(default)]
    pub on_unknown: UnknownIdPolicy,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackupConfig {
    /// Directory for CSV snapshots. In-memory only when absent.
    #[serde(default)]
    pub dir: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub json: Option<String>,
    /// Directory receiving consolidated CSV files.
    #[serde(default)]
    pub dir: Option<String>,
    /// SQLite database receiving consolidated tables.
    #[serde(default)]
    pub sqlite: Option<String>,
}

// ---------------------------------------------------------------------------
// Parse + Validate
// ---------------------------------------------------------------------------

impl ConsolidateConfig {
    pub fn from_toml(input: &str) -> Result<Self, ConsolidateError> {
        let config: ConsolidateConfig =
            toml::from_str(input).map_err(|e| ConsolidateError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConsolidateError> {
        if self.entities.columns.id == self.entities.columns.name {
            return Err(ConsolidateError::ConfigValidation(format!(
                "entity id and name columns must differ (both '{}')",
                self.entities.columns.id
            )));
        }

        if self.facts.foreign_keys.is_empty() {
            return Err(ConsolidateError::ConfigValidation(
                "at least one foreign key is required".into(),
            ));
        }

        let mut seen = HashSet::new();
        for fk in &self.facts.foreign_keys {
            if !seen.insert(fk.field.as_str()) {
                return Err(ConsolidateError::ConfigValidation(format!(
                    "foreign key field '{}' listed twice",
                    fk.field
                )));
            }
            if fk.name_field.as_deref() == Some(fk.field.as_str()) {
                return Err(ConsolidateError::ConfigValidation(format!(
                    "foreign key '{}': name_field must differ from field",
                    fk.field
                )));
            }
        }

        for (old, target) in &self.overrides {
            if old.trim().is_empty() || target.trim().is_empty() {
                return Err(ConsolidateError::ConfigValidation(format!(
                    "override '{old}' -> '{target}' has an empty id"
                )));
            }
        }

        for rule in &self.normalize.rewrites {
            if rule.from.trim().is_empty() {
                return Err(ConsolidateError::ConfigValidation(format!(
                    "rewrite rule -> '{}' has an empty pattern",
                    rule.to
                )));
            }
        }

        if self.output.dir.is_some() && self.output.sqlite.is_some() {
            return Err(ConsolidateError::ConfigValidation(
                "set at most one of output.dir and output.sqlite".into(),
            ));
        }

        Ok(())
    }

    /// Fold overrides loaded from `overrides_file` into the inline table.
    /// Inline entries win only when they agree; a disagreement is an error.
    pub fn merge_overrides(&mut self, extra: BTreeMap<String, String>) -> Result<(), ConsolidateError> {
        for (old, target) in extra {
            match self.overrides.get(&old) {
                Some(existing) if *existing != target => {
                    return Err(ConsolidateError::ConfigValidation(format!(
                        "override '{old}' maps to '{existing}' inline and '{target}' in overrides file"
                    )));
                }
                Some(_) => {}
                None => {
                    self.overrides.insert(old, target);
                }
            }
        }
        Ok(())
    }
}

/// Parse an `old_id,target_id` CSV (header row required).
pub fn parse_overrides_csv(csv_data: &str) -> Result<BTreeMap<String, String>, ConsolidateError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(csv_data.as_bytes());

    let mut overrides = BTreeMap::new();
    for record in reader.records() {
        let record =
            record.map_err(|e| ConsolidateError::ConfigParse(format!("overrides file: {e}")))?;
        let old = record.get(0).unwrap_or("");
        let target = record.get(1).unwrap_or("");
        if old.is_empty() || target.is_empty() {
            return Err(ConsolidateError::ConfigValidation(format!(
                "overrides file: incomplete row '{old},{target}'"
            )));
        }
        if let Some(prev) = overrides.insert(old.to_string(), target.to_string()) {
            if prev != target {
                return Err(ConsolidateError::ConfigValidation(format!(
                    "overrides file: '{old}' maps to both '{prev}' and '{target}'"
                )));
            }
        }
    }
    Ok(overrides)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
name = "Products"

[entities]
file = "products.csv"
[entities.columns]
id   = "product_id"
name = "product_name"

[facts]
file = "orders.csv"
record_id = "order_id"

[[facts.foreign_keys]]
field = "product_id"
name_field = "product_name"

[overrides]
"8d0d" = "e682"
"5142" = "f81e"
"#;

    #[test]
    fn parse_valid() {
        let config = ConsolidateConfig::from_toml(VALID).unwrap();
        assert_eq!(config.name, "Products");
        assert_eq!(config.entities.columns.id, "product_id");
        assert_eq!(config.facts.record_id.as_deref(), Some("order_id"));
        assert_eq!(config.facts.foreign_keys.len(), 1);
        assert_eq!(
            config.facts.foreign_keys[0].name_field.as_deref(),
            Some("product_name")
        );
        assert_eq!(config.overrides["8d0d"], "e682");
        assert!(config.relations.normalized_name);
        assert!(config.relations.overrides);
        assert_eq!(config.remap.on_unknown, UnknownIdPolicy::Accumulate);
        assert!(config.backup.dir.is_none());
    }

    #[test]
    fn parse_policy_and_rewrites() {
        let input = format!(
            r#"{VALID}
[relations]
exact_name = false

[normalize]
rewrites = [{{ from = "inches", to = "in" }}]

[remap]
on_unknown = "fail_fast"

[backup]
dir = "backups"
"#
        );
        let config = ConsolidateConfig::from_toml(&input).unwrap();
        assert!(!config.relations.exact_name);
        assert!(config.relations.normalized_name);
        assert_eq!(config.normalize.rewrites.len(), 1);
        assert_eq!(config.remap.on_unknown, UnknownIdPolicy::FailFast);
        assert_eq!(config.backup.dir.as_deref(), Some("backups"));
    }

    #[test]
    fn reject_unknown_policy() {
        let input = format!("{VALID}\n[remap]\non_unknown = \"ignore\"\n");
        assert!(ConsolidateConfig::from_toml(&input).is_err());
    }

    #[test]
    fn reject_missing_foreign_keys() {
        let input = r#"
name = "Bad"
[entities]
file = "p.csv"
[entities.columns]
id = "id"
name = "name"
[facts]
file = "f.csv"
foreign_keys = []
"#;
        let err = ConsolidateConfig::from_toml(input).unwrap_err();
        assert!(err.to_string().contains("at least one foreign key"));
    }

    #[test]
    fn reject_duplicate_foreign_key() {
        let input = r#"
name = "Bad"
[entities]
file = "p.csv"
[entities.columns]
id = "id"
name = "name"
[facts]
file = "f.csv"
[[facts.foreign_keys]]
field = "product_id"
[[facts.foreign_keys]]
field = "product_id"
"#;
        let err = ConsolidateConfig::from_toml(input).unwrap_err();
        assert!(err.to_string().contains("listed twice"));
    }

    #[test]
    fn reject_two_output_targets() {
        let input = format!("{VALID}\n[output]\ndir = \"out\"\nsqlite = \"out.db\"\n");
        let err = ConsolidateConfig::from_toml(&input).unwrap_err();
        assert!(err.to_string().contains("at most one"));
    }

    #[test]
    fn overrides_csv() {
        let csv = "old_id,target_id\n8d0d,e682\n 8e5d , e682\n";
        let map = parse_overrides_csv(csv).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["8e5d"], "e682");
    }

    #[test]
    fn merge_overrides_from_file() {
        let mut config = ConsolidateConfig::from_toml(VALID).unwrap();
        let extra = parse_overrides_csv("old_id,target_id\n8d0d,e682\n8e5d,e682\n").unwrap();
        config.merge_overrides(extra).unwrap();
        assert_eq!(config.overrides.len(), 3);

        let clash = parse_overrides_csv("old_id,target_id\n8d0d,f81e\n").unwrap();
        let err = config.merge_overrides(clash).unwrap_err();
        assert!(err.to_string().contains("overrides file"));
    }

    #[test]
    fn malformed_overrides_csv_is_a_config_error() {
        let csv = "old_id,target_id\n8d0d,e682\n8e5d,e682,extra\n";
        let err = parse_overrides_csv(csv).unwrap_err();
        assert!(matches!(err, ConsolidateError::ConfigParse(_)), "{err}");
        assert!(err.to_string().contains("overrides file"));
    }

    #[test]
    fn overrides_csv_contradiction() {
        let csv = "old_id,target_id\n8d0d,e682\n8d0d,f81e\n";
        let err = parse_overrides_csv(csv).unwrap_err();
        assert!(err.to_string().contains("both 'e682' and 'f81e'"));
    }
}
