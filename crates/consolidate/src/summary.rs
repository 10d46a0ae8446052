use crate::model::{
    ConsolidateSummary, DimensionReport, EquivalenceClass, RemapReport, VerificationReport,
};

/// Compute run-level counts from the per-stage reports.
pub fn compute_summary(
    classes: &[EquivalenceClass],
    dimension: &DimensionReport,
    remap: &RemapReport,
    verification: &VerificationReport,
) -> ConsolidateSummary {
    let duplicate_classes = classes.iter().filter(|c| c.is_duplicate()).count();
    let ids_remapped = classes
        .iter()
        .map(|c| c.members.len().saturating_sub(1))
        .sum();

    ConsolidateSummary {
        entities_in: dimension.rows_in,
        entities_out: dimension.rows_out,
        classes: classes.len(),
        duplicate_classes,
        ids_remapped,
        facts_scanned: remap.records_scanned,
        facts_changed: remap.records_changed,
        references_changed: remap.changes.iter().map(|c| c.affected_count).sum(),
        orphans: verification.orphans.len(),
        duplicate_names: verification.duplicate_names.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChangeEntry, SelectionRule};
    use std::collections::BTreeSet;

    fn class(members: &[&str]) -> EquivalenceClass {
        EquivalenceClass {
            members: members.iter().map(|s| s.to_string()).collect(),
            canonical_id: members[0].to_string(),
            rule: SelectionRule::Lexicographic,
            reasons: BTreeSet::new(),
        }
    }

    #[test]
    fn summary_counts() {
        let classes = vec![class(&["a", "b", "c"]), class(&["d"]), class(&["e", "f"])];
        let dimension = DimensionReport {
            rows_in: 7,
            rows_out: 3,
            rows_removed: 4,
            ..DimensionReport::default()
        };
        let remap = RemapReport {
            records_scanned: 10,
            records_changed: 4,
            changes: vec![
                ChangeEntry {
                    field: "product_id".into(),
                    old_id: "b".into(),
                    new_id: "a".into(),
                    affected_count: 3,
                },
                ChangeEntry {
                    field: "product_id".into(),
                    old_id: "f".into(),
                    new_id: "e".into(),
                    affected_count: 1,
                },
            ],
            ..RemapReport::default()
        };

        let s = compute_summary(&classes, &dimension, &remap, &VerificationReport::default());
        assert_eq!(s.classes, 3);
        assert_eq!(s.duplicate_classes, 2);
        assert_eq!(s.ids_remapped, 3);
        assert_eq!(s.entities_out, 3);
        assert_eq!(s.references_changed, 4);
        assert_eq!(s.orphans, 0);
    }
}
