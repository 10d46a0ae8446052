//! CLI Exit Code Registry
//!
//! This is the single source of truth for all CLI exit codes.
//! Exit codes are part of the shell contract; scripts rely on them.
//!
//! # Exit Code Ranges
//!
//! | Range   | Domain           | Description                                |
//! |---------|------------------|--------------------------------------------|
//! | 0       | Universal        | Success                                    |
//! | 1       | Universal        | General error (unspecified)                |
//! | 2       | Universal        | CLI usage error (bad or missing args)      |
//! | 3-9     | run              | Consolidation aborted or rolled back       |
//! | 10-19   | findings         | Completed, but duplicates/violations found |
//!
//! Codes 3 to 6 and 8 are raised before any snapshot or write, so the
//! target is untouched. Code 7 means writes were staged and rolled back.
//!
//! # Adding New Exit Codes
//!
//! 1. Add the constant in the appropriate range
//! 2. Document what triggers it
//! 3. Update the table above
//! 4. Wire it into `exit_code_for`

use conform_consolidate::ConsolidateError;

// =============================================================================
// Universal (0-2)
// =============================================================================

/// Success - command completed without errors.
pub const EXIT_SUCCESS: u8 = 0;

/// General error - unspecified failure.
/// Avoid using this; prefer a specific error code.
pub const EXIT_ERROR: u8 = 1;

/// Usage error - bad arguments, missing required options.
/// Raised by clap itself before any command runs.
#[allow(dead_code)]
pub const EXIT_USAGE: u8 = 2;

// =============================================================================
// Run (3-9)
// =============================================================================

/// Config could not be parsed or failed validation (including overrides file).
pub const EXIT_INVALID_CONFIG: u8 = 3;

/// Input could not be read: missing file, missing column, malformed CSV.
pub const EXIT_INPUT: u8 = 4;

/// An entity name could not be normalized (control characters, bad UTF-8).
pub const EXIT_NORMALIZATION: u8 = 5;

/// Overrides assert two canonical ids for one equivalence class.
pub const EXIT_EQUIVALENCE_CONFLICT: u8 = 6;

/// Verification failed or remapping aborted after the snapshot; all staged
/// writes were rolled back.
pub const EXIT_ROLLED_BACK: u8 = 7;

/// Snapshot could not be written. Nothing was mutated.
pub const EXIT_BACKUP_WRITE: u8 = 8;

/// Output sink refused a write or commit.
pub const EXIT_SINK: u8 = 9;

// =============================================================================
// Findings (10-19)
// =============================================================================

/// `analyze --strict`: duplicate classes found.
pub const EXIT_DUPLICATES_FOUND: u8 = 10;

/// `run --dry-run`: verification would fail on a real run.
pub const EXIT_DRY_RUN_VIOLATIONS: u8 = 11;

/// Map an engine error to its exit code.
pub fn exit_code_for(err: &ConsolidateError) -> u8 {
    match err {
        ConsolidateError::ConfigParse(_) | ConsolidateError::ConfigValidation(_) => {
            EXIT_INVALID_CONFIG
        }
        ConsolidateError::MissingColumn { .. } | ConsolidateError::Io(_) => EXIT_INPUT,
        ConsolidateError::Normalization { .. } => EXIT_NORMALIZATION,
        ConsolidateError::EquivalenceConflict { .. } => EXIT_EQUIVALENCE_CONFLICT,
        ConsolidateError::IntegrityViolation(_) | ConsolidateError::MappingIncomplete { .. } => {
            EXIT_ROLLED_BACK
        }
        ConsolidateError::BackupWrite(_) => EXIT_BACKUP_WRITE,
        ConsolidateError::Sink(_) => EXIT_SINK,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pre_mutation_errors_never_report_rollback() {
        let errors = [
            ConsolidateError::ConfigParse("x".into()),
            ConsolidateError::Normalization { entity_id: "a6be".into(), reason: "x".into() },
            ConsolidateError::EquivalenceConflict { members: vec![], targets: vec![] },
            ConsolidateError::BackupWrite("x".into()),
        ];
        for err in &errors {
            assert!(err.is_pre_mutation());
            assert_ne!(exit_code_for(err), EXIT_ROLLED_BACK, "{err}");
        }
    }

    #[test]
    fn codes_are_distinct() {
        let codes = [
            EXIT_SUCCESS,
            EXIT_ERROR,
            EXIT_USAGE,
            EXIT_INVALID_CONFIG,
            EXIT_INPUT,
            EXIT_NORMALIZATION,
            EXIT_EQUIVALENCE_CONFLICT,
            EXIT_ROLLED_BACK,
            EXIT_BACKUP_WRITE,
            EXIT_SINK,
            EXIT_DUPLICATES_FOUND,
            EXIT_DRY_RUN_VIOLATIONS,
        ];
        let unique: std::collections::HashSet<u8> = codes.iter().copied().collect();
        assert_eq!(unique.len(), codes.len());
    }
}
