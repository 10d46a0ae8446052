//! `conform run | analyze | validate`: config-driven consolidation.

use std::path::{Path, PathBuf};

use clap::Subcommand;
use serde::Serialize;

use conform_consolidate::config::{parse_overrides_csv, UnknownIdPolicy};
use conform_consolidate::model::{AnalysisReport, VerificationReport};
use conform_consolidate::{
    load_csv_entities, load_csv_facts, ConsolidateConfig, ConsolidateError, ConsolidateInput,
    ConsolidateResult, Consolidator, DirSnapshotStore, MemorySink, MemorySnapshotStore, Sink,
    Snapshot, SnapshotStore,
};
use conform_store::{CsvDirSink, CsvLayout, SqliteSink};

use crate::exit_codes::{
    exit_code_for, EXIT_DRY_RUN_VIOLATIONS, EXIT_DUPLICATES_FOUND, EXIT_ERROR, EXIT_INPUT,
};
use crate::CliError;

#[derive(Subcommand)]
pub enum ConsolidateCommands {
    /// Consolidate duplicates, remap fact references and commit the result
    #[command(after_help = "\
Examples:
  conform run products.conform.toml
  conform run products.conform.toml --dry-run --json
  conform run products.conform.toml --output result.json
  conform run products.conform.toml --fail-fast")]
    Run {
        /// Path to the .conform.toml config file
        config: PathBuf,

        /// Plan and verify without snapshot or writes
        #[arg(long)]
        dry_run: bool,

        /// Output JSON to stdout instead of human summary
        #[arg(long)]
        json: bool,

        /// Write JSON output to file (overrides output.json)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Abort on the first fact referencing an unknown id
        #[arg(long)]
        fail_fast: bool,
    },

    /// Report duplicate ids, names and the merge plan without writing
    #[command(after_help = "\
Examples:
  conform analyze products.conform.toml
  conform analyze products.conform.toml --json --strict")]
    Analyze {
        /// Path to the .conform.toml config file
        config: PathBuf,

        /// Output JSON to stdout instead of human summary
        #[arg(long)]
        json: bool,

        /// Write JSON output to file
        #[arg(long)]
        output: Option<PathBuf>,

        /// Exit non-zero when any duplicate class is found
        #[arg(long)]
        strict: bool,
    },

    /// Validate a config (and its overrides file) without loading data
    #[command(after_help = "\
Examples:
  conform validate products.conform.toml")]
    Validate {
        /// Path to the .conform.toml config file
        config: PathBuf,
    },
}

pub fn cmd_consolidate(cmd: ConsolidateCommands) -> Result<(), CliError> {
    match cmd {
        ConsolidateCommands::Run { config, dry_run, json, output, fail_fast } => {
            cmd_run(config, dry_run, json, output, fail_fast)
        }
        ConsolidateCommands::Analyze { config, json, output, strict } => {
            cmd_analyze(config, json, output, strict)
        }
        ConsolidateCommands::Validate { config } => cmd_validate(config),
    }
}

fn run_err(code: u8, msg: impl Into<String>) -> CliError {
    CliError { code, message: msg.into(), hint: None }
}

fn engine_err(err: ConsolidateError) -> CliError {
    let hint = match &err {
        ConsolidateError::EquivalenceConflict { .. } => {
            Some("check [overrides] and overrides_file for ids pointing one class at two targets")
        }
        ConsolidateError::Normalization { .. } => Some("clean the entity name in the source file"),
        ConsolidateError::BackupWrite(_) => Some("check that backup.dir is writable; nothing was changed"),
        ConsolidateError::IntegrityViolation(_) => {
            Some("nothing was written; rerun with --dry-run --json for the full report")
        }
        ConsolidateError::MappingIncomplete { .. } => {
            Some("nothing was written; add the id to the dimension or drop --fail-fast")
        }
        _ => None,
    };
    let error = CliError::new(exit_code_for(&err), err.to_string());
    match hint {
        Some(hint) => error.with_hint(hint),
        None => error,
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Parsed config plus the directory relative paths resolve against.
struct Loaded {
    config: ConsolidateConfig,
    base_dir: PathBuf,
}

impl Loaded {
    fn path(&self, rel: &str) -> PathBuf {
        self.base_dir.join(rel)
    }
}

fn read_bytes(path: &Path) -> Result<Vec<u8>, CliError> {
    std::fs::read(path)
        .map_err(|e| run_err(EXIT_INPUT, format!("cannot read {}: {e}", path.display())))
}

/// Read and validate the config, folding in `overrides_file` when set.
fn load_config(config_path: &Path) -> Result<Loaded, CliError> {
    let config_str = std::fs::read_to_string(config_path)
        .map_err(|e| run_err(EXIT_INPUT, format!("cannot read config: {e}")))?;
    let mut config = ConsolidateConfig::from_toml(&config_str).map_err(engine_err)?;

    // Resolve file paths relative to config file's directory
    let base_dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    if let Some(file) = config.overrides_file.clone() {
        let path = base_dir.join(&file);
        let data = std::fs::read_to_string(&path)
            .map_err(|e| run_err(EXIT_INPUT, format!("cannot read {}: {e}", path.display())))?;
        let extra = parse_overrides_csv(&data).map_err(engine_err)?;
        log::info!("loaded {} override(s) from {}", extra.len(), path.display());
        config.merge_overrides(extra).map_err(engine_err)?;
        config.validate().map_err(engine_err)?;
    }

    Ok(Loaded { config, base_dir })
}

fn load_input(loaded: &Loaded) -> Result<ConsolidateInput, CliError> {
    let config = &loaded.config;
    let entities_path = loaded.path(&config.entities.file);
    let entities = load_csv_entities(&read_bytes(&entities_path)?, &config.entities)
        .map_err(engine_err)?;
    let facts_path = loaded.path(&config.facts.file);
    let facts = load_csv_facts(&read_bytes(&facts_path)?, &config.facts).map_err(engine_err)?;
    log::info!(
        "loaded {} entity row(s) from {}, {} fact(s) from {}",
        entities.len(),
        entities_path.display(),
        facts.len(),
        facts_path.display()
    );
    Ok(ConsolidateInput { entities, facts })
}

fn open_sink(loaded: &Loaded) -> Result<Box<dyn Sink>, CliError> {
    let output = &loaded.config.output;
    if let Some(db) = &output.sqlite {
        let sink = SqliteSink::open(&loaded.path(db)).map_err(engine_err)?;
        log::info!("output database {}", loaded.path(db).display());
        return Ok(Box::new(sink));
    }
    if let Some(dir) = &output.dir {
        let layout = CsvLayout::from_config(&loaded.config);
        let sink = CsvDirSink::new(loaded.path(dir), layout);
        log::info!("output directory {}", sink.dir().display());
        return Ok(Box::new(sink));
    }
    log::warn!("no output.dir or output.sqlite configured; result is reported only");
    Ok(Box::new(MemorySink::new()))
}

fn open_snapshot_store(loaded: &Loaded) -> TrackedSnapshots {
    let inner: Box<dyn SnapshotStore> = match &loaded.config.backup.dir {
        Some(dir) => Box::new(DirSnapshotStore::new(loaded.path(dir))),
        None => {
            log::warn!("no backup.dir configured; snapshot kept in memory only");
            Box::new(MemorySnapshotStore::new())
        }
    };
    TrackedSnapshots { inner, persisted: None }
}

/// Remembers the last persisted snapshot, so a rolled-back run can say
/// where the authoritative state lives.
struct TrackedSnapshots {
    inner: Box<dyn SnapshotStore>,
    persisted: Option<PersistedSnapshot>,
}

#[derive(Debug, Serialize)]
struct PersistedSnapshot {
    id: String,
    location: String,
}

impl SnapshotStore for TrackedSnapshots {
    fn persist(&mut self, snapshot: &Snapshot) -> Result<String, ConsolidateError> {
        let location = self.inner.persist(snapshot)?;
        self.persisted = Some(PersistedSnapshot {
            id: snapshot.id().to_string(),
            location: location.clone(),
        });
        Ok(location)
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// JSON body emitted when a run was rolled back.
#[derive(Debug, Serialize)]
struct RolledBack<'a> {
    config_name: &'a str,
    engine_version: &'static str,
    status: &'static str,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    snapshot: Option<&'a PersistedSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    verification: Option<&'a VerificationReport>,
}

fn emit<T: Serialize>(value: &T, json_output: bool, output_file: Option<&Path>) -> Result<(), CliError> {
    let json_str = serde_json::to_string_pretty(value)
        .map_err(|e| run_err(EXIT_ERROR, format!("JSON serialization error: {e}")))?;

    if let Some(path) = output_file {
        std::fs::write(path, &json_str)
            .map_err(|e| run_err(EXIT_ERROR, format!("cannot write output: {e}")))?;
        eprintln!("wrote {}", path.display());
    }

    if json_output {
        println!("{json_str}");
    }
    Ok(())
}

fn print_run_summary(result: &ConsolidateResult) {
    let s = &result.summary;
    eprintln!(
        "'{}': {} -> {} entities, {} duplicate class(es), {} id(s) remapped, {} of {} fact(s) changed ({})",
        result.meta.config_name,
        s.entities_in,
        s.entities_out,
        s.duplicate_classes,
        s.ids_remapped,
        s.facts_changed,
        s.facts_scanned,
        result.status,
    );
    if let Some(ref id) = result.meta.snapshot_id {
        eprintln!("snapshot: {id}");
    }
    if s.orphans > 0 || s.duplicate_names > 0 {
        eprintln!(
            "verification: {} orphan reference(s), {} duplicate name(s)",
            s.orphans, s.duplicate_names
        );
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_run(
    config_path: PathBuf,
    dry_run: bool,
    json_output: bool,
    output_file: Option<PathBuf>,
    fail_fast: bool,
) -> Result<(), CliError> {
    let mut loaded = load_config(&config_path)?;
    if fail_fast {
        loaded.config.remap.on_unknown = UnknownIdPolicy::FailFast;
    }
    let output_file = output_file.or_else(|| loaded.config.output.json.as_deref().map(|p| loaded.path(p)));
    let input = load_input(&loaded)?;
    let consolidator = Consolidator::new(&loaded.config);

    if dry_run {
        let result = consolidator.dry_run(&input).map_err(engine_err)?;
        emit(&result, json_output, output_file.as_deref())?;
        print_run_summary(&result);
        if !result.verification.is_clean() {
            return Err(run_err(
                EXIT_DRY_RUN_VIOLATIONS,
                "verification would fail; a real run would roll back",
            ));
        }
        return Ok(());
    }

    let mut sink = open_sink(&loaded)?;
    let mut snapshots = open_snapshot_store(&loaded);

    match consolidator.run(&input, sink.as_mut(), &mut snapshots) {
        Ok(result) => {
            emit(&result, json_output, output_file.as_deref())?;
            print_run_summary(&result);
            Ok(())
        }
        Err(err) if !err.is_pre_mutation() && !matches!(err, ConsolidateError::Sink(_)) => {
            let verification = match &err {
                ConsolidateError::IntegrityViolation(report) => Some(report.as_ref()),
                _ => None,
            };
            let body = RolledBack {
                config_name: &loaded.config.name,
                engine_version: env!("CARGO_PKG_VERSION"),
                status: "rolled_back",
                error: err.to_string(),
                snapshot: snapshots.persisted.as_ref(),
                verification,
            };
            emit(&body, json_output, output_file.as_deref())?;
            eprintln!("'{}': rolled back", loaded.config.name);
            if let Some(snapshot) = &snapshots.persisted {
                eprintln!("snapshot: {} ({})", snapshot.id, snapshot.location);
            }
            Err(engine_err(err))
        }
        Err(err) => Err(engine_err(err)),
    }
}

fn cmd_analyze(
    config_path: PathBuf,
    json_output: bool,
    output_file: Option<PathBuf>,
    strict: bool,
) -> Result<(), CliError> {
    let loaded = load_config(&config_path)?;
    let input = load_input(&loaded)?;
    let report: AnalysisReport = Consolidator::new(&loaded.config)
        .analyze(&input)
        .map_err(engine_err)?;

    emit(&report, json_output, output_file.as_deref())?;

    eprintln!(
        "'{}': {} row(s), {} unique id(s), {} duplicate id(s), {} duplicate name(s), {} variant group(s), {} class(es) to merge",
        loaded.config.name,
        report.total_rows,
        report.unique_ids,
        report.duplicate_ids.len(),
        report.duplicate_names.len(),
        report.name_variants.len(),
        report.classes.len(),
    );

    if strict && !report.classes.is_empty() {
        return Err(run_err(
            EXIT_DUPLICATES_FOUND,
            format!("{} duplicate class(es) found", report.classes.len()),
        ));
    }
    Ok(())
}

fn cmd_validate(config_path: PathBuf) -> Result<(), CliError> {
    let loaded = load_config(&config_path)?;
    let config = &loaded.config;
    eprintln!(
        "valid: '{}' with {} foreign key(s), {} override(s), {} rewrite rule(s)",
        config.name,
        config.facts.foreign_keys.len(),
        config.overrides.len(),
        config.normalize.rewrites.len(),
    );
    Ok(())
}
