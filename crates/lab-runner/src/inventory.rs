//! Expected-versus-present inventory of an experiment directory.
//!
//! Scanning never fails because something is missing or malformed: those are
//! recorded as inventory facts. The only error is an experiment path that
//! cannot be listed at all.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use lab_analysis::{
    check_aggregate, render_batch_log, render_experiment_results, DerivedState,
    ReplicationReport, ReportEntry, BATCH_LOG_HEADER, RESULTS_HEADER,
};
use lab_core::layout::{self, DirKind};
use lab_core::{sha256_bytes, ConfigSnapshot, LabError, CURRENT_SCHEMA_VERSION};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum RawFileState {
    Present,
    Missing,
    Empty,
    Unparsable(String),
}

impl RawFileState {
    pub fn is_present(&self) -> bool {
        matches!(self, RawFileState::Present)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrialInventory {
    pub trial: u32,
    pub query: RawFileState,
    pub response: RawFileState,
}

impl TrialInventory {
    pub fn is_complete(&self) -> bool {
        self.query.is_present() && self.response.is_present()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplicationInventory {
    pub index: u32,
    pub dir: PathBuf,
    pub dir_present: bool,
    /// Number of regular files in the directory, expected or not.
    pub file_count: usize,
    pub trials: Vec<TrialInventory>,
    pub report: DerivedState,
    #[serde(skip)]
    pub parsed_report: Option<ReportEntry>,
}

impl ReplicationInventory {
    pub fn raw_data_complete(&self) -> bool {
        self.dir_present && self.trials.iter().all(TrialInventory::is_complete)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum StructuralIssue {
    SnapshotMissing,
    SnapshotInvalid { message: String },
    SchemaOutdated { found: u32, current: u32 },
    LegacyDirectory { name: String, index: u32 },
    LegacyReport { dir: String },
    ReplicationOutOfRange { name: String, index: u32, expected: u32 },
}

impl StructuralIssue {
    pub fn describe(&self) -> String {
        match self {
            StructuralIssue::SnapshotMissing => format!("{} is missing", layout::CONFIG_SNAPSHOT),
            StructuralIssue::SnapshotInvalid { message } => {
                format!("{} is unreadable: {}", layout::CONFIG_SNAPSHOT, message)
            }
            StructuralIssue::SchemaOutdated { found, current } => {
                format!("schema version {} predates current version {}", found, current)
            }
            StructuralIssue::LegacyDirectory { name, index } => format!(
                "legacy directory '{}' (expected '{}')",
                name,
                layout::replication_dir_name(*index)
            ),
            StructuralIssue::LegacyReport { dir } => {
                format!("legacy '{}' in {}", layout::LEGACY_REPORT, dir)
            }
            StructuralIssue::ReplicationOutOfRange {
                name,
                index,
                expected,
            } => format!(
                "'{}' has index {} outside 1..={}",
                name, index, expected
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregateInventory {
    pub results: DerivedState,
    pub batch_log: DerivedState,
    /// False when some replication lacked a fresh report, so the expected
    /// aggregate content could not be rendered and only presence was checked.
    pub evaluated: bool,
}

impl AggregateInventory {
    pub fn is_fresh(&self) -> bool {
        self.evaluated && self.results.is_fresh() && self.batch_log.is_fresh()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentInventory {
    pub path: PathBuf,
    #[serde(skip)]
    pub snapshot: Option<ConfigSnapshot>,
    pub expected_replications: u32,
    pub expected_trials: u32,
    /// Every `replication_NNN` / legacy directory found, sorted by index.
    pub found_dirs: Vec<String>,
    pub replications: Vec<ReplicationInventory>,
    pub structural: Vec<StructuralIssue>,
    pub aggregates: AggregateInventory,
}

impl ExperimentInventory {
    pub fn replication(&self, index: u32) -> Option<&ReplicationInventory> {
        self.replications.iter().find(|r| r.index == index)
    }

    /// Parsed reports of every replication, provided all of them are fresh.
    pub fn fresh_reports(&self) -> Option<Vec<ReportEntry>> {
        if self.replications.is_empty() {
            return None;
        }
        self.replications
            .iter()
            .map(|r| match (&r.report, &r.parsed_report) {
                (DerivedState::Fresh, Some(entry)) => Some(entry.clone()),
                _ => None,
            })
            .collect()
    }
}

struct DirEntryInfo {
    name: String,
    kind: DirKind,
}

fn list_subdirs(path: &Path) -> Result<Vec<DirEntryInfo>> {
    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(path).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| anyhow!("cannot list {}: {}", path.display(), e))?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let kind = layout::classify_dir_name(&name);
        out.push(DirEntryInfo { name, kind });
    }
    out.sort_by_key(|d| (d.kind.index().unwrap_or(u32::MAX), layout::natural_key(&d.name)));
    Ok(out)
}

fn raw_file_state(path: &Path) -> (RawFileState, Option<Vec<u8>>) {
    match fs::read(path) {
        Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => (RawFileState::Empty, None),
        Ok(bytes) => match std::str::from_utf8(&bytes) {
            Ok(_) => (RawFileState::Present, Some(bytes)),
            Err(_) => (
                RawFileState::Unparsable("not valid UTF-8".to_string()),
                None,
            ),
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => (RawFileState::Missing, None),
        Err(e) => (RawFileState::Unparsable(e.to_string()), None),
    }
}

fn highest_trial_index(dir: &Path) -> u32 {
    fs::read_dir(dir)
        .map(|rd| {
            rd.filter_map(|e| e.ok())
                .filter_map(|e| layout::parse_trial_file(&e.file_name().to_string_lossy()))
                .map(|(_, i)| i)
                .max()
                .unwrap_or(0)
        })
        .unwrap_or(0)
}

fn count_files(dir: &Path) -> usize {
    walkdir::WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count()
}

fn report_state(
    index: u32,
    dir: &Path,
    expected_seed: Option<u64>,
    responses: &[(u32, Option<Vec<u8>>)],
) -> (DerivedState, Option<ReportEntry>) {
    let path = dir.join(layout::report_file_name(index));
    let bytes = match fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return (DerivedState::Missing, None),
        Err(e) => return (DerivedState::Unparsable(e.to_string()), None),
    };
    let text = match String::from_utf8(bytes) {
        Ok(t) => t,
        Err(_) => {
            return (
                DerivedState::Unparsable("not valid UTF-8".to_string()),
                None,
            )
        }
    };
    let report = match ReplicationReport::parse(&text) {
        Ok(r) => r,
        Err(e) => return (DerivedState::Unparsable(e.to_string()), None),
    };
    if report.replication != index {
        return (
            DerivedState::Unparsable(format!(
                "report belongs to replication {}",
                report.replication
            )),
            None,
        );
    }
    let entry = ReportEntry {
        report_sha256: sha256_bytes(text.as_bytes()),
        report,
    };

    let seed_matches = expected_seed.map_or(true, |s| s == entry.report.seed);
    let trials_match = entry.report.trials.len() == responses.len()
        && responses.iter().all(|(trial, bytes)| match bytes {
            Some(b) => entry.report.response_hash(*trial) == Some(sha256_bytes(b).as_str()),
            None => false,
        });
    if seed_matches && trials_match {
        (DerivedState::Fresh, Some(entry))
    } else {
        (DerivedState::Stale, Some(entry))
    }
}

fn scan_replication(
    experiment: &Path,
    index: u32,
    trials: u32,
    expected_seed: Option<u64>,
    structural: &mut Vec<StructuralIssue>,
) -> ReplicationInventory {
    let name = layout::replication_dir_name(index);
    let dir = experiment.join(&name);
    if !dir.is_dir() {
        return ReplicationInventory {
            index,
            dir,
            dir_present: false,
            file_count: 0,
            trials: Vec::new(),
            report: DerivedState::Missing,
            parsed_report: None,
        };
    }
    if dir.join(layout::LEGACY_REPORT).exists() {
        structural.push(StructuralIssue::LegacyReport { dir: name });
    }

    let mut trial_inv = Vec::with_capacity(trials as usize);
    let mut responses = Vec::with_capacity(trials as usize);
    for trial in 1..=trials {
        let (query, _) = raw_file_state(&dir.join(layout::query_file_name(trial)));
        let (response, bytes) = raw_file_state(&dir.join(layout::response_file_name(trial)));
        trial_inv.push(TrialInventory {
            trial,
            query,
            response,
        });
        responses.push((trial, bytes));
    }
    let (report, parsed_report) = report_state(index, &dir, expected_seed, &responses);
    debug!(replication = index, report = ?report, "scanned replication");
    ReplicationInventory {
        index,
        file_count: count_files(&dir),
        dir,
        dir_present: true,
        trials: trial_inv,
        report,
        parsed_report,
    }
}

fn scan_aggregates(experiment: &Path, reports: Option<Vec<ReportEntry>>) -> AggregateInventory {
    let results_path = experiment.join(layout::EXPERIMENT_RESULTS);
    let log_path = experiment.join(layout::BATCH_RUN_LOG);
    let rendered = reports.and_then(|entries| {
        Some((
            render_experiment_results(&entries).ok()?,
            render_batch_log(&entries).ok()?,
        ))
    });
    match rendered {
        Some((results, batch_log)) => AggregateInventory {
            results: check_aggregate(&results_path, &results, &RESULTS_HEADER),
            batch_log: check_aggregate(&log_path, &batch_log, &BATCH_LOG_HEADER),
            evaluated: true,
        },
        None => {
            let presence = |p: &Path| {
                if p.exists() {
                    DerivedState::Stale
                } else {
                    DerivedState::Missing
                }
            };
            AggregateInventory {
                results: presence(&results_path),
                batch_log: presence(&log_path),
                evaluated: false,
            }
        }
    }
}

/// Builds the inventory of the experiment at `path`.
pub fn scan(path: &Path) -> Result<ExperimentInventory> {
    if !path.is_dir() {
        return Err(LabError::io(
            path,
            io::Error::new(io::ErrorKind::NotFound, "experiment directory not found"),
        )
        .into());
    }
    let mut structural = Vec::new();
    let snapshot = match ConfigSnapshot::load(path) {
        Ok(s) => Some(s),
        Err(LabError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
            structural.push(StructuralIssue::SnapshotMissing);
            None
        }
        Err(e) => {
            structural.push(StructuralIssue::SnapshotInvalid {
                message: e.to_string(),
            });
            None
        }
    };
    if let Some(s) = &snapshot {
        if !s.is_current() {
            structural.push(StructuralIssue::SchemaOutdated {
                found: s.schema_version,
                current: CURRENT_SCHEMA_VERSION,
            });
        }
    }

    let subdirs = list_subdirs(path)?;
    let highest_on_disk = subdirs.iter().filter_map(|d| d.kind.index()).max().unwrap_or(0);
    let expected_replications = snapshot
        .as_ref()
        .map(|s| s.num_replications)
        .unwrap_or(highest_on_disk);

    let mut found_dirs = Vec::new();
    for d in &subdirs {
        let Some(index) = d.kind.index() else { continue };
        found_dirs.push(d.name.clone());
        if d.kind.is_legacy() {
            structural.push(StructuralIssue::LegacyDirectory {
                name: d.name.clone(),
                index,
            });
        } else if index == 0 || index > expected_replications {
            structural.push(StructuralIssue::ReplicationOutOfRange {
                name: d.name.clone(),
                index,
                expected: expected_replications,
            });
        }
    }

    let expected_trials = match &snapshot {
        Some(s) => s.num_trials,
        None => subdirs
            .iter()
            .filter(|d| d.kind.index().is_some())
            .map(|d| highest_trial_index(&path.join(&d.name)))
            .max()
            .unwrap_or(0),
    };

    let replications: Vec<ReplicationInventory> = (1..=expected_replications)
        .map(|index| {
            let seed = snapshot.as_ref().map(|s| s.seed_for(index));
            scan_replication(path, index, expected_trials, seed, &mut structural)
        })
        .collect();

    let mut inventory = ExperimentInventory {
        path: path.to_path_buf(),
        snapshot,
        expected_replications,
        expected_trials,
        found_dirs,
        replications,
        structural,
        aggregates: AggregateInventory {
            results: DerivedState::Missing,
            batch_log: DerivedState::Missing,
            evaluated: false,
        },
    };
    inventory.aggregates = scan_aggregates(path, inventory.fresh_reports());
    Ok(inventory)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_snapshot(dir: &Path, replications: u32, trials: u32) {
        fs::write(
            dir.join(layout::CONFIG_SNAPSHOT),
            format!(
                "[Study]\nschema_version = 2\nnum_replications = {}\nnum_trials = {}\nbase_seed = 10\n",
                replications, trials
            ),
        )
        .expect("snapshot");
    }

    #[test]
    fn missing_and_empty_files_are_facts_not_errors() {
        let tmp = tempfile::tempdir().expect("tmp");
        write_snapshot(tmp.path(), 2, 2);
        let rep = tmp.path().join("replication_001");
        fs::create_dir_all(&rep).expect("rep");
        fs::write(rep.join("query_001.txt"), "q1").expect("q");
        fs::write(rep.join("response_001.txt"), "  \n").expect("r");
        fs::write(rep.join("query_002.txt"), [0xff, 0xfe]).expect("q2");

        let inv = scan(tmp.path()).expect("scan");
        assert!(inv.structural.is_empty(), "{:?}", inv.structural);
        assert_eq!(inv.replications.len(), 2);
        let r1 = inv.replication(1).expect("r1");
        assert_eq!(r1.trials[0].query, RawFileState::Present);
        assert_eq!(r1.trials[0].response, RawFileState::Empty);
        assert!(matches!(r1.trials[1].query, RawFileState::Unparsable(_)));
        assert_eq!(r1.trials[1].response, RawFileState::Missing);
        assert_eq!(r1.report, DerivedState::Missing);
        assert_eq!(r1.file_count, 3);
        assert!(!inv.replication(2).expect("r2").dir_present);
        assert!(!inv.aggregates.evaluated);
    }

    #[test]
    fn unreadable_snapshot_falls_back_to_disk_indices() {
        let tmp = tempfile::tempdir().expect("tmp");
        fs::write(tmp.path().join(layout::CONFIG_SNAPSHOT), "not ini at all").expect("snap");
        for name in ["replication_001", "replication_003"] {
            let dir = tmp.path().join(name);
            fs::create_dir_all(&dir).expect("dir");
            fs::write(dir.join("response_004.txt"), "x").expect("resp");
        }
        let inv = scan(tmp.path()).expect("scan");
        assert_eq!(inv.expected_replications, 3);
        assert_eq!(inv.expected_trials, 4);
        assert!(matches!(
            inv.structural[0],
            StructuralIssue::SnapshotInvalid { .. }
        ));
    }

    #[test]
    fn legacy_and_out_of_range_directories_are_structural() {
        let tmp = tempfile::tempdir().expect("tmp");
        write_snapshot(tmp.path(), 2, 1);
        for name in ["run_1", "replication_2", "replication_005", "analysis"] {
            fs::create_dir_all(tmp.path().join(name)).expect("dir");
        }
        let inv = scan(tmp.path()).expect("scan");
        assert_eq!(
            inv.found_dirs,
            vec!["run_1".to_string(), "replication_2".to_string(), "replication_005".to_string()]
        );
        assert_eq!(
            inv.structural,
            vec![
                StructuralIssue::LegacyDirectory {
                    name: "run_1".to_string(),
                    index: 1
                },
                StructuralIssue::LegacyDirectory {
                    name: "replication_2".to_string(),
                    index: 2
                },
                StructuralIssue::ReplicationOutOfRange {
                    name: "replication_005".to_string(),
                    index: 5,
                    expected: 2
                },
            ]
        );
    }

    #[test]
    fn scanning_a_missing_directory_is_an_error() {
        let tmp = tempfile::tempdir().expect("tmp");
        assert!(scan(&tmp.path().join("nope")).is_err());
    }
}
