use std::fs;
use std::io;
use std::path::Path;

use serde::Serialize;

use crate::report::ReplicationReport;

pub const RESULTS_HEADER: [&str; 5] = ["replication", "seed", "trial", "score", "response_sha256"];
pub const BATCH_LOG_HEADER: [&str; 5] = ["replication", "seed", "trials", "status", "report_sha256"];

const EXPERIMENT_COLUMN: &str = "experiment";
const COMPLETE: &str = "complete";

/// Condition of a locally derived file (report or aggregate).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum DerivedState {
    Fresh,
    Missing,
    /// Readable, but built from inputs that no longer match.
    Stale,
    Unparsable(String),
}

impl DerivedState {
    pub fn is_fresh(&self) -> bool {
        matches!(self, DerivedState::Fresh)
    }
}

/// A parsed replication report together with the digest of its file.
#[derive(Debug, Clone)]
pub struct ReportEntry {
    pub report: ReplicationReport,
    pub report_sha256: String,
}

fn sorted(entries: &[ReportEntry]) -> Vec<&ReportEntry> {
    let mut refs: Vec<&ReportEntry> = entries.iter().collect();
    refs.sort_by_key(|e| e.report.replication);
    refs
}

fn result_rows(entries: &[ReportEntry]) -> Vec<[String; 5]> {
    let mut rows = Vec::new();
    for entry in sorted(entries) {
        let r = &entry.report;
        for t in &r.trials {
            rows.push([
                r.replication.to_string(),
                r.seed.to_string(),
                t.trial.to_string(),
                t.score.clone().unwrap_or_else(|| "NA".to_string()),
                t.response_sha256.clone(),
            ]);
        }
    }
    rows
}

fn batch_rows(entries: &[ReportEntry]) -> Vec<[String; 5]> {
    sorted(entries)
        .into_iter()
        .map(|entry| {
            [
                entry.report.replication.to_string(),
                entry.report.seed.to_string(),
                entry.report.trials.len().to_string(),
                COMPLETE.to_string(),
                entry.report_sha256.clone(),
            ]
        })
        .collect()
}

fn write_csv<R: AsRef<[String]>>(header: &[&str], rows: &[(Option<&str>, R)]) -> csv::Result<Vec<u8>> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    wtr.write_record(header)?;
    for (prefix, row) in rows {
        match prefix {
            Some(p) => {
                let mut record = vec![p.to_string()];
                record.extend(row.as_ref().iter().cloned());
                wtr.write_record(&record)?;
            }
            None => wtr.write_record(row.as_ref())?,
        }
    }
    wtr.into_inner()
        .map_err(|e| csv::Error::from(io::Error::new(io::ErrorKind::Other, e.to_string())))
}

pub fn render_experiment_results(entries: &[ReportEntry]) -> csv::Result<Vec<u8>> {
    let rows: Vec<_> = result_rows(entries).into_iter().map(|r| (None, r)).collect();
    write_csv(&RESULTS_HEADER, &rows)
}

pub fn render_batch_log(entries: &[ReportEntry]) -> csv::Result<Vec<u8>> {
    let rows: Vec<_> = batch_rows(entries).into_iter().map(|r| (None, r)).collect();
    write_csv(&BATCH_LOG_HEADER, &rows)
}

/// Header of a study-level table: `experiment` followed by `base`.
pub fn study_header(base: &[&'static str]) -> Vec<&'static str> {
    let mut header = vec![EXPERIMENT_COLUMN];
    header.extend_from_slice(base);
    header
}

/// Master results table: every experiment's result rows, prefixed with the
/// experiment name, in the order given.
pub fn render_study_results(experiments: &[(String, Vec<ReportEntry>)]) -> csv::Result<Vec<u8>> {
    let mut rows = Vec::new();
    for (name, entries) in experiments {
        for row in result_rows(entries) {
            rows.push((Some(name.as_str()), row));
        }
    }
    write_csv(&study_header(&RESULTS_HEADER), &rows)
}

pub fn render_study_batch_log(experiments: &[(String, Vec<ReportEntry>)]) -> csv::Result<Vec<u8>> {
    let mut rows = Vec::new();
    for (name, entries) in experiments {
        for row in batch_rows(entries) {
            rows.push((Some(name.as_str()), row));
        }
    }
    write_csv(&study_header(&BATCH_LOG_HEADER), &rows)
}

/// Compares an on-disk aggregate against its expected rendering. A file that
/// differs is `Stale` when it is still well-formed CSV with the expected
/// header and `Unparsable` otherwise.
pub fn check_aggregate(path: &Path, expected: &[u8], header: &[&str]) -> DerivedState {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return DerivedState::Missing,
        Err(e) => return DerivedState::Unparsable(e.to_string()),
    };
    if bytes == expected {
        return DerivedState::Fresh;
    }
    let mut rdr = csv::Reader::from_reader(bytes.as_slice());
    match rdr.headers() {
        Ok(h) if h.iter().eq(header.iter().copied()) => {}
        Ok(h) => {
            return DerivedState::Unparsable(format!(
                "unexpected header: {}",
                h.iter().collect::<Vec<_>>().join(",")
            ))
        }
        Err(e) => return DerivedState::Unparsable(e.to_string()),
    }
    for record in rdr.records() {
        if let Err(e) = record {
            return DerivedState::Unparsable(e.to_string());
        }
    }
    DerivedState::Stale
}
