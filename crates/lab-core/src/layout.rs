//! File and directory naming contract shared by every tool that touches an
//! experiment or study directory.

pub const CONFIG_SNAPSHOT: &str = "config_snapshot.ini";
pub const EXPERIMENT_RESULTS: &str = "EXPERIMENT_results.csv";
pub const BATCH_RUN_LOG: &str = "batch_run_log.csv";
pub const AUDIT_LOG: &str = "experiment_audit_log.txt";
pub const REPAIR_LOG: &str = "experiment_repair_log.txt";

pub const STUDY_RESULTS: &str = "STUDY_results.csv";
pub const STUDY_BATCH_LOG: &str = "STUDY_batch_log.csv";
pub const STUDY_AUDIT_LOG: &str = "study_audit_log.txt";

/// Report name used before reports carried their replication index.
pub const LEGACY_REPORT: &str = "report.txt";

const REPLICATION_PREFIX: &str = "replication_";
const LEGACY_RUN_PREFIX: &str = "run_";

pub fn replication_dir_name(index: u32) -> String {
    format!("{}{:03}", REPLICATION_PREFIX, index)
}

pub fn report_file_name(index: u32) -> String {
    format!("report_{:03}.txt", index)
}

pub fn query_file_name(trial: u32) -> String {
    format!("query_{:03}.txt", trial)
}

pub fn response_file_name(trial: u32) -> String {
    format!("response_{:03}.txt", trial)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialFile {
    Query,
    Response,
}

/// Parses `query_TTT.txt` / `response_TTT.txt` into kind and trial index.
pub fn parse_trial_file(name: &str) -> Option<(TrialFile, u32)> {
    let stem = name.strip_suffix(".txt")?;
    let (kind, digits) = if let Some(d) = stem.strip_prefix("query_") {
        (TrialFile::Query, d)
    } else if let Some(d) = stem.strip_prefix("response_") {
        (TrialFile::Response, d)
    } else {
        return None;
    };
    parse_index(digits).map(|i| (kind, i))
}

/// Files inside an experiment directory that are outputs of the audit and
/// repair tools themselves rather than experiment data.
pub fn is_tool_log(name: &str) -> bool {
    name == AUDIT_LOG || name == REPAIR_LOG
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirKind {
    /// `replication_NNN`, the current naming scheme.
    Replication(u32),
    /// `run_<n>` from the original layout.
    LegacyRun(u32),
    /// `replication_<n>` without zero padding.
    UnpaddedReplication(u32),
    Other,
}

impl DirKind {
    pub fn index(self) -> Option<u32> {
        match self {
            DirKind::Replication(i) | DirKind::LegacyRun(i) | DirKind::UnpaddedReplication(i) => {
                Some(i)
            }
            DirKind::Other => None,
        }
    }

    pub fn is_legacy(self) -> bool {
        matches!(self, DirKind::LegacyRun(_) | DirKind::UnpaddedReplication(_))
    }
}

pub fn classify_dir_name(name: &str) -> DirKind {
    if let Some(digits) = name.strip_prefix(REPLICATION_PREFIX) {
        return match parse_index(digits) {
            Some(index) if replication_dir_name(index) == name => DirKind::Replication(index),
            Some(index) => DirKind::UnpaddedReplication(index),
            None => DirKind::Other,
        };
    }
    if let Some(digits) = name.strip_prefix(LEGACY_RUN_PREFIX) {
        if let Some(index) = parse_index(digits) {
            return DirKind::LegacyRun(index);
        }
    }
    DirKind::Other
}

fn parse_index(digits: &str) -> Option<u32> {
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Sort key that orders `exp_2` before `exp_10`: the name split into its
/// leading text and trailing number, with the full name as a tiebreaker.
pub fn natural_key(name: &str) -> (String, Option<u64>, String) {
    let split = name
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i)
        .unwrap_or(name.len());
    let (prefix, digits) = name.split_at(split);
    (prefix.to_string(), digits.parse().ok(), name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_recognises_modern_and_legacy_names() {
        assert_eq!(classify_dir_name("replication_001"), DirKind::Replication(1));
        assert_eq!(classify_dir_name("replication_1234"), DirKind::Replication(1234));
        assert_eq!(classify_dir_name("replication_1"), DirKind::UnpaddedReplication(1));
        assert_eq!(classify_dir_name("replication_0007"), DirKind::UnpaddedReplication(7));
        assert_eq!(classify_dir_name("run_3"), DirKind::LegacyRun(3));
        assert_eq!(classify_dir_name("run_x"), DirKind::Other);
        assert_eq!(classify_dir_name("analysis"), DirKind::Other);
    }

    #[test]
    fn parse_trial_file_reads_kind_and_index() {
        assert_eq!(parse_trial_file("query_004.txt"), Some((TrialFile::Query, 4)));
        assert_eq!(parse_trial_file("response_12.txt"), Some((TrialFile::Response, 12)));
        assert_eq!(parse_trial_file("report_001.txt"), None);
        assert_eq!(parse_trial_file("response_.txt"), None);
    }

    #[test]
    fn natural_key_orders_numeric_suffixes() {
        let mut names = vec!["exp_10", "exp_2", "baseline", "exp_1"];
        names.sort_by_key(|n| natural_key(n));
        assert_eq!(names, vec!["baseline", "exp_1", "exp_2", "exp_10"]);
    }
}
