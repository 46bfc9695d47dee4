//! Per-experiment configuration snapshot.
//!
//! The snapshot is an INI copy of the process-wide configuration captured when
//! the experiment was created. Audit and repair read replication count, trial
//! count, seeds and the engine command from it and never from the live global
//! file, which may have been edited for other experiments since.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{LabError, Result};
use crate::fsio::atomic_write_bytes;
use crate::layout;

pub const CURRENT_SCHEMA_VERSION: u32 = 2;

const STUDY_SECTION: &str = "Study";
const ENGINE_SECTION: &str = "Engine";

/// Order-preserving INI document. Section names keep their case, keys are
/// lower-cased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IniDocument {
    sections: Vec<(String, Vec<(String, String)>)>,
}

impl IniDocument {
    pub fn parse(text: &str) -> std::result::Result<Self, String> {
        let mut doc = IniDocument::default();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if let Some(rest) = line.strip_prefix('[') {
                let name = rest
                    .strip_suffix(']')
                    .ok_or_else(|| format!("line {}: unterminated section header", lineno + 1))?
                    .trim();
                if name.is_empty() {
                    return Err(format!("line {}: empty section name", lineno + 1));
                }
                doc.sections.push((name.to_string(), Vec::new()));
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .or_else(|| line.split_once(':'))
                .ok_or_else(|| format!("line {}: expected key = value", lineno + 1))?;
            let key = key.trim().to_ascii_lowercase();
            if key.is_empty() {
                return Err(format!("line {}: empty key", lineno + 1));
            }
            let section = doc
                .sections
                .last_mut()
                .ok_or_else(|| format!("line {}: key '{}' outside any section", lineno + 1, key))?;
            section.1.retain(|(k, _)| k != &key);
            section.1.push((key, value.trim().to_string()));
        }
        Ok(doc)
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        let key = key.to_ascii_lowercase();
        self.sections
            .iter()
            .rev()
            .find(|(name, _)| name.eq_ignore_ascii_case(section))
            .and_then(|(_, entries)| entries.iter().find(|(k, _)| *k == key))
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        let key = key.to_ascii_lowercase();
        let value = value.into();
        let idx = match self
            .sections
            .iter()
            .position(|(name, _)| name.eq_ignore_ascii_case(section))
        {
            Some(idx) => idx,
            None => {
                self.sections.push((section.to_string(), Vec::new()));
                self.sections.len() - 1
            }
        };
        let entries = &mut self.sections[idx].1;
        match entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => entries.push((key, value)),
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, (name, entries)) in self.sections.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            out.push_str(&format!("[{}]\n", name));
            for (k, v) in entries {
                out.push_str(&format!("{} = {}\n", k, v));
            }
        }
        out
    }
}

/// Overrides applied when a snapshot is captured from the global config.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotOverrides {
    pub replications: Option<u32>,
    pub trials: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSnapshot {
    pub schema_version: u32,
    pub num_replications: u32,
    pub num_trials: u32,
    pub base_seed: u64,
    pub engine_command: Option<Vec<String>>,
    document: IniDocument,
}

impl ConfigSnapshot {
    pub fn path_in(experiment_dir: &Path) -> PathBuf {
        experiment_dir.join(layout::CONFIG_SNAPSHOT)
    }

    pub fn load(experiment_dir: &Path) -> Result<Self> {
        let path = Self::path_in(experiment_dir);
        let text = fs::read_to_string(&path).map_err(|e| LabError::io(&path, e))?;
        Self::from_ini_str(&text, &path)
    }

    pub fn from_ini_str(text: &str, origin: &Path) -> Result<Self> {
        let document = IniDocument::parse(text).map_err(|m| LabError::snapshot(origin, m))?;
        Self::from_document(document, origin)
    }

    fn from_document(document: IniDocument, origin: &Path) -> Result<Self> {
        // Snapshots written before versioning carry no schema_version key.
        let schema_version = match document.get(STUDY_SECTION, "schema_version") {
            Some(raw) => parse_number::<u32>(raw, "schema_version", origin)?,
            None => 1,
        };
        let num_replications = required_positive(&document, "num_replications", origin)?;
        let num_trials = required_positive(&document, "num_trials", origin)?;
        let base_seed = match document.get(STUDY_SECTION, "base_seed") {
            Some(raw) => parse_number::<u64>(raw, "base_seed", origin)?,
            None => 0,
        };
        let engine_command = document
            .get(ENGINE_SECTION, "command")
            .map(|raw| raw.split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .filter(|parts| !parts.is_empty());
        Ok(ConfigSnapshot {
            schema_version,
            num_replications,
            num_trials,
            base_seed,
            engine_command,
            document,
        })
    }

    /// Builds a snapshot from the global configuration, stamping the current
    /// schema version.
    pub fn capture(global: &IniDocument, overrides: SnapshotOverrides, origin: &Path) -> Result<Self> {
        let mut document = global.clone();
        document.set(STUDY_SECTION, "schema_version", CURRENT_SCHEMA_VERSION.to_string());
        if let Some(r) = overrides.replications {
            document.set(STUDY_SECTION, "num_replications", r.to_string());
        }
        if let Some(t) = overrides.trials {
            document.set(STUDY_SECTION, "num_trials", t.to_string());
        }
        Self::from_document(document, origin)
    }

    pub fn is_current(&self) -> bool {
        self.schema_version == CURRENT_SCHEMA_VERSION
    }

    /// Copy of this snapshot upgraded to the current schema version.
    pub fn upgraded(&self) -> Self {
        let mut next = self.clone();
        next.schema_version = CURRENT_SCHEMA_VERSION;
        next.document
            .set(STUDY_SECTION, "schema_version", CURRENT_SCHEMA_VERSION.to_string());
        next
    }

    pub fn seed_for(&self, replication: u32) -> u64 {
        self.base_seed.wrapping_add(u64::from(replication))
    }

    pub fn document(&self) -> &IniDocument {
        &self.document
    }

    pub fn render(&self) -> String {
        self.document.render()
    }

    pub fn write_to(&self, experiment_dir: &Path) -> Result<()> {
        atomic_write_bytes(&Self::path_in(experiment_dir), self.render().as_bytes())
    }
}

/// Reads a global configuration file. Only experiment creation and snapshot
/// capture during migration call this.
pub fn load_global_config(path: &Path) -> Result<IniDocument> {
    let text = fs::read_to_string(path).map_err(|e| LabError::io(path, e))?;
    IniDocument::parse(&text).map_err(|m| LabError::snapshot(path, m))
}

fn required_positive(doc: &IniDocument, key: &str, origin: &Path) -> Result<u32> {
    let raw = doc
        .get(STUDY_SECTION, key)
        .ok_or_else(|| LabError::snapshot(origin, format!("missing [{}] {}", STUDY_SECTION, key)))?;
    let value = parse_number::<u32>(raw, key, origin)?;
    if value == 0 {
        return Err(LabError::snapshot(origin, format!("{} must be at least 1", key)));
    }
    Ok(value)
}

fn parse_number<T: std::str::FromStr>(raw: &str, key: &str, origin: &Path) -> Result<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| LabError::snapshot(origin, format!("{} is not a number: '{}'", key, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
[Study]
schema_version = 2
num_replications = 3
num_trials = 4
base_seed = 1000

; engine invoked for data repair
[Engine]
command = python3 run_replication.py --fast

[LLM]
model = some-model
";

    #[test]
    fn parses_snapshot_fields() {
        let snap = ConfigSnapshot::from_ini_str(SAMPLE, Path::new("config_snapshot.ini"))
            .expect("parse");
        assert_eq!(snap.schema_version, 2);
        assert_eq!(snap.num_replications, 3);
        assert_eq!(snap.num_trials, 4);
        assert_eq!(snap.seed_for(2), 1002);
        assert_eq!(
            snap.engine_command.as_deref(),
            Some(&["python3".to_string(), "run_replication.py".to_string(), "--fast".to_string()][..])
        );
        assert_eq!(snap.document().get("llm", "MODEL"), Some("some-model"));
        assert!(snap.is_current());
    }

    #[test]
    fn missing_schema_version_reads_as_legacy() {
        let text = "[Study]\nnum_replications = 2\nnum_trials = 1\n";
        let snap = ConfigSnapshot::from_ini_str(text, Path::new("x.ini")).expect("parse");
        assert_eq!(snap.schema_version, 1);
        assert!(!snap.is_current());
        let upgraded = snap.upgraded();
        assert!(upgraded.is_current());
        assert!(upgraded.render().contains("schema_version = 2"));
    }

    #[test]
    fn rejects_malformed_and_incomplete_snapshots() {
        let cases = [
            "num_trials = 1\n",
            "[Study]\nnum_replications = 0\nnum_trials = 1\n",
            "[Study]\nnum_replications = three\nnum_trials = 1\n",
            "[Study]\nnum_replications = 3\n",
            "[Study\nnum_replications = 3\n",
            "[Study]\njust some words\n",
        ];
        for text in cases {
            let err = ConfigSnapshot::from_ini_str(text, Path::new("x.ini"))
                .expect_err(&format!("should reject: {:?}", text));
            assert!(matches!(err, LabError::Snapshot { .. }), "{:?}", err);
        }
    }

    #[test]
    fn capture_applies_overrides_and_renders_round_trippable_text() {
        let global = IniDocument::parse(SAMPLE).expect("global");
        let snap = ConfigSnapshot::capture(
            &global,
            SnapshotOverrides {
                replications: Some(5),
                trials: None,
            },
            Path::new("global.ini"),
        )
        .expect("capture");
        assert_eq!(snap.num_replications, 5);
        let reparsed =
            ConfigSnapshot::from_ini_str(&snap.render(), Path::new("x.ini")).expect("reparse");
        assert_eq!(reparsed, snap);
    }
}
