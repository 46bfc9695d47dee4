use lab_core::sha256_bytes;
use thiserror::Error;

const REPORT_MAGIC: &str = "# replication report v1";
const TABLE_HEADER: &str = "trial,response_sha256,response_bytes,score";
const NO_SCORE: &str = "NA";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReportError {
    #[error("missing report header line")]
    MissingHeader,
    #[error("missing or malformed field '{0}'")]
    BadField(&'static str),
    #[error("line {line}: {message}")]
    BadRow { line: usize, message: String },
    #[error("report declares {declared} trials but lists {found}")]
    TrialCount { declared: usize, found: usize },
}

/// What a report records about one trial's response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialRecord {
    pub trial: u32,
    pub response_sha256: String,
    pub response_bytes: u64,
    pub score: Option<String>,
}

impl TrialRecord {
    pub fn from_response(trial: u32, bytes: &[u8]) -> Self {
        TrialRecord {
            trial,
            response_sha256: sha256_bytes(bytes),
            response_bytes: bytes.len() as u64,
            score: first_number(&String::from_utf8_lossy(bytes)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationReport {
    pub replication: u32,
    pub seed: u64,
    pub trials: Vec<TrialRecord>,
}

/// Builds the report for one replication from its response files, given as
/// `(trial index, raw bytes)`.
pub fn extract_report(replication: u32, seed: u64, responses: &[(u32, Vec<u8>)]) -> ReplicationReport {
    let mut trials: Vec<TrialRecord> = responses
        .iter()
        .map(|(trial, bytes)| TrialRecord::from_response(*trial, bytes))
        .collect();
    trials.sort_by_key(|t| t.trial);
    ReplicationReport {
        replication,
        seed,
        trials,
    }
}

impl ReplicationReport {
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(REPORT_MAGIC);
        out.push('\n');
        out.push_str(&format!("replication: {}\n", self.replication));
        out.push_str(&format!("seed: {}\n", self.seed));
        out.push_str(&format!("trials: {}\n", self.trials.len()));
        out.push_str(TABLE_HEADER);
        out.push('\n');
        for t in &self.trials {
            out.push_str(&format!(
                "{},{},{},{}\n",
                t.trial,
                t.response_sha256,
                t.response_bytes,
                t.score.as_deref().unwrap_or(NO_SCORE)
            ));
        }
        out
    }

    pub fn parse(text: &str) -> Result<Self, ReportError> {
        let mut lines = text.lines().enumerate();
        match lines.next() {
            Some((_, l)) if l.trim() == REPORT_MAGIC => {}
            _ => return Err(ReportError::MissingHeader),
        }
        let replication = header_field(lines.next(), "replication")?;
        let seed = header_field(lines.next(), "seed")?;
        let declared: usize = header_field(lines.next(), "trials")?;
        match lines.next() {
            Some((_, l)) if l.trim() == TABLE_HEADER => {}
            _ => return Err(ReportError::BadField("table header")),
        }

        let mut trials = Vec::new();
        for (idx, raw) in lines {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            trials.push(parse_row(line).map_err(|message| ReportError::BadRow {
                line: idx + 1,
                message,
            })?);
        }
        if trials.len() != declared {
            return Err(ReportError::TrialCount {
                declared,
                found: trials.len(),
            });
        }
        Ok(ReplicationReport {
            replication,
            seed,
            trials,
        })
    }

    pub fn response_hash(&self, trial: u32) -> Option<&str> {
        self.trials
            .iter()
            .find(|t| t.trial == trial)
            .map(|t| t.response_sha256.as_str())
    }
}

fn header_field<T: std::str::FromStr>(
    line: Option<(usize, &str)>,
    name: &'static str,
) -> Result<T, ReportError> {
    line.and_then(|(_, l)| l.split_once(':'))
        .filter(|(k, _)| k.trim() == name)
        .and_then(|(_, v)| v.trim().parse().ok())
        .ok_or(ReportError::BadField(name))
}

fn parse_row(line: &str) -> Result<TrialRecord, String> {
    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() != 4 {
        return Err(format!("expected 4 columns, found {}", fields.len()));
    }
    let trial = fields[0]
        .parse()
        .map_err(|_| format!("bad trial index '{}'", fields[0]))?;
    let sha = fields[1];
    if sha.len() != 64 || !sha.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("bad response hash '{}'", sha));
    }
    let response_bytes = fields[2]
        .parse()
        .map_err(|_| format!("bad byte count '{}'", fields[2]))?;
    let score = match fields[3] {
        NO_SCORE => None,
        s if first_number(s).as_deref() == Some(s) => Some(s.to_string()),
        s => return Err(format!("bad score '{}'", s)),
    };
    Ok(TrialRecord {
        trial,
        response_sha256: sha.to_string(),
        response_bytes,
        score,
    })
}

/// First decimal number in `text` (optional sign, optional fraction), kept as
/// written so that rendering never reformats it.
pub fn first_number(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let start = bytes.iter().position(u8::is_ascii_digit)?;
    let begin = if start > 0 && bytes[start - 1] == b'-' {
        start - 1
    } else {
        start
    };
    let mut end = start;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end + 1 < bytes.len() && bytes[end] == b'.' && bytes[end + 1].is_ascii_digit() {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
    }
    Some(text[begin..end].to_string())
}
