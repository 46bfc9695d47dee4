use std::fmt;

use serde::{Deserialize, Serialize};

/// Health classification of an experiment (or a whole study).
///
/// Variants are declared from least to most severe, so the derived ordering
/// is the severity ordering and `max` picks the verdict that must be handled
/// first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    AllValid,
    NeedsAggregation,
    NeedsReprocess,
    NeedsRepair,
    NeedsMigration,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::AllValid => "ALL_VALID",
            Verdict::NeedsAggregation => "NEEDS_AGGREGATION",
            Verdict::NeedsReprocess => "NEEDS_REPROCESS",
            Verdict::NeedsRepair => "NEEDS_REPAIR",
            Verdict::NeedsMigration => "NEEDS_MIGRATION",
        }
    }

    pub fn is_valid(self) -> bool {
        self == Verdict::AllValid
    }

    /// Most severe verdict of the iterator, `AllValid` when empty.
    pub fn worst<I: IntoIterator<Item = Verdict>>(verdicts: I) -> Verdict {
        verdicts.into_iter().max().unwrap_or(Verdict::AllValid)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_follows_audit_priority() {
        assert!(Verdict::NeedsMigration > Verdict::NeedsRepair);
        assert!(Verdict::NeedsRepair > Verdict::NeedsReprocess);
        assert!(Verdict::NeedsReprocess > Verdict::NeedsAggregation);
        assert!(Verdict::NeedsAggregation > Verdict::AllValid);
        assert_eq!(
            Verdict::worst([Verdict::AllValid, Verdict::NeedsReprocess, Verdict::NeedsRepair]),
            Verdict::NeedsRepair
        );
        assert_eq!(Verdict::worst([]), Verdict::AllValid);
    }
}
