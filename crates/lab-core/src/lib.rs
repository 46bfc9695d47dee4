//! Shared building blocks for the experiment lifecycle tools: the on-disk
//! layout contract, the per-experiment config snapshot, the audit verdict
//! and filesystem helpers.

pub mod error;
pub mod fsio;
pub mod layout;
pub mod snapshot;
pub mod verdict;

pub use error::{LabError, Result};
pub use fsio::{atomic_write_bytes, ensure_dir, sha256_bytes, sha256_file, tree_digest};
pub use snapshot::{
    load_global_config, ConfigSnapshot, IniDocument, SnapshotOverrides, CURRENT_SCHEMA_VERSION,
};
pub use verdict::Verdict;
