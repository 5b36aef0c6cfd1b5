//! Engine-wide configuration, loadable from TOML (SPEC_FULL.md §B).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::gc::GcConfig;

/// Top-level configuration for an embedding application. `gc` is the only
/// section with engine-meaningful defaults; everything else here exists so
/// a single TOML file can describe a whole deployment, the way the teacher's
/// own config carries unrelated sibling sections side by side.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub gc: GcConfig,
    /// Name of the branch a fresh store bootstraps (spec §4.3: `"main"`).
    #[serde(default = "default_branch")]
    pub default_branch: String,
}

fn default_branch() -> String {
    "main".to_string()
}

impl EngineConfig {
    /// Parses a TOML document into an `EngineConfig`.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|err| EngineError::InvalidArgument(format!("invalid config: {err}")))
    }

    /// Reads and parses a TOML file from disk.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|err| EngineError::Storage(format!("reading {}: {err}", path.as_ref().display())))?;
        Self::from_toml_str(&raw)
    }
}
