//! Configuration resolution for the `loom` CLI.
//!
//! Resolves the target repository, coordination directory, and engine
//! settings from (in priority order) CLI flags, environment variables, an
//! optional `loom.toml` file discovered from the current directory, and
//! built-in defaults.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use loom_core::EngineConfig;
use loom_store::CoordinationConfig;
use serde::Deserialize;

/// The `[engine]` table in `loom.toml`, deserialized straight into
/// [`EngineConfig`] (every field defaults per spec §6 when absent).
#[derive(Debug, Deserialize)]
struct LoomToml {
    #[serde(default)]
    engine: EngineConfig,
}

/// Fully resolved configuration for a CLI invocation.
#[derive(Debug)]
pub struct ResolvedConfig {
    pub repo_path: PathBuf,
    pub coordination: CoordinationConfig,
    pub engine: EngineConfig,
}

/// Find `loom.toml` by walking up from `start` to the filesystem root.
pub fn find_loom_toml(start: &Path) -> Option<PathBuf> {
    let mut dir = Some(start.to_path_buf());
    while let Some(d) = dir {
        let candidate = d.join("loom.toml");
        if candidate.is_file() {
            return Some(candidate);
        }
        dir = d.parent().map(Path::to_path_buf);
    }
    None
}

impl ResolvedConfig {
    /// Resolve from the environment, an optional `--repo` flag, and an
    /// optional `loom.toml` discovered from the resolved repo path.
    pub fn resolve(repo_flag: Option<&str>) -> Result<Self> {
        let repo_path = if let Some(r) = repo_flag {
            PathBuf::from(r)
        } else if let Ok(r) = std::env::var("LOOM_REPO_PATH") {
            PathBuf::from(r)
        } else {
            std::env::current_dir().context("failed to get current directory")?
        };

        let engine = match find_loom_toml(&repo_path) {
            Some(path) => {
                let contents = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                let parsed: LoomToml = toml::from_str(&contents)
                    .with_context(|| format!("failed to parse {}", path.display()))?;
                parsed.engine
            }
            None => EngineConfig::default(),
        };

        let coordination = if let Ok(dir) = std::env::var("LOOM_COORD_DIR") {
            CoordinationConfig::new(dir)
        } else {
            CoordinationConfig::new(repo_path.join(CoordinationConfig::DEFAULT_DIR))
        };

        Ok(Self {
            repo_path,
            coordination,
            engine,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn find_loom_toml_walks_up() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("loom.toml"), "[engine]\nmax_workers = 2\n").unwrap();

        let found = find_loom_toml(&nested).unwrap();
        assert_eq!(found, dir.path().join("loom.toml"));
    }

    #[test]
    fn find_loom_toml_returns_none_when_absent() {
        let dir = TempDir::new().unwrap();
        assert!(find_loom_toml(dir.path()).is_none());
    }
}
