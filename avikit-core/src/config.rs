//! # Configuration
//!
//! Parser limits and codec library lookup. Loaded from an optional JSON file,
//! then overridden from the environment:
//!
//! - `AVIKIT_LIBTIFF`: explicit path to the libtiff shared object
//! - `AVIKIT_MAX_DEPTH`: maximum RIFF list nesting depth

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_LIBTIFF: &str = "AVIKIT_LIBTIFF";
pub const ENV_MAX_DEPTH: &str = "AVIKIT_MAX_DEPTH";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvikitConfig {
    pub riff: RiffConfig,
    pub codec: CodecConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiffConfig {
    /// Lists nested deeper than this are rejected as malformed.
    pub max_depth: usize,
}

impl Default for RiffConfig {
    fn default() -> Self {
        Self { max_depth: 16 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Tried before `libtiff_names` when set.
    pub libtiff_path: Option<PathBuf>,
    pub libtiff_names: Vec<String>,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            libtiff_path: None,
            libtiff_names: default_libtiff_names(),
        }
    }
}

fn default_libtiff_names() -> Vec<String> {
    #[cfg(target_os = "windows")]
    let names: &[&str] = &["libtiff.dll", "tiff.dll", "libtiff-6.dll", "libtiff-5.dll"];
    #[cfg(target_os = "macos")]
    let names: &[&str] = &["libtiff.6.dylib", "libtiff.5.dylib", "libtiff.dylib"];
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    let names: &[&str] = &["libtiff.so.6", "libtiff.so.5", "libtiff.so"];

    names.iter().map(|s| s.to_string()).collect()
}

impl AvikitConfig {
    /// Defaults plus environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Read a JSON config file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
        let mut config: Self = serde_json::from_str(&text)
            .map_err(|e| format!("Invalid config {}: {}", path.display(), e))?;
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        self.apply_overrides(
            std::env::var_os(ENV_LIBTIFF).map(PathBuf::from),
            std::env::var(ENV_MAX_DEPTH).ok(),
        );
    }

    fn apply_overrides(&mut self, libtiff: Option<PathBuf>, max_depth: Option<String>) {
        if let Some(path) = libtiff {
            self.codec.libtiff_path = Some(path);
        }
        if let Some(raw) = max_depth {
            match raw.trim().parse::<usize>() {
                Ok(depth) if depth > 0 => self.riff.max_depth = depth,
                _ => tracing::warn!("Ignoring invalid {}={:?}", ENV_MAX_DEPTH, raw),
            }
        }
    }
}
