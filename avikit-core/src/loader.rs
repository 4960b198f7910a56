//! Codec Library Loader
//!
//! Resolves codec shared libraries at runtime. An explicit path from the
//! config is tried first, then the platform's usual library names through
//! the system search path.
//!
//! Each library is resolved at most once per process. The first caller does
//! the work while concurrent callers wait; a failed load is remembered and
//! never retried.

use std::path::PathBuf;
use std::sync::OnceLock;

use crate::config::CodecConfig;
use crate::error::{CodecError, Result};

/// Library loading result
#[derive(Debug)]
pub struct LoadedLibrary {
    pub path: PathBuf,
    pub library: libloading::Library,
}

/// Candidate locations for libtiff, in search order.
pub fn libtiff_candidates(config: &CodecConfig) -> Vec<PathBuf> {
    config
        .libtiff_path
        .iter()
        .cloned()
        .chain(config.libtiff_names.iter().map(PathBuf::from))
        .collect()
}

/// Load the first candidate that opens.
///
/// Candidates with a directory component must exist on disk. Bare names go
/// through the platform loader's search path.
pub fn load_first(candidates: &[PathBuf]) -> std::result::Result<LoadedLibrary, String> {
    let mut errors = Vec::new();

    for path in candidates {
        let explicit = path.components().count() > 1;
        if explicit && !path.exists() {
            errors.push(format!("{}: not found", path.display()));
            continue;
        }

        match unsafe { libloading::Library::new(path) } {
            Ok(library) => {
                return Ok(LoadedLibrary { path: path.clone(), library });
            }
            Err(e) => errors.push(format!("{}: {}", path.display(), e)),
        }
    }

    Err(format!("no candidate could be loaded ({})", errors.join("; ")))
}

/// A library resolved once per process, success or failure.
pub struct LazyLibrary<T> {
    name: &'static str,
    cell: OnceLock<Option<T>>,
}

impl<T> LazyLibrary<T> {
    pub const fn new(name: &'static str) -> Self {
        Self { name, cell: OnceLock::new() }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Resolve with `load` on first use. Later calls return the cached
    /// outcome without running `load`.
    pub fn get_or_load<F>(&self, load: F) -> Result<&T>
    where
        F: FnOnce() -> std::result::Result<T, String>,
    {
        self.cell
            .get_or_init(|| match load() {
                Ok(lib) => {
                    tracing::info!("{} loaded successfully", self.name);
                    Some(lib)
                }
                Err(e) => {
                    tracing::warn!("Failed to load {}: {}", self.name, e);
                    None
                }
            })
            .as_ref()
            .ok_or_else(|| CodecError::Unavailable(format!("{} could not be loaded", self.name)))
    }

    /// `None` until the first load attempt finishes.
    pub fn is_available(&self) -> Option<bool> {
        self.cell.get().map(Option::is_some)
    }
}

// ============================================================================
// Tests
// ============================================================================
