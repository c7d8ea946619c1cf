//! Mirroring of namespaces into their legacy single-purpose files.
//!
//! Provides the [`StateExporter`] trait. The primary implementation,
//! [`LegacyFileExporter`], writes each namespace to its historical file name
//! under the data directory so older consumers keep working.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::namespace::Namespace;
use super::writer::write_atomic_blocking;
use crate::Result;

/// Receives a namespace's serialized content after every mutation.
///
/// Called on the blocking thread pool, never under the document lock.
pub trait StateExporter: Send + Sync {
    /// Persist the latest content of `namespace`.
    ///
    /// # Errors
    ///
    /// Returns an error if the export could not be written.
    fn export(&self, namespace: Namespace, value: &serde_json::Value) -> Result<()>;
}

/// Writes each namespace to `<dir>/<legacy file name>` atomically.
pub struct LegacyFileExporter {
    dir: PathBuf,
}

impl LegacyFileExporter {
    /// Construct an exporter rooted at `dir`.
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Target file for `namespace`.
    #[must_use]
    pub fn path_for(&self, namespace: Namespace) -> PathBuf {
        legacy_path(&self.dir, namespace)
    }
}

/// Legacy file location of `namespace` under `dir`.
#[must_use]
pub fn legacy_path(dir: &Path, namespace: Namespace) -> PathBuf {
    dir.join(namespace.legacy_file_name())
}

impl StateExporter for LegacyFileExporter {
    fn export(&self, namespace: Namespace, value: &serde_json::Value) -> Result<()> {
        let path = self.path_for(namespace);
        let bytes = serde_json::to_vec_pretty(value)?;
        write_atomic_blocking(&path, &bytes)?;
        debug!(%namespace, path = %path.display(), "legacy file synced");
        Ok(())
    }
}
