//! Persisted dynamic cluster configuration
//!
//! The node set can change at runtime (failover, scale-out), so it lives in
//! its own JSON document next to the static config. Writes go through a
//! temp-file-then-rename sequence with the previous version kept as `.bak`;
//! reloads fall back to the backup on a corrupt primary and to an empty
//! document when both copies are unreadable.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::topology::NodeDescriptor;

use super::ConfigError;

/// The persisted document: the cluster's node descriptors.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClusterDocument {
    #[serde(default)]
    pub nodes: Vec<NodeDescriptor>,
}

impl ClusterDocument {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Handle for loading and atomically rewriting the cluster document.
pub struct DynamicConfig {
    path: PathBuf,
}

impl DynamicConfig {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn backup_path(&self) -> PathBuf {
        let mut p = self.path.clone().into_os_string();
        p.push(".bak");
        PathBuf::from(p)
    }

    fn temp_path(&self) -> PathBuf {
        let mut p = self.path.clone().into_os_string();
        p.push(".tmp");
        PathBuf::from(p)
    }

    /// Load the document, falling back to the backup and then to an empty
    /// document rather than failing startup.
    pub fn load(&self) -> ClusterDocument {
        match Self::read_document(&self.path) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Primary cluster document unreadable, trying backup"
                );
                match Self::read_document(&self.backup_path()) {
                    Ok(doc) => {
                        info!(
                            path = %self.backup_path().display(),
                            nodes = doc.nodes.len(),
                            "Recovered cluster document from backup"
                        );
                        doc
                    }
                    Err(e) => {
                        warn!(
                            path = %self.backup_path().display(),
                            error = %e,
                            "Backup cluster document unreadable, starting empty"
                        );
                        ClusterDocument::default()
                    }
                }
            }
        }
    }

    fn read_document(path: &Path) -> Result<ClusterDocument, String> {
        let content = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        serde_json::from_str(&content).map_err(|e| e.to_string())
    }

    /// Persist the document: write to a temp file, rotate the current file
    /// to `.bak`, then rename the temp file into place. A crash at any step
    /// leaves either the old document or the old backup intact.
    pub fn save(&self, doc: &ClusterDocument) -> Result<(), ConfigError> {
        let serialized = serde_json::to_string_pretty(doc)?;

        let tmp = self.temp_path();
        std::fs::write(&tmp, serialized)?;

        if self.path.exists() {
            std::fs::rename(&self.path, self.backup_path())?;
        }
        std::fs::rename(&tmp, &self.path)?;

        info!(
            path = %self.path.display(),
            nodes = doc.nodes.len(),
            "Persisted cluster document"
        );
        Ok(())
    }
}
