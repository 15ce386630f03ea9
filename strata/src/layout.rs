use crate::errors::{StrataError, StrataResult};
use std::path::{Path, PathBuf};

/// Directory structure constants
pub mod dirs {
    /// Base directory name for strata data under the user's home
    pub const STRATA_DIR: &str = ".strata";

    /// Subdirectory holding the layer store
    pub const GRAPH_DIR: &str = "graph";

    /// Subdirectory for unpacked layer contents
    pub const LAYERS_DIR: &str = "layers";

    /// Subdirectory for per-layer metadata records
    pub const METADATA_DIR: &str = "metadata";
}

// ============================================================================
// STORE LAYOUT
// ============================================================================

/// Filesystem layout of a `DirectoryLayerStore`.
///
/// ```text
/// <root>/
/// ├── layers/
/// │   ├── {graph_id}/                       # unpacked layer contents
/// │   └── {graph_id}.{uuid}.registering/    # in-flight registration
/// └── metadata/
///     └── {graph_id}.json                   # StoredLayer record
/// ```
#[derive(Clone, Debug)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Layers directory: <root>/layers
    pub fn layers_dir(&self) -> PathBuf {
        self.root.join(dirs::LAYERS_DIR)
    }

    /// Metadata directory: <root>/metadata
    pub fn metadata_dir(&self) -> PathBuf {
        self.root.join(dirs::METADATA_DIR)
    }

    pub fn layer_dir(&self, graph_id: &str) -> PathBuf {
        self.layers_dir().join(graph_id)
    }

    pub fn metadata_path(&self, graph_id: &str) -> PathBuf {
        self.metadata_dir().join(format!("{}.json", graph_id))
    }

    /// Prepare the store directory structure.
    pub fn prepare(&self) -> StrataResult<()> {
        std::fs::create_dir_all(self.layers_dir())
            .map_err(|e| StrataError::Storage(format!("failed to create layers dir: {e}")))?;

        std::fs::create_dir_all(self.metadata_dir())
            .map_err(|e| StrataError::Storage(format!("failed to create metadata dir: {e}")))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_paths() {
        let layout = StoreLayout::new(PathBuf::from("/var/strata/graph"));
        assert_eq!(layout.layer_dir("abc"), PathBuf::from("/var/strata/graph/layers/abc"));
        assert_eq!(
            layout.metadata_path("abc"),
            PathBuf::from("/var/strata/graph/metadata/abc.json")
        );
    }

    #[test]
    fn test_prepare_creates_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let layout = StoreLayout::new(temp_dir.path().join("graph"));
        layout.prepare().unwrap();

        assert!(layout.layers_dir().is_dir());
        assert!(layout.metadata_dir().is_dir());

        // Idempotent
        layout.prepare().unwrap();
    }
}
