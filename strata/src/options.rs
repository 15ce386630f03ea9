//! Configuration for strata.

use crate::errors::{StrataError, StrataResult};
use crate::layout::dirs as const_dirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable overriding the default home directory.
pub const STRATA_HOME_ENV: &str = "STRATA_HOME";

/// Registry used when an image reference names no host.
pub const DEFAULT_REGISTRY: &str = "registry-1.docker.io";

/// Options for a `LayerManager`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StrataOptions {
    /// Root of all strata state; the layer store lives in `<home_dir>/graph`.
    ///
    /// Default: `$STRATA_HOME`, else `~/.strata`
    #[serde(default = "default_home_dir")]
    pub home_dir: PathBuf,

    /// Mount point of the btrfs filesystem holding the store.
    ///
    /// When set, layer removal also deletes nested subvolumes and quota groups.
    #[serde(default)]
    pub btrfs_mount_point: Option<PathBuf>,

    /// Registry used for references without a host.
    #[serde(default = "default_registry")]
    pub default_registry: String,

    /// Registries (hostnames or CIDR ranges) allowed to fall back to plain http.
    #[serde(default)]
    pub insecure_registries: Vec<String>,

    /// Ceiling on the total layer bytes of one fetched image.
    ///
    /// Default: unlimited
    #[serde(default = "default_max_image_size")]
    pub max_image_size: u64,
}

impl Default for StrataOptions {
    fn default() -> Self {
        Self {
            home_dir: default_home_dir(),
            btrfs_mount_point: None,
            default_registry: default_registry(),
            insecure_registries: Vec::new(),
            max_image_size: default_max_image_size(),
        }
    }
}

impl StrataOptions {
    /// Parse options from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> StrataResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| StrataError::Config(format!("invalid options: {}", e)))
    }

    /// Load options from a JSON file.
    pub fn from_file(path: &Path) -> StrataResult<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            StrataError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    /// Directory of the layer store.
    pub fn graph_dir(&self) -> PathBuf {
        self.home_dir.join(const_dirs::GRAPH_DIR)
    }
}

fn default_home_dir() -> PathBuf {
    if let Ok(home) = std::env::var(STRATA_HOME_ENV)
        && !home.is_empty()
    {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join(const_dirs::STRATA_DIR)
}

fn default_registry() -> String {
    DEFAULT_REGISTRY.to_string()
}

fn default_max_image_size() -> u64 {
    u64::MAX
}
