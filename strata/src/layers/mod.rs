//! Layer store contract and implementations.
//!
//! - `LayerStore`: the contract every consumer depends on (path, get, register, remove)
//! - `DirectoryLayerStore`: plain-directory backed store
//! - `BtrfsReclaimer`: decorator that tears down nested btrfs subvolumes and
//!   quota groups before delegating removal

mod btrfs;
mod directory;
mod id;

pub use btrfs::{BtrfsReclaimer, ContentCleaner, clear_dir_contents};
pub use directory::{DirectoryLayerStore, StoredLayer};
pub use id::LayerId;

use crate::errors::StrataResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::io::AsyncRead;

/// Raw layer content as handed to `LayerStore::register`.
pub type LayerStream = Box<dyn AsyncRead + Send + Unpin>;

/// Layer descriptor as served by a registry (`images/<id>/json`).
///
/// Only the fields the layer machinery consumes are modelled; unknown fields
/// are ignored on parse.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerMetadata {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,

    /// Size of the layer content in bytes.
    #[serde(rename = "Size", default)]
    pub size: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<LayerConfig>,
}

/// Runtime configuration carried by a layer descriptor.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    #[serde(rename = "Env", default)]
    pub env: Option<Vec<String>>,

    #[serde(rename = "Volumes", default)]
    pub volumes: Option<BTreeMap<String, serde_json::Value>>,
}

impl LayerMetadata {
    /// Parse a registry layer descriptor.
    pub fn from_json(json: &[u8]) -> StrataResult<Self> {
        Ok(serde_json::from_slice(json)?)
    }

    /// Store key for this layer.
    pub fn layer_id(&self) -> LayerId {
        LayerId::docker(self.id.clone())
    }

    /// Raw `KEY=VALUE` entries declared by the layer (unfiltered).
    pub fn env(&self) -> &[String] {
        self.config
            .as_ref()
            .and_then(|c| c.env.as_deref())
            .unwrap_or(&[])
    }

    /// Declared volume mount paths.
    pub fn volumes(&self) -> Vec<String> {
        self.config
            .as_ref()
            .and_then(|c| c.volumes.as_ref())
            .map(|v| v.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// Storage for filesystem layers.
///
/// Implementations are shared between concurrent fetches and reclaims, so every
/// method takes `&self`. Serializing registrations of the same id is the
/// caller's job (see `LayerLocks`).
#[async_trait]
pub trait LayerStore: Send + Sync {
    /// Absolute on-disk location of a registered layer.
    async fn path(&self, id: &LayerId) -> StrataResult<PathBuf>;

    /// Cached metadata of a registered layer.
    async fn get(&self, id: &LayerId) -> StrataResult<LayerMetadata>;

    /// Persist a new layer from its content stream and index it by
    /// `metadata.id`. Returns the metadata as recorded by the store.
    async fn register(
        &self,
        metadata: LayerMetadata,
        content: LayerStream,
    ) -> StrataResult<LayerMetadata>;

    /// Delete the layer's bookkeeping entry and its contents.
    async fn remove(&self, id: &LayerId) -> StrataResult<()>;
}
