//! Fetching images from a registry into the layer store.
//!
//! - `RemoteImageFetcher`: resolves a tag and materializes every missing layer
//! - `QuotaedReader`: caps the bytes a layer stream may deliver
//! - `LayerLocks`: serializes cache-check-then-register per layer id
//! - `Env`: de-duplicated environment accumulated across layers

mod env;
mod lock;
mod quota;
mod remote;

pub use env::Env;
pub use lock::{LayerLockGuard, LayerLocks};
pub use quota::{QuotaProbe, QuotaedReader};
pub use remote::RemoteImageFetcher;

use crate::layers::LayerId;
use crate::registry::RegistrySession;
use std::collections::BTreeSet;
use std::sync::Arc;

/// What to fetch and from where.
#[derive(Clone)]
pub struct FetchRequest {
    /// Session against the registry holding the repository.
    pub session: Arc<dyn RegistrySession>,
    /// Registry host, for error reporting.
    pub host: String,
    /// Repository path, e.g. `library/busybox`.
    pub path: String,
    pub tag: String,
    /// Ceiling on the summed size of all layers of the image, in bytes.
    pub max_size: u64,
}

impl std::fmt::Debug for FetchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchRequest")
            .field("host", &self.host)
            .field("path", &self.path)
            .field("tag", &self.tag)
            .field("max_size", &self.max_size)
            .finish()
    }
}

/// A fetched image, ready for rootfs assembly.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Image {
    /// Id of the top layer.
    pub image_id: String,
    /// Mount paths declared by any layer.
    pub volumes: BTreeSet<String>,
    /// Environment accumulated base layer first.
    pub env: Env,
    /// Layers from base to top.
    pub layer_ids: Vec<LayerId>,
}
