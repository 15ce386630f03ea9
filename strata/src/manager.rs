//! Process-level wiring of store, reclaimer, fetcher and registry access.

use crate::errors::{StrataError, StrataResult};
use crate::fetch::{FetchRequest, Image, LayerLocks, RemoteImageFetcher};
use crate::layers::{BtrfsReclaimer, DirectoryLayerStore, LayerId, LayerStore};
use crate::options::StrataOptions;
use crate::registry::{RegistryProvider, RegistrySession};
use crate::util::ProcessRunner;
use std::fmt;
use std::sync::Arc;

/// Parsed `docker://[host]/path[#tag]` image reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host; empty means the configured default registry.
    pub host: String,
    pub path: String,
    pub tag: String,
}

impl ImageReference {
    pub fn parse(reference: &str) -> StrataResult<Self> {
        let rest = reference.strip_prefix("docker://").ok_or_else(|| {
            StrataError::InvalidArgument(format!(
                "unsupported image reference {reference:?}: expected docker://[host]/path[#tag]"
            ))
        })?;

        let (location, tag) = match rest.split_once('#') {
            Some((location, tag)) if !tag.is_empty() => (location, tag),
            Some((location, _)) => (location, "latest"),
            None => (rest, "latest"),
        };

        let (host, path) = match location.split_once('/') {
            Some((host, path)) => (host, path),
            None => ("", location),
        };

        let path = path.trim_matches('/');
        if path.is_empty() {
            return Err(StrataError::InvalidArgument(format!(
                "image reference {reference:?} has no repository path"
            )));
        }

        // Official images live under library/ on the index.
        let path = if path.contains('/') {
            path.to_string()
        } else {
            format!("library/{path}")
        };

        Ok(Self {
            host: host.to_string(),
            path,
            tag: tag.to_string(),
        })
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "docker://{}/{}#{}", self.host, self.path, self.tag)
    }
}

/// Owns the layer store for the life of the process and hands it to the
/// fetcher and (on btrfs) the reclaimer.
pub struct LayerManager {
    options: StrataOptions,
    store: Arc<dyn LayerStore>,
    fetcher: RemoteImageFetcher,
    provider: RegistryProvider,
}

impl fmt::Debug for LayerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerManager")
            .field("options", &self.options)
            .finish()
    }
}

impl LayerManager {
    /// Open the directory store under `options.graph_dir()`, decorated with a
    /// `BtrfsReclaimer` when a btrfs mount point is configured.
    pub fn new(options: StrataOptions) -> StrataResult<Self> {
        let base: Arc<dyn LayerStore> = Arc::new(DirectoryLayerStore::new(options.graph_dir())?);

        let store: Arc<dyn LayerStore> = match &options.btrfs_mount_point {
            Some(mount_point) => {
                tracing::info!(mount_point = %mount_point.display(), "btrfs layer reclaim enabled");
                Arc::new(BtrfsReclaimer::new(
                    base,
                    Arc::new(ProcessRunner::new()),
                    mount_point.clone(),
                ))
            }
            None => base,
        };

        Ok(Self::with_store(options, store))
    }

    /// Build around an existing store.
    pub fn with_store(options: StrataOptions, store: Arc<dyn LayerStore>) -> Self {
        let fetcher = RemoteImageFetcher::new(Arc::clone(&store), Arc::new(LayerLocks::new()));
        let provider = RegistryProvider::new(
            options.default_registry.clone(),
            options.insecure_registries.clone(),
        );
        Self {
            options,
            store,
            fetcher,
            provider,
        }
    }

    pub fn options(&self) -> &StrataOptions {
        &self.options
    }

    pub fn store(&self) -> Arc<dyn LayerStore> {
        Arc::clone(&self.store)
    }

    /// Fetch `reference` from its registry into the store.
    pub async fn fetch(&self, reference: &ImageReference) -> StrataResult<Image> {
        let session = self.open_session(reference).await?;
        self.fetch_with_session(reference, session).await
    }

    /// Resolve `reference` to its top layer id.
    pub async fn fetch_id(&self, reference: &ImageReference) -> StrataResult<LayerId> {
        let session = self.open_session(reference).await?;
        self.fetch_id_with_session(reference, session).await
    }

    /// Fetch `reference` through an already established session.
    pub async fn fetch_with_session(
        &self,
        reference: &ImageReference,
        session: Arc<dyn RegistrySession>,
    ) -> StrataResult<Image> {
        let request = self.request(reference, session);
        self.fetcher.fetch(&request).await
    }

    pub async fn fetch_id_with_session(
        &self,
        reference: &ImageReference,
        session: Arc<dyn RegistrySession>,
    ) -> StrataResult<LayerId> {
        let request = self.request(reference, session);
        self.fetcher.fetch_id(&request).await
    }

    /// Remove a layer through the (possibly reclaiming) store.
    pub async fn remove(&self, id: &LayerId) -> StrataResult<()> {
        self.store.remove(id).await
    }

    async fn open_session(
        &self,
        reference: &ImageReference,
    ) -> StrataResult<Arc<dyn RegistrySession>> {
        let (session, endpoint) = self.provider.provide_registry(&reference.host).await?;
        tracing::debug!(host = %endpoint.host, secure = endpoint.secure, url = %endpoint.url, "opened registry session");
        let session: Arc<dyn RegistrySession> = session;
        Ok(session)
    }

    fn request(&self, reference: &ImageReference, session: Arc<dyn RegistrySession>) -> FetchRequest {
        FetchRequest {
            session,
            host: self.provider.resolve_host(&reference.host).to_string(),
            path: reference.path.clone(),
            tag: reference.tag.clone(),
            max_size: self.options.max_image_size,
        }
    }
}
