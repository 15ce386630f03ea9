//! Remote image fetcher.
//!
//! Resolves `path:tag` to an image id, then walks the image's layer history
//! from the base up against each candidate endpoint in turn, registering
//! every layer the store doesn't already have. The first endpoint that yields
//! the whole history wins.
//!
//! Disk usage is bounded by `FetchRequest::max_size`: the remaining budget
//! shrinks by each layer's size as the walk proceeds, and a layer stream is
//! cut off as soon as it would overrun what is left. Running out of quota ends
//! the fetch outright since another endpoint would serve the same bytes.

use crate::errors::{StrataError, StrataResult};
use crate::fetch::{Env, FetchRequest, Image, LayerLocks, QuotaedReader};
use crate::layers::{LayerId, LayerMetadata, LayerStore};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

/// Image id and candidate endpoints for a request.
#[derive(Debug)]
struct ImageV1Metadata {
    image_id: String,
    endpoints: Vec<String>,
}

/// What one layer contributes to the image.
#[derive(Debug)]
struct DockerLayer {
    env: Env,
    volumes: Vec<String>,
    size: u64,
}

impl DockerLayer {
    fn from_metadata(metadata: &LayerMetadata) -> Self {
        Self {
            env: Env::from_entries(metadata.env()),
            volumes: metadata.volumes(),
            size: metadata.size,
        }
    }
}

/// Fetches images into a shared layer store.
///
/// Cheap to share: concurrent fetches of images with common base layers
/// coordinate through the `LayerLocks` so each layer is downloaded once.
pub struct RemoteImageFetcher {
    store: Arc<dyn LayerStore>,
    locks: Arc<LayerLocks>,
}

impl std::fmt::Debug for RemoteImageFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteImageFetcher")
            .field("locks", &self.locks)
            .finish()
    }
}

impl RemoteImageFetcher {
    /// Any other code path registering into `store` must use the same `locks`.
    pub fn new(store: Arc<dyn LayerStore>, locks: Arc<LayerLocks>) -> Self {
        Self { store, locks }
    }

    /// Resolve the request to its top layer id without downloading anything.
    pub async fn fetch_id(&self, request: &FetchRequest) -> StrataResult<LayerId> {
        let metadata = self.fetch_metadata(request).await?;
        Ok(LayerId::docker(metadata.image_id))
    }

    /// Materialize every layer of the requested image.
    pub async fn fetch(&self, request: &FetchRequest) -> StrataResult<Image> {
        let metadata = self.fetch_metadata(request).await?;
        let image_id = metadata.image_id;

        let mut last_error = None;
        for endpoint in &metadata.endpoints {
            tracing::debug!(endpoint = %endpoint, image = %image_id, "trying endpoint");

            match self.fetch_from_endpoint(request, endpoint, &image_id).await {
                Ok(image) => {
                    tracing::debug!(
                        endpoint = %endpoint,
                        image = %image_id,
                        volumes = ?image.volumes,
                        "fetched image"
                    );
                    return Ok(image);
                }
                Err(e) if e.is_quota_exceeded() => {
                    tracing::info!(image = %image_id, "quota exceeded, giving up");
                    return Err(StrataError::QuotaExceeded);
                }
                Err(e) => {
                    tracing::warn!(endpoint = %endpoint, image = %image_id, error = %e, "endpoint failed");
                    last_error = Some(e);
                }
            }
        }

        let cause = last_error.unwrap_or_else(|| {
            StrataError::NotFound(format!("no endpoints serve {}", request.path))
        });
        Err(StrataError::fetch(
            "fetch from endpoint",
            &request.host,
            &request.path,
            StrataError::EndpointsExhausted(Box::new(cause)),
        ))
    }

    async fn fetch_from_endpoint(
        &self,
        request: &FetchRequest,
        endpoint: &str,
        image_id: &str,
    ) -> StrataResult<Image> {
        let history = request
            .session
            .get_remote_history(image_id, endpoint)
            .await
            .map_err(|e| StrataError::layer(image_id, "get remote history", e))?;

        let mut remaining = request.max_size;
        let mut env = Env::new();
        let mut volumes = BTreeSet::new();

        for layer_id in history.iter().rev() {
            let layer = self
                .fetch_layer(request, endpoint, layer_id, remaining)
                .await?;

            remaining = remaining
                .checked_sub(layer.size)
                .ok_or(StrataError::QuotaExceeded)?;

            env.merge(&layer.env);
            volumes.extend(layer.volumes);
        }

        Ok(Image {
            image_id: image_id.to_string(),
            volumes,
            env,
            layer_ids: history.iter().rev().map(LayerId::docker).collect(),
        })
    }

    async fn fetch_layer(
        &self,
        request: &FetchRequest,
        endpoint: &str,
        layer_id: &str,
        remaining: u64,
    ) -> StrataResult<DockerLayer> {
        let id = LayerId::docker(layer_id);
        let _guard = self.locks.acquire(&id.graph_id()).await;

        if let Ok(cached) = self.store.get(&id).await {
            tracing::info!(layer = %layer_id, size = cached.size, "using cached layer");
            return Ok(DockerLayer::from_metadata(&cached));
        }

        let (json, size) = request
            .session
            .get_remote_image_json(layer_id, endpoint)
            .await
            .map_err(|e| StrataError::layer(layer_id, "get remote image JSON", e))?;

        let metadata = LayerMetadata::from_json(&json)
            .map_err(|e| StrataError::layer(layer_id, "new image JSON", e))?;

        let content = request
            .session
            .get_remote_image_layer(&metadata.id, endpoint, size)
            .await
            .map_err(|e| StrataError::layer(layer_id, "get remote image layer", e))?;

        let started = Instant::now();
        tracing::info!(layer = %layer_id, "downloading layer");

        let reader = QuotaedReader::new(content, remaining);
        let probe = reader.probe();
        let registered = match self.store.register(metadata, Box::new(reader)).await {
            Ok(registered) => registered,
            Err(e) if probe.exceeded() || e.is_quota_exceeded() => {
                return Err(StrataError::QuotaExceeded);
            }
            Err(e) => return Err(StrataError::layer(layer_id, "register", e)),
        };

        let layer = DockerLayer::from_metadata(&registered);
        tracing::info!(
            layer = %layer_id,
            took = ?started.elapsed(),
            vols = ?layer.volumes,
            size = layer.size,
            "downloaded layer"
        );

        Ok(layer)
    }

    async fn fetch_metadata(&self, request: &FetchRequest) -> StrataResult<ImageV1Metadata> {
        tracing::debug!(host = %request.host, path = %request.path, tag = %request.tag, "resolving image");

        let repo_data = request
            .session
            .get_repository_data(&request.path)
            .await
            .map_err(|e| StrataError::fetch("GetRepositoryData", &request.host, &request.path, e))?;

        let tags = request
            .session
            .get_remote_tags(&repo_data.endpoints, &request.path)
            .await
            .map_err(|e| StrataError::fetch("GetRemoteTags", &request.host, &request.path, e))?;

        let image_id = tags.get(&request.tag).cloned().ok_or_else(|| {
            StrataError::fetch(
                "looking up tag",
                &request.host,
                &request.path,
                StrataError::NotFound(format!("unknown tag: {}", request.tag)),
            )
        })?;

        Ok(ImageV1Metadata {
            image_id,
            endpoints: repo_data.endpoints,
        })
    }
}
