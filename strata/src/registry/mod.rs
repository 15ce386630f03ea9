//! Registry access consumed by the fetcher.
//!
//! - `RegistrySession`: the calls the fetcher makes against a registry
//! - `V1Session`: HTTP implementation of the v1 image protocol
//! - `RegistryProvider`: picks host and transport security, hands out sessions

mod provider;
mod v1;

pub use provider::{RegistryEndpoint, RegistryProvider};
pub use v1::V1Session;

use crate::errors::StrataResult;
use crate::layers::LayerStream;
use async_trait::async_trait;
use std::collections::HashMap;

/// Repository lookup result.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RepositoryData {
    /// Endpoints able to serve the repository's layers, in preference order.
    pub endpoints: Vec<String>,
}

/// Calls made against an image registry.
///
/// Each call carries its own deadline; the fetcher adds none.
#[async_trait]
pub trait RegistrySession: Send + Sync {
    /// Look up the endpoints serving repository `path`.
    async fn get_repository_data(&self, path: &str) -> StrataResult<RepositoryData>;

    /// Tag name to image id mapping of repository `path`.
    async fn get_remote_tags(
        &self,
        endpoints: &[String],
        path: &str,
    ) -> StrataResult<HashMap<String, String>>;

    /// Layer ids making up `image_id`, newest first.
    async fn get_remote_history(&self, image_id: &str, endpoint: &str)
    -> StrataResult<Vec<String>>;

    /// Raw JSON descriptor of a layer and its advertised content size.
    async fn get_remote_image_json(
        &self,
        layer_id: &str,
        endpoint: &str,
    ) -> StrataResult<(Vec<u8>, u64)>;

    /// Content stream of a layer.
    async fn get_remote_image_layer(
        &self,
        layer_id: &str,
        endpoint: &str,
        expected_size: u64,
    ) -> StrataResult<LayerStream>;
}
