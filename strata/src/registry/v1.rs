//! Docker registry v1 image protocol over HTTP.

use crate::errors::{StrataError, StrataResult};
use crate::layers::LayerStream;
use crate::registry::{RegistrySession, RepositoryData};
use async_trait::async_trait;
use futures::TryStreamExt;
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use std::collections::HashMap;
use tokio_util::io::StreamReader;

const TOKEN_HEADER: &str = "X-Docker-Token";
const ENDPOINTS_HEADER: &str = "X-Docker-Endpoints";
const SIZE_HEADER: &str = "X-Docker-Size";

/// Session against a v1 registry index.
///
/// The index hands out a token and the list of endpoints holding the
/// repository; later calls go to those endpoints with the token attached.
pub struct V1Session {
    client: reqwest::Client,
    index: String,
    token: Mutex<Option<String>>,
}

impl std::fmt::Debug for V1Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("V1Session")
            .field("index", &self.index)
            .finish()
    }
}

impl V1Session {
    /// Create a session for the index at `index_url` (e.g. `https://registry.example.com`).
    pub fn new(index_url: impl Into<String>) -> StrataResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| StrataError::Registry(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(client, index_url))
    }

    pub fn with_client(client: reqwest::Client, index_url: impl Into<String>) -> Self {
        Self {
            client,
            index: index_url.into().trim_end_matches('/').to_string(),
            token: Mutex::new(None),
        }
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    /// Check the index answers the v1 ping.
    pub async fn ping(&self) -> StrataResult<()> {
        self.get(&format!("{}/v1/_ping", self.index)).await?;
        Ok(())
    }

    async fn get(&self, url: &str) -> StrataResult<reqwest::Response> {
        let mut request = self.client.get(url);
        let token = self.token.lock().clone();
        if let Some(token) = token {
            request = request.header(reqwest::header::AUTHORIZATION, format!("Token {token}"));
        }
        self.send(request, url).await
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        url: &str,
    ) -> StrataResult<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| StrataError::Registry(format!("GET {url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StrataError::Registry(format!("GET {url}: HTTP {status}")));
        }
        Ok(response)
    }

    /// Endpoint base URL for a host advertised by the index.
    fn endpoint_url(&self, host: &str) -> String {
        let scheme = if self.index.starts_with("http://") {
            "http"
        } else {
            "https"
        };
        format!("{scheme}://{host}/v1/")
    }
}

#[async_trait]
impl RegistrySession for V1Session {
    async fn get_repository_data(&self, path: &str) -> StrataResult<RepositoryData> {
        let url = format!("{}/v1/repositories/{}/images", self.index, path);
        let request = self.client.get(&url).header(TOKEN_HEADER, "true");
        let response = self.send(request, &url).await?;

        let headers = response.headers();
        if let Some(token) = header_str(headers, TOKEN_HEADER) {
            *self.token.lock() = Some(token.to_string());
        }

        let endpoints = match header_str(headers, ENDPOINTS_HEADER) {
            Some(hosts) => parse_endpoint_hosts(hosts)
                .map(|host| self.endpoint_url(host))
                .collect(),
            // Registries serving repositories themselves omit the header.
            None => vec![format!("{}/v1/", self.index)],
        };

        tracing::debug!(path = %path, endpoints = ?endpoints, "resolved repository endpoints");
        Ok(RepositoryData { endpoints })
    }

    async fn get_remote_tags(
        &self,
        endpoints: &[String],
        path: &str,
    ) -> StrataResult<HashMap<String, String>> {
        let mut last_error = None;
        for endpoint in endpoints {
            let url = format!("{endpoint}repositories/{path}/tags");
            match self.get(&url).await {
                Ok(response) => {
                    return response
                        .json::<HashMap<String, String>>()
                        .await
                        .map_err(|e| StrataError::Registry(format!("GET {url}: bad tag list: {e}")));
                }
                Err(e) => {
                    tracing::debug!(endpoint = %endpoint, error = %e, "tag lookup failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            StrataError::Registry(format!("no endpoints to look up tags of {path}"))
        }))
    }

    async fn get_remote_history(
        &self,
        image_id: &str,
        endpoint: &str,
    ) -> StrataResult<Vec<String>> {
        let url = format!("{endpoint}images/{image_id}/ancestry");
        self.get(&url)
            .await?
            .json::<Vec<String>>()
            .await
            .map_err(|e| StrataError::Registry(format!("GET {url}: bad ancestry: {e}")))
    }

    async fn get_remote_image_json(
        &self,
        layer_id: &str,
        endpoint: &str,
    ) -> StrataResult<(Vec<u8>, u64)> {
        let url = format!("{endpoint}images/{layer_id}/json");
        let response = self.get(&url).await?;
        let size = header_str(response.headers(), SIZE_HEADER)
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);

        let body = response
            .bytes()
            .await
            .map_err(|e| StrataError::Registry(format!("GET {url}: {e}")))?;
        Ok((body.to_vec(), size))
    }

    async fn get_remote_image_layer(
        &self,
        layer_id: &str,
        endpoint: &str,
        expected_size: u64,
    ) -> StrataResult<LayerStream> {
        let url = format!("{endpoint}images/{layer_id}/layer");
        let response = self.get(&url).await?;

        tracing::debug!(
            layer = %layer_id,
            expected_size,
            content_length = ?response.content_length(),
            "streaming layer"
        );

        let stream = response.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::new(StreamReader::new(Box::pin(stream))))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn parse_endpoint_hosts(header: &str) -> impl Iterator<Item = &str> {
    header.split(',').map(str::trim).filter(|h| !h.is_empty())
}
