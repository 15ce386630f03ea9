//! Test doubles for strata's collaborator seams.
//!
//! - `FakeLayerStore`: in-memory `LayerStore` that drains content streams
//! - `FakeCommandRunner`: scripted `CommandRunner` recording every invocation
//! - `FakeRegistrySession`: scripted `RegistrySession` counting downloads

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;
use strata::errors::{StrataError, StrataResult};
use strata::layers::{LayerId, LayerMetadata, LayerStore, LayerStream};
use strata::registry::{RegistrySession, RepositoryData};
use strata::util::CommandRunner;

// ============================================================================
// Layer store
// ============================================================================

#[derive(Default)]
struct StoreState {
    layers: HashMap<String, LayerMetadata>,
    paths: HashMap<String, PathBuf>,
    path_errors: HashMap<String, StrataError>,
    remove_error: Option<StrataError>,
    registrations: HashMap<String, usize>,
    removals: Vec<LayerId>,
}

/// In-memory `LayerStore`.
///
/// `register` reads the whole content stream before recording the layer, so
/// a `QuotaedReader` wrapped around it trips exactly as with a real store.
pub struct FakeLayerStore {
    root: PathBuf,
    register_delay: Option<Duration>,
    state: Mutex<StoreState>,
}

impl FakeLayerStore {
    /// Layers without an explicit path resolve to `<root>/<graph id>`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            register_delay: None,
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Sleep this long inside every `register`, widening race windows.
    pub fn with_register_delay(mut self, delay: Duration) -> Self {
        self.register_delay = Some(delay);
        self
    }

    /// Seed a layer as already registered.
    pub fn insert_layer(&self, metadata: LayerMetadata) {
        let key = metadata.layer_id().graph_id();
        self.state.lock().layers.insert(key, metadata);
    }

    /// Seed a layer id with a fixed on-disk path.
    pub fn insert_path(&self, id: &LayerId, path: impl Into<PathBuf>) {
        let mut state = self.state.lock();
        let key = id.graph_id();
        state.paths.insert(key.clone(), path.into());
        state
            .layers
            .entry(key.clone())
            .or_insert_with(|| LayerMetadata {
                id: key,
                ..Default::default()
            });
    }

    pub fn fail_path(&self, id: &LayerId, err: StrataError) {
        self.state.lock().path_errors.insert(id.graph_id(), err);
    }

    pub fn fail_remove(&self, err: StrataError) {
        self.state.lock().remove_error = Some(err);
    }

    pub fn contains(&self, id: &LayerId) -> bool {
        self.state.lock().layers.contains_key(&id.graph_id())
    }

    /// Successful registrations of `id`.
    pub fn register_count(&self, id: &LayerId) -> usize {
        self.state
            .lock()
            .registrations
            .get(&id.graph_id())
            .copied()
            .unwrap_or(0)
    }

    pub fn total_registrations(&self) -> usize {
        self.state.lock().registrations.values().sum()
    }

    /// Every id `remove` was called with, in call order.
    pub fn removals(&self) -> Vec<LayerId> {
        self.state.lock().removals.clone()
    }
}

#[async_trait]
impl LayerStore for FakeLayerStore {
    async fn path(&self, id: &LayerId) -> StrataResult<PathBuf> {
        let state = self.state.lock();
        let key = id.graph_id();
        if let Some(err) = state.path_errors.get(&key) {
            return Err(err.clone());
        }
        if let Some(path) = state.paths.get(&key) {
            return Ok(path.clone());
        }
        if state.layers.contains_key(&key) {
            return Ok(self.root.join(&key));
        }
        Err(StrataError::NotFound(format!("layer {key}")))
    }

    async fn get(&self, id: &LayerId) -> StrataResult<LayerMetadata> {
        self.state
            .lock()
            .layers
            .get(&id.graph_id())
            .cloned()
            .ok_or_else(|| StrataError::NotFound(format!("layer {id}")))
    }

    async fn register(
        &self,
        mut metadata: LayerMetadata,
        mut content: LayerStream,
    ) -> StrataResult<LayerMetadata> {
        if let Some(delay) = self.register_delay {
            tokio::time::sleep(delay).await;
        }

        let copied = tokio::io::copy(&mut content, &mut tokio::io::sink())
            .await
            .map_err(|e| StrataError::from_io("read layer content", e))?;
        if metadata.size == 0 {
            metadata.size = copied;
        }

        let mut state = self.state.lock();
        let key = metadata.layer_id().graph_id();
        state.layers.insert(key.clone(), metadata.clone());
        *state.registrations.entry(key).or_default() += 1;
        Ok(metadata)
    }

    async fn remove(&self, id: &LayerId) -> StrataResult<()> {
        let mut state = self.state.lock();
        state.removals.push(id.clone());
        if let Some(err) = state.remove_error.clone() {
            return Err(err);
        }
        let key = id.graph_id();
        state.paths.remove(&key);
        state
            .layers
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| StrataError::NotFound(format!("layer {key}")))
    }
}

// ============================================================================
// Command runner
// ============================================================================

/// Scripted `CommandRunner`.
///
/// Responses are keyed by the full command line (`program arg arg ...`);
/// unscripted commands succeed with empty stdout.
#[derive(Default)]
pub struct FakeCommandRunner {
    responses: Mutex<HashMap<String, StrataResult<String>>>,
    log: Mutex<Vec<String>>,
}

impl FakeCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, command_line: &str, stdout: &str) {
        self.responses
            .lock()
            .insert(command_line.to_string(), Ok(stdout.to_string()));
    }

    pub fn fail(&self, command_line: &str, err: StrataError) {
        self.responses
            .lock()
            .insert(command_line.to_string(), Err(err));
    }

    /// Append a non-command event to the log, for ordering assertions.
    pub fn record(&self, event: impl Into<String>) {
        self.log.lock().push(event.into());
    }

    /// Every command line run (and event recorded), in order.
    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    /// Recorded command lines starting with `prefix`.
    pub fn commands_starting_with(&self, prefix: &str) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .filter(|line| line.starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CommandRunner for FakeCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> StrataResult<String> {
        let mut command_line = program.to_string();
        for arg in args {
            command_line.push(' ');
            command_line.push_str(arg);
        }
        self.log.lock().push(command_line.clone());

        self.responses
            .lock()
            .get(&command_line)
            .cloned()
            .unwrap_or_else(|| Ok(String::new()))
    }
}

// ============================================================================
// Registry session
// ============================================================================

#[derive(Clone, Debug)]
struct FakeLayer {
    json: Vec<u8>,
    size: u64,
    content: Vec<u8>,
}

#[derive(Default)]
struct SessionCounters {
    history: HashMap<String, usize>,
    json: HashMap<String, usize>,
    downloads: HashMap<String, usize>,
    calls: usize,
}

/// Scripted `RegistrySession`.
///
/// Build it up front with the `with_*` methods, then share it behind an `Arc`.
#[derive(Default)]
pub struct FakeRegistrySession {
    repositories: HashMap<String, Vec<String>>,
    tags: HashMap<String, HashMap<String, String>>,
    histories: HashMap<String, Vec<String>>,
    layers: HashMap<String, FakeLayer>,
    failing_endpoints: HashSet<String>,
    failing_downloads: HashSet<(String, String)>,
    fail_repository_lookup: bool,
    download_delay: Option<Duration>,
    counters: Mutex<SessionCounters>,
}

impl FakeRegistrySession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_repository(mut self, path: &str, endpoints: &[&str]) -> Self {
        self.repositories.insert(
            path.to_string(),
            endpoints.iter().map(|e| e.to_string()).collect(),
        );
        self
    }

    pub fn with_tag(mut self, path: &str, tag: &str, image_id: &str) -> Self {
        self.tags
            .entry(path.to_string())
            .or_default()
            .insert(tag.to_string(), image_id.to_string());
        self
    }

    /// History of `image_id`, newest layer first.
    pub fn with_history(mut self, image_id: &str, history: &[&str]) -> Self {
        self.histories.insert(
            image_id.to_string(),
            history.iter().map(|l| l.to_string()).collect(),
        );
        self
    }

    /// A layer whose advertised size is its content length.
    pub fn with_layer(self, id: &str, env: &[&str], volumes: &[&str], content: Vec<u8>) -> Self {
        let size = content.len() as u64;
        self.with_sized_layer(id, env, volumes, size, content)
    }

    /// A layer advertising `size` regardless of its content.
    pub fn with_sized_layer(
        mut self,
        id: &str,
        env: &[&str],
        volumes: &[&str],
        size: u64,
        content: Vec<u8>,
    ) -> Self {
        let volumes: serde_json::Map<String, serde_json::Value> = volumes
            .iter()
            .map(|v| (v.to_string(), serde_json::json!({})))
            .collect();
        let json = serde_json::json!({
            "id": id,
            "Size": size,
            "config": { "Env": env, "Volumes": volumes },
        });
        self.layers.insert(
            id.to_string(),
            FakeLayer {
                json: json.to_string().into_bytes(),
                size,
                content,
            },
        );
        self
    }

    /// A layer served with raw descriptor bytes.
    pub fn with_raw_layer(mut self, id: &str, json: &[u8], content: Vec<u8>) -> Self {
        self.layers.insert(
            id.to_string(),
            FakeLayer {
                json: json.to_vec(),
                size: content.len() as u64,
                content,
            },
        );
        self
    }

    /// Every call naming `endpoint` fails.
    pub fn with_failing_endpoint(mut self, endpoint: &str) -> Self {
        self.failing_endpoints.insert(endpoint.to_string());
        self
    }

    /// Downloading `layer` from `endpoint` fails.
    pub fn with_failing_download(mut self, endpoint: &str, layer: &str) -> Self {
        self.failing_downloads
            .insert((endpoint.to_string(), layer.to_string()));
        self
    }

    pub fn with_failing_repository_lookup(mut self) -> Self {
        self.fail_repository_lookup = true;
        self
    }

    pub fn with_download_delay(mut self, delay: Duration) -> Self {
        self.download_delay = Some(delay);
        self
    }

    pub fn history_requests(&self, endpoint: &str) -> usize {
        self.counters.lock().history.get(endpoint).copied().unwrap_or(0)
    }

    pub fn json_requests(&self, layer: &str) -> usize {
        self.counters.lock().json.get(layer).copied().unwrap_or(0)
    }

    pub fn downloads(&self, layer: &str) -> usize {
        self.counters.lock().downloads.get(layer).copied().unwrap_or(0)
    }

    pub fn total_downloads(&self) -> usize {
        self.counters.lock().downloads.values().sum()
    }

    /// Total number of registry calls of any kind.
    pub fn calls(&self) -> usize {
        self.counters.lock().calls
    }

    fn check_endpoint(&self, endpoint: &str) -> StrataResult<()> {
        if self.failing_endpoints.contains(endpoint) {
            return Err(StrataError::Registry(format!("{endpoint}: connection refused")));
        }
        Ok(())
    }

    fn layer(&self, id: &str) -> StrataResult<&FakeLayer> {
        self.layers
            .get(id)
            .ok_or_else(|| StrataError::NotFound(format!("layer {id}")))
    }
}

#[async_trait]
impl RegistrySession for FakeRegistrySession {
    async fn get_repository_data(&self, path: &str) -> StrataResult<RepositoryData> {
        self.counters.lock().calls += 1;
        if self.fail_repository_lookup {
            return Err(StrataError::Registry("index unavailable".into()));
        }
        let endpoints = self
            .repositories
            .get(path)
            .cloned()
            .ok_or_else(|| StrataError::NotFound(format!("repository {path}")))?;
        Ok(RepositoryData { endpoints })
    }

    async fn get_remote_tags(
        &self,
        _endpoints: &[String],
        path: &str,
    ) -> StrataResult<HashMap<String, String>> {
        self.counters.lock().calls += 1;
        Ok(self.tags.get(path).cloned().unwrap_or_default())
    }

    async fn get_remote_history(
        &self,
        image_id: &str,
        endpoint: &str,
    ) -> StrataResult<Vec<String>> {
        {
            let mut counters = self.counters.lock();
            counters.calls += 1;
            *counters.history.entry(endpoint.to_string()).or_default() += 1;
        }
        self.check_endpoint(endpoint)?;
        self.histories
            .get(image_id)
            .cloned()
            .ok_or_else(|| StrataError::NotFound(format!("image {image_id}")))
    }

    async fn get_remote_image_json(
        &self,
        layer_id: &str,
        endpoint: &str,
    ) -> StrataResult<(Vec<u8>, u64)> {
        {
            let mut counters = self.counters.lock();
            counters.calls += 1;
            *counters.json.entry(layer_id.to_string()).or_default() += 1;
        }
        self.check_endpoint(endpoint)?;
        let layer = self.layer(layer_id)?;
        Ok((layer.json.clone(), layer.size))
    }

    async fn get_remote_image_layer(
        &self,
        layer_id: &str,
        endpoint: &str,
        _expected_size: u64,
    ) -> StrataResult<LayerStream> {
        {
            let mut counters = self.counters.lock();
            counters.calls += 1;
            *counters.downloads.entry(layer_id.to_string()).or_default() += 1;
        }
        if let Some(delay) = self.download_delay {
            tokio::time::sleep(delay).await;
        }
        self.check_endpoint(endpoint)?;
        if self
            .failing_downloads
            .contains(&(endpoint.to_string(), layer_id.to_string()))
        {
            return Err(StrataError::Registry(format!(
                "{endpoint}: download of {layer_id} reset"
            )));
        }
        let content = self.layer(layer_id)?.content.clone();
        Ok(Box::new(std::io::Cursor::new(content)))
    }
}

// ============================================================================
// Archives
// ============================================================================

/// Uncompressed tar archive holding `files` (path, contents) as regular files.
pub fn tar_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, *contents)
            .expect("append tar entry");
    }
    builder.into_inner().expect("finish tar archive")
}
