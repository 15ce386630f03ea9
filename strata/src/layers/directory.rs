//! Plain-directory layer store.
//!
//! Each registered layer is unpacked into its own directory and described by a
//! JSON record. A layer counts as registered once its record exists, so the
//! record is written last.

use crate::errors::{StrataError, StrataResult};
use crate::layers::{LayerId, LayerMetadata, LayerStore, LayerStream};
use crate::layout::StoreLayout;
use async_trait::async_trait;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::io::SyncIoBridge;

const STAGING_SUFFIX: &str = ".registering";

/// Persisted record of a registered layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredLayer {
    pub layer: LayerMetadata,
    pub registered_at: String,
}

/// `LayerStore` keeping layers as unpacked directories under a root.
pub struct DirectoryLayerStore {
    layout: StoreLayout,
}

impl std::fmt::Debug for DirectoryLayerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryLayerStore")
            .field("root", &self.layout.root())
            .finish()
    }
}

impl DirectoryLayerStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn new(root: PathBuf) -> StrataResult<Self> {
        let layout = StoreLayout::new(root);
        layout.prepare()?;
        sweep_staging_dirs(&layout.layers_dir())?;
        Ok(Self { layout })
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    async fn load(&self, graph_id: &str) -> StrataResult<StoredLayer> {
        let record_path = self.layout.metadata_path(graph_id);
        let json = match tokio::fs::read(&record_path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StrataError::NotFound(format!("layer {}", graph_id)));
            }
            Err(e) => {
                return Err(StrataError::Storage(format!(
                    "Failed to read layer record {}: {}",
                    record_path.display(),
                    e
                )));
            }
        };

        serde_json::from_slice(&json).map_err(|e| {
            StrataError::Storage(format!(
                "Failed to parse layer record {}: {}",
                record_path.display(),
                e
            ))
        })
    }

    async fn record_exists(&self, graph_id: &str) -> StrataResult<bool> {
        let record_path = self.layout.metadata_path(graph_id);
        tokio::fs::try_exists(&record_path).await.map_err(|e| {
            StrataError::Storage(format!(
                "Failed to stat layer record {}: {}",
                record_path.display(),
                e
            ))
        })
    }

    /// Move an unpacked staging directory to `layer_dir`.
    ///
    /// Returns the existing record when another registration of the same id
    /// finished first. A layer directory without a record is a leftover of an
    /// interrupted register or remove and is replaced.
    async fn install(
        &self,
        graph_id: &str,
        staging_dir: &Path,
        layer_dir: &Path,
    ) -> StrataResult<Option<LayerMetadata>> {
        let Err(first) = tokio::fs::rename(staging_dir, layer_dir).await else {
            return Ok(None);
        };

        if let Ok(existing) = self.load(graph_id).await {
            tracing::debug!(layer = %graph_id, "layer already registered");
            return Ok(Some(existing.layer));
        }

        if !tokio::fs::try_exists(layer_dir).await.unwrap_or(false) {
            return Err(StrataError::Storage(format!(
                "Failed to move layer into {}: {}",
                layer_dir.display(),
                first
            )));
        }

        tracing::warn!(
            layer = %graph_id,
            path = %layer_dir.display(),
            "replacing layer directory without a record"
        );
        tokio::fs::remove_dir_all(layer_dir).await.map_err(|e| {
            StrataError::Storage(format!(
                "Failed to remove orphaned layer directory {}: {}",
                layer_dir.display(),
                e
            ))
        })?;
        tokio::fs::rename(staging_dir, layer_dir).await.map_err(|e| {
            StrataError::Storage(format!(
                "Failed to move layer into {}: {}",
                layer_dir.display(),
                e
            ))
        })?;
        Ok(None)
    }

    async fn save(&self, graph_id: &str, record: &StoredLayer) -> StrataResult<()> {
        let record_path = self.layout.metadata_path(graph_id);
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| StrataError::Storage(format!("Failed to serialize layer record: {}", e)))?;

        // Write then rename so a reader never sees a partial record.
        let staged = record_path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&staged, json).await.map_err(|e| {
            StrataError::Storage(format!(
                "Failed to write layer record {}: {}",
                staged.display(),
                e
            ))
        })?;
        tokio::fs::rename(&staged, &record_path).await.map_err(|e| {
            StrataError::Storage(format!(
                "Failed to install layer record {}: {}",
                record_path.display(),
                e
            ))
        })
    }
}

#[async_trait]
impl LayerStore for DirectoryLayerStore {
    async fn path(&self, id: &LayerId) -> StrataResult<PathBuf> {
        let graph_id = id.graph_id();
        if !self.record_exists(&graph_id).await? {
            return Err(StrataError::NotFound(format!("layer {}", graph_id)));
        }
        Ok(self.layout.layer_dir(&graph_id))
    }

    async fn get(&self, id: &LayerId) -> StrataResult<LayerMetadata> {
        Ok(self.load(&id.graph_id()).await?.layer)
    }

    async fn register(
        &self,
        metadata: LayerMetadata,
        content: LayerStream,
    ) -> StrataResult<LayerMetadata> {
        let graph_id = metadata.layer_id().graph_id();
        validate_graph_id(&graph_id)?;

        let layer_dir = self.layout.layer_dir(&graph_id);
        let staging_dir = self.layout.layers_dir().join(format!(
            "{}.{}{}",
            graph_id,
            uuid::Uuid::new_v4().simple(),
            STAGING_SUFFIX
        ));

        tokio::fs::create_dir_all(&staging_dir).await.map_err(|e| {
            StrataError::Storage(format!(
                "Failed to create staging directory {}: {}",
                staging_dir.display(),
                e
            ))
        })?;

        let reader = SyncIoBridge::new(content);
        let dest = staging_dir.clone();
        let unpacked = tokio::task::spawn_blocking(move || unpack_layer(reader, &dest))
            .await
            .map_err(|e| StrataError::Internal(format!("layer unpack task failed: {}", e)));

        let bytes = match unpacked.and_then(|r| r) {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&staging_dir).await;
                return Err(e);
            }
        };

        match self.install(&graph_id, &staging_dir, &layer_dir).await {
            Ok(None) => {}
            Ok(Some(existing)) => {
                let _ = tokio::fs::remove_dir_all(&staging_dir).await;
                return Ok(existing);
            }
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&staging_dir).await;
                return Err(e);
            }
        }

        let mut layer = metadata;
        if layer.size == 0 {
            layer.size = bytes;
        }

        let record = StoredLayer {
            layer,
            registered_at: chrono::Utc::now().to_rfc3339(),
        };
        self.save(&graph_id, &record).await?;

        tracing::debug!(layer = %graph_id, size = record.layer.size, "registered layer");
        Ok(record.layer)
    }

    async fn remove(&self, id: &LayerId) -> StrataResult<()> {
        let graph_id = id.graph_id();
        let record_path = self.layout.metadata_path(&graph_id);
        if !self.record_exists(&graph_id).await? {
            return Err(StrataError::NotFound(format!("layer {}", graph_id)));
        }

        // Drop the record first: a half-removed layer must not look registered.
        tokio::fs::remove_file(&record_path).await.map_err(|e| {
            StrataError::Storage(format!(
                "Failed to remove layer record {}: {}",
                record_path.display(),
                e
            ))
        })?;

        let layer_dir = self.layout.layer_dir(&graph_id);
        match tokio::fs::remove_dir_all(&layer_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(StrataError::Storage(format!(
                    "Failed to remove layer directory {}: {}",
                    layer_dir.display(),
                    e
                )));
            }
        }

        tracing::debug!(layer = %graph_id, "removed layer");
        Ok(())
    }
}

/// Delete staging directories left behind by registrations that never finished.
fn sweep_staging_dirs(layers_dir: &Path) -> StrataResult<()> {
    let entries = std::fs::read_dir(layers_dir).map_err(|e| {
        StrataError::Storage(format!(
            "Failed to read layers dir {}: {}",
            layers_dir.display(),
            e
        ))
    })?;

    for entry in entries.flatten() {
        let path = entry.path();
        let is_staging = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(STAGING_SUFFIX));
        if !is_staging {
            continue;
        }

        match std::fs::remove_dir_all(&path) {
            Ok(()) => tracing::info!(path = %path.display(), "removed stale staging directory"),
            Err(e) => tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to remove stale staging directory"
            ),
        }
    }
    Ok(())
}

/// Graph ids become directory names; reject anything that could escape the store.
fn validate_graph_id(graph_id: &str) -> StrataResult<()> {
    if graph_id.is_empty()
        || graph_id == "."
        || graph_id == ".."
        || graph_id.contains('/')
        || graph_id.contains('\0')
    {
        return Err(StrataError::InvalidArgument(format!(
            "invalid layer id: {:?}",
            graph_id
        )));
    }
    Ok(())
}

/// Counts bytes pulled from the wrapped reader.
struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

/// Unpack a (possibly gzip-compressed) layer tarball into `dest`.
///
/// Consumes the whole stream, including any padding after the archive's end
/// marker, and returns the number of raw bytes read.
fn unpack_layer<R: Read>(reader: R, dest: &Path) -> StrataResult<u64> {
    let count = Arc::new(AtomicU64::new(0));
    let mut buffered = BufReader::new(CountingReader {
        inner: reader,
        count: Arc::clone(&count),
    });

    // Gzip magic number: 0x1f 0x8b
    let is_gzip = {
        let head = buffered
            .fill_buf()
            .map_err(|e| StrataError::from_io("Failed to read layer header", e))?;
        head.len() >= 2 && head[..2] == [0x1f, 0x8b]
    };

    let decoded: Box<dyn Read> = if is_gzip {
        tracing::trace!("Detected gzip compression for layer");
        Box::new(GzDecoder::new(buffered))
    } else {
        Box::new(buffered)
    };

    let mut archive = tar::Archive::new(decoded);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive
        .unpack(dest)
        .map_err(|e| StrataError::from_io("Failed to unpack layer", e))?;

    let mut rest = archive.into_inner();
    std::io::copy(&mut rest, &mut std::io::sink())
        .map_err(|e| StrataError::from_io("Failed to drain layer stream", e))?;

    Ok(count.load(Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tarball(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_unpack_plain_tar() {
        let dest = tempfile::TempDir::new().unwrap();
        let tar = tarball(&[("etc/hostname", b"strata\n")]);

        let bytes = unpack_layer(&tar[..], dest.path()).unwrap();

        assert_eq!(bytes, tar.len() as u64);
        assert_eq!(
            std::fs::read(dest.path().join("etc/hostname")).unwrap(),
            b"strata\n"
        );
    }

    #[test]
    fn test_unpack_gzip_tar() {
        use flate2::Compression;
        use flate2::write::GzEncoder;
        use std::io::Write;

        let dest = tempfile::TempDir::new().unwrap();
        let tar = tarball(&[("bin/tool", b"#!/bin/sh\n")]);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar).unwrap();
        let gz = encoder.finish().unwrap();

        let bytes = unpack_layer(&gz[..], dest.path()).unwrap();

        assert_eq!(bytes, gz.len() as u64);
        assert!(dest.path().join("bin/tool").exists());
    }

    #[test]
    fn test_validate_graph_id() {
        assert!(validate_graph_id("abc123").is_ok());
        assert!(validate_graph_id("").is_err());
        assert!(validate_graph_id("..").is_err());
        assert!(validate_graph_id("a/b").is_err());
    }
}
