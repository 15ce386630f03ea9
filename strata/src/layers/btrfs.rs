//! Layer removal on btrfs.
//!
//! A layer's directory on btrfs is a subvolume, and anything running inside a
//! container (docker-in-docker, nested snapshots) may have created further
//! subvolumes beneath it. A plain recursive delete cannot remove those, and
//! every subvolume may also own a quota group that outlives it unless it is
//! destroyed explicitly. `BtrfsReclaimer` handles both before handing the
//! layer to the wrapped store for removal.

use crate::errors::{StrataError, StrataResult};
use crate::layers::{LayerId, LayerMetadata, LayerStore, LayerStream};
use crate::util::CommandRunner;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const BTRFS: &str = "btrfs";

/// Best-effort content removal applied to a subvolume before it is deleted.
pub type ContentCleaner = Arc<dyn Fn(&Path) -> std::io::Result<()> + Send + Sync>;

/// `LayerStore` decorator that reclaims nested subvolumes and quota groups.
///
/// Only `remove` is intercepted; `path`, `get` and `register` go straight to
/// the wrapped store.
pub struct BtrfsReclaimer {
    store: Arc<dyn LayerStore>,
    runner: Arc<dyn CommandRunner>,
    mount_point: PathBuf,
    clean: ContentCleaner,
}

impl std::fmt::Debug for BtrfsReclaimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtrfsReclaimer")
            .field("mount_point", &self.mount_point)
            .finish()
    }
}

impl BtrfsReclaimer {
    /// Wrap `store`, whose layers live on the btrfs filesystem mounted at
    /// `mount_point`.
    pub fn new(
        store: Arc<dyn LayerStore>,
        runner: Arc<dyn CommandRunner>,
        mount_point: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            runner,
            mount_point: mount_point.into(),
            clean: Arc::new(clear_dir_contents),
        }
    }

    /// Replace the function used to empty a subvolume before deleting it.
    pub fn with_content_cleaner(mut self, clean: ContentCleaner) -> Self {
        self.clean = clean;
        self
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Delete every subvolume nested under `layer_path`, children first.
    ///
    /// The layer's own subvolume is left for the wrapped store.
    async fn remove_subvolumes(&self, layer_path: &Path) -> StrataResult<()> {
        let listing = self
            .runner
            .run(
                BTRFS,
                &["subvolume".into(), "list".into(), path_arg(&self.mount_point)],
            )
            .await?;

        for subvolume in nested_subvolumes(&self.mount_point, layer_path, &listing) {
            tracing::info!(
                layer_path = %layer_path.display(),
                subvolume = %subvolume.display(),
                "removing nested subvolume"
            );

            // A leftover file makes the delete below fail, which is reported there.
            let clean = Arc::clone(&self.clean);
            let target = subvolume.clone();
            let cleared = tokio::task::spawn_blocking(move || clean(&target))
                .await
                .map_err(|e| std::io::Error::other(format!("clean task failed: {e}")))
                .and_then(|r| r);
            if let Err(e) = cleared {
                tracing::warn!(
                    subvolume = %subvolume.display(),
                    error = %e,
                    "failed to clear subvolume contents"
                );
            }

            self.runner
                .run(
                    BTRFS,
                    &["subvolume".into(), "delete".into(), path_arg(&subvolume)],
                )
                .await?;
        }

        Ok(())
    }

    /// Destroy the quota group accounting for `layer_path`.
    async fn remove_qgroup(&self, layer_path: &Path) -> StrataResult<()> {
        let info = self
            .runner
            .run(
                BTRFS,
                &[
                    "qgroup".into(),
                    "show".into(),
                    "-f".into(),
                    path_arg(layer_path),
                ],
            )
            .await?;

        let qgroup_id = parse_qgroup_id(&info)?;

        if let Err(e) = self
            .runner
            .run(
                BTRFS,
                &[
                    "qgroup".into(),
                    "destroy".into(),
                    qgroup_id.clone(),
                    path_arg(&self.mount_point),
                ],
            )
            .await
        {
            tracing::error!(qgroup_id = %qgroup_id, error = %e, "failed to destroy qgroup");
            return Ok(());
        }

        tracing::info!(qgroup_id = %qgroup_id, "destroyed qgroup");
        Ok(())
    }
}

#[async_trait]
impl LayerStore for BtrfsReclaimer {
    async fn path(&self, id: &LayerId) -> StrataResult<PathBuf> {
        self.store.path(id).await
    }

    async fn get(&self, id: &LayerId) -> StrataResult<LayerMetadata> {
        self.store.get(id).await
    }

    async fn register(
        &self,
        metadata: LayerMetadata,
        content: LayerStream,
    ) -> StrataResult<LayerMetadata> {
        self.store.register(metadata, content).await
    }

    async fn remove(&self, id: &LayerId) -> StrataResult<()> {
        tracing::info!(id = %id, "cleaning layer");

        let layer_path = match self.store.path(id).await {
            Ok(path) => path,
            Err(e) => {
                tracing::error!(id = %id, error = %e, "failed to resolve layer path");
                return Err(e);
            }
        };

        if let Err(e) = self.remove_subvolumes(&layer_path).await {
            tracing::error!(id = %id, error = %e, "failed to remove nested subvolumes");
            return Err(e);
        }

        if let Err(e) = self.remove_qgroup(&layer_path).await {
            tracing::error!(id = %id, error = %e, "failed to remove qgroup");
        }

        let result = self.store.remove(id).await;
        tracing::info!(id = %id, ok = result.is_ok(), "cleaning layer complete");
        result
    }
}

/// Subvolumes from a `btrfs subvolume list` listing that are strictly nested
/// under `layer_path`, deepest first.
fn nested_subvolumes(mount_point: &Path, layer_path: &Path, listing: &str) -> Vec<PathBuf> {
    let mut nested: Vec<PathBuf> = listing
        .lines()
        .filter_map(|line| line.split_whitespace().last())
        .map(|relative| {
            let relative = relative.strip_prefix("<FS_TREE>/").unwrap_or(relative);
            mount_point.join(relative)
        })
        .filter(|path| path.starts_with(layer_path) && path.as_path() != layer_path)
        .collect();

    nested.sort_by(|a, b| {
        let depth = |p: &Path| p.components().count();
        depth(b)
            .cmp(&depth(a))
            .then_with(|| b.as_os_str().len().cmp(&a.as_os_str().len()))
            .then_with(|| a.cmp(b))
    });
    nested.dedup();
    nested
}

/// Extract the qgroup id from `btrfs qgroup show -f` output.
///
/// Expected shape: two header lines, one data line, and the trailing newline.
fn parse_qgroup_id(output: &str) -> StrataResult<String> {
    let lines: Vec<&str> = output.split('\n').collect();
    if lines.len() != 4 {
        return Err(StrataError::Command(format!(
            "unexpected qgroup show output: {:?}",
            output
        )));
    }

    lines[2]
        .split_whitespace()
        .next()
        .map(str::to_string)
        .ok_or_else(|| {
            StrataError::Command(format!("unexpected qgroup show output: {:?}", output))
        })
}

/// Remove everything inside `dir`, leaving `dir` itself in place.
///
/// Stops at the first failure.
pub fn clear_dir_contents(dir: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(entry.path())?;
        } else {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNT: &str = "/absolute/btrfs_mount";
    const LAYER: &str = "/absolute/btrfs_mount/relative/path/to/the-layer";

    fn nested(listing: &str) -> Vec<String> {
        nested_subvolumes(Path::new(MOUNT), Path::new(LAYER), listing)
            .into_iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_blank_listing_has_no_subvolumes() {
        assert!(nested("\n").is_empty());
        assert!(nested("").is_empty());
    }

    #[test]
    fn test_layer_itself_is_excluded() {
        let listing = "ID 257 gen 9 top level 5 path relative/path/to/the-layer\n";
        assert!(nested(listing).is_empty());
    }

    #[test]
    fn test_unrelated_and_sibling_subvolumes_are_excluded() {
        let listing = "\
ID 257 gen 9 top level 5 path relative/path/to/other-layer/sub
ID 258 gen 9 top level 5 path relative/path/to/the-layer2/sub
ID 259 gen 9 top level 5 path relative/path/to/the-layer/sub
";
        assert_eq!(nested(listing), vec![format!("{}/sub", LAYER)]);
    }

    #[test]
    fn test_deepest_first() {
        let listing = "\
ID 257 gen 9 top level 5 path relative/path/to/the-layer
ID 258 gen 9 top level 257 path relative/path/to/the-layer/subvolume1
ID 259 gen 9 top level 258 path relative/path/to/the-layer/subvolume1/subsubvol1
";
        assert_eq!(
            nested(listing),
            vec![
                format!("{}/subvolume1/subsubvol1", LAYER),
                format!("{}/subvolume1", LAYER),
            ]
        );
    }

    #[test]
    fn test_depth_beats_name_length() {
        let listing = "\
ID 258 gen 9 top level 257 path relative/path/to/the-layer/a-very-long-subvolume-name
ID 259 gen 9 top level 258 path relative/path/to/the-layer/b/c
";
        assert_eq!(
            nested(listing),
            vec![
                format!("{}/b/c", LAYER),
                format!("{}/a-very-long-subvolume-name", LAYER),
            ]
        );
    }

    #[test]
    fn test_fs_tree_prefix_is_stripped() {
        let listing = "ID 258 gen 9 top level 5 path <FS_TREE>/relative/path/to/the-layer/sub\n";
        assert_eq!(nested(listing), vec![format!("{}/sub", LAYER)]);
    }

    #[test]
    fn test_parse_qgroup_id() {
        let output = "qgroupid rfer  excl\n-------- ----  ----\n0/5      49152 49152\n";
        assert_eq!(parse_qgroup_id(output).unwrap(), "0/5");
    }

    #[test]
    fn test_parse_qgroup_id_rejects_other_shapes() {
        assert!(parse_qgroup_id("").is_err());
        assert!(parse_qgroup_id("qgroupid rfer excl\n-------- ---- ----\n").is_err());
        assert!(
            parse_qgroup_id("qgroupid rfer excl\n---\n0/5 1 1\n0/6 1 1\n").is_err(),
            "two data lines are not a single qgroup"
        );
        assert!(parse_qgroup_id("h\n-\n   \n").is_err());
    }

    #[test]
    fn test_clear_dir_contents_keeps_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("file"), b"x").unwrap();
        std::fs::create_dir_all(dir.path().join("nested/deeper")).unwrap();
        std::fs::write(dir.path().join("nested/deeper/file"), b"y").unwrap();

        clear_dir_contents(dir.path()).unwrap();

        assert!(dir.path().exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_clear_dir_contents_missing_dir_fails() {
        assert!(clear_dir_contents(Path::new("/nonexistent/strata/subvol")).is_err());
    }
}
