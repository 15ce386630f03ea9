//! Integration tests for the directory-backed layer store and the layer manager.

use std::path::Path;
use std::sync::Arc;
use strata::errors::StrataError;
use strata::fetch::QuotaedReader;
use strata::layers::{DirectoryLayerStore, LayerId, LayerMetadata, LayerStore};
use strata::manager::{ImageReference, LayerManager};
use strata::options::StrataOptions;
use strata_test_utils::{FakeRegistrySession, tar_archive};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

// ============================================================================
// TEST FIXTURES
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct TestContext {
    store: DirectoryLayerStore,
    _temp_dir: TempDir,
}

impl TestContext {
    fn new() -> Self {
        init_tracing();
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = DirectoryLayerStore::new(temp_dir.path().join("graph"))
            .expect("Failed to open store");
        Self {
            store,
            _temp_dir: temp_dir,
        }
    }
}

fn metadata(id: &str) -> LayerMetadata {
    LayerMetadata {
        id: id.to_string(),
        ..Default::default()
    }
}

fn entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

// ============================================================================
// STORE TESTS
// ============================================================================

#[tokio::test]
async fn unknown_layer_is_not_found() {
    let ctx = TestContext::new();
    let id = LayerId::docker("missing");

    assert!(matches!(ctx.store.path(&id).await, Err(StrataError::NotFound(_))));
    assert!(matches!(ctx.store.get(&id).await, Err(StrataError::NotFound(_))));
    assert!(matches!(ctx.store.remove(&id).await, Err(StrataError::NotFound(_))));
}

#[tokio::test]
async fn register_then_path_get_remove() {
    let ctx = TestContext::new();
    let tar = tar_archive(&[("etc/os-release", b"ID=strata\n"), ("bin/sh", b"\x7fELF")]);
    let id = LayerId::docker("base");

    let registered = ctx
        .store
        .register(metadata("base"), Box::new(std::io::Cursor::new(tar.clone())))
        .await
        .unwrap();
    assert_eq!(registered.size, tar.len() as u64);

    let path = ctx.store.path(&id).await.unwrap();
    assert_eq!(path, ctx.store.layout().layer_dir("base"));
    assert_eq!(
        std::fs::read(path.join("etc/os-release")).unwrap(),
        b"ID=strata\n"
    );
    assert_eq!(ctx.store.get(&id).await.unwrap(), registered);

    ctx.store.remove(&id).await.unwrap();
    assert!(!path.exists());
    assert!(matches!(ctx.store.get(&id).await, Err(StrataError::NotFound(_))));
    assert!(entries(&ctx.store.layout().layers_dir()).is_empty());
    assert!(entries(&ctx.store.layout().metadata_dir()).is_empty());
}

#[tokio::test]
async fn advertised_size_is_kept() {
    let ctx = TestContext::new();
    let mut meta = metadata("sized");
    meta.size = 4096;

    let registered = ctx
        .store
        .register(meta, Box::new(std::io::Cursor::new(tar_archive(&[("f", b"x")]))))
        .await
        .unwrap();

    assert_eq!(registered.size, 4096);
}

#[tokio::test]
async fn records_survive_reopening() {
    let ctx = TestContext::new();
    let root = ctx.store.layout().root().to_path_buf();
    let layer = LayerMetadata::from_json(
        br#"{"id": "cfg", "config": {"Env": ["LANG=C"], "Volumes": {"/srv": {}}}}"#,
    )
    .unwrap();
    ctx.store
        .register(layer, Box::new(std::io::Cursor::new(tar_archive(&[]))))
        .await
        .unwrap();

    let reopened = DirectoryLayerStore::new(root).unwrap();
    let loaded = reopened.get(&LayerId::docker("cfg")).await.unwrap();

    assert_eq!(loaded.env(), ["LANG=C"]);
    assert_eq!(loaded.volumes(), vec!["/srv"]);
}

#[tokio::test]
async fn quota_overrun_leaves_nothing_behind() {
    let ctx = TestContext::new();
    let big = vec![7u8; 64 * 1024];
    let tar = tar_archive(&[("blob", &big)]);
    let reader = QuotaedReader::new(std::io::Cursor::new(tar), 4096);
    let probe = reader.probe();

    let err = ctx
        .store
        .register(metadata("big"), Box::new(reader))
        .await
        .unwrap_err();

    assert!(probe.exceeded());
    assert_eq!(err, StrataError::QuotaExceeded);
    assert!(entries(&ctx.store.layout().layers_dir()).is_empty());
    assert!(ctx.store.get(&LayerId::docker("big")).await.is_err());
}

#[tokio::test]
async fn layer_directory_without_record_is_replaced() {
    let ctx = TestContext::new();
    let leftover = ctx.store.layout().layer_dir("base");
    std::fs::create_dir_all(leftover.join("nested")).unwrap();
    std::fs::write(leftover.join("nested/f"), b"stale").unwrap();

    let tar = tar_archive(&[("etc/hostname", b"fresh\n")]);
    ctx.store
        .register(metadata("base"), Box::new(std::io::Cursor::new(tar)))
        .await
        .unwrap();

    let path = ctx.store.path(&LayerId::docker("base")).await.unwrap();
    assert_eq!(path, leftover);
    assert!(!path.join("nested").exists());
    assert_eq!(std::fs::read(path.join("etc/hostname")).unwrap(), b"fresh\n");
    assert_eq!(entries(&ctx.store.layout().layers_dir()), vec!["base"]);
}

#[tokio::test]
async fn registered_layer_is_not_replaced() {
    let ctx = TestContext::new();
    let first = tar_archive(&[("version", b"1")]);
    let second = tar_archive(&[("version", b"2")]);

    ctx.store
        .register(metadata("base"), Box::new(std::io::Cursor::new(first)))
        .await
        .unwrap();
    ctx.store
        .register(metadata("base"), Box::new(std::io::Cursor::new(second)))
        .await
        .unwrap();

    let path = ctx.store.path(&LayerId::docker("base")).await.unwrap();
    assert_eq!(std::fs::read(path.join("version")).unwrap(), b"1");
    assert_eq!(entries(&ctx.store.layout().layers_dir()), vec!["base"]);
}

#[test]
fn reopening_sweeps_stale_staging_dirs() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("graph");
    let store = DirectoryLayerStore::new(root.clone()).unwrap();
    let layers_dir = store.layout().layers_dir();
    let stale = layers_dir.join("base.0123456789abcdef.registering");
    std::fs::create_dir_all(stale.join("usr/bin")).unwrap();
    std::fs::write(stale.join("usr/bin/tool"), b"half").unwrap();
    std::fs::create_dir_all(layers_dir.join("kept")).unwrap();

    DirectoryLayerStore::new(root).unwrap();

    assert!(!stale.exists());
    assert_eq!(entries(&layers_dir), vec!["kept"]);
}

#[tokio::test]
async fn corrupt_archive_is_rejected() {
    let ctx = TestContext::new();
    let mut garbage = vec![0xAAu8; 1024];
    garbage[0] = b'x';

    let result = ctx
        .store
        .register(metadata("junk"), Box::new(std::io::Cursor::new(garbage)))
        .await;

    assert!(result.is_err());
    assert!(entries(&ctx.store.layout().layers_dir()).is_empty());
}

#[tokio::test]
async fn escaping_layer_ids_are_rejected() {
    let ctx = TestContext::new();

    for id in ["", "..", "a/b"] {
        let result = ctx
            .store
            .register(metadata(id), Box::new(std::io::Cursor::new(tar_archive(&[]))))
            .await;
        assert!(
            matches!(result, Err(StrataError::InvalidArgument(_))),
            "{id:?} accepted"
        );
    }
}

#[tokio::test]
async fn container_layers_use_hashed_directory_names() {
    let ctx = TestContext::new();
    let id = LayerId::container("web-1");
    let graph_id = id.graph_id();

    ctx.store
        .register(metadata(&graph_id), Box::new(std::io::Cursor::new(tar_archive(&[]))))
        .await
        .unwrap();

    assert_eq!(
        ctx.store.path(&id).await.unwrap(),
        ctx.store.layout().layer_dir(&graph_id)
    );
}

// ============================================================================
// LAYER MANAGER TESTS
// ============================================================================

fn busybox_registry() -> FakeRegistrySession {
    FakeRegistrySession::new()
        .with_repository("library/busybox", &["ep-a"])
        .with_tag("library/busybox", "latest", "bb-top")
        .with_history("bb-top", &["bb-top", "bb-base"])
        .with_layer(
            "bb-base",
            &["PATH=/bin"],
            &[],
            tar_archive(&[("bin/busybox", b"\x7fELF")]),
        )
        .with_layer(
            "bb-top",
            &["HOME=/root"],
            &["/tmp"],
            tar_archive(&[("etc/motd", b"hello\n")]),
        )
}

fn manager_options(temp_dir: &TempDir) -> StrataOptions {
    StrataOptions {
        home_dir: temp_dir.path().to_path_buf(),
        ..Default::default()
    }
}

#[tokio::test]
async fn manager_fetches_into_graph_dir_and_removes() {
    init_tracing();
    let temp_dir = TempDir::new().unwrap();
    let manager = LayerManager::new(manager_options(&temp_dir)).unwrap();
    let reference = ImageReference::parse("docker:///busybox").unwrap();

    let image = manager
        .fetch_with_session(&reference, Arc::new(busybox_registry()))
        .await
        .unwrap();

    assert_eq!(
        image.layer_ids,
        vec![LayerId::docker("bb-base"), LayerId::docker("bb-top")]
    );
    assert_eq!(image.env.to_entries(), vec!["PATH=/bin", "HOME=/root"]);

    let store = manager.store();
    let base = store.path(&LayerId::docker("bb-base")).await.unwrap();
    assert!(base.starts_with(temp_dir.path().join("graph")));
    assert!(base.join("bin/busybox").exists());

    manager.remove(&LayerId::docker("bb-base")).await.unwrap();
    assert!(!base.exists());
    assert!(store.get(&LayerId::docker("bb-top")).await.is_ok());
}

#[tokio::test]
async fn manager_applies_image_size_limit() {
    let temp_dir = TempDir::new().unwrap();
    let mut options = manager_options(&temp_dir);
    options.max_image_size = 1024;
    let manager = LayerManager::new(options).unwrap();
    let reference = ImageReference::parse("docker:///busybox").unwrap();

    let err = manager
        .fetch_with_session(&reference, Arc::new(busybox_registry()))
        .await
        .unwrap_err();

    assert_eq!(err, StrataError::QuotaExceeded);
}

#[tokio::test]
async fn manager_resolves_ids_and_reports_default_host() {
    let temp_dir = TempDir::new().unwrap();
    let manager = LayerManager::new(manager_options(&temp_dir)).unwrap();

    let id = manager
        .fetch_id_with_session(
            &ImageReference::parse("docker:///busybox#latest").unwrap(),
            Arc::new(busybox_registry()),
        )
        .await
        .unwrap();
    assert_eq!(id, LayerId::docker("bb-top"));

    let err = manager
        .fetch_id_with_session(
            &ImageReference::parse("docker:///busybox#1.36").unwrap(),
            Arc::new(busybox_registry()),
        )
        .await
        .unwrap_err();
    assert!(
        matches!(&err, StrataError::Fetch { host, .. } if host == strata::options::DEFAULT_REGISTRY),
        "{err:?}"
    );
}

#[test]
fn manager_with_btrfs_mount_builds_without_running_commands() {
    let temp_dir = TempDir::new().unwrap();
    let mut options = manager_options(&temp_dir);
    options.btrfs_mount_point = Some(temp_dir.path().to_path_buf());

    let manager = LayerManager::new(options).unwrap();

    assert!(temp_dir.path().join("graph/layers").is_dir());
    assert!(temp_dir.path().join("graph/metadata").is_dir());
    assert_eq!(
        manager.options().btrfs_mount_point.as_deref(),
        Some(temp_dir.path())
    );
}
