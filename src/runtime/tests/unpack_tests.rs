//! Unpacker integration tests: filters, overwrite policy, parent chains.

mod common;

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use common::{build_kit, null_progress, tar_bytes, KitLayer, MockRemote};
use kitops_core::oci::ContentDigest;
use kitops_core::{Descriptor, KitError, Manifest, ModelReference};
use kitops_runtime::{parse_filter, unpack_modelkit, LocalRepo, PullOptions, UnpackOptions};

fn opts(reference: &str, unpack_dir: &Path) -> UnpackOptions {
    UnpackOptions {
        model_ref: ModelReference::parse(reference).unwrap(),
        unpack_dir: unpack_dir.to_path_buf(),
        filters: vec![],
        overwrite: false,
        ignore_existing: false,
    }
}

fn full_kit() -> common::BuiltKit {
    build_kit(
        "demo",
        None,
        vec![
            KitLayer::model("demo", "model/weights.bin", &[("model/weights.bin", &[7u8; 256])]),
            KitLayer::dataset("train", "data/train.csv", &[("data/train.csv", b"1,2\n")]),
            KitLayer::dataset("validation", "data/val.csv", &[("data/val.csv", b"3,4\n")]),
            KitLayer::code("src/", &[("src/train.py", b"print('hi')\n")]),
            KitLayer::docs("README.md", &[("README.md", b"# demo\n")]),
        ],
    )
}

#[tokio::test]
async fn test_unpack_everything() {
    let tmp = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let kit = full_kit();
    let repo = LocalRepo::open(tmp.path(), "localhost/demo").unwrap();
    kit.seed_local(&repo, "latest").await;

    unpack_modelkit(tmp.path(), &opts("demo", out.path()), null_progress())
        .await
        .unwrap();

    assert!(out.path().join("Kitfile").is_file());
    assert_eq!(
        std::fs::read(out.path().join("model/weights.bin")).unwrap(),
        vec![7u8; 256]
    );
    assert!(out.path().join("data/train.csv").is_file());
    assert!(out.path().join("data/val.csv").is_file());
    assert!(out.path().join("src/train.py").is_file());
    assert!(out.path().join("README.md").is_file());
}

#[tokio::test]
async fn test_unpack_filter_model_and_named_dataset() {
    let tmp = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let kit = full_kit();
    let repo = LocalRepo::open(tmp.path(), "localhost/demo").unwrap();
    kit.seed_local(&repo, "latest").await;

    let mut options = opts("demo", out.path());
    options.filters = vec![
        parse_filter("model").unwrap(),
        parse_filter("datasets:train").unwrap(),
    ];
    unpack_modelkit(tmp.path(), &options, null_progress())
        .await
        .unwrap();

    // Kitfile is absent: the filter omits 'kitfile'
    assert!(!out.path().join("Kitfile").exists());
    assert!(out.path().join("model/weights.bin").is_file());
    assert!(out.path().join("data/train.csv").is_file());
    // Unselected entries stay off disk
    assert!(!out.path().join("data/val.csv").exists());
    assert!(!out.path().join("src/train.py").exists());
    assert!(!out.path().join("README.md").exists());
}

#[tokio::test]
async fn test_unpack_kitfile_only() {
    let tmp = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let kit = full_kit();
    let repo = LocalRepo::open(tmp.path(), "localhost/demo").unwrap();
    kit.seed_local(&repo, "latest").await;

    let mut options = opts("demo", out.path());
    options.filters = vec![parse_filter("kitfile").unwrap()];
    unpack_modelkit(tmp.path(), &options, null_progress())
        .await
        .unwrap();

    assert!(out.path().join("Kitfile").is_file());
    assert!(!out.path().join("model").exists());
    assert!(!out.path().join("data").exists());
}

#[tokio::test]
async fn test_unpack_twice_conflicts_without_overwrite() {
    let tmp = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let kit = full_kit();
    let repo = LocalRepo::open(tmp.path(), "localhost/demo").unwrap();
    kit.seed_local(&repo, "latest").await;

    unpack_modelkit(tmp.path(), &opts("demo", out.path()), null_progress())
        .await
        .unwrap();
    let err = unpack_modelkit(tmp.path(), &opts("demo", out.path()), null_progress())
        .await
        .unwrap_err();
    assert!(matches!(err, KitError::Conflict { .. }));
}

#[tokio::test]
async fn test_unpack_ignore_existing_leaves_files() {
    let tmp = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let kit = full_kit();
    let repo = LocalRepo::open(tmp.path(), "localhost/demo").unwrap();
    kit.seed_local(&repo, "latest").await;

    unpack_modelkit(tmp.path(), &opts("demo", out.path()), null_progress())
        .await
        .unwrap();
    // Locally modify a file, then unpack again ignoring existing files
    std::fs::write(out.path().join("data/train.csv"), b"edited").unwrap();
    let mut options = opts("demo", out.path());
    options.ignore_existing = true;
    unpack_modelkit(tmp.path(), &options, null_progress())
        .await
        .unwrap();
    assert_eq!(
        std::fs::read(out.path().join("data/train.csv")).unwrap(),
        b"edited"
    );
}

#[tokio::test]
async fn test_unpack_overwrite_replaces_files() {
    let tmp = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let kit = full_kit();
    let repo = LocalRepo::open(tmp.path(), "localhost/demo").unwrap();
    kit.seed_local(&repo, "latest").await;

    unpack_modelkit(tmp.path(), &opts("demo", out.path()), null_progress())
        .await
        .unwrap();
    std::fs::write(out.path().join("data/train.csv"), b"edited").unwrap();
    let mut options = opts("demo", out.path());
    options.overwrite = true;
    unpack_modelkit(tmp.path(), &options, null_progress())
        .await
        .unwrap();
    assert_eq!(
        std::fs::read(out.path().join("data/train.csv")).unwrap(),
        b"1,2\n"
    );
}

#[tokio::test]
async fn test_unpack_rejects_path_traversal() {
    let tmp = TempDir::new().unwrap();
    let outer = TempDir::new().unwrap();
    let out = outer.path().join("target");
    std::fs::create_dir(&out).unwrap();

    // A code layer whose tar tries to climb out of the unpack dir
    let kit = build_kit(
        "evil",
        None,
        vec![KitLayer::code("src/", &[("../escape.txt", b"gotcha")])],
    );
    let repo = LocalRepo::open(tmp.path(), "localhost/evil").unwrap();
    kit.seed_local(&repo, "latest").await;

    let err = unpack_modelkit(tmp.path(), &opts("evil", &out), null_progress())
        .await
        .unwrap_err();
    assert!(matches!(err, KitError::PathTraversal { .. }));
    assert!(!outer.path().join("escape.txt").exists());
}

#[tokio::test]
async fn test_unpack_manifest_config_mismatch() {
    let tmp = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let kit = full_kit();
    let repo = LocalRepo::open(tmp.path(), "localhost/demo").unwrap();
    kit.seed_local(&repo, "latest").await;

    // Re-point the manifest's model layer at a different digest
    let mut manifest = Manifest::from_bytes(&kit.manifest_bytes).unwrap();
    manifest.layers[0].digest = ContentDigest::from_content(b"someone else's layer");
    let tampered_bytes = manifest.to_bytes().unwrap();
    let tampered_desc = Descriptor::for_manifest_bytes(&tampered_bytes);
    repo.push(&tampered_desc, common::boxed_reader(&tampered_bytes))
        .await
        .unwrap();
    repo.tag(&tampered_desc, "bad").await.unwrap();

    let err = unpack_modelkit(tmp.path(), &opts("demo:bad", out.path()), null_progress())
        .await
        .unwrap_err();
    assert!(matches!(err, KitError::ManifestConfigMismatch { .. }));
}

/// Seed a chain of kits where each extends the previous via `model.path`.
async fn seed_chain(storage: &Path, count: usize, prefix: &str) {
    for i in 0..count {
        let parent = if i == 0 {
            None
        } else {
            Some(format!("localhost/{prefix}-{}:latest", i - 1))
        };
        let file = format!("model/gen{i}.bin");
        let kit = build_kit(
            &format!("{prefix}-{i}"),
            parent.as_deref(),
            vec![KitLayer::model(
                &format!("gen{i}"),
                &file,
                &[(file.as_str(), format!("weights {i}").as_bytes())],
            )],
        );
        let repo = LocalRepo::open(storage, &format!("localhost/{prefix}-{i}")).unwrap();
        kit.seed_local(&repo, "latest").await;
    }
}

#[tokio::test]
async fn test_unpack_parent_chain_collects_model_layers() {
    let tmp = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    seed_chain(tmp.path(), 2, "base").await;

    // Child extends base-1 and adds its own dataset
    let child = build_kit(
        "child",
        Some("localhost/base-1:latest"),
        vec![
            KitLayer::model("child", "model/child.bin", &[("model/child.bin", b"child weights")]),
            KitLayer::dataset("train", "data/train.csv", &[("data/train.csv", b"1\n")]),
        ],
    );
    let repo = LocalRepo::open(tmp.path(), "localhost/child").unwrap();
    child.seed_local(&repo, "latest").await;

    unpack_modelkit(tmp.path(), &opts("child", out.path()), null_progress())
        .await
        .unwrap();

    // Model layers from every generation land in order
    assert_eq!(
        std::fs::read(out.path().join("model/gen0.bin")).unwrap(),
        b"weights 0"
    );
    assert_eq!(
        std::fs::read(out.path().join("model/gen1.bin")).unwrap(),
        b"weights 1"
    );
    assert_eq!(
        std::fs::read(out.path().join("model/child.bin")).unwrap(),
        b"child weights"
    );
    // The child's own non-model entries are included; the Kitfile is the child's
    assert!(out.path().join("data/train.csv").is_file());
    let kitfile = std::fs::read_to_string(out.path().join("Kitfile")).unwrap();
    assert!(kitfile.contains("child"));
}

#[tokio::test]
async fn test_unpack_parent_skipped_when_filter_excludes_model() {
    let tmp = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    seed_chain(tmp.path(), 1, "base").await;

    let child = build_kit(
        "child",
        Some("localhost/base-0:latest"),
        vec![
            KitLayer::model("child", "model/child.bin", &[("model/child.bin", b"w")]),
            KitLayer::code("src/", &[("src/a.py", b"pass\n")]),
        ],
    );
    let repo = LocalRepo::open(tmp.path(), "localhost/child").unwrap();
    child.seed_local(&repo, "latest").await;

    let mut options = opts("child", out.path());
    options.filters = vec![parse_filter("code").unwrap()];
    unpack_modelkit(tmp.path(), &options, null_progress())
        .await
        .unwrap();

    assert!(out.path().join("src/a.py").is_file());
    assert!(!out.path().join("model").exists());
}

#[tokio::test]
async fn test_unpack_reference_cycle() {
    let tmp = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();

    let a = build_kit(
        "cycle-a",
        Some("localhost/cycle-b:latest"),
        vec![KitLayer::model("a", "model/a.bin", &[("model/a.bin", b"a")])],
    );
    let b = build_kit(
        "cycle-b",
        Some("localhost/cycle-a:latest"),
        vec![KitLayer::model("b", "model/b.bin", &[("model/b.bin", b"b")])],
    );
    let repo_a = LocalRepo::open(tmp.path(), "localhost/cycle-a").unwrap();
    a.seed_local(&repo_a, "latest").await;
    let repo_b = LocalRepo::open(tmp.path(), "localhost/cycle-b").unwrap();
    b.seed_local(&repo_b, "latest").await;

    let err = unpack_modelkit(tmp.path(), &opts("cycle-a", out.path()), null_progress())
        .await
        .unwrap_err();
    assert!(matches!(err, KitError::ReferenceCycle(_)));
}

#[tokio::test]
async fn test_unpack_reference_chain_too_long() {
    let tmp = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    // Chain depth exceeds MAX_MODEL_REF_CHAIN (10)
    seed_chain(tmp.path(), 13, "deep").await;

    let err = unpack_modelkit(tmp.path(), &opts("deep-12", out.path()), null_progress())
        .await
        .unwrap_err();
    assert!(matches!(err, KitError::ReferenceChainTooLong(_)));
}

#[tokio::test]
async fn test_pull_then_unpack_round_trip() {
    let storage = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let remote = Arc::new(MockRemote::new(true));
    let kit = full_kit();
    kit.seed_remote(&remote, "1.0");

    let repo = LocalRepo::open(storage.path(), "registry.example.com/org/demo").unwrap();
    repo.pull_model(
        remote.clone(),
        &ModelReference::parse("registry.example.com/org/demo:1.0").unwrap(),
        PullOptions::default(),
        null_progress(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    unpack_modelkit(
        storage.path(),
        &opts("registry.example.com/org/demo:1.0", out.path()),
        null_progress(),
    )
    .await
    .unwrap();

    assert_eq!(
        std::fs::read(out.path().join("model/weights.bin")).unwrap(),
        vec![7u8; 256]
    );
    assert_eq!(
        std::fs::read(out.path().join("data/train.csv")).unwrap(),
        b"1,2\n"
    );
    assert_eq!(
        std::fs::read(out.path().join("src/train.py")).unwrap(),
        b"print('hi')\n"
    );
}

#[tokio::test]
async fn test_unpack_gzip_layer() {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write as _;

    let tmp = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();

    // Hand-build a kit whose single model layer is gzip compressed
    let tar = tar_bytes(&[("model/weights.bin", b"compressed weights")]);
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar).unwrap();
    let gz = encoder.finish().unwrap();

    let layer_desc = Descriptor::new(
        "application/vnd.kitops.modelkit.model.v1.tar+gzip",
        ContentDigest::from_content(&gz),
        gz.len() as u64,
    );
    let kitfile_yaml = format!(
        "manifestVersion: \"1.0\"\nmodel:\n  name: gz\n  path: model/weights.bin\n  layerInfo:\n    digest: {}\n",
        layer_desc.digest
    )
    .into_bytes();
    let config_desc = Descriptor::new(
        kitops_core::oci::MEDIA_TYPE_MODELKIT_CONFIG,
        ContentDigest::from_content(&kitfile_yaml),
        kitfile_yaml.len() as u64,
    );
    let manifest = Manifest::new(config_desc.clone(), vec![layer_desc.clone()]);
    let manifest_bytes = manifest.to_bytes().unwrap();
    let manifest_desc = Descriptor::for_manifest_bytes(&manifest_bytes);

    let repo = LocalRepo::open(tmp.path(), "localhost/gz").unwrap();
    repo.push(&config_desc, common::boxed_reader(&kitfile_yaml))
        .await
        .unwrap();
    repo.push(&layer_desc, common::boxed_reader(&gz)).await.unwrap();
    repo.push(&manifest_desc, common::boxed_reader(&manifest_bytes))
        .await
        .unwrap();
    repo.tag(&manifest_desc, "latest").await.unwrap();

    unpack_modelkit(tmp.path(), &opts("gz", out.path()), null_progress())
        .await
        .unwrap();
    assert_eq!(
        std::fs::read(out.path().join("model/weights.bin")).unwrap(),
        b"compressed weights"
    );
}
