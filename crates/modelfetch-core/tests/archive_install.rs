//! Archive payloads: download, extract, flatten, and report.

mod common;

use common::{drain, file_list, wait_for_state, zip_bytes, Harness};
use modelfetch_core::{
    restructure, ArchiveSummary, DownloadEvent, DownloadState, FetchError, FileFilter,
    MemoryTransferBackend, ModelLocation, RemoteFile, RestructureOutcome, RestructureRules,
    StaticRepository,
};

const PACKAGE: &str = "org/coreml-package";

fn package_zip() -> Vec<u8> {
    zip_bytes(&[
        ("config.json", b"{\"outer\":true}"),
        ("package/", b""),
        ("package/inner/merges.txt", b"a b\n"),
        ("package/inner/config.json", b"{\"inner\":true}"),
        ("package/inner/TextEncoder.mlmodelc/weights/weight.bin", b"weights"),
        ("package/inner/TextEncoder.mlmodelc/model.mil", b"program"),
        ("package/notes/", b""),
    ])
}

async fn harness_with_package(bytes: Vec<u8>) -> Harness {
    let repo = StaticRepository::new().with_repo(
        PACKAGE,
        vec![RemoteFile::new("package.zip", bytes.len() as u64)],
    );
    let backend = MemoryTransferBackend::manual().with_content(PACKAGE, "package.zip", bytes);
    Harness::with_backend(repo, backend).await
}

#[tokio::test]
async fn test_downloaded_archive_is_flattened() {
    let h = harness_with_package(package_zip()).await;
    h.engine
        .start(ModelLocation::remote(PACKAGE), &FileFilter::allow_all())
        .await
        .unwrap();
    let mut events = h.engine.subscribe(PACKAGE).await.unwrap();

    h.backend.complete_session(&h.session_of(PACKAGE)).unwrap();
    wait_for_state(&h.engine, PACKAGE, DownloadState::Downloaded).await;

    let model_dir = h.engine.model_directory(PACKAGE);
    assert_eq!(
        file_list(&model_dir),
        [
            "TextEncoder.mlmodelc/model.mil",
            "TextEncoder.mlmodelc/weights/weight.bin",
            "config.json",
            "config_1.json",
            "merges.txt",
        ]
    );
    assert_eq!(
        std::fs::read_to_string(model_dir.join("config.json")).unwrap(),
        "{\"outer\":true}"
    );
    assert_eq!(
        std::fs::read_to_string(model_dir.join("config_1.json")).unwrap(),
        "{\"inner\":true}"
    );
    // Empty directories the archive shipped are kept; only emptied ones go.
    assert!(!model_dir.join("package/inner").exists());
    assert!(model_dir.join("package/notes").is_dir());
    assert!(!model_dir.join("package.zip").exists());

    match drain(&mut events).last() {
        Some(DownloadEvent::Completed(info)) => {
            assert_eq!(
                info.archive,
                Some(ArchiveSummary::Flattened {
                    moved: 3,
                    renamed: 1
                })
            );
        }
        other => panic!("expected completion, got {:?}", other),
    }

    // Running the restructurer again changes nothing.
    let before = file_list(&model_dir);
    let again = restructure(&model_dir, &RestructureRules::default()).unwrap();
    assert_eq!(again, RestructureOutcome::AlreadyFlat);
    assert_eq!(file_list(&model_dir), before);
}

#[tokio::test]
async fn test_archive_without_marker_is_kept_as_extracted() {
    let bytes = zip_bytes(&[
        ("weights/model.safetensors", b"w"),
        ("config.json", b"{}"),
    ]);
    let h = harness_with_package(bytes).await;
    h.engine
        .start(ModelLocation::remote(PACKAGE), &FileFilter::allow_all())
        .await
        .unwrap();
    let mut events = h.engine.subscribe(PACKAGE).await.unwrap();

    h.backend.complete_session(&h.session_of(PACKAGE)).unwrap();
    wait_for_state(&h.engine, PACKAGE, DownloadState::Downloaded).await;

    assert_eq!(
        file_list(&h.engine.model_directory(PACKAGE)),
        ["config.json", "weights/model.safetensors"]
    );
    match drain(&mut events).last() {
        Some(DownloadEvent::Completed(info)) => {
            assert_eq!(info.archive, Some(ArchiveSummary::MarkerNotFound));
        }
        other => panic!("expected completion, got {:?}", other),
    }
}

#[tokio::test]
async fn test_corrupt_archive_fails_download() {
    let h = harness_with_package(b"PK\x03\x04 definitely not a zip".to_vec()).await;
    h.engine
        .start(ModelLocation::remote(PACKAGE), &FileFilter::allow_all())
        .await
        .unwrap();
    let mut events = h.engine.subscribe(PACKAGE).await.unwrap();

    h.backend.complete_session(&h.session_of(PACKAGE)).unwrap();
    wait_for_state(&h.engine, PACKAGE, DownloadState::NotDownloaded).await;

    match drain(&mut events).last() {
        Some(DownloadEvent::Failed(error)) => {
            assert!(matches!(**error, FetchError::ArchiveCorrupt { .. }));
            assert!(!error.is_retryable());
        }
        other => panic!("expected failure, got {:?}", other),
    }

    // No staging directory is left behind.
    let leftovers: Vec<_> = std::fs::read_dir(&h.engine.config().models_root)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with(".extract-"))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn test_local_archive_installs_into_models_root() {
    let h = Harness::manual(StaticRepository::new()).await;
    let archive = h.tmp.path().join("bundle.zip");
    std::fs::write(&archive, package_zip()).unwrap();

    let model_id = h
        .engine
        .start(ModelLocation::local(&archive), &FileFilter::allow_all())
        .await
        .unwrap();
    assert_eq!(h.engine.current_state(&model_id), DownloadState::Downloaded);

    let record = h.engine.record(&model_id).unwrap();
    let local_path = record.local_path.unwrap();
    assert!(local_path.starts_with(&h.engine.config().models_root));
    assert!(local_path.join("merges.txt").is_file());
    assert!(local_path.join("config_1.json").is_file());
    // The source archive is left alone.
    assert!(archive.is_file());

    h.engine.delete(&model_id).await.unwrap();
    assert!(!local_path.exists());
    assert!(archive.is_file());
}
