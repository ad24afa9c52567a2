// ABOUTME: Integration tests for image builds, build log retrieval and snapshots
// ABOUTME: Runs the pipeline against the fake engine and fake object storage

mod common;

use common::{test_cache, test_manager, FakeEngine, FakeObjectStorage};
use futures::StreamExt;
use pretty_assertions::assert_eq;
use runner_sandbox::{
    build_log_path, BuildLogReader, BuildRequest, ContainerStatus, ImagePipeline, Outcome,
    RegistryCredentials, RunnerError, SandboxState, SnapshotState, StateCache,
};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn context_tarball(path: &str, data: &[u8]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, path, data).unwrap();
    builder.into_inner().unwrap()
}

fn registry() -> RegistryCredentials {
    RegistryCredentials {
        url: "registry.internal:5000".to_string(),
        project: Some("sandboxes".to_string()),
        username: Some("runner".to_string()),
        password: Some("secret".to_string()),
    }
}

fn pipeline(engine: Arc<FakeEngine>, dir: &TempDir) -> ImagePipeline {
    ImagePipeline::new(engine, test_cache(), dir.path().join("builds"))
}

#[tokio::test]
async fn test_build_streams_to_sink_and_log_file() {
    let dir = TempDir::new().unwrap();
    let engine = FakeEngine::new();
    engine.set_build_output(&["Step 1/2 : FROM python:3.12", "Successfully built abc123"]);

    let storage = Arc::new(FakeObjectStorage::default());
    storage.insert("org-1", "hash-1", context_tarball("main.py", b"print(1)"));
    let images = pipeline(engine.clone(), &dir).with_storage(storage);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let request = BuildRequest {
        image: "team/app:1.0".to_string(),
        dockerfile: "FROM python:3.12\nCOPY main.py .".to_string(),
        organization_id: Some("org-1".to_string()),
        context_hashes: vec!["hash-1".to_string()],
        ..Default::default()
    };

    let outcome = images.build_image(&request, Some(tx)).await.unwrap();

    assert_eq!(outcome, Outcome::Applied);
    assert_eq!(rx.recv().await.unwrap(), "Step 1/2 : FROM python:3.12");
    assert_eq!(rx.recv().await.unwrap(), "Successfully built abc123");

    let log = std::fs::read_to_string(build_log_path(
        &dir.path().join("builds"),
        "team/app:1.0",
    ))
    .unwrap();
    assert_eq!(
        log,
        "Step 1/2 : FROM python:3.12\nSuccessfully built abc123\n"
    );
}

#[tokio::test]
async fn test_build_of_existing_image_is_unchanged() {
    let dir = TempDir::new().unwrap();
    let engine = FakeEngine::new();
    engine.add_image("app:1.0", "amd64", chrono::Utc::now());
    let images = pipeline(engine.clone(), &dir);

    let request = BuildRequest {
        image: "app:1.0".to_string(),
        dockerfile: "FROM alpine".to_string(),
        ..Default::default()
    };

    assert_eq!(
        images.build_image(&request, None).await.unwrap(),
        Outcome::Unchanged
    );
    assert_eq!(engine.count("build_image"), 0);
}

#[tokio::test]
async fn test_build_rejects_untagged_reference() {
    let dir = TempDir::new().unwrap();
    let images = pipeline(FakeEngine::new(), &dir);

    let request = BuildRequest {
        image: "app".to_string(),
        dockerfile: "FROM alpine".to_string(),
        ..Default::default()
    };

    assert!(matches!(
        images.build_image(&request, None).await,
        Err(RunnerError::BadRequest(_))
    ));
}

#[tokio::test]
async fn test_build_publishes_to_internal_registry() {
    let dir = TempDir::new().unwrap();
    let engine = FakeEngine::new();
    let images = pipeline(engine.clone(), &dir).with_internal_registry(registry());

    let request = BuildRequest {
        image: "app:1.0".to_string(),
        dockerfile: "FROM alpine".to_string(),
        push_to_internal_registry: true,
        ..Default::default()
    };

    images.build_image(&request, None).await.unwrap();

    assert!(engine
        .calls()
        .contains(&"push_image:registry.internal:5000/sandboxes/app:1.0".to_string()));
}

#[tokio::test]
async fn test_publish_without_registry_is_bad_request() {
    let dir = TempDir::new().unwrap();
    let engine = FakeEngine::new();
    let images = pipeline(engine.clone(), &dir);

    let request = BuildRequest {
        image: "app:1.0".to_string(),
        dockerfile: "FROM alpine".to_string(),
        push_to_internal_registry: true,
        ..Default::default()
    };

    assert!(matches!(
        images.build_image(&request, None).await,
        Err(RunnerError::BadRequest(_))
    ));
    assert_eq!(engine.count("build_image"), 0);
}

#[tokio::test]
async fn test_build_logs_of_unknown_image_is_not_found() {
    let dir = TempDir::new().unwrap();
    let reader = BuildLogReader::new(FakeEngine::new(), dir.path());

    let result = reader.read("ghost:1.0", true).await;

    assert!(matches!(result, Err(RunnerError::NotFound(_))));
}

#[tokio::test]
async fn test_build_logs_full_dump() {
    let dir = TempDir::new().unwrap();
    std::fs::write(build_log_path(dir.path(), "app:1.0"), "one\ntwo\n").unwrap();
    let reader = BuildLogReader::new(FakeEngine::new(), dir.path());

    let lines: Vec<String> = reader
        .read("app:1.0", false)
        .await
        .unwrap()
        .map(|line| line.unwrap())
        .collect()
        .await;

    assert_eq!(lines, vec!["one", "two"]);
}

#[tokio::test]
async fn test_build_logs_follow_ends_after_image_appears() {
    let dir = TempDir::new().unwrap();
    let path = build_log_path(dir.path(), "app:1.0");
    std::fs::write(&path, "step 1\n").unwrap();

    let engine = FakeEngine::new();
    let reader = BuildLogReader::new(engine.clone(), dir.path())
        .with_timing(Duration::from_millis(10), Duration::from_millis(20));

    let follow = reader.read("app:1.0", true).await.unwrap();
    let collected = tokio::spawn(async move {
        follow
            .map(|line| line.unwrap())
            .collect::<Vec<String>>()
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(b"step 2\n").unwrap();
    engine.add_image("app:1.0", "amd64", chrono::Utc::now());

    let lines = tokio::time::timeout(Duration::from_secs(5), collected)
        .await
        .expect("follow stream did not end")
        .unwrap();
    assert_eq!(lines, vec!["step 1", "step 2"]);
}

#[tokio::test]
async fn test_build_logs_follow_joins_line_written_in_pieces() {
    let dir = TempDir::new().unwrap();
    let path = build_log_path(dir.path(), "app:1.0");
    std::fs::write(&path, "step 1\nStep 2/5 : RUN ").unwrap();

    let engine = FakeEngine::new();
    let reader = BuildLogReader::new(engine.clone(), dir.path())
        .with_timing(Duration::from_millis(10), Duration::from_millis(20));

    let follow = reader.read("app:1.0", true).await.unwrap();
    let collected = tokio::spawn(async move {
        follow
            .map(|line| line.unwrap())
            .collect::<Vec<String>>()
            .await
    });

    // The reader has polled past the fragment at least once by now
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(b"apt-get install -y curl\n").unwrap();
    engine.add_image("app:1.0", "amd64", chrono::Utc::now());

    let lines = tokio::time::timeout(Duration::from_secs(5), collected)
        .await
        .expect("follow stream did not end")
        .unwrap();
    assert_eq!(
        lines,
        vec!["step 1", "Step 2/5 : RUN apt-get install -y curl"]
    );
}

#[tokio::test]
async fn test_build_logs_follow_flushes_unterminated_last_line() {
    let dir = TempDir::new().unwrap();
    std::fs::write(build_log_path(dir.path(), "app:1.0"), "step 1\nSuccessfully built").unwrap();

    let engine = FakeEngine::new();
    engine.add_image("app:1.0", "amd64", chrono::Utc::now());
    let reader = BuildLogReader::new(engine, dir.path())
        .with_timing(Duration::from_millis(10), Duration::from_millis(20));

    let lines: Vec<String> = reader
        .read("app:1.0", true)
        .await
        .unwrap()
        .map(|line| line.unwrap())
        .collect()
        .await;

    assert_eq!(lines, vec!["step 1", "Successfully built"]);
}

#[tokio::test]
async fn test_snapshot_retries_commit_and_pushes() {
    let dir = TempDir::new().unwrap();
    let engine = FakeEngine::new();
    engine.add_container("sbx-1", ContainerStatus::Running, 0);
    engine.fail_commits(2);
    let cache = test_cache();
    let images = ImagePipeline::new(engine.clone(), cache.clone(), dir.path())
        .with_internal_registry(registry());

    images
        .create_snapshot("sbx-1", "snap:1.0", None, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(engine.count("commit_container"), 3);
    assert_eq!(engine.count("push_image"), 1);
    assert!(!engine.has_image("snap:1.0"));
    assert_eq!(
        cache.get("sbx-1").unwrap().snapshot_state,
        SnapshotState::Completed
    );
}

#[tokio::test]
async fn test_snapshot_gives_up_after_three_commits() {
    let dir = TempDir::new().unwrap();
    let engine = FakeEngine::new();
    engine.add_container("sbx-1", ContainerStatus::Running, 0);
    engine.fail_commits(3);
    let cache = test_cache();
    let images = ImagePipeline::new(engine.clone(), cache.clone(), dir.path());

    let result = images
        .create_snapshot("sbx-1", "snap:1.0", None, CancellationToken::new())
        .await;

    assert!(result.is_err());
    assert_eq!(engine.count("commit_container"), 3);
    assert_eq!(engine.count("push_image"), 0);
    let data = cache.get("sbx-1").unwrap();
    assert_eq!(data.snapshot_state, SnapshotState::Error);
    assert!(data.error_reason.is_some());
}

#[tokio::test]
async fn test_snapshot_digest_error_falls_back_to_export_import() {
    let dir = TempDir::new().unwrap();
    let engine = FakeEngine::new();
    engine.add_container("sbx-1", ContainerStatus::Running, 0);
    engine.fail_commits_with(
        1,
        "Error response from daemon: failed to get digest sha256:4f1c",
    );
    let cache = test_cache();
    let images = ImagePipeline::new(engine.clone(), cache.clone(), dir.path());

    images
        .create_snapshot("sbx-1", "snap:1.0", Some(&registry()), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(engine.count("commit_container"), 1);
    assert_eq!(engine.count("export_import_container"), 1);
    assert_eq!(engine.count("push_image"), 1);
    assert_eq!(
        cache.get("sbx-1").unwrap().snapshot_state,
        SnapshotState::Completed
    );
}

#[tokio::test]
async fn test_snapshot_with_socket_files_is_rebuilt_without_them() {
    let dir = TempDir::new().unwrap();
    let layer = TempDir::new().unwrap();
    std::fs::create_dir_all(layer.path().join("tmp")).unwrap();
    let _socket =
        std::os::unix::net::UnixListener::bind(layer.path().join("tmp/agent.sock")).unwrap();

    let engine = FakeEngine::new();
    engine.add_container("sbx-1", ContainerStatus::Running, 0);
    engine.set_commit_layer_dirs(&[layer.path()]);
    let cache = test_cache();
    let images = ImagePipeline::new(engine.clone(), cache.clone(), dir.path());

    images
        .create_snapshot("sbx-1", "snap:1.0", Some(&registry()), CancellationToken::new())
        .await
        .unwrap();

    let calls = engine.calls();
    assert!(calls.contains(&"clone_container:sbx-1 socket-fix-sbx-1".to_string()));
    assert!(calls.contains(&"exec:socket-fix-sbx-1 find / -type s -delete".to_string()));
    assert!(calls.contains(&"export_import_container:socket-fix-sbx-1".to_string()));
    assert!(calls.contains(&"remove_container:socket-fix-sbx-1".to_string()));
    assert_eq!(engine.container_names(), vec!["sbx-1"]);
    assert_eq!(engine.count("push_image"), 1);
    assert_eq!(
        cache.get("sbx-1").unwrap().snapshot_state,
        SnapshotState::Completed
    );
}

#[tokio::test]
async fn test_snapshot_without_sockets_skips_rebuild() {
    let dir = TempDir::new().unwrap();
    let layer = TempDir::new().unwrap();
    std::fs::write(layer.path().join("notes.txt"), "plain file").unwrap();

    let engine = FakeEngine::new();
    engine.add_container("sbx-1", ContainerStatus::Running, 0);
    engine.set_commit_layer_dirs(&[layer.path()]);
    let images = ImagePipeline::new(engine.clone(), test_cache(), dir.path());

    images
        .create_snapshot("sbx-1", "snap:1.0", Some(&registry()), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(engine.count("clone_container"), 0);
    assert_eq!(engine.count("export_import_container"), 0);
    assert_eq!(engine.count("push_image"), 1);
}

#[tokio::test]
async fn test_snapshot_push_failure_is_recorded() {
    let dir = TempDir::new().unwrap();
    let engine = FakeEngine::new();
    engine.add_container("sbx-1", ContainerStatus::Running, 0);
    engine.fail_pushes();
    let cache = test_cache();
    let images = ImagePipeline::new(engine.clone(), cache.clone(), dir.path());

    let result = images
        .create_snapshot("sbx-1", "snap:1.0", Some(&registry()), CancellationToken::new())
        .await;

    assert!(matches!(result, Err(RunnerError::Unauthorized(_))));
    let data = cache.get("sbx-1").unwrap();
    assert_eq!(data.snapshot_state, SnapshotState::Error);
    assert!(data.error_reason.unwrap().contains("registry denied push"));
}

#[tokio::test]
async fn test_manager_snapshot_runs_in_background() {
    let dir = TempDir::new().unwrap();
    let engine = FakeEngine::new();
    engine.add_container("sbx-1", ContainerStatus::Running, 0);
    let cache = test_cache();
    cache.set_sandbox_state("sbx-1", SandboxState::Started);
    let manager = test_manager(engine.clone(), cache.clone(), dir.path());

    manager.create_snapshot("sbx-1", "snap:1.0", None).unwrap();
    assert_eq!(
        cache.get("sbx-1").unwrap().snapshot_state,
        SnapshotState::Pending
    );

    for _ in 0..100 {
        if cache.get("sbx-1").unwrap().snapshot_state == SnapshotState::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        cache.get("sbx-1").unwrap().snapshot_state,
        SnapshotState::Completed
    );
    assert_eq!(engine.count("push_image"), 1);
}

#[tokio::test]
async fn test_manager_rejects_snapshot_of_destroyed_sandbox() {
    let dir = TempDir::new().unwrap();
    let engine = FakeEngine::new();
    let cache = test_cache();
    cache.set_sandbox_state("sbx-1", SandboxState::Destroyed);
    let manager = test_manager(engine.clone(), cache, dir.path());

    assert!(matches!(
        manager.create_snapshot("sbx-1", "snap:1.0", None),
        Err(RunnerError::Conflict(_))
    ));
    assert_eq!(engine.count("commit_container"), 0);
}
