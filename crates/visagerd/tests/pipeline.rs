use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use visager_core::{
    BoundingBox, DetectError, Embedding, FaceBackend, FaceObservation, IdentityStore,
};
use visagerd::{Config, Pipeline, PipelineError, Status};

/// Backend that answers by file name prefix and records call order.
///
/// - `empty*`: no face
/// - `group*`: three faces, the most confident one at `[0, 1]`
/// - `alice*`: one face at cosine distance 0.3 from Alice's reference
/// - `stranger*`: one face at cosine distance 0.8 from Alice's reference
/// - `crash*`: the backend process died
/// - `panic*`: the backend panicked
struct MockBackend {
    calls: Arc<Mutex<Vec<String>>>,
}

fn face(values: Vec<f32>, confidence: f32) -> FaceObservation {
    FaceObservation {
        embedding: Embedding::new(values),
        region: BoundingBox::default(),
        confidence,
    }
}

fn alice_reference() -> Embedding {
    Embedding::new(vec![1.0, 0.0])
}

/// Unit vector at cosine distance `d` from [`alice_reference`].
fn at_distance(d: f32) -> Vec<f32> {
    let cos = 1.0 - d;
    vec![cos, (1.0 - cos * cos).sqrt()]
}

impl FaceBackend for MockBackend {
    fn detect_faces(&mut self, path: &Path) -> Result<Vec<FaceObservation>, DetectError> {
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        self.calls.lock().unwrap().push(name.clone());
        if name.starts_with("empty") {
            Err(DetectError::NoFace)
        } else if name.starts_with("group") {
            Ok(vec![
                face(vec![0.6, 0.8], 0.7),
                face(vec![0.0, 1.0], 0.95),
                face(vec![1.0, 0.0], 0.5),
            ])
        } else if name.starts_with("alice") {
            Ok(vec![face(at_distance(0.3), 0.95)])
        } else if name.starts_with("stranger") {
            Ok(vec![face(at_distance(0.8), 0.95)])
        } else if name.starts_with("crash") {
            Err(DetectError::Crashed("exit status 139".into()))
        } else if name.starts_with("panic") {
            panic!("detector segfault");
        } else {
            Err(DetectError::Backend(format!("unexpected test file {name}")))
        }
    }
}

struct Harness {
    _dir: TempDir,
    sources: PathBuf,
    photos: PathBuf,
    pipeline: Arc<Pipeline>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl Harness {
    /// Pipeline over a fresh library whose store already knows Alice.
    async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    /// Like [`start`](Self::start), with the config adjusted after Alice
    /// has been saved to the default store path.
    async fn start_with(adjust: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::with_root(dir.path());

        let mut store = IdentityStore::new(config.model_tag.clone());
        store.append("Alice", alice_reference()).unwrap();
        store.save(&config.store_path).unwrap();
        adjust(&mut config);

        let calls = Arc::new(Mutex::new(Vec::new()));
        let backend = MockBackend {
            calls: Arc::clone(&calls),
        };
        let pipeline = Pipeline::new(&config, backend).unwrap();
        pipeline.initialize().await.unwrap();
        pipeline.start();

        let sources = dir.path().join("camera");
        std::fs::create_dir_all(&sources).unwrap();
        Self {
            photos: config.photos_root.clone(),
            sources,
            _dir: dir,
            pipeline,
            calls,
        }
    }

    fn source(&self, name: &str) -> PathBuf {
        let path = self.sources.join(name);
        std::fs::write(&path, b"not really a jpeg").unwrap();
        path
    }

    async fn index(&self, names: &[&str]) {
        let paths = names.iter().map(|n| self.source(n)).collect();
        let report = self.pipeline.index(paths).await.unwrap();
        assert_eq!(report.queued, names.len());
        assert!(report.skipped.is_empty());
    }

    /// Wait until every queued task has been processed.
    async fn drain(&self) {
        let mut rx = self.pipeline.subscribe();
        tokio::time::timeout(
            Duration::from_secs(10),
            rx.wait_for(|s| s.status == Status::Idle && s.is_drained()),
        )
        .await
        .expect("pipeline did not drain")
        .unwrap();
    }

    fn files_in(&self, folder: &str) -> Vec<String> {
        let mut names: Vec<String> = match std::fs::read_dir(self.photos.join(folder)) {
            Ok(entries) => entries
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }
}

#[tokio::test]
async fn test_no_face_goes_to_unsorted() {
    let h = Harness::start().await;
    h.index(&["empty.jpg"]).await;
    h.drain().await;

    assert_eq!(h.files_in("Unsorted"), ["empty.jpg"]);
    assert!(h.files_in("Inbox").is_empty());
    let status = h.pipeline.status();
    assert_eq!(status.processed_count, 1);
    assert_eq!(status.total_queued, 1);
    assert_eq!(status.status, Status::Idle);
}

#[tokio::test]
async fn test_group_photo_goes_to_group_folder() {
    let h = Harness::start().await;
    h.index(&["group.jpg"]).await;
    h.drain().await;
    assert_eq!(h.files_in("Group_Photos"), ["group.jpg"]);
}

#[tokio::test]
async fn test_close_face_matches_known_person() {
    let h = Harness::start().await;
    h.index(&["alice.jpg"]).await;
    h.drain().await;
    assert_eq!(h.files_in("Alice"), ["alice.jpg"]);
}

#[tokio::test]
async fn test_distant_face_needs_name() {
    let h = Harness::start().await;
    h.index(&["stranger.jpg"]).await;
    h.drain().await;
    assert_eq!(h.files_in("Needs_Name"), ["stranger.jpg"]);
    assert!(h.files_in("Alice").is_empty());
}

#[tokio::test]
async fn test_every_ingested_format_is_reviewable() {
    let h = Harness::start().await;
    h.index(&["stranger.webp", "group.gif"]).await;
    h.drain().await;

    assert_eq!(h.files_in("Needs_Name"), ["stranger.webp"]);
    assert_eq!(h.files_in("Group_Photos"), ["group.gif"]);
    let review = h.pipeline.review().await.unwrap();
    let paths: Vec<&str> = review.iter().map(|r| r.path.as_str()).collect();
    assert_eq!(paths, ["Needs_Name/stranger.webp", "Group_Photos/group.gif"]);

    h.pipeline
        .assign("Needs_Name/stranger.webp", "Bob")
        .await
        .unwrap();
    let albums = h.pipeline.albums().await.unwrap();
    assert_eq!(albums[0].name, "Bob");
    assert_eq!(albums[0].count, 1);
}

#[tokio::test]
async fn test_tasks_processed_in_fifo_order() {
    let h = Harness::start().await;
    let names = ["alice.jpg", "empty.jpg", "group.jpg", "stranger.jpg", "empty2.jpg"];
    h.index(&names).await;
    h.drain().await;

    assert_eq!(*h.calls.lock().unwrap(), names);
    let status = h.pipeline.status();
    assert_eq!(status.processed_count, 5);
    assert_eq!(status.total_queued, 5);
    assert!(status.current_file.is_empty());
}

#[tokio::test]
async fn test_processed_never_exceeds_total() {
    let h = Harness::start().await;
    let mut rx = h.pipeline.subscribe();
    let watcher = tokio::spawn(async move {
        loop {
            {
                let s = rx.borrow_and_update();
                assert!(s.processed_count <= s.total_queued, "{s:?}");
                if s.status == Status::Idle && s.total_queued == 4 && s.is_drained() {
                    return;
                }
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    });

    h.index(&["alice.jpg", "group.jpg", "empty.jpg", "stranger.jpg"])
        .await;
    tokio::time::timeout(Duration::from_secs(10), watcher)
        .await
        .expect("watcher did not finish")
        .unwrap();
}

#[tokio::test]
async fn test_same_name_files_never_overwrite() {
    let h = Harness::start().await;
    let first = h.sources.join("a");
    let second = h.sources.join("b");
    std::fs::create_dir_all(&first).unwrap();
    std::fs::create_dir_all(&second).unwrap();
    std::fs::write(first.join("alice.jpg"), b"first").unwrap();
    std::fs::write(second.join("alice.jpg"), b"second").unwrap();

    let report = h
        .pipeline
        .index(vec![first.join("alice.jpg"), second.join("alice.jpg")])
        .await
        .unwrap();
    assert_eq!(report.queued, 2);
    h.drain().await;

    let routed = h.files_in("Alice");
    assert_eq!(routed.len(), 2, "{routed:?}");
    let mut contents: Vec<Vec<u8>> = routed
        .iter()
        .map(|n| std::fs::read(h.photos.join("Alice").join(n)).unwrap())
        .collect();
    contents.sort();
    assert_eq!(contents, [b"first".to_vec(), b"second".to_vec()]);
}

#[tokio::test]
async fn test_failed_tasks_are_consumed_and_loop_continues() {
    let h = Harness::start().await;
    h.index(&["crash.jpg", "panic.jpg", "empty.jpg"]).await;
    h.drain().await;

    let status = h.pipeline.status();
    assert_eq!(status.processed_count, 3);
    assert_eq!(status.total_queued, 3);
    // Failed files stay in the Inbox; the rest is routed.
    assert_eq!(h.files_in("Inbox"), ["crash.jpg", "panic.jpg"]);
    assert_eq!(h.files_in("Unsorted"), ["empty.jpg"]);
    assert!(h.pipeline.health().worker_alive);
}

#[tokio::test]
async fn test_non_image_paths_are_skipped() {
    let h = Harness::start().await;
    let notes = h.source("notes.txt");
    let missing = h.sources.join("gone.jpg");
    let report = h
        .pipeline
        .index(vec![notes, missing, h.source("empty.jpg")])
        .await
        .unwrap();
    assert_eq!(report.queued, 1);
    assert_eq!(report.skipped.len(), 2);
    h.drain().await;
    assert_eq!(h.pipeline.status().total_queued, 1);
}

#[tokio::test]
async fn test_upload_streams_into_pipeline() {
    let h = Harness::start().await;
    let dest = h
        .pipeline
        .receive("alice.jpg", &b"uploaded bytes"[..])
        .await
        .unwrap();
    assert!(dest.starts_with(h.photos.join("Inbox")));
    h.drain().await;
    assert_eq!(h.files_in("Alice"), ["alice.jpg"]);

    let err = h
        .pipeline
        .receive("notes.txt", &b"text"[..])
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Unsupported(_)));
}

#[tokio::test]
async fn test_assign_learns_new_identity() {
    let h = Harness::start().await;
    h.index(&["stranger.jpg"]).await;
    h.drain().await;

    let review = h.pipeline.review().await.unwrap();
    assert_eq!(review.len(), 1);
    assert_eq!(review[0].path, "Needs_Name/stranger.jpg");

    let outcome = h
        .pipeline
        .assign("Needs_Name/stranger.jpg", "Bob")
        .await
        .unwrap();
    assert!(outcome.embedding_added);
    assert_eq!(outcome.path, h.photos.join("Bob").join("stranger.jpg"));
    assert!(h.files_in("Needs_Name").is_empty());
    assert_eq!(h.files_in("Bob"), ["stranger.jpg"]);
    assert_eq!(h.pipeline.store_size().await, (2, 2));

    let result = h
        .pipeline
        .identify(&Embedding::new(at_distance(0.8)))
        .await;
    assert_eq!(result.name.as_deref(), Some("Bob"));
    assert!(result.distance.unwrap() < 1e-4);

    // The store on disk has the new identity.
    let config = Config::with_root(h.photos.parent().unwrap());
    let saved = IdentityStore::try_load(&config.store_path, &config.model_tag).unwrap();
    assert_eq!(saved.get("Bob").unwrap().embeddings.len(), 1);
}

#[tokio::test]
async fn test_assign_group_photo_uses_most_confident_face() {
    let h = Harness::start().await;
    h.index(&["group.jpg"]).await;
    h.drain().await;

    let outcome = h
        .pipeline
        .assign("Group_Photos/group.jpg", "Carol")
        .await
        .unwrap();
    assert!(outcome.embedding_added);
    let result = h.pipeline.identify(&Embedding::new(vec![0.0, 1.0])).await;
    assert_eq!(result.name.as_deref(), Some("Carol"));
    assert!(result.distance.unwrap() < 1e-4);
}

#[tokio::test]
async fn test_assign_without_face_moves_but_learns_nothing() {
    let h = Harness::start().await;
    h.index(&["empty.jpg"]).await;
    h.drain().await;
    let unsorted = h.photos.join("Unsorted").join("empty.jpg");
    let pending = h.photos.join("Needs_Name").join("empty.jpg");
    std::fs::rename(unsorted, pending).unwrap();

    let outcome = h
        .pipeline
        .assign("Needs_Name/empty.jpg", "Dana")
        .await
        .unwrap();
    assert!(!outcome.embedding_added);
    assert_eq!(h.files_in("Dana"), ["empty.jpg"]);
    assert_eq!(h.pipeline.store_size().await, (1, 1));
}

#[tokio::test]
async fn test_assign_bare_file_name_finds_pending_photo() {
    let h = Harness::start().await;
    h.index(&["stranger.jpg", "group.jpg"]).await;
    h.drain().await;

    let outcome = h.pipeline.assign("stranger.jpg", "Bob").await.unwrap();
    assert_eq!(outcome.path, h.photos.join("Bob").join("stranger.jpg"));
    let outcome = h.pipeline.assign("group.jpg", "Carol").await.unwrap();
    assert_eq!(outcome.path, h.photos.join("Carol").join("group.jpg"));
    assert!(h.pipeline.review().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_assign_survives_store_write_failure() {
    let h = Harness::start_with(|config| {
        // A regular file where the store's directory should be.
        let blocker = config.store_path.with_file_name("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        config.store_path = blocker.join("identities.json");
    })
    .await;
    assert_eq!(h.pipeline.store_size().await, (0, 0));

    h.index(&["stranger.jpg"]).await;
    h.drain().await;
    let outcome = h
        .pipeline
        .assign("Needs_Name/stranger.jpg", "Bob")
        .await
        .unwrap();
    assert!(outcome.embedding_added);
    assert_eq!(h.files_in("Bob"), ["stranger.jpg"]);

    // The in-memory store keeps serving matches.
    assert_eq!(h.pipeline.store_size().await, (1, 1));
    let result = h
        .pipeline
        .identify(&Embedding::new(at_distance(0.8)))
        .await;
    assert_eq!(result.name.as_deref(), Some("Bob"));
}

#[tokio::test]
async fn test_assign_missing_file_changes_nothing() {
    let h = Harness::start().await;
    let err = h
        .pipeline
        .assign("Needs_Name/ghost.jpg", "Bob")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NotFound(_)));
    assert_eq!(h.pipeline.store_size().await, (1, 1));
    assert!(h.files_in("Bob").is_empty());
}

#[tokio::test]
async fn test_assign_rejects_reserved_and_path_names() {
    let h = Harness::start().await;
    for name in ["Inbox", "Unsorted", "", "../escape", "a/b"] {
        let err = h
            .pipeline
            .assign("Needs_Name/x.jpg", name)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidName(_)), "{name:?}");
    }
}

#[tokio::test]
async fn test_albums_and_photos_listing() {
    let h = Harness::start().await;
    h.index(&["alice.jpg", "empty.jpg", "stranger.jpg"]).await;
    h.drain().await;

    let albums = h.pipeline.albums().await.unwrap();
    assert_eq!(albums.len(), 1);
    assert_eq!(albums[0].name, "Alice");
    assert_eq!(albums[0].count, 1);
    assert_eq!(albums[0].cover, "Alice/alice.jpg");

    let photos = h.pipeline.photos().await.unwrap();
    let names: Vec<&str> = photos.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, ["stranger.jpg", "empty.jpg", "alice.jpg"]);
}

#[tokio::test]
async fn test_health_reports_worker_and_executor() {
    let h = Harness::start().await;
    let health = h.pipeline.health();
    assert_eq!(health.status, "healthy");
    assert!(health.worker_alive);
    assert!(health.executor_ready);
    assert_eq!(health.queue_size, 0);
}

#[tokio::test]
async fn test_shutdown_stops_worker_and_refuses_work() {
    let h = Harness::start().await;
    h.index(&["empty.jpg"]).await;
    h.drain().await;

    h.pipeline.shutdown().await;
    let health = h.pipeline.health();
    assert!(!health.worker_alive);
    assert!(!health.executor_ready);

    let err = h
        .pipeline
        .index(vec![h.source("alice.jpg")])
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::ShuttingDown));
}
