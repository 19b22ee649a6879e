//! End-to-end indexing and retrieval against an in-process repository host.

use std::io::{Cursor, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use zip::write::SimpleFileOptions;

use submission_index::config::Config;
use submission_index::control::{InMemoryStatusStore, StatusStore};
use submission_index::embedding::{Embedder, HashingEmbedder};
use submission_index::error::{IndexError, Result as IndexResult};
use submission_index::models::{
    IndexFailure, IndexStats, IndexStatus, IndexStatusRecord, RepoReference, SearchOptions,
};
use submission_index::notify::{spawn_worker, CompletionEvent, CompletionHandler, CompletionNotifier};
use submission_index::pipeline::Engine;
use submission_index::vector_index::InMemoryVectorIndex;

const GOOD_SHA: &str = "abc1234";
const EVIL_SHA: &str = "bad0bad";
const NEXT_SHA: &str = "c0ffee1";

fn fifty_lines(tag: &str, marker: &str) -> String {
    let mut out = String::new();
    for i in 1..=50 {
        if i == 25 {
            out.push_str(&format!("// {}\n", marker));
        } else {
            out.push_str(&format!("let {}_{} = {};\n", tag, i, i));
        }
    }
    out
}

fn zip_bytes(entries: &[(String, String)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in entries {
        writer
            .start_file(name.as_str(), SimpleFileOptions::default())
            .unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

#[derive(Clone)]
struct FakeHost {
    fetches: Arc<AtomicUsize>,
    good: Arc<Vec<u8>>,
    next: Arc<Vec<u8>>,
    evil: Arc<Vec<u8>>,
}

async fn zipball(
    State(host): State<FakeHost>,
    Path((_owner, _repo, rev)): Path<(String, String, String)>,
) -> axum::response::Response {
    host.fetches.fetch_add(1, Ordering::SeqCst);
    match rev.as_str() {
        GOOD_SHA => host.good.as_ref().clone().into_response(),
        NEXT_SHA => host.next.as_ref().clone().into_response(),
        EVIL_SHA => host.evil.as_ref().clone().into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn start_fake_host() -> (SocketAddr, Arc<AtomicUsize>) {
    let root = "acme-widgets-abc1234";
    let good = zip_bytes(&[
        (format!("{}/src/alpha.rs", root), fifty_lines("alpha", "parse the config header")),
        (
            format!("{}/src/beta.rs", root),
            fifty_lines("beta", "zebra quasar lighthouse beacon"),
        ),
        (format!("{}/src/gamma.rs", root), fifty_lines("gamma", "open a database pool")),
        (format!("{}/node_modules/dep/index.js", root), "module.exports = 1;\n".into()),
        (format!("{}/logo.png", root), "not really a png".into()),
    ]);
    // The next revision deletes beta.rs and alpha.rs and adds delta.rs.
    let next = zip_bytes(&[
        (
            "acme-widgets-c0ffee1/src/delta.rs".to_string(),
            fifty_lines("delta", "open a database pool"),
        ),
        (
            "acme-widgets-c0ffee1/src/gamma.rs".to_string(),
            fifty_lines("gamma", "open a database pool"),
        ),
    ]);
    let evil = zip_bytes(&[
        ("ok/readme.md".to_string(), "fine\n".to_string()),
        ("../escape.txt".to_string(), "gotcha\n".to_string()),
    ]);

    let fetches = Arc::new(AtomicUsize::new(0));
    let state = FakeHost {
        fetches: fetches.clone(),
        good: Arc::new(good),
        next: Arc::new(next),
        evil: Arc::new(evil),
    };
    let app = Router::new()
        .route("/repos/{owner}/{repo}/zipball/{rev}", get(zipball))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, fetches)
}

/// Blocks every embedding call until permits are added.
struct GatedEmbedder {
    inner: HashingEmbedder,
    gate: Arc<Semaphore>,
}

#[async_trait]
impl Embedder for GatedEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
    fn dims(&self) -> usize {
        self.inner.dims()
    }
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let _permit = self.gate.acquire().await?;
        self.inner.embed(texts).await
    }
}

struct Harness {
    _tmp: TempDir,
    work_dir: std::path::PathBuf,
    engine: Engine,
    status: Arc<InMemoryStatusStore>,
    fetches: Arc<AtomicUsize>,
}

async fn harness_with(embedder: Arc<dyn Embedder>) -> Harness {
    build_harness(embedder, |store| store, None).await
}

async fn build_harness(
    embedder: Arc<dyn Embedder>,
    wrap_status: impl FnOnce(Arc<InMemoryStatusStore>) -> Arc<dyn StatusStore>,
    notifier: Option<CompletionNotifier>,
) -> Harness {
    let (addr, fetches) = start_fake_host().await;
    let tmp = TempDir::new().unwrap();
    let work_dir = tmp.path().join("work");

    let mut config = Config::with_db_path(tmp.path().join("unused.sqlite"));
    config.snapshot.api_base = format!("http://{}", addr);
    config.snapshot.work_dir = work_dir.clone();
    config.snapshot.token_env = "SUBIDX_TEST_UNSET_TOKEN".to_string();
    config.validate().unwrap();

    let status = Arc::new(InMemoryStatusStore::new());
    let engine = Engine::new(
        &config,
        wrap_status(status.clone()),
        Arc::new(InMemoryVectorIndex::new()),
        embedder,
        notifier,
    )
    .unwrap();

    Harness {
        _tmp: tmp,
        work_dir,
        engine,
        status,
        fetches,
    }
}

async fn harness() -> Harness {
    harness_with(Arc::new(HashingEmbedder::new(512))).await
}

/// Delegates to the in-memory store, failing the first `mark_ready`.
struct FailFirstReady {
    inner: Arc<InMemoryStatusStore>,
    ready_failures: AtomicUsize,
}

#[async_trait]
impl StatusStore for FailFirstReady {
    async fn register_submission(&self, id: &str, repo: &RepoReference) -> IndexResult<()> {
        self.inner.register_submission(id, repo).await
    }
    async fn resolve_submission(&self, id: &str) -> IndexResult<Option<RepoReference>> {
        self.inner.resolve_submission(id).await
    }
    async fn get(&self, id: &str, revision: &str) -> IndexResult<Option<IndexStatusRecord>> {
        self.inner.get(id, revision).await
    }
    async fn ensure_queued(&self, id: &str, repo: &RepoReference) -> IndexResult<()> {
        self.inner.ensure_queued(id, repo).await
    }
    async fn try_begin_indexing(&self, id: &str, revision: &str) -> IndexResult<bool> {
        self.inner.try_begin_indexing(id, revision).await
    }
    async fn mark_ready(&self, id: &str, revision: &str, stats: IndexStats) -> IndexResult<()> {
        if self.ready_failures.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(IndexError::Other("database is locked".to_string()));
        }
        self.inner.mark_ready(id, revision, stats).await
    }
    async fn mark_failed(
        &self,
        id: &str,
        revision: &str,
        failure: IndexFailure,
    ) -> IndexResult<()> {
        self.inner.mark_failed(id, revision, failure).await
    }
}

/// Records every event; fails for the ones it is told to.
struct CollectingHandler {
    events: Arc<Mutex<Vec<CompletionEvent>>>,
    fail: bool,
}

#[async_trait]
impl CompletionHandler for CollectingHandler {
    async fn handle(&self, event: &CompletionEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        if self.fail {
            anyhow::bail!("downstream unavailable");
        }
        Ok(())
    }
}

async fn register(h: &Harness, id: &str, sha: &str) {
    let repo = RepoReference::new("acme", "widgets", sha).unwrap();
    h.engine.indexer.register(id, &repo).await.unwrap();
}

#[tokio::test]
async fn test_end_to_end_three_files_three_chunks() {
    let h = harness().await;
    register(&h, "sub-1", GOOD_SHA).await;

    let outcome = h.engine.indexer.start_indexing("sub-1").await.unwrap();
    assert_eq!(outcome.status, IndexStatus::Ready);
    assert_eq!(outcome.file_count, Some(3));
    assert_eq!(outcome.chunk_count, Some(3));

    let response = h
        .engine
        .retriever
        .search("sub-1", "zebra quasar lighthouse", &SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(response.chunks[0].path, "src/beta.rs");
    assert_eq!(response.chunks[0].start_line, 1);
    assert_eq!(response.chunks[0].end_line, 50);
    assert_eq!(response.chunks[0].language, "rust");
    assert!(response.stats.total_chars <= 24_000);
}

#[tokio::test]
async fn test_repeated_indexing_fetches_once() {
    let h = harness().await;
    register(&h, "sub-1", GOOD_SHA).await;

    let first = h.engine.indexer.start_indexing("sub-1").await.unwrap();
    let second = h.engine.indexer.start_indexing("sub-1").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(h.fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrent_indexing_fetches_once() {
    let h = harness().await;
    register(&h, "sub-1", GOOD_SHA).await;

    let indexer = h.engine.indexer.clone();
    let (a, b) = tokio::join!(indexer.start_indexing("sub-1"), indexer.start_indexing("sub-1"));
    let statuses = [a.unwrap().status, b.unwrap().status];

    assert!(statuses.contains(&IndexStatus::Ready));
    assert_eq!(h.fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_status_reports_indexing_then_ready() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness_with(Arc::new(GatedEmbedder {
        inner: HashingEmbedder::new(64),
        gate: gate.clone(),
    }))
    .await;
    register(&h, "sub-1", GOOD_SHA).await;

    let indexer = h.engine.indexer.clone();
    let run = tokio::spawn(async move { indexer.start_indexing("sub-1").await });

    let mut seen_indexing = false;
    for _ in 0..200 {
        if let Ok(record) = h.engine.indexer.get_index_status("sub-1").await {
            if record.status == IndexStatus::Indexing {
                seen_indexing = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(seen_indexing);

    // A search while indexing is refused.
    assert!(matches!(
        h.engine
            .retriever
            .search("sub-1", "anything", &SearchOptions::default())
            .await,
        Err(IndexError::IndexNotReady { .. })
    ));

    gate.add_permits(1);
    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome.status, IndexStatus::Ready);

    let record = h.engine.indexer.get_index_status("sub-1").await.unwrap();
    assert_eq!(record.status, IndexStatus::Ready);
    assert_eq!(record.stats.file_count, 3);
    assert_eq!(record.stats.chunk_count, 3);
}

#[tokio::test]
async fn test_missing_revision_is_recorded_as_failed() {
    let h = harness().await;
    register(&h, "sub-1", "deadbeef").await;

    let outcome = h.engine.indexer.start_indexing("sub-1").await.unwrap();
    assert_eq!(outcome.status, IndexStatus::Failed);
    assert!(outcome.error.unwrap().contains("repository inaccessible"));

    let record = h.status.get("sub-1", "deadbeef").await.unwrap().unwrap();
    let failure = record.error.unwrap();
    assert!(!failure.failed_at.is_empty());

    let err = h
        .engine
        .retriever
        .search("sub-1", "anything", &SearchOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, IndexError::IndexFailed(_)));
}

#[tokio::test]
async fn test_failed_revision_is_retried() {
    let h = harness().await;
    register(&h, "sub-1", "deadbeef").await;

    h.engine.indexer.start_indexing("sub-1").await.unwrap();
    h.engine.indexer.start_indexing("sub-1").await.unwrap();
    assert_eq!(h.fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_traversal_archive_fails_and_writes_nothing_outside() {
    let h = harness().await;
    register(&h, "sub-1", EVIL_SHA).await;

    let outcome = h.engine.indexer.start_indexing("sub-1").await.unwrap();
    assert_eq!(outcome.status, IndexStatus::Failed);
    assert!(outcome.error.unwrap().contains("escapes"));

    assert!(!h.work_dir.join("escape.txt").exists());
    assert!(!h.work_dir.parent().unwrap().join("escape.txt").exists());
    let leftovers: Vec<_> = std::fs::read_dir(&h.work_dir).unwrap().collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn test_snapshot_cleaned_after_success() {
    let h = harness().await;
    register(&h, "sub-1", GOOD_SHA).await;
    h.engine.indexer.start_indexing("sub-1").await.unwrap();

    let leftovers: Vec<_> = std::fs::read_dir(&h.work_dir).unwrap().collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn test_unknown_submission() {
    let h = harness().await;
    assert!(matches!(
        h.engine.indexer.start_indexing("nobody").await,
        Err(IndexError::UnknownSubmission(_))
    ));
    assert!(matches!(
        h.engine.indexer.get_index_status("nobody").await,
        Err(IndexError::UnknownSubmission(_))
    ));
}

#[tokio::test]
async fn test_budget_options_tighten_results() {
    let h = harness().await;
    register(&h, "sub-1", GOOD_SHA).await;
    h.engine.indexer.start_indexing("sub-1").await.unwrap();

    let options = SearchOptions {
        max_chunks: Some(1),
        max_chunk_chars: Some(100),
        ..SearchOptions::default()
    };
    let response = h
        .engine
        .retriever
        .search("sub-1", "database pool", &options)
        .await
        .unwrap();
    assert_eq!(response.chunks.len(), 1);
    assert_eq!(response.chunks[0].content.chars().count(), 100);
    assert_eq!(response.stats.total_chars, 100);
    assert_eq!(response.stats.candidates, 3);
}

#[tokio::test]
async fn test_http_api_round_trip() {
    let h = harness().await;
    let app = submission_index::server::router(h.engine.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = reqwest::Client::new();
    let base = format!("http://{}", addr);

    let res = client
        .put(format!("{}/submissions/sub-9", base))
        .json(&serde_json::json!({"owner": "acme", "repo": "widgets", "revision": "main"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 400);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    let res = client
        .put(format!("{}/submissions/sub-9", base))
        .json(&serde_json::json!({"owner": "acme", "repo": "widgets", "revision": GOOD_SHA}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);

    let res = client
        .post(format!("{}/submissions/sub-9/index", base))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 202);

    let mut ready = false;
    for _ in 0..200 {
        let body: serde_json::Value = client
            .get(format!("{}/submissions/sub-9/index", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if body["status"] == "ready" {
            assert_eq!(body["stats"]["chunk_count"], 3);
            ready = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(ready);

    let res = client
        .post(format!("{}/submissions/sub-9/search", base))
        .json(&serde_json::json!({"query": "zebra quasar", "max_chunks": 2}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["chunks"][0]["path"], "src/beta.rs");
    assert!(body["chunks"].as_array().unwrap().len() <= 2);

    let res = client
        .post(format!("{}/submissions/sub-9/search", base))
        .json(&serde_json::json!({"query": "  "}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 400);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"]["code"], "empty_query");

    let res = client
        .get(format!("{}/submissions/nobody/index", base))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 404);
}

#[tokio::test]
async fn test_new_revision_does_not_return_deleted_files() {
    let h = harness().await;
    register(&h, "sub-1", GOOD_SHA).await;
    let first = h.engine.indexer.start_indexing("sub-1").await.unwrap();
    assert_eq!(first.status, IndexStatus::Ready);

    register(&h, "sub-1", NEXT_SHA).await;
    let second = h.engine.indexer.start_indexing("sub-1").await.unwrap();
    assert_eq!(second.status, IndexStatus::Ready);
    assert_eq!(second.chunk_count, Some(2));

    let response = h
        .engine
        .retriever
        .search("sub-1", "zebra quasar lighthouse", &SearchOptions::default())
        .await
        .unwrap();
    let paths: Vec<&str> = response.chunks.iter().map(|c| c.path.as_str()).collect();
    assert_eq!(response.stats.candidates, 2);
    assert!(!paths.contains(&"src/beta.rs"), "stale file returned: {:?}", paths);
    assert!(!paths.contains(&"src/alpha.rs"), "stale file returned: {:?}", paths);
}

#[tokio::test]
async fn test_failed_ready_write_is_recorded_and_retryable() {
    let h = build_harness(
        Arc::new(HashingEmbedder::new(512)),
        |inner| {
            Arc::new(FailFirstReady {
                inner,
                ready_failures: AtomicUsize::new(0),
            })
        },
        None,
    )
    .await;
    register(&h, "sub-1", GOOD_SHA).await;

    let outcome = h.engine.indexer.start_indexing("sub-1").await.unwrap();
    assert_eq!(outcome.status, IndexStatus::Failed);
    assert!(outcome.error.unwrap().contains("database is locked"));

    let record = h.status.get("sub-1", GOOD_SHA).await.unwrap().unwrap();
    assert_eq!(record.status, IndexStatus::Failed);

    let retry = h.engine.indexer.start_indexing("sub-1").await.unwrap();
    assert_eq!(retry.status, IndexStatus::Ready);
    assert_eq!(retry.chunk_count, Some(3));
    assert_eq!(h.fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_ready_run_emits_completion_event() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let (notifier, worker) = spawn_worker(Arc::new(CollectingHandler {
        events: events.clone(),
        fail: false,
    }));
    let h = build_harness(Arc::new(HashingEmbedder::new(512)), |s| s, Some(notifier)).await;
    register(&h, "sub-1", GOOD_SHA).await;
    register(&h, "sub-2", "deadbeef").await;

    h.engine.indexer.start_indexing("sub-1").await.unwrap();
    h.engine.indexer.start_indexing("sub-1").await.unwrap();
    h.engine.indexer.start_indexing("sub-2").await.unwrap();

    // Dropping the engine closes the channel; the worker drains and exits.
    drop(h);
    worker.await.unwrap();

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1, "only the one successful run notifies");
    let event = &events[0];
    assert_eq!(event.submission_id, "sub-1");
    assert_eq!((event.owner.as_str(), event.repo.as_str()), ("acme", "widgets"));
    assert_eq!(event.revision, GOOD_SHA);
    assert_eq!(event.file_count, 3);
    assert_eq!(event.chunk_count, 3);
    assert!(!event.completed_at.is_empty());
}

#[tokio::test]
async fn test_failing_completion_handler_keeps_ready_status() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let (notifier, worker) = spawn_worker(Arc::new(CollectingHandler {
        events: events.clone(),
        fail: true,
    }));
    let h = build_harness(Arc::new(HashingEmbedder::new(512)), |s| s, Some(notifier)).await;
    register(&h, "sub-1", GOOD_SHA).await;

    let outcome = h.engine.indexer.start_indexing("sub-1").await.unwrap();
    assert_eq!(outcome.status, IndexStatus::Ready);

    let status = h.status.clone();
    drop(h);
    worker.await.unwrap();

    assert_eq!(events.lock().unwrap().len(), 1);
    let record = status.get("sub-1", GOOD_SHA).await.unwrap().unwrap();
    assert_eq!(record.status, IndexStatus::Ready);
    assert_eq!(record.stats.chunk_count, 3);
}
