//! Archive download and acquisition against an in-process repository host.

use std::io::{Cursor, Write};
use std::net::SocketAddr;
use std::path::Path;

use axum::body::{Body, Bytes};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

use submission_index::config::SnapshotConfig;
use submission_index::error::IndexError;
use submission_index::models::RepoReference;
use submission_index::snapshot::RepositoryHost;

const LIMIT: u64 = 1000;

fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in entries {
        writer.start_file(*name, SimpleFileOptions::default()).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn fake_host() -> SocketAddr {
    let archive = zip_bytes(&[
        ("acme-widgets-abc1234/README.md", "# widgets\n"),
        ("acme-widgets-abc1234/src/lib.rs", "pub fn widget() {}\n"),
    ]);

    let app = Router::new()
        .route(
            "/streamed",
            get(|| async {
                let chunks = (0..10).map(|_| Ok::<_, std::io::Error>(Bytes::from(vec![b'x'; 500])));
                Body::from_stream(futures::stream::iter(chunks))
            }),
        )
        .route("/declared", get(|| async { vec![b'y'; 5000] }))
        .route("/small", get(|| async { vec![b'z'; 600] }))
        .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
        .route("/limited", get(|| async { StatusCode::TOO_MANY_REQUESTS }))
        .route("/forbidden", get(|| async { StatusCode::FORBIDDEN }))
        .route("/broken", get(|| async { StatusCode::BAD_GATEWAY }))
        .route(
            "/repos/acme/widgets/zipball/abc1234",
            get(move || {
                let archive = archive.clone();
                async move { archive }
            }),
        );
    serve(app).await
}

fn host(addr: SocketAddr, work_dir: &Path) -> RepositoryHost {
    RepositoryHost::new(&SnapshotConfig {
        work_dir: work_dir.to_path_buf(),
        max_archive_bytes: LIMIT,
        api_base: format!("http://{}", addr),
        token_env: "SUBIDX_TEST_UNSET_TOKEN".to_string(),
        timeout_secs: 10,
    })
    .unwrap()
}

#[tokio::test]
async fn test_streamed_body_over_ceiling_is_rejected() {
    let addr = fake_host().await;
    let tmp = TempDir::new().unwrap();
    let dest = tmp.path().join("archive.zip");

    let err = host(addr, tmp.path())
        .download_archive(&format!("http://{}/streamed", addr), &dest)
        .await
        .unwrap_err();

    assert!(matches!(err, IndexError::SizeLimitExceeded { limit: LIMIT, .. }));
    assert!(!dest.exists(), "partial archive must be removed");
}

#[tokio::test]
async fn test_declared_length_over_ceiling_is_rejected() {
    let addr = fake_host().await;
    let tmp = TempDir::new().unwrap();
    let dest = tmp.path().join("archive.zip");

    let err = host(addr, tmp.path())
        .download_archive(&format!("http://{}/declared", addr), &dest)
        .await
        .unwrap_err();

    assert!(matches!(err, IndexError::SizeLimitExceeded { .. }));
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_download_under_ceiling_succeeds() {
    let addr = fake_host().await;
    let tmp = TempDir::new().unwrap();
    let dest = tmp.path().join("archive.zip");

    let written = host(addr, tmp.path())
        .download_archive(&format!("http://{}/small", addr), &dest)
        .await
        .unwrap();

    assert_eq!(written, 600);
    assert_eq!(std::fs::metadata(&dest).unwrap().len(), 600);
}

#[tokio::test]
async fn test_status_codes_map_to_error_kinds() {
    let addr = fake_host().await;
    let tmp = TempDir::new().unwrap();
    let host = host(addr, tmp.path());
    let dest = tmp.path().join("a.zip");
    let url = |p: &str| format!("http://{}/{}", addr, p);

    assert!(matches!(
        host.download_archive(&url("missing"), &dest).await,
        Err(IndexError::NotFound(_))
    ));
    assert!(matches!(
        host.download_archive(&url("limited"), &dest).await,
        Err(IndexError::RateLimited(_))
    ));
    assert!(matches!(
        host.download_archive(&url("forbidden"), &dest).await,
        Err(IndexError::RateLimited(_))
    ));
    assert!(matches!(
        host.download_archive(&url("broken"), &dest).await,
        Err(IndexError::Fetch(_))
    ));
}

#[tokio::test]
async fn test_acquire_extracts_and_cleanup_removes_session() {
    let addr = fake_host().await;
    let tmp = TempDir::new().unwrap();
    let work_dir = tmp.path().join("work");
    let repo = RepoReference::new("acme", "widgets", "abc1234").unwrap();

    let snapshot = host(addr, &work_dir).acquire(&repo).await.unwrap();
    assert_eq!(snapshot.top_level_dir.as_deref(), Some("acme-widgets-abc1234"));
    assert!(snapshot.root_path.join("src/lib.rs").is_file());
    assert!(snapshot.archive_path().is_file());

    snapshot.cleanup().await;
    let leftovers: Vec<_> = std::fs::read_dir(&work_dir).unwrap().collect();
    assert!(leftovers.is_empty(), "session directory should be removed");
}

#[tokio::test]
async fn test_acquire_unknown_revision_leaves_nothing_behind() {
    let addr = fake_host().await;
    let tmp = TempDir::new().unwrap();
    let work_dir = tmp.path().join("work");
    let repo = RepoReference::new("acme", "widgets", "fffffff").unwrap();

    let err = host(addr, &work_dir).acquire(&repo).await.unwrap_err();
    assert!(matches!(err, IndexError::NotFound(_)));
    let leftovers: Vec<_> = std::fs::read_dir(&work_dir).unwrap().collect();
    assert!(leftovers.is_empty());
}
