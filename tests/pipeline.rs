use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use tokio::sync::Notify;

use playlist_etl::catalog::PlaylistSource;
use playlist_etl::config::{StorageConfig, TransformedPrefixes};
use playlist_etl::error::{EtlError, Result};
use playlist_etl::models::{FetchedPlaylist, TableKind};
use playlist_etl::pipeline::{self, Pipeline, Plan, TaskId, TaskState};
use playlist_etl::store::{MemoryStore, ObjectStore};

const PENDING: &str = "raw_data/to_processed/";
const PROCESSED: &str = "raw_data/processed/";

fn storage() -> StorageConfig {
    StorageConfig {
        bucket: "etl-bucket".to_string(),
        region: "us-east-1".to_string(),
        endpoint_url: None,
        pending_prefix: PENDING.to_string(),
        processed_prefix: PROCESSED.to_string(),
        transformed: TransformedPrefixes::default(),
    }
}

fn run_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 10, 10, 12, 0, 0).unwrap()
}

/// One playlist page with a single item: track T1 on album A1.
fn scenario_document(release_date: &str) -> String {
    json!({
        "items": [{
            "added_at": "2024-01-01T00:00:00Z",
            "track": {
                "id": "T1",
                "name": "Song1",
                "duration_ms": 1000,
                "popularity": 5,
                "external_urls": { "spotify": "u" },
                "artists": [
                    { "id": "R1", "name": "Artist One", "href": "h1", "external_urls": { "spotify": "s1" } },
                    { "id": "R2", "name": "Artist Two", "href": "h2", "external_urls": { "spotify": "s2" } }
                ],
                "album": {
                    "id": "A1",
                    "name": "X",
                    "release_date": release_date,
                    "total_tracks": 10,
                    "external_urls": { "spotify": "u" },
                    "artists": [{ "id": "Q1" }]
                }
            }
        }]
    })
    .to_string()
}

struct StubSource {
    body: String,
}

#[async_trait]
impl PlaylistSource for StubSource {
    async fn fetch_playlist(&self) -> Result<FetchedPlaylist> {
        Ok(FetchedPlaylist {
            filename: "spotify_raw_20241010120000.json".to_string(),
            body: self.body.clone(),
        })
    }
}

struct RateLimitedSource;

#[async_trait]
impl PlaylistSource for RateLimitedSource {
    async fn fetch_playlist(&self) -> Result<FetchedPlaylist> {
        Err(EtlError::RateLimited {
            retry_after: Some(10),
        })
    }
}

/// Memory store whose deletes always fail.
struct StuckDeleteStore {
    inner: MemoryStore,
}

#[async_trait]
impl ObjectStore for StuckDeleteStore {
    fn location(&self) -> String {
        self.inner.location()
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list_keys(prefix).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<()> {
        self.inner.put(key, body).await
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        self.inner.copy(from, to).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        Err(EtlError::Store(format!("delete denied: {}", key)))
    }
}

fn text(store: &MemoryStore, key: &str) -> String {
    String::from_utf8(store.object(key).unwrap_or_else(|| panic!("missing object {}", key)))
        .unwrap()
}

#[tokio::test]
async fn test_full_run_publishes_tables_and_archives() {
    let store = Arc::new(MemoryStore::new());
    let source: Arc<dyn PlaylistSource> = Arc::new(StubSource {
        body: scenario_document("1999"),
    });
    let pipeline = Pipeline::new(storage(), store.clone(), Some(source));

    let report = pipeline.run(Plan::Full, run_at()).await;
    assert!(report.is_success(), "{}", report);

    assert_eq!(
        text(&store, "transformed_data/albums/album_transformed_20241010T120000.csv"),
        "album_id,name,release_date,total_tracks,url\nA1,X,1999-01-01,10,u\n"
    );
    assert_eq!(
        text(&store, "transformed_data/artists/artist_transformed_20241010T120000.csv"),
        "artist_id,artist_name,external_url\nR1,Artist One,h1\nR2,Artist Two,h2\n"
    );
    assert_eq!(
        text(&store, "transformed_data/songs/song_transformed_20241010T120000.csv"),
        "song_id,song_name,duration_ms,url,popularity,song_added,album_id,artist_id\n\
         T1,Song1,1000,u,5,2024-01-01T00:00:00Z,A1,Q1\n"
    );

    // Raw document moved, not duplicated.
    assert!(store
        .object("raw_data/to_processed/spotify_raw_20241010120000.json")
        .is_none());
    assert!(store
        .object("raw_data/processed/spotify_raw_20241010120000.json")
        .is_some());
    assert_eq!(report.outputs.moved.len(), 1);
    assert_eq!(report.outputs.published.len(), 3);
}

#[tokio::test]
async fn test_transform_reads_every_pending_document() {
    let store = Arc::new(MemoryStore::new());
    store.insert(
        format!("{}spotify_raw_1.json", PENDING),
        scenario_document("1999"),
    ).unwrap();
    store.insert(
        format!("{}spotify_raw_2.json", PENDING),
        scenario_document("1999-05-01"),
    ).unwrap();
    let pipeline = Pipeline::new(storage(), store.clone(), None);

    let report = pipeline.run(Plan::Transform, run_at()).await;
    assert!(report.is_success(), "{}", report);
    assert_eq!(report.outputs.pending.len(), 2);

    // A1 appears in both documents; the first one read wins.
    let albums = text(&store, "transformed_data/albums/album_transformed_20241010T120000.csv");
    assert_eq!(albums.lines().count(), 2);
    assert!(albums.contains("A1,X,1999-01-01,10,u"));

    // Transform leaves pending documents in place.
    assert_eq!(
        pipeline::pending_keys(store.as_ref(), PENDING).await.unwrap().len(),
        2
    );
}

#[tokio::test]
async fn test_full_plan_without_source_touches_nothing() {
    let store = Arc::new(MemoryStore::new());
    store.insert(
        format!("{}spotify_raw_1.json", PENDING),
        scenario_document("sometime"),
    ).unwrap();
    let pipeline = Pipeline::new(storage(), store.clone(), None);

    let report = pipeline.run(Plan::Full, run_at()).await;
    assert!(!report.is_success());

    assert!(matches!(
        report.state(TaskId::FetchPlaylist),
        Some(TaskState::Failed(EtlError::Config(_)))
    ));
    assert!(matches!(
        report.state(TaskId::ReadPending),
        Some(TaskState::UpstreamFailed)
    ));
    assert!(matches!(
        report.state(TaskId::MoveProcessed),
        Some(TaskState::UpstreamFailed)
    ));
    assert_eq!(store.keys(), vec![format!("{}spotify_raw_1.json", PENDING)]);
}

#[tokio::test]
async fn test_bad_album_date_keeps_documents_pending() {
    let store = Arc::new(MemoryStore::new());
    let source: Arc<dyn PlaylistSource> = Arc::new(StubSource {
        body: scenario_document("sometime"),
    });
    let pipeline = Pipeline::new(storage(), store.clone(), Some(source));

    let report = pipeline.run(Plan::Full, run_at()).await;
    assert!(!report.is_success());

    assert!(matches!(
        report.state(TaskId::Process(TableKind::Album)),
        Some(TaskState::Failed(EtlError::Malformed { .. }))
    ));
    assert!(matches!(
        report.state(TaskId::Store(TableKind::Album)),
        Some(TaskState::UpstreamFailed)
    ));
    assert!(matches!(
        report.state(TaskId::Store(TableKind::Artist)),
        Some(TaskState::Success)
    ));
    assert!(matches!(
        report.state(TaskId::Store(TableKind::Song)),
        Some(TaskState::Success)
    ));
    assert!(matches!(
        report.state(TaskId::MoveProcessed),
        Some(TaskState::UpstreamFailed)
    ));

    assert!(store
        .object("raw_data/to_processed/spotify_raw_20241010120000.json")
        .is_some());
    assert!(store
        .object("transformed_data/albums/album_transformed_20241010T120000.csv")
        .is_none());
    assert!(store
        .object("transformed_data/artists/artist_transformed_20241010T120000.csv")
        .is_some());

    let (task, err) = report.first_error().unwrap();
    assert_eq!(task, TaskId::Process(TableKind::Album));
    assert!(err.to_string().contains("spotify_raw_20241010120000.json"));
}

#[tokio::test]
async fn test_rate_limited_fetch_stops_everything_downstream() {
    let store = Arc::new(MemoryStore::new());
    let source: Arc<dyn PlaylistSource> = Arc::new(RateLimitedSource);
    let pipeline = Pipeline::new(storage(), store.clone(), Some(source));

    let report = pipeline.run(Plan::Full, run_at()).await;
    assert!(matches!(
        report.state(TaskId::FetchPlaylist),
        Some(TaskState::Failed(EtlError::RateLimited { retry_after: Some(10) }))
    ));
    for task in &report.tasks[1..] {
        assert!(matches!(task.1, TaskState::UpstreamFailed), "{:?}", task.0);
    }
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_empty_pending_publishes_header_only_tables() {
    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::new(storage(), store.clone(), None);

    let report = pipeline.run(Plan::Transform, run_at()).await;
    assert!(report.is_success(), "{}", report);
    assert_eq!(
        text(&store, "transformed_data/artists/artist_transformed_20241010T120000.csv"),
        "artist_id,artist_name,external_url\n"
    );
}

#[tokio::test]
async fn test_republishing_same_run_overwrites() {
    let store = Arc::new(MemoryStore::new());
    store.insert(
        format!("{}spotify_raw_1.json", PENDING),
        scenario_document("1999"),
    ).unwrap();
    let pipeline = Pipeline::new(storage(), store.clone(), None);

    pipeline.run(Plan::Transform, run_at()).await;
    let before = store.keys();
    let report = pipeline.run(Plan::Transform, run_at()).await;
    assert!(report.is_success());
    assert_eq!(store.keys(), before);
}

#[tokio::test]
async fn test_archive_skips_non_json_keys() {
    let store = Arc::new(MemoryStore::new());
    store.insert(format!("{}a.json", PENDING), "{}").unwrap();
    store.insert(format!("{}nested/b.json", PENDING), "{}").unwrap();
    store.insert(format!("{}notes.txt", PENDING), "keep").unwrap();

    let moved = pipeline::move_processed(store.as_ref(), PENDING, PROCESSED)
        .await
        .unwrap();
    assert_eq!(moved.len(), 2);
    assert_eq!(
        store.keys(),
        vec![
            "raw_data/processed/a.json".to_string(),
            "raw_data/processed/nested/b.json".to_string(),
            "raw_data/to_processed/notes.txt".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_failed_delete_leaves_document_in_both_places() {
    let store = StuckDeleteStore {
        inner: MemoryStore::new(),
    };
    store.inner.insert(format!("{}a.json", PENDING), "{}").unwrap();

    let err = pipeline::move_processed(&store, PENDING, PROCESSED)
        .await
        .unwrap_err();
    assert!(matches!(err, EtlError::Store(_)));
    assert_eq!(
        store.inner.keys(),
        vec![
            "raw_data/processed/a.json".to_string(),
            "raw_data/to_processed/a.json".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_unparseable_pending_document_is_malformed() {
    let store = Arc::new(MemoryStore::new());
    store.insert(format!("{}broken.json", PENDING), "{not json").unwrap();

    let err = pipeline::load_pending(store.as_ref(), PENDING)
        .await
        .unwrap_err();
    match err {
        EtlError::Malformed { key, .. } => assert_eq!(key, "raw_data/to_processed/broken.json"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_field_missing_for_songs_fails_only_song_branch() {
    let mut document: serde_json::Value =
        serde_json::from_str(&scenario_document("1999")).unwrap();
    document["items"][0]["track"]
        .as_object_mut()
        .unwrap()
        .remove("popularity");
    let store = Arc::new(MemoryStore::new());
    store
        .insert(format!("{}a.json", PENDING), document.to_string())
        .unwrap();
    let pipeline = Pipeline::new(storage(), store.clone(), None);

    let report = pipeline.run(Plan::Transform, run_at()).await;
    assert!(!report.is_success());

    for kind in [TableKind::Album, TableKind::Artist] {
        assert!(
            matches!(report.state(TaskId::Store(kind)), Some(TaskState::Success)),
            "{}",
            report
        );
    }
    match report.state(TaskId::Process(TableKind::Song)) {
        Some(TaskState::Failed(EtlError::Malformed { key, reason })) => {
            assert_eq!(key, "raw_data/to_processed/a.json");
            assert!(reason.contains("popularity"));
        }
        other => panic!("unexpected song state: {:?}", other),
    }

    assert_eq!(
        text(&store, "transformed_data/albums/album_transformed_20241010T120000.csv"),
        "album_id,name,release_date,total_tracks,url\nA1,X,1999-01-01,10,u\n"
    );
    assert!(store
        .object("transformed_data/songs/song_transformed_20241010T120000.csv")
        .is_none());
}

/// Fails its first fetch, then serves a new document per call. Signals
/// `done` once it has been called `stop_after` times.
struct FlakySource {
    calls: AtomicUsize,
    stop_after: usize,
    done: Arc<Notify>,
}

#[async_trait]
impl PlaylistSource for FlakySource {
    async fn fetch_playlist(&self) -> Result<FetchedPlaylist> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.stop_after {
            self.done.notify_one();
        }
        if call == 1 {
            return Err(EtlError::Catalog("HTTP 502 Bad Gateway: upstream".to_string()));
        }
        Ok(FetchedPlaylist {
            filename: format!("spotify_raw_{}.json", call),
            body: scenario_document("1999"),
        })
    }
}

#[tokio::test]
async fn test_schedule_runs_once_per_tick_and_survives_failures() {
    let done = Arc::new(Notify::new());
    let source = Arc::new(FlakySource {
        calls: AtomicUsize::new(0),
        stop_after: 3,
        done: done.clone(),
    });
    let store = Arc::new(MemoryStore::new());
    let dyn_source: Arc<dyn PlaylistSource> = source.clone();
    let pipeline = Pipeline::new(storage(), store.clone(), Some(dyn_source));

    tokio::time::timeout(
        Duration::from_secs(10),
        pipeline.run_until(Duration::from_millis(5), done.notified()),
    )
    .await
    .expect("schedule loop did not stop")
    .unwrap();

    // The failed first run did not end the loop, and shutdown is honored
    // as soon as the third run returns.
    assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        store.keys().iter().filter(|k| k.starts_with(PROCESSED)).count(),
        2
    );
    assert!(pipeline::pending_keys(store.as_ref(), PENDING)
        .await
        .unwrap()
        .is_empty());
}
