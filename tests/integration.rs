//! End-to-end tests over the library with mock provider servers.
//!
//! A small axum server stands in for the embedding provider (returning
//! deterministic SHA-256-derived vectors, normalized, 4 dimensions) and
//! another for the generation provider (streaming two SSE content chunks).
//! Tests then run the real ingest engine, store, assembler, and HTTP
//! surface against them.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

use embedder::auth::AdminAuth;
use embedder::config::Settings;
use embedder::context::{AssembleRequest, Assembler};
use embedder::index::DistanceMetric;
use embedder::ingest::IngestEngine;
use embedder::metrics::Metrics;
use embedder::serve::Shutdown;
use embedder::server::{build_router, AppState};
use embedder::sources::SourceProcessor;
use embedder::store::VectorStore;
use embedder::tokenizer::Tokenizer;

const DIM: usize = 4;

/// Deterministic unit-length vector from a text: SHA-256 truncated to four
/// bytes, centered and normalized.
fn sha_vector(text: &str) -> Vec<f32> {
    let digest = Sha256::digest(text.as_bytes());
    let mut v: Vec<f32> = digest[..DIM]
        .iter()
        .map(|b| *b as f32 - 127.5)
        .collect();
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-6);
    v.iter_mut().for_each(|x| *x /= norm);
    v
}

async fn spawn_embedding_server() -> String {
    async fn embed(Json(body): Json<serde_json::Value>) -> axum::response::Response {
        let texts = body["content"].as_array().cloned().unwrap_or_default();
        if texts
            .iter()
            .any(|t| t.as_str().unwrap_or_default().contains("FAIL_EMBED"))
        {
            return (StatusCode::INTERNAL_SERVER_ERROR, "embedding backend down").into_response();
        }
        let items: Vec<serde_json::Value> = texts
            .iter()
            .map(|t| {
                serde_json::json!({
                    "embedding": [sha_vector(t.as_str().unwrap_or_default())]
                })
            })
            .collect();
        Json(serde_json::Value::Array(items)).into_response()
    }

    let app = Router::new().route("/embedding", post(embed));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/embedding", addr)
}

async fn spawn_generation_server() -> String {
    async fn chat(Json(_body): Json<serde_json::Value>) -> axum::response::Response {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hello \"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"world\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        ([("Content-Type", "text/event-stream")], body).into_response()
    }

    let app = Router::new().route("/v1/chat/completions", post(chat));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/v1/chat/completions", addr)
}

/// Settings over a tempdir corpus, saved to disk so `update()` can re-read
/// them.
fn test_settings(root: &Path, embed_url: &str, gen_url: &str) -> Settings {
    let config = serde_json::json!({
        "chunking": { "nof_max_tokens": 100, "nof_min_tokens": 1, "overlap_percentage": 0.0 },
        "embedding": {
            "apis": [{
                "id": "mock-embed",
                "api_url": embed_url,
                "model": "mock",
            }],
            "current_api": "mock-embed",
            "batch_size": 4,
            "top_k": 5,
        },
        "generation": {
            "apis": [{
                "id": "mock-gen",
                "api_url": gen_url,
                "model": "mock",
                "context_length": 8192,
                "stream": true,
            }],
            "current_api": "mock-gen",
        },
        "database": {
            "sqlite_path": root.join("db.sqlite").to_string_lossy(),
            "index_path": root.join("index").to_string_lossy(),
            "vector_dim": DIM,
            "max_elements": 1000,
            "distance_metric": "cosine",
        },
        "source": {
            "default_extensions": [".txt"],
            "paths": [{
                "type": "directory",
                "path": root.join("corpus").to_string_lossy(),
                "recursive": true,
            }],
        },
    });
    let mut settings: Settings = serde_json::from_value(config).unwrap();
    settings.config_path = root.join("settings.json");
    settings.save().unwrap();
    settings
}

async fn open_store(settings: &Settings) -> Arc<VectorStore> {
    Arc::new(
        VectorStore::open(
            &settings.database.sqlite_path,
            &settings.database.index_path,
            settings.database.vector_dim,
            settings.database.max_elements,
            DistanceMetric::Cosine,
        )
        .await
        .unwrap(),
    )
}

fn write_corpus_file(root: &Path, name: &str, content: &str) {
    let dir = root.join("corpus");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(name), content).unwrap();
}

#[tokio::test]
async fn empty_corpus_search_returns_empty() {
    let tmp = TempDir::new().unwrap();
    let embed_url = spawn_embedding_server().await;
    let gen_url = spawn_generation_server().await;
    let settings = test_settings(tmp.path(), &embed_url, &gen_url);
    let store = open_store(&settings).await;

    let results = store.search(&[1.0, 0.0, 0.0, 0.0], 5).await.unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn ingest_then_search_roundtrip() {
    let tmp = TempDir::new().unwrap();
    let embed_url = spawn_embedding_server().await;
    let gen_url = spawn_generation_server().await;
    write_corpus_file(tmp.path(), "a.txt", "hello world");
    write_corpus_file(tmp.path(), "b.txt", "goodbye world");

    let settings = test_settings(tmp.path(), &embed_url, &gen_url);
    let store = open_store(&settings).await;
    let tokenizer = Arc::new(Tokenizer::approximate());
    let engine = IngestEngine::new(Arc::clone(&store), tokenizer, settings.clone());

    let summary = engine.embed(true).await.unwrap();
    assert_eq!(summary.files, 2);

    let stats = store.get_stats().await.unwrap();
    assert_eq!(stats.total_chunks, 2);
    assert_eq!(stats.active_count, 2);

    let results = store.search(&sha_vector("hello world"), 1).await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].source_id.ends_with("a.txt"));
    assert!(
        results[0].similarity_score >= 0.999,
        "identical text must score ~1, got {}",
        results[0].similarity_score
    );
}

#[tokio::test]
async fn incremental_update_reembeds_modified_file() {
    let tmp = TempDir::new().unwrap();
    let embed_url = spawn_embedding_server().await;
    let gen_url = spawn_generation_server().await;
    write_corpus_file(tmp.path(), "a.txt", "hello world");
    write_corpus_file(tmp.path(), "b.txt", "goodbye world");

    let settings = test_settings(tmp.path(), &embed_url, &gen_url);
    let store = open_store(&settings).await;
    let tokenizer = Arc::new(Tokenizer::approximate());
    let engine = IngestEngine::new(Arc::clone(&store), tokenizer, settings.clone());
    engine.embed(true).await.unwrap();

    let a_path = tmp
        .path()
        .join("corpus/a.txt")
        .to_string_lossy()
        .into_owned();
    let old_ids = store.get_chunk_ids_by_source(&a_path).await.unwrap();
    assert_eq!(old_ids.len(), 1);
    let old_mtime = store
        .get_tracked_files()
        .await
        .unwrap()
        .into_iter()
        .find(|f| f.path == a_path)
        .unwrap()
        .last_modified;

    // Unchanged corpus: update is a no-op.
    assert_eq!(engine.update().await.unwrap(), 0);

    // Modify a.txt (different size guarantees change detection).
    write_corpus_file(tmp.path(), "a.txt", "entirely new content about parsers");
    assert_eq!(engine.update().await.unwrap(), 1);

    let new_ids = store.get_chunk_ids_by_source(&a_path).await.unwrap();
    assert_eq!(new_ids.len(), 1);
    assert_ne!(new_ids[0], old_ids[0], "re-ingest must assign a fresh id");

    let new_mtime = store
        .get_tracked_files()
        .await
        .unwrap()
        .into_iter()
        .find(|f| f.path == a_path)
        .unwrap()
        .last_modified;
    assert!(new_mtime >= old_mtime);

    let results = store
        .search(&sha_vector("entirely new content about parsers"), 1)
        .await
        .unwrap();
    assert_eq!(results[0].chunk_id, Some(new_ids[0]));
}

#[tokio::test]
async fn delete_then_restore_round_trips() {
    let tmp = TempDir::new().unwrap();
    let embed_url = spawn_embedding_server().await;
    let gen_url = spawn_generation_server().await;
    write_corpus_file(tmp.path(), "a.txt", "hello world");

    let settings = test_settings(tmp.path(), &embed_url, &gen_url);
    let store = open_store(&settings).await;
    let tokenizer = Arc::new(Tokenizer::approximate());
    let engine = IngestEngine::new(Arc::clone(&store), tokenizer, settings.clone());
    engine.embed(true).await.unwrap();

    let a_path = tmp
        .path()
        .join("corpus/a.txt")
        .to_string_lossy()
        .into_owned();
    let before: Vec<String> = store
        .search(&sha_vector("hello world"), 5)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.source_id)
        .collect();

    let mut tx = store.begin().await.unwrap();
    tx.delete_documents_by_source(&a_path).await.unwrap();
    tx.remove_file_metadata(&a_path).await.unwrap();
    tx.commit().await.unwrap();

    // Re-ingest identical content; the mock embedder is deterministic, so
    // the same source set (and scores) comes back.
    engine.update().await.unwrap();
    let after: Vec<String> = store
        .search(&sha_vector("hello world"), 5)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.source_id)
        .collect();
    assert_eq!(before, after);
}

#[tokio::test]
async fn failure_quarantine_after_three_strikes() {
    let tmp = TempDir::new().unwrap();
    let embed_url = spawn_embedding_server().await;
    let gen_url = spawn_generation_server().await;
    write_corpus_file(tmp.path(), "good.txt", "perfectly fine file");

    let settings = test_settings(tmp.path(), &embed_url, &gen_url);
    let store = open_store(&settings).await;
    let tokenizer = Arc::new(Tokenizer::approximate());
    let engine = IngestEngine::new(Arc::clone(&store), tokenizer, settings.clone());
    engine.embed(true).await.unwrap();

    // The mock embedding server rejects any batch containing this marker.
    write_corpus_file(tmp.path(), "bad.txt", "FAIL_EMBED forever");
    let bad_path = tmp
        .path()
        .join("corpus/bad.txt")
        .to_string_lossy()
        .into_owned();

    for round in 1..=3 {
        assert_eq!(engine.update().await.unwrap(), 0, "round {}", round);
    }
    assert!(
        engine.is_ignored(&bad_path).await,
        "three failures must quarantine the file"
    );

    // Quarantined: the fourth update does not touch it.
    assert_eq!(engine.update().await.unwrap(), 0);
    assert!(!store.file_exists_in_metadata(&bad_path).await.unwrap());

    // The failing file never poisoned the good one.
    let results = store
        .search(&sha_vector("perfectly fine file"), 1)
        .await
        .unwrap();
    assert!(results[0].source_id.ends_with("good.txt"));
}

#[tokio::test]
async fn assembler_respects_budget_and_group_order() {
    let tmp = TempDir::new().unwrap();
    let embed_url = spawn_embedding_server().await;
    let gen_url = spawn_generation_server().await;

    let words = |n: usize, tag: &str| -> String {
        (0..n).map(|i| format!("{}{} ", tag, i)).collect()
    };
    write_corpus_file(tmp.path(), "small.txt", &words(100, "s"));
    write_corpus_file(tmp.path(), "large.txt", &words(900, "l"));

    let mut settings = test_settings(tmp.path(), &embed_url, &gen_url);
    settings.generation.max_chunks = 10;
    let store = open_store(&settings).await;
    let tokenizer = Arc::new(Tokenizer::approximate());
    let engine = IngestEngine::new(Arc::clone(&store), Arc::clone(&tokenizer), settings.clone());
    engine.embed(true).await.unwrap();

    // Provider window 1000 tokens, half available to context.
    settings.generation.apis[0].context_length = 1000;
    let api = settings.generation_current_api().unwrap();
    let processor = SourceProcessor::new(settings.clone());
    let assembler = Assembler::new(&store, Arc::clone(&tokenizer), &settings, &processor);

    let small_path = tmp.path().join("corpus/small.txt");
    let large_path = tmp.path().join("corpus/large.txt");
    let mut infos: Vec<String> = Vec::new();
    let mut on_info = |m: &str| infos.push(m.to_string());

    let (ordered, used) = assembler
        .assemble(
            AssembleRequest {
                question: words(50, "q"),
                attachments: vec![
                    embedder::models::Attachment {
                        filename: "att-small.txt".to_string(),
                        content: words(200, "a"),
                    },
                    embedder::models::Attachment {
                        filename: "att-large.txt".to_string(),
                        content: words(2000, "b"),
                    },
                ],
                pinned_sources: vec![
                    small_path.to_string_lossy().into_owned(),
                    large_path.to_string_lossy().into_owned(),
                ],
                api,
                ctx_ratio: 0.5,
                attached_only: false,
            },
            &mut on_info,
        )
        .await
        .unwrap();

    let max_budget = 500;
    assert!(used <= max_budget, "used {} tokens of {}", used, max_budget);
    let content_tokens: usize = ordered
        .iter()
        .map(|r| tokenizer.count(&r.content, false))
        .sum();
    assert!(
        content_tokens <= max_budget,
        "passages use {} tokens of {}",
        content_tokens,
        max_budget
    );
    assert!(ordered.len() <= settings.generation.max_chunks);

    // Group order: both attachments first, then full sources.
    assert!(ordered.len() >= 2);
    assert!(ordered[0].source_id.starts_with("att-"));
    assert!(ordered[1].source_id.starts_with("att-"));
    for result in &ordered[2..] {
        assert!(!result.source_id.starts_with("att-"));
    }

    // The oversized attachment produced a truncation notice.
    assert!(
        infos.iter().any(|m| m.contains("truncated")),
        "expected a truncation meta ping, got {:?}",
        infos
    );
}

#[tokio::test]
async fn chat_endpoint_streams_sse_frames_in_order() {
    let tmp = TempDir::new().unwrap();
    let embed_url = spawn_embedding_server().await;
    let gen_url = spawn_generation_server().await;
    write_corpus_file(tmp.path(), "a.txt", "hello world");

    let settings = test_settings(tmp.path(), &embed_url, &gen_url);
    let store = open_store(&settings).await;
    let tokenizer = Arc::new(Tokenizer::approximate());
    let engine = Arc::new(IngestEngine::new(
        Arc::clone(&store),
        tokenizer,
        settings.clone(),
    ));
    engine.embed(true).await.unwrap();

    let state = AppState {
        engine,
        auth: Arc::new(AdminAuth::new()),
        metrics: Arc::new(Metrics::new()),
        registry: None,
        shutdown: Arc::new(Shutdown::new()),
        app_key: String::new(),
    };
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    let body = reqwest::Client::new()
        .post(format!("http://{}/api/chat", addr))
        .json(&serde_json::json!({
            "messages": [{"role": "user", "content": "what does hello world do?"}]
        }))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    let meta_pos = body
        .find("data: {\"content\":\"[meta]")
        .expect("meta frame missing");
    let hello_pos = body
        .find("data: {\"content\":\"Hello \"}")
        .expect("first content frame missing");
    let world_pos = body
        .find("data: {\"content\":\"world\"}")
        .expect("second content frame missing");
    let sources_pos = body
        .find("data: {\"sources\":")
        .expect("context_sources frame missing");
    assert!(body.contains("\"type\":\"context_sources\""));
    let done_pos = body.find("data: [DONE]").expect("DONE frame missing");

    assert!(meta_pos < hello_pos);
    assert!(hello_pos < world_pos);
    assert!(world_pos < sources_pos);
    assert!(sources_pos < done_pos);
    assert!(body.trim_end().ends_with("data: [DONE]"));

    // Every frame uses the `data: <payload>\n\n` shape.
    for frame in body.split("\n\n").filter(|f| !f.trim().is_empty()) {
        assert!(frame.starts_with("data: "), "malformed frame: {:?}", frame);
    }
}

#[tokio::test]
async fn health_and_stats_endpoints() {
    let tmp = TempDir::new().unwrap();
    let embed_url = spawn_embedding_server().await;
    let gen_url = spawn_generation_server().await;
    write_corpus_file(tmp.path(), "a.txt", "hello world");

    let settings = test_settings(tmp.path(), &embed_url, &gen_url);
    let store = open_store(&settings).await;
    let tokenizer = Arc::new(Tokenizer::approximate());
    let engine = Arc::new(IngestEngine::new(
        Arc::clone(&store),
        tokenizer,
        settings.clone(),
    ));
    engine.embed(true).await.unwrap();

    let state = AppState {
        engine,
        auth: Arc::new(AdminAuth::new()),
        metrics: Arc::new(Metrics::new()),
        registry: None,
        shutdown: Arc::new(Shutdown::new()),
        app_key: String::new(),
    };
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    let client = reqwest::Client::new();
    let health: serde_json::Value = client
        .get(format!("http://{}/api/health", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let stats: serde_json::Value = client
        .get(format!("http://{}/api/stats", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["total_chunks"], 1);
    assert_eq!(stats["sources"]["total_files"], 1);

    let prometheus = client
        .get(format!("http://{}/metrics", addr))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(prometheus.contains("# TYPE embedder_requests_total counter"));
    assert!(prometheus.contains("embedder_database_chunks_total 1"));
}
