// HTTP API integration: document round trip, synchronous search, and the
// status endpoint against a standalone process.

use std::sync::Arc;
use std::time::{Duration, Instant};

use textmatch::registry::{Flags, Mode, Registry};

async fn open_standalone() -> (Arc<Registry>, String) {
    let mut flags = Flags::default();
    flags.api_address = "127.0.0.1:0".to_string();
    flags.posting_addresses = vec!["127.0.0.1:0".to_string(), "127.0.0.1:0".to_string()];
    let registry = Registry::open(Mode::Standalone, flags).await.unwrap();
    registry.clone().start_services().await.unwrap();
    let base = format!("http://{}", registry.api_address);
    (registry, base)
}

async fn settle(registry: &Arc<Registry>, terminal: u64) {
    let deadline = Instant::now() + Duration::from_secs(20);
    let queue = registry.queue();
    loop {
        let stats = queue.stats().await.unwrap();
        if stats.completed + stats.failed >= terminal {
            return;
        }
        if Instant::now() > deadline {
            panic!("queue never settled: {:?}", stats);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_document_round_trip_over_http() {
    let (registry, base) = open_standalone().await;
    let http = reqwest::Client::new();

    let response = http
        .post(format!("{}/document/1/1", base))
        .json(&serde_json::json!({
            "title": "Payload",
            "text": "PayloadWithsometextlongerthanwindowsize"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);
    let enqueued: serde_json::Value = response.json().await.unwrap();
    assert!(enqueued["queue_id"].as_u64().is_some());

    settle(&registry, 1).await;

    let response = http
        .get(format!("{}/document/1/1", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let doc: serde_json::Value = response.json().await.unwrap();
    assert_eq!(doc["title"], "Payload");
    assert_eq!(doc["text"], "PayloadWithsometextlongerthanwindowsize");

    let response = http
        .get(format!("{}/document/1/2", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let response = http
        .delete(format!("{}/document/1/1", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);
    settle(&registry, 2).await;

    let response = http
        .get(format!("{}/document/1/1", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    registry.shutdown().await;
}

#[tokio::test]
async fn test_search_and_status_over_http() {
    let (registry, base) = open_standalone().await;
    let http = reqwest::Client::new();

    let shared = "a shared stretch of text well beyond the thirty rune window size";
    let stored = format!("{} plus trailing content of its own", shared);
    let response = http
        .post(format!("{}/document/2/5", base))
        .json(&serde_json::json!({ "title": "stored", "text": stored }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);
    settle(&registry, 1).await;

    let response = http
        .post(format!("{}/search", base))
        .json(&serde_json::json!({ "text": shared }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let matches: serde_json::Value = response.json().await.unwrap();
    assert_eq!(matches["partial"], false);
    let runs = matches["runs"].as_array().unwrap();
    assert!(!runs.is_empty(), "no runs in {}", matches);
    assert_eq!(runs[0]["doc"]["doctype"], 2);
    assert_eq!(runs[0]["doc"]["docid"], 5);

    let response = http.get(format!("{}/status", base)).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let status: serde_json::Value = response.json().await.unwrap();
    assert_eq!(status["documents"], 1);
    assert_eq!(status["queue"]["completed"], 1);
    let shards = status["shards"].as_array().unwrap();
    assert_eq!(shards.len(), 2);
    assert!(shards.iter().all(|s| s["state"] == "ready"));

    registry.shutdown().await;
}
