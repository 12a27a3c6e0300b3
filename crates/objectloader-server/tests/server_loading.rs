//! Loader integration against a mocked object server.
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test --package objectloader-server --test server_loading
//! ```

use futures::StreamExt;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use objectloader_core::{BatchDownloader, BatchDownloaderOptions, LoaderBuilder, TransportOptions};
use objectloader_server::{ServerFetcher, ServerOptions};

const ROOT: &str = r#"{"id":"root","speckle_type":"Collection","name":"Level 1","__closure":{"wall":1,"door":2}}"#;
const WALL: &str = r#"{"id":"wall","speckle_type":"Wall","height":3.2}"#;
const DOOR: &str = r#"{"id":"door","speckle_type":"Door"}"#;

async fn mock_server() -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/objects/project/root/single"))
        .respond_with(ResponseTemplate::new(200).set_body_string(ROOT))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/getobjects/project"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(format!("wall\t{}\ndoor\t{}\n", WALL, DOOR)),
        )
        .expect(1)
        .mount(&server)
        .await;

    server
}

fn downloader(server: &MockServer) -> Arc<BatchDownloader<ServerFetcher>> {
    let fetcher = ServerFetcher::new(ServerOptions::new(server.uri(), "project").with_max_retries(0))
        .expect("Failed to build fetcher");
    Arc::new(BatchDownloader::new(
        fetcher,
        BatchDownloaderOptions {
            batch_max_size: 100,
            batch_max_wait: Duration::from_millis(10),
        },
    ))
}

#[tokio::test]
async fn test_streams_closure_from_server() {
    let server = mock_server().await;
    let loader = LoaderBuilder::new()
        .root_id("root")
        .downloader(downloader(&server))
        .build()
        .unwrap();

    let root = loader.get_root_object().await.unwrap();
    assert_eq!(root.properties["name"], "Level 1");

    let items: Vec<_> = loader
        .object_stream()
        .await
        .unwrap()
        .map(|r| r.unwrap())
        .collect()
        .await;
    let mut ids: Vec<&str> = items.iter().map(|i| i.base_id.as_str()).collect();
    assert_eq!(ids[0], "root");
    ids.sort();
    assert_eq!(ids, vec!["door", "root", "wall"]);

    let wall = items.iter().find(|i| i.base_id == "wall").unwrap();
    assert_eq!(wall.size, Some(WALL.len()));
    loader.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_streams_closure_through_worker_thread() {
    // Behind the worker every request is batched, the root included
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/getobjects/project"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            "root\t{}\nwall\t{}\ndoor\t{}\n",
            ROOT, WALL, DOOR
        )))
        .mount(&server)
        .await;

    let loader = LoaderBuilder::new()
        .root_id("root")
        .downloader(downloader(&server))
        .worker_transport(TransportOptions::default())
        .build()
        .unwrap();

    let mut ids: Vec<String> = loader
        .object_stream()
        .await
        .unwrap()
        .map(|r| r.unwrap().base_id)
        .collect()
        .await;
    ids.sort();
    assert_eq!(ids, vec!["door", "root", "wall"]);
    loader.dispose().await;
}
