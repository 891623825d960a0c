use std::sync::Arc;

use reqwest::Client;
use tempfile::TempDir;
use tokio::net::TcpListener;

use iou_service::api::create_router;
use iou_service::config::Config;
use iou_service::ledger::InMemoryLedger;
use iou_service::state::AppState;
use iou_service::types::Identity;

pub const NODE: &str = "O=PartyA, L=London, C=GB";

/// Test client for API calls
pub struct TestClient {
    pub base_url: String,
    pub client: Client,
}

impl TestClient {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            client: Client::new(),
        }
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .expect("Failed to send request")
    }

    pub async fn post(&self, path: &str) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .send()
            .await
            .expect("Failed to send request")
    }

    pub async fn post_form(&self, path: &str, form: &[(&str, &str)]) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .form(form)
            .send()
            .await
            .expect("Failed to send request")
    }

    pub async fn json(&self, path: &str) -> serde_json::Value {
        let resp = self.get(path).await;
        assert!(resp.status().is_success(), "GET {} -> {}", path, resp.status());
        resp.json().await.expect("Invalid JSON")
    }
}

pub struct TestServer {
    pub client: TestClient,
    pub state: Arc<AppState>,
    pub ledger: Arc<InMemoryLedger>,
    pub config: Config,
    // Dropped last: removes the key directory
    pub _dir: TempDir,
}

fn party(name: &str) -> Identity {
    Identity::parse(name).expect("valid identity")
}

/// Start a test server on a random port backed by an in-memory ledger
pub async fn start_test_server() -> TestServer {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = Config {
        host: "127.0.0.1".into(),
        port: 0,
        key_dir: dir.path().join("KeyPair"),
        key_size: 1024,
        node_name: NODE.into(),
        reserved_services: vec!["Notary".into(), "Network Map Service".into()],
        ledger_url: None,
        verify_on_list: true,
        ..Config::default()
    };

    let ledger = Arc::new(InMemoryLedger::new(
        party(NODE),
        vec![
            party("O=PartyB, L=New York, C=US"),
            party("O=PartyC, L=Paris, C=FR"),
            party("O=Notary, L=London, C=GB"),
        ],
    ));
    let state = AppState::new(config.clone(), ledger.clone());
    let app = create_router(Arc::clone(&state));

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to get local addr");

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("Server failed");
    });

    TestServer {
        client: TestClient::new(format!("http://{}", addr)),
        state,
        ledger,
        config,
        _dir: dir,
    }
}
