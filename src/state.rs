//! Application state for the IOU service

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::keystore::KeyStore;
use crate::ledger::{InMemoryLedger, LedgerGateway};
use crate::rpc::HttpLedger;
use crate::service::IouService;
use crate::types::HealthResponse;

/// Global application state
pub struct AppState {
    /// Configuration
    pub config: Config,
    /// IOU orchestration, owns the key store and ledger handle
    pub service: IouService,
    /// Start time for uptime calculation
    pub start_time: Instant,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: Config, ledger: Arc<dyn LedgerGateway>) -> Arc<Self> {
        let keys = Arc::new(KeyStore::from_config(&config));
        let service = IouService::new(&config, keys, ledger);

        Arc::new(Self {
            config,
            service,
            start_time: Instant::now(),
            started_at: Utc::now(),
        })
    }

    /// Build state with the ledger the configuration asks for: a remote
    /// node when `LEDGER_URL` is set, otherwise an in-memory one.
    pub fn from_config(config: Config) -> anyhow::Result<Arc<Self>> {
        let ledger: Arc<dyn LedgerGateway> = match &config.ledger_url {
            Some(url) => {
                tracing::info!("Using ledger node at {}", url);
                Arc::new(HttpLedger::new(url, config.ledger_timeout)?)
            }
            None => {
                tracing::info!("No LEDGER_URL set, using in-memory ledger as {}", config.node_name);
                Arc::new(InMemoryLedger::from_config(&config)?)
            }
        };
        Ok(Self::new(config, ledger))
    }

    /// Get health info
    pub async fn health(&self) -> HealthResponse {
        HealthResponse {
            status: "healthy".into(),
            version: self.config.version.clone(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            started_at: self.started_at,
            keys_loaded: self.service.keys().is_loaded().await,
        }
    }
}
