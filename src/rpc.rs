//! [`LedgerGateway`] over JSON/HTTP to a remote ledger node
//!
//! | Call | Request | Success |
//! |---|---|---|
//! | resolve_identity | `GET /identities/{name}` | identity string, 404 when unknown |
//! | submit | `POST /transactions` with the record | `{"transaction_id": ..}` |
//! | query_all | `GET /records` | array of records |
//! | network_snapshot | `GET /network` | array of identity strings |
//! | self_identity | `GET /me` | identity string |
//!
//! A non-2xx answer to `submit` carries the ledger's rejection text as body.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::ledger::{LedgerError, LedgerGateway, LedgerResult};
use crate::types::{Identity, IouRecord, TransactionId};

#[derive(Clone)]
pub struct HttpLedger {
    base_url: Url,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct SubmitResponse {
    transaction_id: TransactionId,
}

impl HttpLedger {
    pub fn new(base_url: &str, timeout: Duration) -> LedgerResult<Self> {
        let base_url = Url::parse(base_url).map_err(|e| {
            LedgerError::Transport(format!("invalid ledger url {}: {}", base_url, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(LedgerError::Transport(format!(
                "ledger url {} cannot be a base",
                base_url
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::Transport(e.to_string()))?;
        Ok(Self { base_url, client })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn get_json<T: DeserializeOwned>(&self, segments: &[&str]) -> LedgerResult<T> {
        let resp = self
            .client
            .get(self.url(segments))
            .send()
            .await
            .map_err(|e| LedgerError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(bad_status(resp).await);
        }
        resp.json()
            .await
            .map_err(|e| LedgerError::BadResponse(e.to_string()))
    }
}

async fn bad_status(resp: reqwest::Response) -> LedgerError {
    LedgerError::BadResponse(format!(
        "status={} body={:?}",
        resp.status(),
        resp.text().await.ok()
    ))
}

#[async_trait]
impl LedgerGateway for HttpLedger {
    async fn resolve_identity(&self, name: &str) -> LedgerResult<Option<Identity>> {
        let resp = self
            .client
            .get(self.url(&["identities", name]))
            .send()
            .await
            .map_err(|e| LedgerError::Transport(e.to_string()))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => resp
                .json()
                .await
                .map(Some)
                .map_err(|e| LedgerError::BadResponse(e.to_string())),
            _ => Err(bad_status(resp).await),
        }
    }

    async fn submit(&self, record: IouRecord) -> LedgerResult<TransactionId> {
        let resp = self
            .client
            .post(self.url(&["transactions"]))
            .json(&record)
            .send()
            .await
            .map_err(|e| LedgerError::Transport(e.to_string()))?;

        if resp.status().is_success() {
            let body: SubmitResponse = resp
                .json()
                .await
                .map_err(|e| LedgerError::BadResponse(e.to_string()))?;
            Ok(body.transaction_id)
        } else {
            let status = resp.status();
            let text = resp
                .text()
                .await
                .map_err(|e| LedgerError::Transport(e.to_string()))?;
            if text.trim().is_empty() {
                Err(LedgerError::Rejected(format!("ledger answered {}", status)))
            } else {
                Err(LedgerError::Rejected(text))
            }
        }
    }

    async fn query_all(&self) -> LedgerResult<Vec<IouRecord>> {
        self.get_json(&["records"]).await
    }

    async fn network_snapshot(&self) -> LedgerResult<Vec<Identity>> {
        self.get_json(&["network"]).await
    }

    async fn self_identity(&self) -> LedgerResult<Identity> {
        self.get_json(&["me"]).await
    }
}
