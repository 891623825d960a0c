//! IOU orchestration: validate, resolve, sign, submit
//!
//! A create runs one pass through
//! `Received -> Validated -> Signed -> Submitted -> Committed`, stopping as
//! `Rejected` at the first failed gate. Nothing is persisted between stages;
//! the ledger call is atomic from this side.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::crypto;
use crate::error::{ApiError, ApiResult};
use crate::keystore::KeyStore;
use crate::ledger::{LedgerError, LedgerGateway, LedgerResult};
use crate::types::{CreatedIou, Identity, IouRecord, IouView};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateStage {
    Received,
    Validated,
    Signed,
    Submitted,
    Committed,
}

impl fmt::Display for CreateStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CreateStage::Received => "received",
            CreateStage::Validated => "validated",
            CreateStage::Signed => "signed",
            CreateStage::Submitted => "submitted",
            CreateStage::Committed => "committed",
        };
        f.write_str(name)
    }
}

/// Result of a key regeneration
#[derive(Debug, Clone)]
pub struct GeneratedKeys {
    pub key_size: usize,
    pub fingerprint: String,
}

pub struct IouService {
    keys: Arc<KeyStore>,
    ledger: Arc<dyn LedgerGateway>,
    reserved_services: Vec<String>,
    ledger_timeout: Duration,
    verify_on_list: bool,
}

impl IouService {
    pub fn new(config: &Config, keys: Arc<KeyStore>, ledger: Arc<dyn LedgerGateway>) -> Self {
        Self {
            keys,
            ledger,
            reserved_services: config.reserved_services.clone(),
            ledger_timeout: config.ledger_timeout,
            verify_on_list: config.verify_on_list,
        }
    }

    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    /// Bound a ledger query; failures and timeouts become `ApiError::Ledger`.
    async fn query<T>(
        &self,
        op: &str,
        fut: impl Future<Output = LedgerResult<T>>,
    ) -> ApiResult<T> {
        match tokio::time::timeout(self.ledger_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                tracing::error!("Ledger {} failed: {}", op, e);
                Err(ApiError::Ledger(e.to_string()))
            }
            Err(_) => {
                tracing::error!("Ledger {} timed out", op);
                Err(ApiError::Ledger(format!(
                    "{} timed out after {}s",
                    op,
                    self.ledger_timeout.as_secs()
                )))
            }
        }
    }

    /// Ledger reads made while creating an IOU; failures report as
    /// `SubmissionFailed`.
    async fn create_query<T>(
        &self,
        op: &str,
        fut: impl Future<Output = LedgerResult<T>>,
    ) -> ApiResult<T> {
        self.query(op, fut).await.map_err(|e| match e {
            ApiError::Ledger(msg) => ApiError::SubmissionFailed(msg),
            other => other,
        })
    }

    // ============ Identity ============

    pub async fn who_am_i(&self) -> ApiResult<Identity> {
        self.query("self identity", self.ledger.self_identity()).await
    }

    /// Business counterparties: the network minus this node and any
    /// reserved infrastructure service.
    pub async fn list_peers(&self) -> ApiResult<Vec<Identity>> {
        let me = self.who_am_i().await?;
        let network = self
            .query("network snapshot", self.ledger.network_snapshot())
            .await?;

        Ok(network
            .into_iter()
            .filter(|peer| *peer != me && peer.organisation() != me.organisation())
            .filter(|peer| {
                !self
                    .reserved_services
                    .iter()
                    .any(|svc| svc == peer.organisation())
            })
            .collect())
    }

    // ============ Keys ============

    /// Replace the node key pair. `None` uses the configured default size.
    pub async fn generate_keys(&self, bits: Option<usize>) -> ApiResult<GeneratedKeys> {
        let bits = bits.unwrap_or_else(|| self.keys.default_bits());
        let pair = self.keys.regenerate(bits).await.map_err(|e| {
            tracing::error!("Key generation failed: {}", e);
            ApiError::from(e)
        })?;
        Ok(GeneratedKeys {
            key_size: pair.key_size(),
            fingerprint: pair.fingerprint(),
        })
    }

    // ============ IOUs ============

    pub async fn create(&self, value: i64, counterparty_name: &str) -> ApiResult<CreatedIou> {
        let mut stage = CreateStage::Received;
        let result = self.run_create(value, counterparty_name, &mut stage).await;
        match &result {
            Ok(created) => tracing::info!(
                "IOU {} of {} to {} committed as {}",
                created.record.linear_id,
                created.record.value,
                created.record.borrower,
                created.transaction_id
            ),
            Err(e) => tracing::warn!(
                stage = %stage,
                kind = e.kind(),
                "IOU creation rejected: {}",
                e
            ),
        }
        result
    }

    async fn run_create(
        &self,
        value: i64,
        counterparty_name: &str,
        stage: &mut CreateStage,
    ) -> ApiResult<CreatedIou> {
        let counterparty_name = counterparty_name.trim();
        if counterparty_name.is_empty() {
            return Err(ApiError::InvalidArgument(
                "Parameter 'partyName' must not be empty".into(),
            ));
        }
        if value <= 0 {
            return Err(ApiError::InvalidArgument(
                "Parameter 'iouValue' must be positive".into(),
            ));
        }
        let value = value as u64;

        let borrower = self
            .create_query(
                "identity resolution",
                self.ledger.resolve_identity(counterparty_name),
            )
            .await?
            .ok_or_else(|| {
                ApiError::UnknownParty(format!(
                    "Party named {} cannot be found",
                    counterparty_name
                ))
            })?;
        let lender = self
            .create_query("self identity", self.ledger.self_identity())
            .await?;
        if lender == borrower {
            return Err(ApiError::InvalidArgument(
                "The lender and the borrower cannot be the same party".into(),
            ));
        }
        advance(stage, CreateStage::Validated);

        let pair = self.keys.key_pair().await.map_err(|e| {
            tracing::error!("Key material unavailable: {}", e);
            ApiError::KeyUnavailable(e.to_string())
        })?;

        let mut record =
            IouRecord::unsigned(value, lender, borrower, pair.public_key_der().to_vec());
        let payload = record
            .signing_payload()
            .map_err(|e| ApiError::Signing(e.to_string()))?;
        record.signed_message = crypto::sign(&payload, pair.private_key()).map_err(|e| {
            tracing::error!("Signing failed: {}", e);
            ApiError::Signing(e.to_string())
        })?;
        advance(stage, CreateStage::Signed);

        let transaction_id =
            match tokio::time::timeout(self.ledger_timeout, self.ledger.submit(record.clone()))
                .await
            {
                Ok(Ok(tx_id)) => tx_id,
                Ok(Err(LedgerError::Rejected(text))) => {
                    tracing::error!("Ledger rejected IOU {}: {}", record.linear_id, text);
                    return Err(ApiError::SubmissionFailed(text));
                }
                Ok(Err(e)) => {
                    tracing::error!("Ledger submission of {} failed: {}", record.linear_id, e);
                    return Err(ApiError::SubmissionFailed(e.to_string()));
                }
                Err(_) => {
                    tracing::error!("Ledger submission of {} timed out", record.linear_id);
                    return Err(ApiError::SubmissionFailed(format!(
                        "ledger submission timed out after {}s",
                        self.ledger_timeout.as_secs()
                    )));
                }
            };
        advance(stage, CreateStage::Submitted);
        advance(stage, CreateStage::Committed);

        Ok(CreatedIou {
            transaction_id,
            record,
        })
    }

    /// Every record the ledger holds, unfiltered
    pub async fn list_all(&self) -> ApiResult<Vec<IouRecord>> {
        self.query("record query", self.ledger.query_all()).await
    }

    /// Records where `me` is the lender
    pub async fn list_mine(&self, me: &Identity) -> ApiResult<Vec<IouRecord>> {
        let all = self.list_all().await?;
        Ok(all.into_iter().filter(|r| r.lender == *me).collect())
    }

    /// Check a record's signature against its own contents and key
    pub fn verify_record(record: &IouRecord) -> ApiResult<bool> {
        let payload = record
            .signing_payload()
            .map_err(|e| ApiError::Verification(e.to_string()))?;
        crypto::verify(&record.public_key, &payload, &record.signed_message)
            .map_err(|e| ApiError::Verification(e.to_string()))
    }

    /// Attach signature status to ledger records before surfacing them
    pub fn inspect(&self, records: Vec<IouRecord>) -> Vec<IouView> {
        records
            .into_iter()
            .map(|record| {
                let signature_valid = self.verify_on_list.then(|| {
                    match Self::verify_record(&record) {
                        Ok(true) => true,
                        Ok(false) => {
                            tracing::warn!(
                                "Signature mismatch on IOU {} from {}",
                                record.linear_id,
                                record.lender
                            );
                            false
                        }
                        Err(e) => {
                            tracing::error!(
                                "Cannot verify IOU {}: {}",
                                record.linear_id,
                                e
                            );
                            false
                        }
                    }
                });
                IouView {
                    record,
                    signature_valid,
                }
            })
            .collect()
    }
}

fn advance(stage: &mut CreateStage, next: CreateStage) {
    tracing::debug!("IOU create {} -> {}", stage, next);
    *stage = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tempfile::{tempdir, TempDir};

    use crate::keystore::{persist, test_key_pair};
    use crate::ledger::InMemoryLedger;
    use crate::types::TransactionId;

    const ME: &str = "O=PartyA, L=London, C=GB";

    fn party(name: &str) -> Identity {
        Identity::parse(name).unwrap()
    }

    fn test_config(dir: &TempDir) -> Config {
        Config {
            key_dir: dir.path().join("KeyPair"),
            key_size: 1024,
            reserved_services: vec!["Notary".into(), "Network Map Service".into()],
            ledger_timeout: Duration::from_millis(500),
            verify_on_list: true,
            ..Config::default()
        }
    }

    fn network_ledger() -> Arc<InMemoryLedger> {
        Arc::new(InMemoryLedger::new(
            party(ME),
            vec![
                party("Bob"),
                party("O=PartyC, L=Paris, C=FR"),
                party("O=Notary, L=London, C=GB"),
                party("O=Network Map Service, L=Zurich, C=CH"),
                party("O=PartyA, L=Madrid, C=ES"),
            ],
        ))
    }

    /// Service whose key files already hold the shared test key
    async fn service_with(ledger: Arc<dyn LedgerGateway>, config: &Config) -> IouService {
        std::fs::create_dir_all(&config.key_dir).unwrap();
        persist(
            test_key_pair(),
            &config.public_key_path(),
            &config.private_key_path(),
        )
        .await
        .unwrap();
        let keys = Arc::new(KeyStore::from_config(config));
        IouService::new(config, keys, ledger)
    }

    /// Ledger that accepts lookups but misbehaves on submit
    struct FaultyLedger {
        inner: InMemoryLedger,
        hang: bool,
    }

    #[async_trait]
    impl LedgerGateway for FaultyLedger {
        async fn resolve_identity(&self, name: &str) -> LedgerResult<Option<Identity>> {
            self.inner.resolve_identity(name).await
        }
        async fn submit(&self, _record: IouRecord) -> LedgerResult<TransactionId> {
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Err(LedgerError::Rejected("Notary unavailable: flow aborted".into()))
        }
        async fn query_all(&self) -> LedgerResult<Vec<IouRecord>> {
            Err(LedgerError::Transport("connection reset".into()))
        }
        async fn network_snapshot(&self) -> LedgerResult<Vec<Identity>> {
            self.inner.network_snapshot().await
        }
        async fn self_identity(&self) -> LedgerResult<Identity> {
            self.inner.self_identity().await
        }
    }

    fn faulty(hang: bool) -> Arc<FaultyLedger> {
        Arc::new(FaultyLedger {
            inner: InMemoryLedger::new(party(ME), vec![party("Bob")]),
            hang,
        })
    }

    #[tokio::test]
    async fn test_create_commits_signed_record() {
        let dir = tempdir().unwrap();
        let ledger = network_ledger();
        let service = service_with(ledger.clone(), &test_config(&dir)).await;

        let created = service.create(100, "Bob").await.unwrap();
        assert!(!created.transaction_id.is_empty());
        assert_eq!(created.record.value, 100);
        assert_eq!(created.record.lender, party(ME));
        assert_eq!(created.record.borrower, party("Bob"));
        assert_eq!(created.record.public_key, test_key_pair().public_key_der());
        assert!(IouService::verify_record(&created.record).unwrap());

        let stored = ledger.query_all().await.unwrap();
        assert_eq!(stored, vec![created.record]);
    }

    #[tokio::test]
    async fn test_create_signs_the_real_payload() {
        let dir = tempdir().unwrap();
        let service = service_with(network_ledger(), &test_config(&dir)).await;

        let created = service.create(100, "Bob").await.unwrap();
        let literal = crypto::verify(
            &created.record.public_key,
            b"msg",
            &created.record.signed_message,
        )
        .unwrap();
        assert!(!literal);

        let mut tampered = created.record.clone();
        tampered.value = 101;
        assert!(!IouService::verify_record(&tampered).unwrap());
    }

    #[tokio::test]
    async fn test_create_rejects_non_positive_value() {
        let dir = tempdir().unwrap();
        let ledger = network_ledger();
        let service = service_with(ledger.clone(), &test_config(&dir)).await;

        for value in [0, -5] {
            let err = service.create(value, "Bob").await.unwrap_err();
            assert!(matches!(err, ApiError::InvalidArgument(_)), "{:?}", err);
        }
        assert_eq!(ledger.transaction_count().await, 0);
    }

    #[tokio::test]
    async fn test_create_rejects_empty_party() {
        let dir = tempdir().unwrap();
        let service = service_with(network_ledger(), &test_config(&dir)).await;

        let err = service.create(100, "   ").await.unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
    }

    #[tokio::test]
    async fn test_create_unknown_party() {
        let dir = tempdir().unwrap();
        let service = service_with(network_ledger(), &test_config(&dir)).await;

        let err = service.create(100, "Ghost").await.unwrap_err();
        assert!(matches!(err, ApiError::UnknownParty(_)));
        assert!(err.to_string().contains("Ghost"));
    }

    #[tokio::test]
    async fn test_create_to_self_is_invalid() {
        let dir = tempdir().unwrap();
        let service = service_with(network_ledger(), &test_config(&dir)).await;

        let err = service.create(100, ME).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_create_generates_keys_on_first_use() {
        let dir = tempdir().unwrap();
        let config = test_config(&dir);
        let keys = Arc::new(KeyStore::from_config(&config));
        let service = IouService::new(&config, keys, network_ledger());

        let created = service.create(7, "Bob").await.unwrap();
        assert!(config.public_key_path().exists());
        assert!(config.private_key_path().exists());
        assert_eq!(
            created.record.public_key,
            service.keys().key_pair().await.unwrap().public_key_der()
        );
    }

    #[tokio::test]
    async fn test_create_with_broken_key_files_is_key_unavailable() {
        let dir = tempdir().unwrap();
        let config = test_config(&dir);
        std::fs::create_dir_all(&config.key_dir).unwrap();
        std::fs::write(config.public_key_path(), b"junk").unwrap();
        std::fs::write(config.private_key_path(), b"junk").unwrap();
        let keys = Arc::new(KeyStore::from_config(&config));
        let service = IouService::new(&config, keys, network_ledger());

        let err = service.create(100, "Bob").await.unwrap_err();
        assert!(matches!(err, ApiError::KeyUnavailable(_)));
    }

    #[tokio::test]
    async fn test_remote_rejection_is_submission_failed() {
        let dir = tempdir().unwrap();
        let service = service_with(faulty(false), &test_config(&dir)).await;

        match service.create(100, "Bob").await {
            Err(ApiError::SubmissionFailed(text)) => {
                assert_eq!(text, "Notary unavailable: flow aborted")
            }
            other => panic!("expected SubmissionFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_submission_timeout_is_submission_failed() {
        let dir = tempdir().unwrap();
        let config = test_config(&dir);
        let service = service_with(faulty(true), &config).await;
        let pair_before = service.keys().key_pair().await.unwrap();

        let err = service.create(100, "Bob").await.unwrap_err();
        assert!(matches!(err, ApiError::SubmissionFailed(_)));
        assert!(err.to_string().contains("timed out"));

        // Key state untouched by the failed submission
        let pair_after = service.keys().key_pair().await.unwrap();
        assert!(Arc::ptr_eq(&pair_before, &pair_after));
    }

    #[tokio::test]
    async fn test_query_failure_is_ledger_error() {
        let dir = tempdir().unwrap();
        let service = service_with(faulty(false), &test_config(&dir)).await;

        assert!(matches!(
            service.list_all().await,
            Err(ApiError::Ledger(_))
        ));
    }

    /// Ledger node that cannot be reached at all
    struct UnreachableLedger;

    #[async_trait]
    impl LedgerGateway for UnreachableLedger {
        async fn resolve_identity(&self, _name: &str) -> LedgerResult<Option<Identity>> {
            Err(LedgerError::Transport("connection refused".into()))
        }
        async fn submit(&self, _record: IouRecord) -> LedgerResult<TransactionId> {
            Err(LedgerError::Transport("connection refused".into()))
        }
        async fn query_all(&self) -> LedgerResult<Vec<IouRecord>> {
            Err(LedgerError::Transport("connection refused".into()))
        }
        async fn network_snapshot(&self) -> LedgerResult<Vec<Identity>> {
            Err(LedgerError::Transport("connection refused".into()))
        }
        async fn self_identity(&self) -> LedgerResult<Identity> {
            Err(LedgerError::Transport("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_create_with_unreachable_ledger_is_submission_failed() {
        let dir = tempdir().unwrap();
        let service = service_with(Arc::new(UnreachableLedger), &test_config(&dir)).await;

        let err = service.create(100, "Bob").await.unwrap_err();
        assert_eq!(err.kind(), "submission_failed");
        assert!(err.to_string().contains("connection refused"));

        // Reads outside a create keep their own kind
        assert!(matches!(
            service.who_am_i().await,
            Err(ApiError::Ledger(_))
        ));
        assert!(matches!(
            service.list_peers().await,
            Err(ApiError::Ledger(_))
        ));
    }

    #[tokio::test]
    async fn test_list_peers_excludes_self_and_services() {
        let dir = tempdir().unwrap();
        let service = service_with(network_ledger(), &test_config(&dir)).await;

        let peers = service.list_peers().await.unwrap();
        assert_eq!(peers, vec![party("Bob"), party("O=PartyC, L=Paris, C=FR")]);
        let me = service.who_am_i().await.unwrap();
        assert!(!peers.contains(&me));
    }

    #[tokio::test]
    async fn test_list_mine_filters_by_lender() {
        let dir = tempdir().unwrap();
        let ledger = network_ledger();
        let service = service_with(ledger.clone(), &test_config(&dir)).await;

        service.create(10, "Bob").await.unwrap();
        service.create(20, "PartyC").await.unwrap();
        let mut foreign = IouRecord::unsigned(
            30,
            party("Bob"),
            party(ME),
            test_key_pair().public_key_der().to_vec(),
        );
        let payload = foreign.signing_payload().unwrap();
        foreign.signed_message = crypto::sign(&payload, test_key_pair().private_key()).unwrap();
        ledger.insert_unchecked(foreign).await.unwrap();

        let me = service.who_am_i().await.unwrap();
        let all = service.list_all().await.unwrap();
        let mine = service.list_mine(&me).await.unwrap();

        assert_eq!(all.len(), 3);
        assert_eq!(mine.len(), 2);
        assert!(mine.iter().all(|r| r.lender == me && all.contains(r)));
        assert_eq!(all.iter().filter(|r| r.lender == me).count(), mine.len());
    }

    #[tokio::test]
    async fn test_inspect_flags_tampered_records() {
        let dir = tempdir().unwrap();
        let ledger = network_ledger();
        let service = service_with(ledger.clone(), &test_config(&dir)).await;

        let created = service.create(10, "Bob").await.unwrap();
        let mut forged = created.record.clone();
        forged.linear_id = uuid::Uuid::new_v4();
        forged.value = 10_000;
        ledger.insert_unchecked(forged.clone()).await.unwrap();
        let mut garbled = created.record.clone();
        garbled.linear_id = uuid::Uuid::new_v4();
        garbled.public_key = b"not a key".to_vec();
        ledger.insert_unchecked(garbled).await.unwrap();

        let views = service.inspect(service.list_all().await.unwrap());
        let flags: Vec<_> = views.iter().map(|v| v.signature_valid).collect();
        assert_eq!(flags, vec![Some(true), Some(false), Some(false)]);
    }

    #[tokio::test]
    async fn test_inspect_disabled() {
        let dir = tempdir().unwrap();
        let config = Config {
            verify_on_list: false,
            ..test_config(&dir)
        };
        let service = service_with(network_ledger(), &config).await;

        service.create(10, "Bob").await.unwrap();
        let views = service.inspect(service.list_all().await.unwrap());
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].signature_valid, None);
    }

    #[tokio::test]
    async fn test_generate_keys() {
        let dir = tempdir().unwrap();
        let service = service_with(network_ledger(), &test_config(&dir)).await;

        let generated = service.generate_keys(None).await.unwrap();
        assert_eq!(generated.key_size, 1024);
        assert_ne!(generated.fingerprint, test_key_pair().fingerprint());

        // New IOUs carry the new key
        let created = service.create(1, "Bob").await.unwrap();
        assert_eq!(crypto::fingerprint(&created.record.public_key), generated.fingerprint);

        let err = service.generate_keys(Some(512)).await.unwrap_err();
        assert!(matches!(err, ApiError::KeyGeneration(_)));
    }
}
