//! Ledger gateway: the narrow interface to the external system of record
//!
//! Consensus, ordering and notarization belong to the ledger. This crate
//! only submits signed records, queries them back and resolves participants.
//! [`InMemoryLedger`] stands in for a real node in development and tests.

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::crypto::{self, sha256_hex};
use crate::types::{Identity, InvalidIdentity, IouRecord, TransactionId};

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    /// The ledger refused the transaction; the text comes from the ledger.
    #[error("{0}")]
    Rejected(String),
    #[error("ledger transport error: {0}")]
    Transport(String),
    #[error("bad ledger response: {0}")]
    BadResponse(String),
}

/// Operations this service consumes from the ledger node
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// Look up a participant by name. `Ok(None)` when nobody matches.
    async fn resolve_identity(&self, name: &str) -> LedgerResult<Option<Identity>>;

    /// Record a signed IOU; returns once the transaction is committed.
    async fn submit(&self, record: IouRecord) -> LedgerResult<TransactionId>;

    async fn query_all(&self) -> LedgerResult<Vec<IouRecord>>;

    /// Every participant on the network, including this node and services
    async fn network_snapshot(&self) -> LedgerResult<Vec<Identity>>;

    async fn self_identity(&self) -> LedgerResult<Identity>;
}

/// Ledger node held entirely in memory.
///
/// Plays the remote contract on submit: positive value, distinct known
/// parties, a fresh linear id and a signature that verifies over the
/// record's signing payload.
pub struct InMemoryLedger {
    me: Identity,
    network: Vec<Identity>,
    transactions: RwLock<Vec<(TransactionId, IouRecord)>>,
}

impl InMemoryLedger {
    /// `peers` may or may not include `me`; the network always does.
    pub fn new(me: Identity, peers: Vec<Identity>) -> Self {
        let mut network = vec![me.clone()];
        for peer in peers {
            if !network.contains(&peer) {
                network.push(peer);
            }
        }
        Self {
            me,
            network,
            transactions: RwLock::new(Vec::new()),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, InvalidIdentity> {
        let me = Identity::parse(&config.node_name)?;
        let peers = config
            .network_peers
            .iter()
            .map(|name| Identity::parse(name))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(me, peers))
    }

    /// Number of committed transactions
    pub async fn transaction_count(&self) -> usize {
        self.transactions.read().await.len()
    }

    /// Append a record without contract checks, as if another node had
    /// committed it.
    pub async fn insert_unchecked(&self, record: IouRecord) -> LedgerResult<TransactionId> {
        let tx_id = transaction_id(&record)?;
        self.transactions.write().await.push((tx_id.clone(), record));
        Ok(tx_id)
    }

    fn check_contract(&self, record: &IouRecord) -> LedgerResult<()> {
        if record.value == 0 {
            return Err(LedgerError::Rejected(
                "The IOU's value must be positive.".into(),
            ));
        }
        if record.lender == record.borrower {
            return Err(LedgerError::Rejected(
                "The lender and the borrower cannot be the same entity.".into(),
            ));
        }
        for party in [&record.lender, &record.borrower] {
            if !self.network.contains(party) {
                return Err(LedgerError::Rejected(format!(
                    "Party {} is not on the network.",
                    party
                )));
            }
        }

        let payload = record
            .signing_payload()
            .map_err(|e| LedgerError::Rejected(e.to_string()))?;
        match crypto::verify(&record.public_key, &payload, &record.signed_message) {
            Ok(true) => Ok(()),
            Ok(false) => Err(LedgerError::Rejected(
                "The IOU signature does not match its contents.".into(),
            )),
            Err(e) => Err(LedgerError::Rejected(format!(
                "The IOU signature cannot be checked: {}",
                e
            ))),
        }
    }
}

/// Uppercase SHA-256 over the signing payload followed by the signature
fn transaction_id(record: &IouRecord) -> LedgerResult<TransactionId> {
    let mut bytes = record
        .signing_payload()
        .map_err(|e| LedgerError::BadResponse(e.to_string()))?;
    bytes.extend_from_slice(&record.signed_message);
    Ok(sha256_hex(&bytes).to_uppercase())
}

#[async_trait]
impl LedgerGateway for InMemoryLedger {
    async fn resolve_identity(&self, name: &str) -> LedgerResult<Option<Identity>> {
        let Ok(wanted) = Identity::parse(name) else {
            return Ok(None);
        };
        if let Some(found) = self.network.iter().find(|p| **p == wanted) {
            return Ok(Some(found.clone()));
        }

        // Fall back to a bare organisation name, only when it is unambiguous
        let mut by_org = self
            .network
            .iter()
            .filter(|p| p.organisation() == wanted.name());
        match (by_org.next(), by_org.next()) {
            (Some(found), None) => Ok(Some(found.clone())),
            _ => Ok(None),
        }
    }

    async fn submit(&self, record: IouRecord) -> LedgerResult<TransactionId> {
        self.check_contract(&record)?;

        let mut transactions = self.transactions.write().await;
        if transactions
            .iter()
            .any(|(_, existing)| existing.linear_id == record.linear_id)
        {
            return Err(LedgerError::Rejected(format!(
                "An IOU with linear id {} already exists.",
                record.linear_id
            )));
        }

        let tx_id = transaction_id(&record)?;
        tracing::debug!("Ledger committed {} ({})", tx_id, record.linear_id);
        transactions.push((tx_id.clone(), record));
        Ok(tx_id)
    }

    async fn query_all(&self) -> LedgerResult<Vec<IouRecord>> {
        let transactions = self.transactions.read().await;
        Ok(transactions.iter().map(|(_, r)| r.clone()).collect())
    }

    async fn network_snapshot(&self) -> LedgerResult<Vec<Identity>> {
        Ok(self.network.clone())
    }

    async fn self_identity(&self) -> LedgerResult<Identity> {
        Ok(self.me.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::test_key_pair;

    fn party(name: &str) -> Identity {
        Identity::parse(name).unwrap()
    }

    fn ledger() -> InMemoryLedger {
        InMemoryLedger::new(
            party("O=PartyA, L=London, C=GB"),
            vec![
                party("O=PartyB, L=New York, C=US"),
                party("O=Notary, L=London, C=GB"),
            ],
        )
    }

    fn signed(value: u64, lender: &str, borrower: &str) -> IouRecord {
        let pair = test_key_pair();
        let mut record = IouRecord::unsigned(
            value,
            party(lender),
            party(borrower),
            pair.public_key_der().to_vec(),
        );
        let payload = record.signing_payload().unwrap();
        record.signed_message = crypto::sign(&payload, pair.private_key()).unwrap();
        record
    }

    #[tokio::test]
    async fn test_resolve_identity() {
        let ledger = ledger();
        let b = party("O=PartyB, L=New York, C=US");

        assert_eq!(
            ledger.resolve_identity("O=PartyB,L=New York,C=US").await.unwrap(),
            Some(b.clone())
        );
        assert_eq!(ledger.resolve_identity("PartyB").await.unwrap(), Some(b));
        assert_eq!(ledger.resolve_identity("Ghost").await.unwrap(), None);
        assert_eq!(ledger.resolve_identity("").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ambiguous_organisation_does_not_resolve() {
        let ledger = InMemoryLedger::new(
            party("O=PartyA, C=GB"),
            vec![party("O=Bank, C=US"), party("O=Bank, C=FR")],
        );
        assert_eq!(ledger.resolve_identity("Bank").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_network_snapshot_includes_self_once() {
        let me = party("O=PartyA, C=GB");
        let ledger = InMemoryLedger::new(me.clone(), vec![me.clone(), party("O=PartyB, C=US")]);
        let network = ledger.network_snapshot().await.unwrap();
        assert_eq!(network.len(), 2);
        assert_eq!(ledger.self_identity().await.unwrap(), me);
    }

    #[tokio::test]
    async fn test_submit_and_query() {
        let ledger = ledger();
        let record = signed(100, "O=PartyA, L=London, C=GB", "O=PartyB, L=New York, C=US");

        let tx_id = ledger.submit(record.clone()).await.unwrap();
        assert_eq!(tx_id.len(), 64);
        assert_eq!(tx_id, tx_id.to_uppercase());
        assert_eq!(ledger.query_all().await.unwrap(), vec![record.clone()]);

        let err = ledger.submit(record).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(ledger.transaction_count().await, 1);
    }

    #[tokio::test]
    async fn test_submit_rejects_contract_violations() {
        let ledger = ledger();
        let a = "O=PartyA, L=London, C=GB";

        let zero = signed(0, a, "O=PartyB, L=New York, C=US");
        assert!(matches!(ledger.submit(zero).await, Err(LedgerError::Rejected(_))));

        let to_self = signed(10, a, a);
        assert!(matches!(ledger.submit(to_self).await, Err(LedgerError::Rejected(_))));

        let stranger = signed(10, a, "O=Ghost, C=XX");
        assert!(matches!(ledger.submit(stranger).await, Err(LedgerError::Rejected(_))));

        assert_eq!(ledger.transaction_count().await, 0);
    }

    #[tokio::test]
    async fn test_submit_rejects_tampered_signature() {
        let ledger = ledger();
        let mut record = signed(100, "O=PartyA, L=London, C=GB", "O=PartyB, L=New York, C=US");
        record.value = 1_000_000;

        let err = ledger.submit(record).await.unwrap_err();
        assert!(err.to_string().contains("signature"));
    }

    #[tokio::test]
    async fn test_insert_unchecked_skips_contract() {
        let ledger = ledger();
        let mut record = signed(100, "O=PartyA, L=London, C=GB", "O=PartyB, L=New York, C=US");
        record.signed_message = vec![1, 2, 3];

        ledger.insert_unchecked(record).await.unwrap();
        assert_eq!(ledger.query_all().await.unwrap().len(), 1);
    }
}
