//! Core types for the IOU service
//!
//! Identities are X.500-style participant names. An [`IouRecord`] is the
//! business attestation carried to and from the ledger; its signature covers
//! every field except the signature itself.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{base64_bytes, encode_base64};

/// Ledger-assigned transaction identifier
pub type TransactionId = String;

// ============ Identity ============

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid identity name: {0:?}")]
pub struct InvalidIdentity(pub String);

/// A network participant, compared by canonical name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    /// Canonicalize `name`: attributes split on `,`, trimmed, re-joined with `", "`.
    pub fn parse(name: &str) -> Result<Self, InvalidIdentity> {
        let attributes: Vec<String> = name
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| match part.split_once('=') {
                Some((key, value)) => format!("{}={}", key.trim(), value.trim()),
                None => part.to_string(),
            })
            .collect();

        if attributes.is_empty() {
            return Err(InvalidIdentity(name.to_string()));
        }
        Ok(Self(attributes.join(", ")))
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    /// Value of the `O=` attribute, or the whole name when there is none
    pub fn organisation(&self) -> &str {
        self.0
            .split(", ")
            .filter_map(|part| part.split_once('='))
            .find(|(key, _)| key.eq_ignore_ascii_case("O"))
            .map(|(_, value)| value)
            .unwrap_or(self.0.as_str())
    }
}

impl TryFrom<String> for Identity {
    type Error = InvalidIdentity;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        Self::parse(&name)
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============ IOU Records ============

/// An IOU as stored on the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IouRecord {
    pub value: u64,
    pub lender: Identity,
    pub borrower: Identity,
    pub linear_id: Uuid,
    /// Lender's SubjectPublicKeyInfo DER
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>,
    /// SHA1withRSA signature over [`IouRecord::signing_payload`]
    #[serde(with = "base64_bytes")]
    pub signed_message: Vec<u8>,
}

/// Field order here is the canonical order; do not reorder.
#[derive(Serialize)]
struct SigningPayload<'a> {
    value: u64,
    lender: &'a str,
    borrower: &'a str,
    linear_id: &'a Uuid,
    public_key: String,
}

impl IouRecord {
    /// A record ready to be signed: everything but the signature
    pub fn unsigned(
        value: u64,
        lender: Identity,
        borrower: Identity,
        public_key: Vec<u8>,
    ) -> Self {
        Self {
            value,
            lender,
            borrower,
            linear_id: Uuid::new_v4(),
            public_key,
            signed_message: Vec::new(),
        }
    }

    /// Canonical bytes the lender signs
    pub fn signing_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&SigningPayload {
            value: self.value,
            lender: self.lender.name(),
            borrower: self.borrower.name(),
            linear_id: &self.linear_id,
            public_key: encode_base64(&self.public_key),
        })
    }
}

/// A record as surfaced to clients, with the outcome of signature checking
#[derive(Debug, Clone, Serialize)]
pub struct IouView {
    #[serde(flatten)]
    pub record: IouRecord,
    /// `None` when verification on listing is disabled
    pub signature_valid: Option<bool>,
}

/// Outcome of a committed create
#[derive(Debug, Clone)]
pub struct CreatedIou {
    pub transaction_id: TransactionId,
    pub record: IouRecord,
}

// ============ API Request/Response Types ============

/// Form body of `create-iou`. Both fields are validated by the service so
/// that bad input surfaces as `invalid_argument` rather than a rejection.
#[derive(Debug, Deserialize, Default)]
pub struct CreateIouForm {
    #[serde(rename = "iouValue")]
    pub iou_value: Option<String>,
    #[serde(rename = "partyName")]
    pub party_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateIouResponse {
    pub transaction_id: TransactionId,
    pub linear_id: Uuid,
    pub message: String,
}

impl From<&CreatedIou> for CreateIouResponse {
    fn from(created: &CreatedIou) -> Self {
        Self {
            transaction_id: created.transaction_id.clone(),
            linear_id: created.record.linear_id,
            message: format!(
                "Transaction id {} committed to ledger.",
                created.transaction_id
            ),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct GenerateKeysQuery {
    pub size: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct GenerateKeysResponse {
    pub message: String,
    pub algorithm: &'static str,
    pub key_size: usize,
    pub fingerprint: String,
    pub public_key_path: String,
}

#[derive(Debug, Serialize)]
pub struct WhoAmIResponse {
    pub me: Identity,
}

#[derive(Debug, Serialize)]
pub struct PeersResponse {
    pub peers: Vec<Identity>,
}

/// Standard API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Machine-readable error kind
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            kind: None,
            hint: None,
        }
    }
}

impl ApiResponse<()> {
    pub fn error(kind: &str, message: impl Into<String>, hint: Option<&str>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            kind: Some(kind.to_string()),
            hint: hint.map(String::from),
        }
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub started_at: DateTime<Utc>,
    pub keys_loaded: bool,
}
