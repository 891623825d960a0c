//! Signing and verification for IOU payloads
//!
//! Every outgoing signature is SHA1withRSA (RSASSA-PKCS1-v1_5 over a SHA-1
//! digest). Public keys travel as X.509 SubjectPublicKeyInfo DER, private
//! keys as PKCS#8 DER.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rsa::pkcs1v15::{
    Signature as RsaSignature, SigningKey as RsaSigningKey, VerifyingKey as RsaVerifyingKey,
};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Algorithm name reported alongside signatures
pub const SIGNATURE_ALGORITHM: &str = "SHA1withRSA";

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Crypto operation errors
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid public key format: {0}")]
    InvalidPublicKey(String),
    #[error("Invalid signature format: {0}")]
    InvalidSignature(String),
    #[error("Signing failed: {0}")]
    SigningFailed(String),
}

/// A message together with its signature and the signer's public key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPayload {
    #[serde(with = "base64_bytes")]
    pub message: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
    /// SubjectPublicKeyInfo DER
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>,
}

impl SignedPayload {
    /// Sign `message` and bundle it with the matching public key.
    pub fn create(
        message: Vec<u8>,
        private_key: &RsaPrivateKey,
        public_key_der: &[u8],
    ) -> CryptoResult<Self> {
        let signature = sign(&message, private_key)?;
        Ok(Self {
            message,
            signature,
            public_key: public_key_der.to_vec(),
        })
    }

    pub fn verify(&self) -> CryptoResult<bool> {
        verify(&self.public_key, &self.message, &self.signature)
    }
}

/// Sign the exact `message` bytes with SHA1withRSA.
pub fn sign(message: &[u8], private_key: &RsaPrivateKey) -> CryptoResult<Vec<u8>> {
    let signing_key = RsaSigningKey::<Sha1>::new(private_key.clone());
    let signature = signing_key
        .try_sign(message)
        .map_err(|e| CryptoError::SigningFailed(e.to_string()))?;
    Ok(signature.to_vec())
}

/// Parse an RSA public key from SubjectPublicKeyInfo DER
pub fn parse_public_key(der: &[u8]) -> CryptoResult<RsaPublicKey> {
    RsaPublicKey::from_public_key_der(der).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
}

/// Verify `signature` over `message` with a DER-encoded public key.
///
/// A well-formed signature that does not match yields `Ok(false)`; only an
/// unparseable key or signature is an error.
pub fn verify(public_key_der: &[u8], message: &[u8], signature: &[u8]) -> CryptoResult<bool> {
    let public_key = parse_public_key(public_key_der)?;
    verify_with_key(&public_key, message, signature)
}

/// Verify against an already parsed public key
pub fn verify_with_key(
    public_key: &RsaPublicKey,
    message: &[u8],
    signature: &[u8],
) -> CryptoResult<bool> {
    if signature.is_empty() {
        return Err(CryptoError::InvalidSignature("signature is empty".into()));
    }
    let signature = RsaSignature::try_from(signature)
        .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
    let verifying_key = RsaVerifyingKey::<Sha1>::new(public_key.clone());
    Ok(verifying_key.verify(message, &signature).is_ok())
}

/// SHA-256 fingerprint of a DER-encoded public key (hex encoded)
pub fn fingerprint(public_key_der: &[u8]) -> String {
    sha256_hex(public_key_der)
}

/// Compute SHA256 hash of data (hex encoded)
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub fn encode_base64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Serde adapter: byte fields travel as standard base64 strings.
pub mod base64_bytes {
    use super::BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded.trim()).map_err(serde::de::Error::custom)
    }
}
