//! RSA key pair lifecycle: generation, persistence and loading
//!
//! The node holds one key pair for every outgoing signature. It lives in two
//! files: the public key as X.509 SubjectPublicKeyInfo DER and the private
//! key as PKCS#8 DER. [`KeyStore`] caches the loaded pair for the process
//! lifetime and serializes every load/generate/persist behind one lock.

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::crypto;

/// Smallest modulus accepted for generation
pub const MIN_KEY_BITS: usize = 1024;
/// Largest modulus accepted for generation
pub const MAX_KEY_BITS: usize = 8192;

pub type KeyResult<T> = Result<T, KeyStoreError>;

#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),
    #[error("Key storage failed: {0}")]
    Storage(String),
    #[error("Key parse failed: {0}")]
    KeyParse(String),
}

fn storage_error(path: &Path, err: io::Error) -> KeyStoreError {
    KeyStoreError::Storage(format!("{}: {}", path.display(), err))
}

/// An RSA key pair with its public half pre-encoded for embedding in records
pub struct KeyPair {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    public_der: Vec<u8>,
}

impl KeyPair {
    pub fn from_private(private_key: RsaPrivateKey) -> KeyResult<Self> {
        let public_key = private_key.to_public_key();
        let public_der = public_key
            .to_public_key_der()
            .map_err(|e| KeyStoreError::KeyParse(e.to_string()))?
            .as_bytes()
            .to_vec();
        Ok(Self {
            private_key,
            public_key,
            public_der,
        })
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// SubjectPublicKeyInfo DER
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_der
    }

    /// PKCS#8 DER
    pub fn private_key_der(&self) -> KeyResult<Vec<u8>> {
        let doc = self
            .private_key
            .to_pkcs8_der()
            .map_err(|e| KeyStoreError::KeyParse(e.to_string()))?;
        Ok(doc.as_bytes().to_vec())
    }

    /// Modulus size in bits
    pub fn key_size(&self) -> usize {
        self.public_key.size() * 8
    }

    pub fn fingerprint(&self) -> String {
        crypto::fingerprint(&self.public_der)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("key_size", &self.key_size())
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Generate a fresh RSA key pair. CPU bound; call from a blocking context.
pub fn generate(bits: usize) -> KeyResult<KeyPair> {
    if bits < MIN_KEY_BITS {
        return Err(KeyStoreError::KeyGeneration(format!(
            "key size {} is below the minimum of {} bits",
            bits, MIN_KEY_BITS
        )));
    }
    if bits > MAX_KEY_BITS {
        return Err(KeyStoreError::KeyGeneration(format!(
            "key size {} exceeds the maximum of {} bits",
            bits, MAX_KEY_BITS
        )));
    }

    let mut rng = rand::rngs::OsRng;
    let private_key = RsaPrivateKey::new(&mut rng, bits)
        .map_err(|e| KeyStoreError::KeyGeneration(e.to_string()))?;
    KeyPair::from_private(private_key)
}

/// Write both halves of `pair`, replacing existing files.
///
/// Each file is written next to its target under a `.tmp` suffix and renamed
/// into place only once both writes have succeeded. The previous private key
/// is kept as `.bak` until the public half lands, and put back if it does
/// not. Parent directories must already exist.
pub async fn persist(pair: &KeyPair, public_path: &Path, private_path: &Path) -> KeyResult<()> {
    if public_path == private_path {
        return Err(KeyStoreError::Storage(format!(
            "{} cannot hold both halves of the key pair",
            public_path.display()
        )));
    }

    let private_der = pair.private_key_der()?;
    let public_tmp = with_suffix(public_path, ".tmp");
    let private_tmp = with_suffix(private_path, ".tmp");
    let private_backup = with_suffix(private_path, ".bak");

    let staged = async {
        write_file(&public_tmp, pair.public_key_der(), false).await?;
        write_file(&private_tmp, &private_der, true).await?;
        let had_private = exists(private_path).await?;
        if had_private {
            tokio::fs::rename(private_path, &private_backup)
                .await
                .map_err(|e| storage_error(private_path, e))?;
        }
        Ok(had_private)
    }
    .await;
    let had_private = match staged {
        Ok(had_private) => had_private,
        Err(e) => {
            discard(&[&public_tmp, &private_tmp]).await;
            return Err(e);
        }
    };

    let committed = async {
        tokio::fs::rename(&private_tmp, private_path)
            .await
            .map_err(|e| storage_error(private_path, e))?;
        tokio::fs::rename(&public_tmp, public_path)
            .await
            .map_err(|e| storage_error(public_path, e))
    }
    .await;

    match committed {
        Ok(()) => {
            if had_private {
                discard(&[&private_backup]).await;
            }
            Ok(())
        }
        Err(e) => {
            let restored = if had_private {
                tokio::fs::rename(&private_backup, private_path).await
            } else {
                tokio::fs::remove_file(private_path).await
            };
            if let Err(restore_err) = restored.or_else(|e| match e.kind() {
                io::ErrorKind::NotFound => Ok(()),
                _ => Err(e),
            }) {
                tracing::error!(
                    "Could not roll back {}: {}",
                    private_path.display(),
                    restore_err
                );
            }
            discard(&[&public_tmp, &private_tmp]).await;
            Err(e)
        }
    }
}

/// `path` with `suffix` appended to its full file name
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

async fn discard(paths: &[&Path]) {
    for path in paths {
        let _ = tokio::fs::remove_file(path).await;
    }
}

async fn write_file(path: &Path, bytes: &[u8], secret: bool) -> KeyResult<()> {
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| storage_error(path, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if secret {
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| storage_error(path, e))?;
        }
    }
    #[cfg(not(unix))]
    let _ = secret;

    Ok(())
}

/// Read a SubjectPublicKeyInfo DER public key
pub async fn load_public(path: &Path) -> KeyResult<RsaPublicKey> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| storage_error(path, e))?;
    RsaPublicKey::from_public_key_der(&bytes)
        .map_err(|e| KeyStoreError::KeyParse(format!("{}: {}", path.display(), e)))
}

/// Read a PKCS#8 DER private key
pub async fn load_private(path: &Path) -> KeyResult<RsaPrivateKey> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| storage_error(path, e))?;
    RsaPrivateKey::from_pkcs8_der(&bytes)
        .map_err(|e| KeyStoreError::KeyParse(format!("{}: {}", path.display(), e)))
}

/// Process-wide handle on the node key pair
pub struct KeyStore {
    public_path: PathBuf,
    private_path: PathBuf,
    default_bits: usize,
    current: Mutex<Option<Arc<KeyPair>>>,
}

impl KeyStore {
    pub fn new(public_path: PathBuf, private_path: PathBuf, default_bits: usize) -> Self {
        Self {
            public_path,
            private_path,
            default_bits,
            current: Mutex::new(None),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.public_key_path(),
            config.private_key_path(),
            config.key_size,
        )
    }

    pub fn public_path(&self) -> &Path {
        &self.public_path
    }

    pub fn private_path(&self) -> &Path {
        &self.private_path
    }

    pub fn default_bits(&self) -> usize {
        self.default_bits
    }

    /// Whether a key pair is already cached in memory
    pub async fn is_loaded(&self) -> bool {
        self.current.lock().await.is_some()
    }

    /// Return the cached key pair, loading it from disk or generating and
    /// persisting a new one on first use.
    pub async fn key_pair(&self) -> KeyResult<Arc<KeyPair>> {
        let mut current = self.current.lock().await;
        if let Some(pair) = current.as_ref() {
            return Ok(Arc::clone(pair));
        }

        let public_exists = exists(&self.public_path).await?;
        let private_exists = exists(&self.private_path).await?;

        let pair = match (public_exists, private_exists) {
            (true, true) => {
                let pair = self.load().await?;
                tracing::info!(
                    "Loaded {}-bit key pair {} from {:?}",
                    pair.key_size(),
                    pair.fingerprint(),
                    self.private_path
                );
                pair
            }
            (false, false) => {
                tracing::info!("No key pair on disk, generating {} bits", self.default_bits);
                self.generate_and_persist(self.default_bits).await?
            }
            (true, false) | (false, true) => {
                let (found, missing) = if public_exists {
                    (&self.public_path, &self.private_path)
                } else {
                    (&self.private_path, &self.public_path)
                };
                return Err(KeyStoreError::KeyParse(format!(
                    "found {} but not {}",
                    found.display(),
                    missing.display()
                )));
            }
        };

        let pair = Arc::new(pair);
        *current = Some(Arc::clone(&pair));
        Ok(pair)
    }

    /// Replace the key pair with a freshly generated one of `bits` bits.
    ///
    /// Signers holding the previous pair keep using it until they finish.
    pub async fn regenerate(&self, bits: usize) -> KeyResult<Arc<KeyPair>> {
        let mut current = self.current.lock().await;
        let pair = Arc::new(self.generate_and_persist(bits).await?);
        *current = Some(Arc::clone(&pair));
        tracing::info!(
            "Generated {}-bit key pair {}",
            pair.key_size(),
            pair.fingerprint()
        );
        Ok(pair)
    }

    async fn load(&self) -> KeyResult<KeyPair> {
        let private_key = load_private(&self.private_path).await?;
        let public_key = load_public(&self.public_path).await?;
        if private_key.to_public_key() != public_key {
            return Err(KeyStoreError::KeyParse(format!(
                "{} does not match {}",
                self.public_path.display(),
                self.private_path.display()
            )));
        }
        KeyPair::from_private(private_key)
    }

    async fn generate_and_persist(&self, bits: usize) -> KeyResult<KeyPair> {
        // Reject bad sizes before tying up a blocking thread
        if !(MIN_KEY_BITS..=MAX_KEY_BITS).contains(&bits) {
            return generate(bits);
        }

        let pair = tokio::task::spawn_blocking(move || generate(bits))
            .await
            .map_err(|e| KeyStoreError::KeyGeneration(e.to_string()))??;

        for path in [&self.public_path, &self.private_path] {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| storage_error(parent, e))?;
            }
        }
        persist(&pair, &self.public_path, &self.private_path).await?;
        Ok(pair)
    }
}

async fn exists(path: &Path) -> KeyResult<bool> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| storage_error(path, e))
}

/// One key pair shared by every test in the crate; generation is slow.
#[cfg(test)]
pub(crate) fn test_key_pair() -> &'static KeyPair {
    static PAIR: std::sync::OnceLock<KeyPair> = std::sync::OnceLock::new();
    PAIR.get_or_init(|| generate(MIN_KEY_BITS).expect("test key generation"))
}
