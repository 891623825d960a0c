use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// File name of the X.509 SubjectPublicKeyInfo key inside `key_dir`
pub const PUBLIC_KEY_FILE: &str = "publicKey";
/// File name of the PKCS#8 private key inside `key_dir`
pub const PRIVATE_KEY_FILE: &str = "privateKey";

const DEFAULT_NODE_NAME: &str = "O=PartyA, L=London, C=GB";
const DEFAULT_NETWORK_PEERS: &str =
    "O=PartyB, L=New York, C=US;O=PartyC, L=Paris, C=FR;O=Notary, L=London, C=GB";
const DEFAULT_RESERVED_SERVICES: &str = "Notary,Network Map Service";

#[derive(Debug, Clone)]
pub struct Config {
    pub version: String,
    pub host: String,
    pub port: u16,
    pub key_dir: PathBuf,
    pub key_size: usize,
    pub node_name: String,
    pub network_peers: Vec<String>,
    pub reserved_services: Vec<String>,
    pub ledger_url: Option<String>,
    pub ledger_timeout: Duration,
    pub verify_on_list: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            key_dir: env::var("KEY_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./KeyPair")),
            key_size: env::var("KEY_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1024),
            node_name: env::var("NODE_NAME").unwrap_or_else(|_| DEFAULT_NODE_NAME.into()),
            network_peers: split_list(
                &env::var("NETWORK_PEERS").unwrap_or_else(|_| DEFAULT_NETWORK_PEERS.into()),
                ';',
            ),
            reserved_services: split_list(
                &env::var("RESERVED_SERVICES")
                    .unwrap_or_else(|_| DEFAULT_RESERVED_SERVICES.into()),
                ',',
            ),
            ledger_url: env::var("LEDGER_URL").ok().filter(|s| !s.trim().is_empty()),
            ledger_timeout: Duration::from_secs(
                env::var("LEDGER_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            verify_on_list: env::var("VERIFY_ON_LIST")
                .ok()
                .map(|s| !matches!(s.to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off"))
                .unwrap_or(true),
        }
    }

    /// The one place the public key location is decided.
    pub fn public_key_path(&self) -> PathBuf {
        self.key_dir.join(PUBLIC_KEY_FILE)
    }

    /// The one place the private key location is decided.
    pub fn private_key_path(&self) -> PathBuf {
        self.key_dir.join(PRIVATE_KEY_FILE)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

fn split_list(raw: &str, sep: char) -> Vec<String> {
    raw.split(sep)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_list_skips_blanks() {
        assert_eq!(
            split_list(" O=A, C=GB ;; O=B, C=US ", ';'),
            vec!["O=A, C=GB".to_string(), "O=B, C=US".to_string()]
        );
        assert!(split_list("", ',').is_empty());
    }

    #[test]
    fn test_key_paths_share_directory() {
        let config = Config {
            key_dir: PathBuf::from("/tmp/keys"),
            ..Config::default()
        };
        assert_eq!(config.public_key_path(), PathBuf::from("/tmp/keys/publicKey"));
        assert_eq!(config.private_key_path(), PathBuf::from("/tmp/keys/privateKey"));
    }
}
