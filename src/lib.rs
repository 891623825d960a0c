//! IOU Service
//!
//! Identity-bound IOU agreements for a ledger network node.
//!
//! ## Architecture
//!
//! - **KeyStore**: one RSA key pair per node, PKCS#8/SPKI files, loaded lazily
//! - **Signer / Verifier**: SHA1withRSA over the exact record payload
//! - **LedgerGateway**: submit, query and identity lookups on the ledger node
//! - **IouService**: validate, resolve, sign and submit; verify on listing

pub mod api;
pub mod config;
pub mod crypto;
pub mod error;
pub mod keystore;
pub mod ledger;
pub mod rpc;
pub mod service;
pub mod state;
pub mod types;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use ledger::{InMemoryLedger, LedgerGateway};
pub use service::IouService;
pub use state::AppState;
