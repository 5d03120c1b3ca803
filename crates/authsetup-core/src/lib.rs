//! authsetup-core: role-based browser login with reusable storage state
//!
//! Logs a browser session into a protected web application once per role,
//! persists the resulting storage state (cookies + local storage) to disk,
//! and lets any number of parallel test workers reuse it until it expires.
//!
//! # Architecture
//!
//! ```text
//! AuthSetup ─→ CredentialResolver ─→ ProviderFactory ─→ AuthProvider
//!     │                                                    │
//!     │                              oidc: OidcProvider + IdpRegistry (+ TOTP)
//!     │                              form / token / custom
//!     ↓
//! StorageStateStore ←─ save ─ BrowserSession (playwright | mock)
//!     ↑
//! workers: get_storage_state_path(role)
//! ```
//!
//! # Modules
//!
//! - `config`: typed configuration, TOML loading, validation
//! - `env`: environment variable source (process or fixed map)
//! - `credentials`: role → username/password from env vars
//! - `totp`: RFC 6238 one-time codes
//! - `browser`: driver seam, Playwright bridge, scripted mock
//! - `wait`: bounded polling helpers
//! - `idp`: identity provider adapters (keycloak, azure-ad, okta, generic)
//! - `provider`: auth providers and the OIDC flow engine
//! - `retry`: login retry policy
//! - `store`: storage-state files, expiry, failure markers
//! - `lock`: per-role cross-process setup lock
//! - `setup`: the orchestrator
//! - `logging`: tracing subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod browser;
pub mod config;
pub mod credentials;
pub mod env;
pub mod error;
pub mod idp;
pub mod lock;
pub mod logging;
pub mod provider;
pub mod retry;
pub mod setup;
pub mod storage_state;
pub mod store;
pub mod totp;
pub mod wait;

pub use config::AuthSetupConfig;
pub use error::{AuthError, AuthPhase, ConfigError, Error, Result, StorageError};
pub use setup::{AuthSetup, SetupOutcome, SetupReport};
pub use store::StorageStateStore;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
