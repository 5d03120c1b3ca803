//! Auth setup orchestration.
//!
//! One [`AuthSetup`] per process. For each role it either reuses a fresh
//! storage-state record or runs the configured provider and saves a new one:
//!
//! ```text
//! resolve credentials ─ build provider ─ fresh record? ── yes ─→ Reused
//!                                            │ no
//!                              acquire per-role lock (waits)
//!                                            │
//!                                     fresh record now? ── yes ─→ Reused
//!                                            │ no
//!                     open session ─ login_with_retry ─ save ─→ Authenticated
//! ```
//!
//! Configuration problems surface before any browser is opened.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::join_all;
use serde::Serialize;
use tracing::Instrument;

use crate::browser::{BrowserSession, SessionFactory};
use crate::config::AuthSetupConfig;
use crate::credentials::CredentialResolver;
use crate::env::{EnvSource, ProcessEnv};
use crate::error::{AuthError, ConfigError, Error, LoginError, Result};
use crate::lock::SetupLock;
use crate::provider::{AuthProvider, ProviderFactory};
use crate::retry::{RetryPolicy, login_with_retry};
use crate::store::{StorageStateStore, is_valid_role_name};

/// How a role's storage state was obtained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum SetupOutcome {
    /// A fresh record already existed; no login happened.
    Reused { path: PathBuf },
    /// Logged in and saved a new record.
    Authenticated { path: PathBuf, attempts: u32 },
}

impl SetupOutcome {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Reused { path } | Self::Authenticated { path, .. } => path,
        }
    }

    #[must_use]
    pub const fn logged_in(&self) -> bool {
        matches!(self, Self::Authenticated { .. })
    }
}

/// Result of one role inside [`AuthSetup::run_all`].
#[derive(Debug)]
pub struct RoleResult {
    pub role: String,
    pub result: Result<SetupOutcome>,
}

/// Per-role results of [`AuthSetup::run_all`], in the order requested.
#[derive(Debug, Default)]
pub struct SetupReport {
    pub roles: Vec<RoleResult>,
    /// Records removed by the sweep that ran first.
    pub swept: usize,
}

impl SetupReport {
    #[must_use]
    pub fn all_ok(&self) -> bool {
        self.roles.iter().all(|r| r.result.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &Error)> {
        self.roles
            .iter()
            .filter_map(|r| r.result.as_ref().err().map(|e| (r.role.as_str(), e)))
    }

    #[must_use]
    pub fn has_config_error(&self) -> bool {
        self.failures().any(|(_, e)| e.is_config())
    }
}

/// Role-level orchestrator.
pub struct AuthSetup {
    config: AuthSetupConfig,
    env: Arc<dyn EnvSource>,
    sessions: Arc<dyn SessionFactory>,
    providers: ProviderFactory,
    store: StorageStateStore,
}

impl std::fmt::Debug for AuthSetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSetup")
            .field("provider", &self.config.auth.provider)
            .field("roles", &self.config.role_names())
            .field("store", &self.store)
            .field("providers", &self.providers)
            .finish_non_exhaustive()
    }
}

impl AuthSetup {
    /// Validates `config`; reads secrets from the process environment.
    pub fn new(
        config: AuthSetupConfig,
        sessions: Arc<dyn SessionFactory>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let store = StorageStateStore::new(&config.storage_state);
        Ok(Self {
            config,
            env: Arc::new(ProcessEnv),
            sessions,
            providers: ProviderFactory::new(),
            store,
        })
    }

    #[must_use]
    pub fn with_env(mut self, env: Arc<dyn EnvSource>) -> Self {
        self.env = env;
        self
    }

    #[must_use]
    pub fn with_providers(mut self, providers: ProviderFactory) -> Self {
        self.providers = providers;
        self
    }

    #[must_use]
    pub fn config(&self) -> &AuthSetupConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &StorageStateStore {
        &self.store
    }

    /// Path of a fresh record for `role`; `None` when absent, stale or
    /// malformed. A failed setup never writes a record, so a role whose last
    /// setup failed also reads as `None`; the failure itself is in
    /// [`StorageStateStore::last_failure`].
    #[must_use]
    pub fn get_storage_state_path(&self, role: &str) -> Option<PathBuf> {
        self.store.load(role)
    }

    /// Make sure `role` has a fresh storage-state record.
    pub async fn run_auth_setup(&self, role: &str) -> Result<SetupOutcome> {
        let span = tracing::info_span!("auth_setup", role);
        self.setup_role(role).instrument(span).await
    }

    async fn setup_role(&self, role: &str) -> Result<SetupOutcome> {
        let started = Instant::now();
        if !is_valid_role_name(role) {
            return Err(ConfigError::invalid(
                format!("auth.roles.{role}"),
                "role names may only use ASCII letters, digits, '-' or '_'",
            )
            .into());
        }
        let credentials = CredentialResolver::new(&self.config, self.env.as_ref()).resolve(role)?;
        let provider = self
            .providers
            .build(&self.config, role, self.env.as_ref())?;

        if let Some(path) = self.store.load(role) {
            tracing::info!(path = %path.display(), "Reusing fresh storage state");
            return Ok(SetupOutcome::Reused { path });
        }

        let _lock = SetupLock::acquire(self.store.dir(), role, self.config.lock.timeout()).await?;
        // Another worker may have finished while we waited.
        if let Some(path) = self.store.load(role) {
            tracing::info!(path = %path.display(), "Storage state was created by another worker");
            return Ok(SetupOutcome::Reused { path });
        }

        tracing::info!(provider = provider.name(), "Logging in");
        let session = self.sessions.open(role, None).await?;
        let result = self
            .login_and_save(provider.as_ref(), session.as_ref(), &credentials, role)
            .await;
        if let Err(e) = session.close().await {
            tracing::debug!(error = %e, "Closing browser session failed");
        }

        match result {
            Ok((path, attempts)) => {
                self.store.clear_failure(role)?;
                tracing::info!(
                    attempts,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    path = %path.display(),
                    "Auth setup complete"
                );
                Ok(SetupOutcome::Authenticated { path, attempts })
            }
            Err(Error::Auth(err)) => {
                tracing::error!(
                    phase = %err.phase,
                    attempts = err.attempts,
                    error = %err.message,
                    "Auth setup failed"
                );
                if let Err(e) = self.store.record_failure(&err) {
                    tracing::warn!(error = %e, "Could not write failure marker");
                }
                Err(Error::Auth(err))
            }
            Err(other) => Err(other),
        }
    }

    async fn login_and_save(
        &self,
        provider: &dyn AuthProvider,
        session: &dyn BrowserSession,
        credentials: &crate::credentials::Credentials,
        role: &str,
    ) -> Result<(PathBuf, u32)> {
        let policy = RetryPolicy::from(&self.config.retry);
        let attempts = login_with_retry(provider, session, credentials, role, policy).await?;
        let path = self.store.save(session, role).await?;
        Ok((path, attempts))
    }

    /// Sweep expired records, then set up every role concurrently.
    ///
    /// One role failing does not stop the others.
    pub async fn run_all(&self, roles: &[String]) -> Result<SetupReport> {
        let swept = self.store.cleanup_expired()?;
        let results = join_all(roles.iter().map(|role| self.run_auth_setup(role))).await;
        let report = SetupReport {
            roles: roles
                .iter()
                .cloned()
                .zip(results)
                .map(|(role, result)| RoleResult { role, result })
                .collect(),
            swept,
        };
        tracing::info!(
            roles = report.roles.len(),
            failed = report.failures().count(),
            swept,
            "Setup run finished"
        );
        Ok(report)
    }

    /// Whether the stored record still logs `role` in, according to the
    /// provider. Refreshes and re-saves when the provider can.
    pub async fn verify_role(&self, role: &str) -> Result<bool> {
        let Some(path) = self.store.load(role) else {
            tracing::info!(role, "No fresh storage state to verify");
            return Ok(false);
        };
        let provider = self
            .providers
            .build(&self.config, role, self.env.as_ref())?;
        let session = self.sessions.open(role, Some(&path)).await?;
        let result = self.check_session(provider.as_ref(), session.as_ref(), role).await;
        if let Err(e) = session.close().await {
            tracing::debug!(error = %e, "Closing browser session failed");
        }
        result
    }

    async fn check_session(
        &self,
        provider: &dyn AuthProvider,
        session: &dyn BrowserSession,
        role: &str,
    ) -> Result<bool> {
        let as_error = |e: LoginError| Error::Auth(AuthError::from_login(role, e, 1));
        if provider.is_session_valid(session).await.map_err(as_error)? {
            tracing::info!(role, "Stored session is valid");
            return Ok(true);
        }
        if provider.refresh_session(session).await.map_err(as_error)? {
            self.store.save(session, role).await?;
            tracing::info!(role, "Stored session refreshed");
            return Ok(true);
        }
        tracing::info!(role, "Stored session is no longer valid");
        Ok(false)
    }

    /// Log `role` out on the provider side (if a record exists) and delete
    /// its record.
    pub async fn logout_role(&self, role: &str) -> Result<()> {
        let path = self.store.path_for(role)?;
        if path.exists() {
            let provider = self
                .providers
                .build(&self.config, role, self.env.as_ref())?;
            match self.sessions.open(role, Some(&path)).await {
                Ok(session) => {
                    if let Err(e) = provider.logout(session.as_ref()).await {
                        tracing::warn!(role, error = %e, "Provider logout failed");
                    }
                    if let Err(e) = session.close().await {
                        tracing::debug!(error = %e, "Closing browser session failed");
                    }
                }
                Err(e) => tracing::warn!(role, error = %e, "Could not open a session to log out"),
            }
        }
        self.store.clear(Some(role))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::mock::{MockBrowser, MockSessionFactory};
    use crate::config::{CredentialsEnv, CustomConfig, ProviderKind, RoleConfig};
    use crate::credentials::Credentials;
    use crate::env::MapEnv;
    use crate::error::AuthPhase;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Writes a token into local storage; fails for users named "locked".
    #[derive(Default)]
    struct Scripted {
        logins: Arc<AtomicU32>,
    }

    #[async_trait]
    impl AuthProvider for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn login(
            &self,
            session: &dyn BrowserSession,
            credentials: &Credentials,
        ) -> Result<(), LoginError> {
            self.logins.fetch_add(1, Ordering::SeqCst);
            if credentials.username == "locked" {
                return Err(LoginError::new(AuthPhase::Credentials, "account locked"));
            }
            session
                .set_local_storage("https://app.test", "token", &credentials.username)
                .await
                .map_err(|e| LoginError::driver(AuthPhase::Callback, e))
        }

        async fn is_session_valid(&self, session: &dyn BrowserSession) -> Result<bool, LoginError> {
            let record = session
                .storage_state()
                .await
                .map_err(|e| LoginError::driver(AuthPhase::Callback, e))?;
            Ok(record.local_storage("https://app.test", "token").is_some())
        }

        async fn logout(&self, session: &dyn BrowserSession) -> Result<(), LoginError> {
            session
                .clear_session()
                .await
                .map_err(|e| LoginError::driver(AuthPhase::Navigation, e))
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        setup: AuthSetup,
        sessions: Arc<MockSessionFactory>,
        logins: Arc<AtomicU32>,
    }

    fn harness(env: MapEnv) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AuthSetupConfig::default();
        config.storage_state.directory = dir.path().join("auth");
        config.auth.provider = ProviderKind::Custom;
        config.auth.custom = Some(CustomConfig {
            name: "scripted".into(),
            ..CustomConfig::default()
        });
        config.retry.delay_ms = 10;
        for role in ["admin", "viewer"] {
            let upper = role.to_uppercase();
            config.auth.roles.insert(
                role.into(),
                RoleConfig {
                    credentials_env: CredentialsEnv {
                        username: format!("{upper}_USER"),
                        password: format!("{upper}_PASS"),
                    },
                    ..RoleConfig::default()
                },
            );
        }

        let logins = Arc::new(AtomicU32::new(0));
        let mut providers = ProviderFactory::new();
        let counter = Arc::clone(&logins);
        providers.register_custom("scripted", move |_| {
            Ok(Box::new(Scripted {
                logins: Arc::clone(&counter),
            }))
        });

        let sessions = Arc::new(MockSessionFactory::new(|_| MockBrowser::new()));
        let setup = AuthSetup::new(config, sessions.clone())
            .unwrap()
            .with_env(Arc::new(env))
            .with_providers(providers);
        Harness {
            _dir: dir,
            setup,
            sessions,
            logins,
        }
    }

    fn env() -> MapEnv {
        MapEnv::new()
            .with("ADMIN_USER", "root")
            .with("ADMIN_PASS", "pw")
            .with("VIEWER_USER", "locked")
            .with("VIEWER_PASS", "pw")
    }

    #[tokio::test]
    async fn setup_then_reuse() {
        let h = harness(env());
        let first = h.setup.run_auth_setup("admin").await.unwrap();
        assert!(first.logged_in());
        assert!(first.path().exists());
        assert_eq!(h.setup.get_storage_state_path("admin").as_deref(), Some(first.path()));

        let second = h.setup.run_auth_setup("admin").await.unwrap();
        assert_eq!(second, SetupOutcome::Reused { path: first.path().to_path_buf() });
        assert_eq!(h.logins.load(Ordering::SeqCst), 1);
        assert_eq!(h.sessions.open_count(), 1);
        assert!(h.sessions.last_for("admin").unwrap().is_closed());
    }

    #[tokio::test]
    async fn failure_leaves_marker_and_no_record() {
        let h = harness(env());
        let err = h.setup.run_auth_setup("viewer").await.unwrap_err();
        let Error::Auth(auth) = err else {
            panic!("expected auth error, got {err:?}");
        };
        assert_eq!(auth.attempts, 2);
        assert_eq!(h.logins.load(Ordering::SeqCst), 2);
        assert!(h.setup.get_storage_state_path("viewer").is_none());

        let marker = h.setup.store().last_failure("viewer").unwrap();
        assert_eq!(marker.phase, AuthPhase::Credentials);
        assert_eq!(marker.attempts, 2);
    }

    #[tokio::test]
    async fn missing_env_is_config_error_before_browser() {
        let h = harness(MapEnv::new());
        let err = h.setup.run_auth_setup("admin").await.unwrap_err();
        assert!(err.is_config());
        assert_eq!(h.sessions.open_count(), 0);
        assert!(h.setup.store().last_failure("admin").is_none());
    }

    #[tokio::test]
    async fn unknown_role_is_config_error() {
        let h = harness(env());
        assert!(h.setup.run_auth_setup("ghost").await.unwrap_err().is_config());
        assert!(h.setup.run_auth_setup("../etc").await.unwrap_err().is_config());
    }

    #[tokio::test]
    async fn concurrent_same_role_logs_in_once() {
        let h = harness(env());
        let (a, b) = tokio::join!(
            h.setup.run_auth_setup("admin"),
            h.setup.run_auth_setup("admin")
        );
        let outcomes = [a.unwrap(), b.unwrap()];
        assert_eq!(outcomes.iter().filter(|o| o.logged_in()).count(), 1);
        assert_eq!(h.logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_all_isolates_failures() {
        let h = harness(env());
        let report = h
            .setup
            .run_all(&["admin".to_string(), "viewer".to_string()])
            .await
            .unwrap();
        assert!(!report.all_ok());
        assert!(!report.has_config_error());
        assert!(report.roles[0].result.is_ok());
        let failed: Vec<&str> = report.failures().map(|(role, _)| role).collect();
        assert_eq!(failed, vec!["viewer"]);
    }

    #[tokio::test]
    async fn verify_and_logout() {
        let h = harness(env());
        assert!(!h.setup.verify_role("admin").await.unwrap());

        let outcome = h.setup.run_auth_setup("admin").await.unwrap();
        assert!(h.setup.verify_role("admin").await.unwrap());
        assert_eq!(h.sessions.last_seed_for("admin").as_deref(), Some(outcome.path()));

        h.setup.logout_role("admin").await.unwrap();
        assert!(!outcome.path().exists());
        assert_eq!(h.sessions.last_for("admin").unwrap().clear_count(), 1);
    }
}
