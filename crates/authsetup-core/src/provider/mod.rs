//! Auth providers.
//!
//! A provider logs one browser session in. The `provider` field of the config
//! picks the variant:
//!
//! | provider | type | how |
//! |---|---|---|
//! | `oidc` | [`OidcProvider`] | drives an IdP login UI: navigation, credentials, mfa, callback |
//! | `form` | [`FormProvider`] | one login page on the app itself |
//! | `token` | [`TokenProvider`] | HTTP credential exchange, token written to local storage |
//! | `custom` | registered on [`ProviderFactory`] | anything else |
//!
//! Providers never retry; see [`crate::retry`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::browser::{BrowserSession, Locator, UrlPattern};
use crate::config::{AuthSetupConfig, MfaType, ProviderKind, SuccessCondition};
use crate::credentials::Credentials;
use crate::env::EnvSource;
use crate::error::{ConfigError, DriverError, LoginError};
use crate::idp::IdpRegistry;
use crate::totp::TotpGenerator;
use crate::wait::first_visible;

mod form;
mod oidc;
mod token;

pub use form::FormProvider;
pub use oidc::OidcProvider;
pub use token::TokenProvider;

/// Capability set shared by every provider variant.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn login(
        &self,
        session: &dyn BrowserSession,
        credentials: &Credentials,
    ) -> Result<(), LoginError>;

    /// Whether the session (usually seeded from a stored record) is still
    /// logged in.
    async fn is_session_valid(&self, session: &dyn BrowserSession) -> Result<bool, LoginError>;

    /// Extend a session without credentials. `Ok(false)` means unsupported or
    /// not possible.
    async fn refresh_session(&self, _session: &dyn BrowserSession) -> Result<bool, LoginError> {
        Ok(false)
    }

    async fn logout(&self, session: &dyn BrowserSession) -> Result<(), LoginError>;
}

/// A compiled [`SuccessCondition`]: every configured part must hold.
#[derive(Debug, Clone)]
pub struct SuccessMatcher {
    url: Option<UrlPattern>,
    selector: Option<Locator>,
}

impl SuccessMatcher {
    pub fn new(condition: &SuccessCondition) -> Result<Self, ConfigError> {
        Ok(Self {
            url: condition.url_pattern()?,
            selector: condition.selector.clone(),
        })
    }

    pub async fn holds(&self, session: &dyn BrowserSession) -> Result<bool, DriverError> {
        if let Some(pattern) = &self.url {
            if !pattern.matches(&session.current_url().await?) {
                return Ok(false);
            }
        }
        if let Some(selector) = &self.selector {
            if !session.is_visible(selector).await? {
                return Ok(false);
            }
        }
        Ok(self.url.is_some() || self.selector.is_some())
    }
}

/// Text of the first visible, non-empty error banner.
pub(crate) async fn banner_text(
    session: &dyn BrowserSession,
    candidates: &[Locator],
) -> Result<Option<String>, DriverError> {
    for locator in candidates {
        if !session.is_visible(locator).await? {
            continue;
        }
        if let Some(text) = session.text_content(locator).await? {
            let text = text.trim();
            if !text.is_empty() {
                return Ok(Some(text.to_string()));
            }
        }
    }
    Ok(None)
}

/// Whether any candidate is visible right now.
pub(crate) async fn any_visible(
    session: &dyn BrowserSession,
    candidates: &[Locator],
) -> Result<bool, DriverError> {
    Ok(first_visible(session, candidates).await?.is_some())
}

/// Inputs handed to a custom provider builder.
pub struct ProviderContext<'a> {
    pub role: &'a str,
    pub config: &'a AuthSetupConfig,
    pub env: &'a dyn EnvSource,
    pub options: &'a BTreeMap<String, String>,
}

type CustomBuilder =
    dyn Fn(&ProviderContext<'_>) -> Result<Box<dyn AuthProvider>, ConfigError> + Send + Sync;

/// Builds the configured provider for a role.
///
/// Construction is where configuration problems surface: incomplete IdP
/// selectors, a missing or malformed TOTP secret, an unregistered custom
/// provider. All of them fail before a browser is opened.
#[derive(Clone, Default)]
pub struct ProviderFactory {
    registry: IdpRegistry,
    custom: HashMap<String, Arc<CustomBuilder>>,
}

impl fmt::Debug for ProviderFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut custom: Vec<&String> = self.custom.keys().collect();
        custom.sort();
        f.debug_struct("ProviderFactory")
            .field("idp_types", &self.registry.names())
            .field("custom", &custom)
            .finish()
    }
}

impl ProviderFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_idp_registry(mut self, registry: IdpRegistry) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn idp_registry(&self) -> &IdpRegistry {
        &self.registry
    }

    /// Make `provider = "custom"` with `auth.custom.name = name` available.
    pub fn register_custom<F>(&mut self, name: &str, builder: F)
    where
        F: Fn(&ProviderContext<'_>) -> Result<Box<dyn AuthProvider>, ConfigError>
            + Send
            + Sync
            + 'static,
    {
        self.custom.insert(name.to_string(), Arc::new(builder));
    }

    /// Provider for `role` under `config`.
    pub fn build(
        &self,
        config: &AuthSetupConfig,
        role: &str,
        env: &dyn EnvSource,
    ) -> Result<Box<dyn AuthProvider>, ConfigError> {
        let role_config = config.role(role)?;
        let auth = &config.auth;
        let missing = |section: &str| {
            ConfigError::invalid(
                section,
                format!("section is required when provider = \"{}\"", auth.provider),
            )
        };

        match auth.provider {
            ProviderKind::Oidc => {
                let oidc = auth.oidc.as_ref().ok_or_else(|| missing("auth.oidc"))?;
                let selectors = self
                    .registry
                    .selectors_for(&oidc.idp_type, &oidc.selectors)?;
                let totp = match oidc.active_mfa() {
                    Some(mfa) if mfa.mfa_type == MfaType::Totp => {
                        let var = role_config
                            .totp_secret_env
                            .as_deref()
                            .or(mfa.totp_secret_env.as_deref())
                            .ok_or_else(|| {
                                ConfigError::invalid(
                                    format!("auth.roles.{role}.totpSecretEnv"),
                                    "TOTP MFA is enabled but no secret variable is named",
                                )
                            })?;
                        Some(TotpGenerator::from_env(env, role, var)?)
                    }
                    _ => None,
                };
                Ok(Box::new(OidcProvider::new(oidc.clone(), selectors, totp)?))
            }
            ProviderKind::Form => {
                let form = auth.form.as_ref().ok_or_else(|| missing("auth.form"))?;
                Ok(Box::new(FormProvider::new(form.clone())?))
            }
            ProviderKind::Token => {
                let token = auth.token.as_ref().ok_or_else(|| missing("auth.token"))?;
                Ok(Box::new(TokenProvider::new(token.clone())?))
            }
            ProviderKind::Custom => {
                let custom = auth.custom.as_ref().ok_or_else(|| missing("auth.custom"))?;
                let builder = self
                    .custom
                    .get(&custom.name)
                    .ok_or_else(|| ConfigError::UnknownCustomProvider(custom.name.clone()))?;
                builder(&ProviderContext {
                    role,
                    config,
                    env,
                    options: &custom.options,
                })
            }
        }
    }
}
