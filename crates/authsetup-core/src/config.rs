//! Typed configuration.
//!
//! The library takes a fully resolved [`AuthSetupConfig`]. The CLI loads one
//! from TOML with [`AuthSetupConfig::load`]; keys are camelCase:
//!
//! ```toml
//! [auth]
//! provider = "oidc"
//!
//! [auth.oidc]
//! idpType = "keycloak"
//! loginUrl = "https://app.example.com/login"
//! successCondition = { url = "https://app.example.com/**" }
//!
//! [auth.roles.admin]
//! credentialsEnv = { username = "ADMIN_USER", password = "ADMIN_PASS" }
//!
//! [storageState]
//! directory = ".auth"
//! maxAgeMinutes = 60
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::browser::{Locator, UrlPattern};
use crate::error::ConfigError;
use crate::store::is_valid_role_name;

/// Everything the subsystem needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSetupConfig {
    pub auth: AuthConfig,
    #[serde(default)]
    pub storage_state: StorageStateConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub lock: LockConfig,
}

/// Which provider variant drives the login.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Oidc,
    Form,
    Token,
    Custom,
}

impl ProviderKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Oidc => "oidc",
            Self::Form => "form",
            Self::Token => "token",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider selection, per-variant settings, and roles.
///
/// Only the section named by `provider` is read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    pub provider: ProviderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oidc: Option<OidcConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form: Option<FormConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<TokenConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<CustomConfig>,
    #[serde(default)]
    pub roles: BTreeMap<String, RoleConfig>,
}

/// Per-role settings. Only environment variable *names* live here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleConfig {
    pub credentials_env: CredentialsEnv,
    /// Overrides `mfa.totpSecretEnv` for this role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub totp_secret_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialsEnv {
    pub username: String,
    pub password: String,
}

/// What "logged in" looks like. Every configured condition must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessCondition {
    /// URL glob (`**` any, `*` one segment).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<Locator>,
    /// Overrides the provider's callback timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl SuccessCondition {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.url.is_none() && self.selector.is_none()
    }

    pub fn url_pattern(&self) -> Result<Option<UrlPattern>, ConfigError> {
        self.url
            .as_deref()
            .map(|raw| {
                UrlPattern::new(raw).map_err(|e| {
                    ConfigError::invalid("successCondition.url", format!("bad pattern: {e}"))
                })
            })
            .transpose()
    }

    fn validate(&self, field: &str) -> Result<(), ConfigError> {
        if self.is_empty() {
            return Err(ConfigError::invalid(
                field,
                "set at least one of url or selector",
            ));
        }
        self.url_pattern()?;
        if self.timeout_ms == Some(0) {
            return Err(ConfigError::invalid(
                format!("{field}.timeoutMs"),
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// OIDC login UI settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OidcConfig {
    /// `keycloak`, `azure-ad`, `okta`, or `generic`. Unknown values fall back
    /// to `generic`.
    #[serde(default = "default_idp_type")]
    pub idp_type: String,
    pub login_url: String,
    /// Go straight to the IdP instead of through the app's redirect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idp_login_url: Option<String>,
    pub success_condition: SuccessCondition,
    #[serde(default)]
    pub selectors: SelectorOverrides,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mfa: Option<MfaConfig>,
    #[serde(default)]
    pub timeouts: OidcTimeouts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logout_url: Option<String>,
}

fn default_idp_type() -> String {
    "generic".to_string()
}

/// Per-IdP selector overrides. Tried before an adapter's built-ins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SelectorOverrides {
    pub username: Vec<Locator>,
    pub password: Vec<Locator>,
    pub submit: Vec<Locator>,
    pub username_next: Vec<Locator>,
    pub stay_signed_in_no: Vec<Locator>,
    pub error_message: Vec<Locator>,
    pub mfa_input: Vec<Locator>,
    pub mfa_submit: Vec<Locator>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MfaType {
    #[default]
    Totp,
    Push,
    Sms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MfaConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, rename = "type")]
    pub mfa_type: MfaType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub totp_secret_env: Option<String>,
    #[serde(default = "default_mfa_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for MfaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mfa_type: MfaType::Totp,
            totp_secret_env: None,
            timeout_ms: default_mfa_timeout_ms(),
        }
    }
}

impl MfaConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_mfa_timeout_ms() -> u64 {
    30_000
}

/// Phase budgets for the OIDC flow. `loginFlowMs` caps the whole flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OidcTimeouts {
    pub login_flow_ms: u64,
    pub idp_redirect_ms: u64,
    pub credentials_ms: u64,
    pub callback_ms: u64,
}

impl Default for OidcTimeouts {
    fn default() -> Self {
        Self {
            login_flow_ms: 60_000,
            idp_redirect_ms: 15_000,
            credentials_ms: 15_000,
            callback_ms: 15_000,
        }
    }
}

impl OidcTimeouts {
    #[must_use]
    pub fn login_flow(&self) -> Duration {
        Duration::from_millis(self.login_flow_ms)
    }

    #[must_use]
    pub fn idp_redirect(&self) -> Duration {
        Duration::from_millis(self.idp_redirect_ms)
    }

    #[must_use]
    pub fn credentials(&self) -> Duration {
        Duration::from_millis(self.credentials_ms)
    }

    #[must_use]
    pub fn callback(&self) -> Duration {
        Duration::from_millis(self.callback_ms)
    }
}

/// Single-page form login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormConfig {
    pub login_url: String,
    pub username_selector: Locator,
    pub password_selector: Locator,
    pub submit_selector: Locator,
    pub success_condition: SuccessCondition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_selector: Option<Locator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logout_url: Option<String>,
    #[serde(default = "default_form_timeout_ms")]
    pub timeout_ms: u64,
}

impl FormConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_form_timeout_ms() -> u64 {
    15_000
}

/// API credential exchange. The token lands in the app origin's local storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenConfig {
    pub token_url: String,
    pub app_origin: String,
    #[serde(default = "default_storage_key")]
    pub storage_key: String,
    #[serde(default = "default_username_field")]
    pub username_field: String,
    #[serde(default = "default_password_field")]
    pub password_field: String,
    /// Field of the JSON response that holds the token.
    #[serde(default = "default_token_field")]
    pub token_field: String,
    /// Extra form fields, e.g. `grant_type` or `client_id`.
    #[serde(default)]
    pub extra_params: BTreeMap<String, String>,
    #[serde(default = "default_token_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            token_url: String::new(),
            app_origin: String::new(),
            storage_key: default_storage_key(),
            username_field: default_username_field(),
            password_field: default_password_field(),
            token_field: default_token_field(),
            extra_params: BTreeMap::new(),
            timeout_ms: default_token_timeout_ms(),
        }
    }
}

impl TokenConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_storage_key() -> String {
    "access_token".to_string()
}

fn default_username_field() -> String {
    "username".to_string()
}

fn default_password_field() -> String {
    "password".to_string()
}

fn default_token_field() -> String {
    "access_token".to_string()
}

fn default_token_timeout_ms() -> u64 {
    10_000
}

/// Names a provider registered on the `ProviderFactory`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomConfig {
    pub name: String,
    /// Passed through to the provider untouched.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

/// Where and for how long storage-state files live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageStateConfig {
    pub directory: PathBuf,
    pub max_age_minutes: u64,
    /// File name template; `{role}` is replaced with the role name.
    pub file_pattern: String,
}

impl Default for StorageStateConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(".auth"),
            max_age_minutes: 60,
            file_pattern: "{role}.json".to_string(),
        }
    }
}

impl StorageStateConfig {
    #[must_use]
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_minutes.saturating_mul(60))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            delay_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LockConfig {
    pub timeout_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: crate::lock::DEFAULT_LOCK_TIMEOUT.as_millis() as u64,
        }
    }
}

impl LockConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl AuthSetupConfig {
    /// Read and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Load {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let config = Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::Load { reason, .. } => ConfigError::Load {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })?;
        tracing::debug!(path = %path.display(), roles = config.auth.roles.len(), "Loaded config");
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Load {
            path: PathBuf::new(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Role settings, or `UnknownRole`.
    pub fn role(&self, role: &str) -> Result<&RoleConfig, ConfigError> {
        self.auth
            .roles
            .get(role)
            .ok_or_else(|| ConfigError::UnknownRole(role.to_string()))
    }

    /// Configured role names in stable order.
    #[must_use]
    pub fn role_names(&self) -> Vec<String> {
        self.auth.roles.keys().cloned().collect()
    }

    /// Shape checks. Env var *values* are not looked at here.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.auth.validate()?;

        let storage = &self.storage_state;
        if storage.max_age_minutes == 0 {
            return Err(ConfigError::invalid(
                "storageState.maxAgeMinutes",
                "must be greater than zero",
            ));
        }
        if !storage.file_pattern.contains("{role}") {
            return Err(ConfigError::invalid(
                "storageState.filePattern",
                "must contain {role}",
            ));
        }
        if storage.file_pattern.contains(['/', '\\']) {
            return Err(ConfigError::invalid(
                "storageState.filePattern",
                "must be a file name, not a path",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "retry.maxAttempts",
                "must be at least 1",
            ));
        }
        if self.lock.timeout_ms == 0 {
            return Err(ConfigError::invalid("lock.timeoutMs", "must be greater than zero"));
        }
        Ok(())
    }
}

impl AuthConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.roles.is_empty() {
            return Err(ConfigError::invalid("auth.roles", "at least one role is required"));
        }
        for (name, role) in &self.roles {
            if !is_valid_role_name(name) {
                return Err(ConfigError::invalid(
                    format!("auth.roles.{name}"),
                    "role names may only use ASCII letters, digits, '-' or '_'",
                ));
            }
            if role.credentials_env.username.trim().is_empty() {
                return Err(ConfigError::invalid(
                    format!("auth.roles.{name}.credentialsEnv.username"),
                    "variable name is empty",
                ));
            }
            if role.credentials_env.password.trim().is_empty() {
                return Err(ConfigError::invalid(
                    format!("auth.roles.{name}.credentialsEnv.password"),
                    "variable name is empty",
                ));
            }
        }

        match self.provider {
            ProviderKind::Oidc => self.require(self.oidc.as_ref(), "auth.oidc")?.validate(&self.roles),
            ProviderKind::Form => self.require(self.form.as_ref(), "auth.form")?.validate(),
            ProviderKind::Token => self.require(self.token.as_ref(), "auth.token")?.validate(),
            ProviderKind::Custom => {
                let custom = self.require(self.custom.as_ref(), "auth.custom")?;
                if custom.name.trim().is_empty() {
                    return Err(ConfigError::invalid("auth.custom.name", "must not be empty"));
                }
                Ok(())
            }
        }
    }

    fn require<'a, T>(&self, section: Option<&'a T>, field: &str) -> Result<&'a T, ConfigError> {
        section.ok_or_else(|| {
            ConfigError::invalid(
                field,
                format!("section is required when provider = \"{}\"", self.provider),
            )
        })
    }
}

fn validate_url(field: &str, raw: &str) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(raw).map_err(|e| ConfigError::invalid(field, e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ConfigError::invalid(field, "must be an http(s) URL"));
    }
    Ok(())
}

impl OidcConfig {
    fn validate(&self, roles: &BTreeMap<String, RoleConfig>) -> Result<(), ConfigError> {
        validate_url("auth.oidc.loginUrl", &self.login_url)?;
        if let Some(idp) = &self.idp_login_url {
            validate_url("auth.oidc.idpLoginUrl", idp)?;
        }
        if let Some(logout) = &self.logout_url {
            validate_url("auth.oidc.logoutUrl", logout)?;
        }
        self.success_condition
            .validate("auth.oidc.successCondition")?;

        let t = &self.timeouts;
        for (field, value) in [
            ("loginFlowMs", t.login_flow_ms),
            ("idpRedirectMs", t.idp_redirect_ms),
            ("credentialsMs", t.credentials_ms),
            ("callbackMs", t.callback_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(
                    format!("auth.oidc.timeouts.{field}"),
                    "must be greater than zero",
                ));
            }
        }

        if let Some(mfa) = self.mfa.as_ref().filter(|m| m.enabled) {
            if mfa.timeout_ms == 0 {
                return Err(ConfigError::invalid(
                    "auth.oidc.mfa.timeoutMs",
                    "must be greater than zero",
                ));
            }
            if mfa.mfa_type == MfaType::Totp {
                for (name, role) in roles {
                    if role.totp_secret_env.is_none() && mfa.totp_secret_env.is_none() {
                        return Err(ConfigError::invalid(
                            format!("auth.roles.{name}.totpSecretEnv"),
                            "TOTP MFA is enabled but no secret variable is named for this role \
                             (or auth.oidc.mfa.totpSecretEnv)",
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Callback budget, honoring `successCondition.timeoutMs`.
    #[must_use]
    pub fn callback_timeout(&self) -> Duration {
        self.success_condition
            .timeout_ms
            .map_or_else(|| self.timeouts.callback(), Duration::from_millis)
    }

    /// MFA settings if MFA is switched on.
    #[must_use]
    pub fn active_mfa(&self) -> Option<&MfaConfig> {
        self.mfa.as_ref().filter(|m| m.enabled)
    }
}

impl FormConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        validate_url("auth.form.loginUrl", &self.login_url)?;
        if let Some(logout) = &self.logout_url {
            validate_url("auth.form.logoutUrl", logout)?;
        }
        self.success_condition
            .validate("auth.form.successCondition")?;
        if self.timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "auth.form.timeoutMs",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl TokenConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        validate_url("auth.token.tokenUrl", &self.token_url)?;
        validate_url("auth.token.appOrigin", &self.app_origin)?;
        if self.storage_key.trim().is_empty() {
            return Err(ConfigError::invalid("auth.token.storageKey", "must not be empty"));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "auth.token.timeoutMs",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}
