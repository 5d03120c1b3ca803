//! Error types for authsetup-core.
//!
//! The taxonomy follows how failures are handled:
//!
//! - [`ConfigError`]: fatal, never retried, raised before any browser work.
//! - [`LoginError`]: a single provider attempt failed in a given [`AuthPhase`].
//! - [`AuthError`]: the role-tagged result once retries are exhausted.
//! - [`StorageError`] / [`DriverError`] / [`LockError`]: infrastructure.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use crate::lock::LockError;

/// Maximum length of an identity-provider response excerpt kept on errors.
pub const IDP_RESPONSE_EXCERPT_LEN: usize = 500;

/// Phase of a login flow. Every [`LoginError`] and [`AuthError`] is tagged
/// with the phase it failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthPhase {
    /// Opening the login entry point and reaching the IdP login form.
    Navigation,
    /// Filling and submitting username/password.
    Credentials,
    /// Multi-factor prompt (TOTP code or out-of-band approval).
    Mfa,
    /// Returning to the application and meeting the success condition.
    Callback,
}

impl AuthPhase {
    /// Stable lowercase name, as used in logs and failure markers.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Navigation => "navigation",
            Self::Credentials => "credentials",
            Self::Mfa => "mfa",
            Self::Callback => "callback",
        }
    }
}

impl fmt::Display for AuthPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration problems. These are never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required environment variable is unset or empty.
    #[error("role '{role}': environment variable {var} ({field}) is not set or empty")]
    MissingEnvVar {
        role: String,
        field: String,
        var: String,
    },

    /// The role is not present in `auth.roles`.
    #[error("unknown role '{0}': add it under auth.roles")]
    UnknownRole(String),

    /// The TOTP secret could not be decoded.
    #[error("TOTP secret in {var} is not valid base32: {reason}")]
    InvalidTotpSecret { var: String, reason: String },

    /// A config field has an invalid value.
    #[error("invalid configuration at {field}: {reason}")]
    Invalid { field: String, reason: String },

    /// `provider = "custom"` names a provider nobody registered.
    #[error("custom provider '{0}' is not registered")]
    UnknownCustomProvider(String),

    /// The config file could not be read or parsed.
    #[error("failed to load config {path}: {reason}")]
    Load { path: PathBuf, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Failures reported by a browser driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("browser session is closed")]
    Closed,

    #[error("driver protocol error: {0}")]
    Protocol(String),

    #[error("failed to launch browser driver: {0}")]
    Launch(String),
}

/// A single failed provider attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{phase} phase failed: {message}")]
pub struct LoginError {
    pub phase: AuthPhase,
    pub message: String,
    /// Excerpt of what the identity provider showed or returned, if captured.
    pub idp_response: Option<String>,
}

impl LoginError {
    pub fn new(phase: AuthPhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            idp_response: None,
        }
    }

    /// A phase wait ran past its budget.
    pub fn timeout(phase: AuthPhase, budget: Duration) -> Self {
        Self::new(
            phase,
            format!("{phase} phase timed out after {}ms", budget.as_millis()),
        )
    }

    /// Wrap a driver failure in the phase it happened in.
    pub fn driver(phase: AuthPhase, err: DriverError) -> Self {
        Self::new(phase, err.to_string())
    }

    #[must_use]
    pub fn with_idp_response(mut self, response: impl AsRef<str>) -> Self {
        self.idp_response = Some(excerpt(response.as_ref(), IDP_RESPONSE_EXCERPT_LEN));
        self
    }
}

/// A role's login failed after all retry attempts.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error(
    "authentication failed for role '{role}' during {phase} phase after {attempts} attempt(s): {message}"
)]
pub struct AuthError {
    pub message: String,
    pub role: String,
    pub phase: AuthPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idp_response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
    pub attempts: u32,
}

impl AuthError {
    /// Build the role-level error from the last provider failure.
    pub fn from_login(role: &str, err: LoginError, attempts: u32) -> Self {
        Self {
            remediation: Some(remediation_for(err.phase, role)),
            message: err.message,
            role: role.to_string(),
            phase: err.phase,
            idp_response: err.idp_response,
            attempts,
        }
    }
}

/// Operator-facing hint for a failed phase.
#[must_use]
pub fn remediation_for(phase: AuthPhase, role: &str) -> String {
    match phase {
        AuthPhase::Navigation => "Check that loginUrl (or idpLoginUrl) is reachable from this host \
             and redirects to the identity provider; raise timeouts.idpRedirectMs for slow IdPs."
            .to_string(),
        AuthPhase::Credentials => format!(
            "Check the credential environment variables configured for role '{role}' \
             (credentialsEnv.username / credentialsEnv.password) and the IdP selector overrides."
        ),
        AuthPhase::Mfa => format!(
            "Check that the TOTP secret for role '{role}' is the account's base32 seed and the \
             host clock is in sync; push/sms approvals must arrive within mfa.timeoutMs."
        ),
        AuthPhase::Callback => "Check successCondition.url / successCondition.selector against \
             the page the application lands on, and timeouts.callbackMs."
            .to_string(),
    }
}

/// Storage-state persistence failures. Missing, corrupt, or stale records
/// are not errors; they read as absent.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("invalid role name '{0}': use ASCII letters, digits, '-' or '_'")]
    InvalidRole(String),

    #[error("storage I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize storage state: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Top-level error for authsetup-core operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Lock(#[from] LockError),
}

impl Error {
    /// True for misconfiguration that no retry or re-run can fix.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Truncate on a char boundary, marking the cut.
pub(crate) fn excerpt(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_display_is_lowercase() {
        assert_eq!(AuthPhase::Navigation.to_string(), "navigation");
        assert_eq!(AuthPhase::Mfa.to_string(), "mfa");
        assert_eq!(
            serde_json::to_string(&AuthPhase::Callback).unwrap(),
            "\"callback\""
        );
    }

    #[test]
    fn missing_env_var_names_the_variable() {
        let e = ConfigError::MissingEnvVar {
            role: "hr".into(),
            field: "credentialsEnv.username".into(),
            var: "HR_USER".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("HR_USER"));
        assert!(msg.contains("credentialsEnv.username"));
        assert!(msg.contains("'hr'"));
    }

    #[test]
    fn auth_error_carries_phase_remediation() {
        let login = LoginError::new(AuthPhase::Credentials, "submit button never appeared");
        let err = AuthError::from_login("admin", login, 2);
        assert_eq!(err.phase, AuthPhase::Credentials);
        assert_eq!(err.attempts, 2);
        assert!(err.remediation.as_deref().unwrap().contains("credentialsEnv"));
        assert!(err.to_string().contains("during credentials phase"));
    }

    #[test]
    fn callback_remediation_points_at_success_condition() {
        assert!(remediation_for(AuthPhase::Callback, "x").contains("successCondition"));
    }

    #[test]
    fn idp_response_is_truncated() {
        let long = "x".repeat(2_000);
        let err = LoginError::new(AuthPhase::Credentials, "rejected").with_idp_response(&long);
        let excerpt = err.idp_response.unwrap();
        assert_eq!(excerpt.len(), IDP_RESPONSE_EXCERPT_LEN + 3);
        assert!(excerpt.ends_with("..."));
    }

    #[test]
    fn excerpt_respects_char_boundaries() {
        let s = "é".repeat(10);
        assert_eq!(excerpt(&s, 4), "éééé...");
        assert_eq!(excerpt("  short  ", 10), "short");
    }

    #[test]
    fn timeout_error_mentions_budget() {
        let e = LoginError::timeout(AuthPhase::Navigation, Duration::from_millis(1500));
        assert_eq!(e.phase, AuthPhase::Navigation);
        assert!(e.message.contains("1500ms"));
    }

    #[test]
    fn config_errors_are_flagged() {
        let e: Error = ConfigError::UnknownRole("ghost".into()).into();
        assert!(e.is_config());
        let e: Error = DriverError::Closed.into();
        assert!(!e.is_config());
    }
}
