//! Login retry policy.
//!
//! Every provider failure is retried the same way: a fixed delay, a fixed
//! number of attempts, and a clean session between attempts. Only the last
//! failure is reported.

use std::time::Duration;

use crate::browser::BrowserSession;
use crate::config::RetryConfig;
use crate::credentials::Credentials;
use crate::error::{AuthError, AuthPhase, LoginError};
use crate::provider::AuthProvider;

/// Attempt budget and inter-attempt delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Never below 1.
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            delay: Duration::from_millis(config.delay_ms),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = if max_attempts == 0 { 1 } else { max_attempts };
        self
    }

    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Delay before the attempt following `attempt` (1-indexed), or `None`
    /// when the budget is spent.
    #[must_use]
    pub const fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            None
        } else {
            Some(self.delay)
        }
    }
}

/// Progress of one `login_with_retry` call. Lives only for that call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    /// Attempts made so far.
    pub attempt: u32,
    pub max_attempts: u32,
    pub last_error: Option<LoginError>,
}

impl RetryState {
    #[must_use]
    pub const fn new(policy: &RetryPolicy) -> Self {
        Self {
            attempt: 0,
            max_attempts: policy.max_attempts,
            last_error: None,
        }
    }

    /// Convert the last failure into the role-level error.
    fn into_error(self, role: &str) -> AuthError {
        let err = self.last_error.unwrap_or_else(|| {
            LoginError::new(AuthPhase::Navigation, "login was never attempted")
        });
        AuthError::from_login(role, err, self.attempt)
    }
}

/// Run `provider.login` under `policy`.
///
/// Returns the number of attempts used on success. On exhaustion the last
/// failure is converted into an [`AuthError`] for `role`.
pub async fn login_with_retry(
    provider: &dyn AuthProvider,
    session: &dyn BrowserSession,
    credentials: &Credentials,
    role: &str,
    policy: RetryPolicy,
) -> Result<u32, AuthError> {
    let mut state = RetryState::new(&policy);
    loop {
        state.attempt += 1;
        tracing::debug!(
            attempt = state.attempt,
            max_attempts = state.max_attempts,
            provider = provider.name(),
            "Login attempt"
        );
        let err = match provider.login(session, credentials).await {
            Ok(()) => return Ok(state.attempt),
            Err(err) => err,
        };
        tracing::warn!(
            attempt = state.attempt,
            max_attempts = state.max_attempts,
            phase = %err.phase,
            error = %err.message,
            "Login attempt failed"
        );
        state.last_error = Some(err);

        let Some(delay) = policy.next_delay(state.attempt) else {
            return Err(state.into_error(role));
        };
        // A half-finished login must not leak into the next attempt.
        if let Err(clear_err) = session.clear_session().await {
            tracing::debug!(error = %clear_err, "Could not clear session before retry");
        }
        tracing::debug!(delay_ms = delay.as_millis() as u64, "Waiting before retry");
        tokio::time::sleep(delay).await;
    }
}
