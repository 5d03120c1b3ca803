//! Bounded waits against a browser session.
//!
//! Every wait here is a polling loop wrapped in `tokio::time::timeout`.
//! Expiry surfaces as a phase-tagged [`LoginError`]; the caller decides what
//! happens next.

use std::future::Future;
use std::time::Duration;

use crate::browser::{BrowserSession, Locator};
use crate::error::{AuthPhase, DriverError, LoginError};

/// Delay between probes.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Poll `probe` until it yields `Some`, or fail with a `phase` timeout.
///
/// Driver errors from the probe end the wait immediately.
pub async fn poll_until<T, F, Fut>(
    phase: AuthPhase,
    budget: Duration,
    mut probe: F,
) -> Result<T, LoginError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, DriverError>>,
{
    let polling = async {
        loop {
            if let Some(value) = probe().await? {
                return Ok::<T, DriverError>(value);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    };
    match tokio::time::timeout(budget, polling).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(LoginError::driver(phase, err)),
        Err(_) => Err(LoginError::timeout(phase, budget)),
    }
}

/// First candidate that is currently visible, in order. Never waits.
pub async fn first_visible<'a>(
    session: &dyn BrowserSession,
    candidates: &'a [Locator],
) -> Result<Option<&'a Locator>, DriverError> {
    for locator in candidates {
        if session.is_visible(locator).await? {
            return Ok(Some(locator));
        }
    }
    Ok(None)
}

/// Wait for any of `candidates` to become visible.
pub async fn wait_for_any<'a>(
    session: &dyn BrowserSession,
    candidates: &'a [Locator],
    phase: AuthPhase,
    budget: Duration,
) -> Result<&'a Locator, LoginError> {
    if candidates.is_empty() {
        return Err(LoginError::new(phase, "no selectors configured to wait for"));
    }
    poll_until(phase, budget, || first_visible(session, candidates)).await
}

/// Run one driver action under `budget`, tagging failures with `phase`.
pub async fn bounded<T, Fut>(phase: AuthPhase, budget: Duration, action: Fut) -> Result<T, LoginError>
where
    Fut: Future<Output = Result<T, DriverError>>,
{
    match tokio::time::timeout(budget, action).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(LoginError::driver(phase, err)),
        Err(_) => Err(LoginError::timeout(phase, budget)),
    }
}

/// Run a whole phase under `budget`.
pub async fn within<T, Fut>(phase: AuthPhase, budget: Duration, body: Fut) -> Result<T, LoginError>
where
    Fut: Future<Output = Result<T, LoginError>>,
{
    tokio::time::timeout(budget, body)
        .await
        .unwrap_or_else(|_| Err(LoginError::timeout(phase, budget)))
}

/// Overall flow deadline. Each phase gets `min(phase budget, time left)`.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    end: tokio::time::Instant,
}

impl Deadline {
    #[must_use]
    pub fn after(total: Duration) -> Self {
        Self {
            end: tokio::time::Instant::now() + total,
        }
    }

    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.end.saturating_duration_since(tokio::time::Instant::now())
    }

    #[must_use]
    pub fn budget(&self, phase_budget: Duration) -> Duration {
        phase_budget.min(self.remaining())
    }
}
