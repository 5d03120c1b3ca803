//! Single-page form login on the application itself.

use std::slice;
use std::time::Duration;

use async_trait::async_trait;

use super::{AuthProvider, SuccessMatcher, banner_text};
use crate::browser::{BrowserSession, Locator};
use crate::config::FormConfig;
use crate::credentials::Credentials;
use crate::error::{AuthPhase, ConfigError, DriverError, LoginError};
use crate::wait::{POLL_INTERVAL, bounded, poll_until, wait_for_any, within};

pub struct FormProvider {
    config: FormConfig,
    success: SuccessMatcher,
}

impl FormProvider {
    pub fn new(config: FormConfig) -> Result<Self, ConfigError> {
        let success = SuccessMatcher::new(&config.success_condition)?;
        Ok(Self { config, success })
    }

    fn callback_timeout(&self) -> Duration {
        self.config
            .success_condition
            .timeout_ms
            .map_or_else(|| self.config.timeout(), Duration::from_millis)
    }

    fn error_candidates(&self) -> &[Locator] {
        match &self.config.error_selector {
            Some(locator) => slice::from_ref(locator),
            None => &[],
        }
    }
}

#[async_trait]
impl AuthProvider for FormProvider {
    fn name(&self) -> &str {
        "form"
    }

    async fn login(
        &self,
        session: &dyn BrowserSession,
        credentials: &Credentials,
    ) -> Result<(), LoginError> {
        let budget = self.config.timeout();

        let phase = AuthPhase::Navigation;
        bounded(phase, budget, session.goto(&self.config.login_url)).await?;
        let username = wait_for_any(
            session,
            slice::from_ref(&self.config.username_selector),
            phase,
            budget,
        )
        .await?;

        let phase = AuthPhase::Credentials;
        let driver = |e: DriverError| LoginError::driver(phase, e);
        within(phase, budget, async {
            session
                .fill(username, &credentials.username)
                .await
                .map_err(driver)?;
            let password = wait_for_any(
                session,
                slice::from_ref(&self.config.password_selector),
                phase,
                budget,
            )
            .await?;
            session
                .fill(password, &credentials.password)
                .await
                .map_err(driver)?;
            session
                .click(&self.config.submit_selector)
                .await
                .map_err(driver)
        })
        .await?;

        let success = &self.success;
        let errors = self.error_candidates();
        let rejection = poll_until(AuthPhase::Callback, self.callback_timeout(), move || async move {
            if success.holds(session).await? {
                return Ok(Some(None));
            }
            Ok(banner_text(session, errors).await?.map(Some))
        })
        .await?;

        match rejection {
            None => {
                tracing::info!("Form login complete");
                Ok(())
            }
            Some(text) => Err(LoginError::new(
                AuthPhase::Credentials,
                "login form rejected the credentials",
            )
            .with_idp_response(text)),
        }
    }

    async fn is_session_valid(&self, session: &dyn BrowserSession) -> Result<bool, LoginError> {
        let phase = AuthPhase::Navigation;
        let budget = self.config.timeout();
        bounded(phase, budget, session.goto(&self.config.login_url)).await?;

        let probe = async {
            loop {
                if self.success.holds(session).await? {
                    return Ok::<bool, DriverError>(true);
                }
                if session.is_visible(&self.config.username_selector).await? {
                    return Ok(false);
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        };
        match tokio::time::timeout(budget, probe).await {
            Ok(result) => result.map_err(|e| LoginError::driver(phase, e)),
            Err(_) => Ok(false),
        }
    }

    async fn logout(&self, session: &dyn BrowserSession) -> Result<(), LoginError> {
        let phase = AuthPhase::Navigation;
        if let Some(url) = &self.config.logout_url {
            bounded(phase, self.config.timeout(), session.goto(url)).await?;
        }
        session
            .clear_session()
            .await
            .map_err(|e| LoginError::driver(phase, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::mock::{MockBrowser, Reaction};
    use crate::config::SuccessCondition;
    use crate::storage_state::Cookie;

    const LOGIN: &str = "https://hr.test/login";
    const DASHBOARD: &str = "https://hr.test/dashboard";

    fn config() -> FormConfig {
        FormConfig {
            login_url: LOGIN.into(),
            username_selector: Locator::css("#email"),
            password_selector: Locator::css("#password"),
            submit_selector: Locator::css("button[type=submit]"),
            success_condition: SuccessCondition {
                url: Some("https://hr.test/dashboard*".into()),
                selector: Some(Locator::css("#user-menu")),
                timeout_ms: None,
            },
            error_selector: Some(Locator::css(".flash-error")),
            logout_url: None,
            timeout_ms: 5_000,
        }
    }

    fn login_page(on_submit: Vec<Reaction>) -> MockBrowser {
        MockBrowser::new()
            .on_goto(
                LOGIN,
                [
                    Reaction::Show(Locator::css("#email")),
                    Reaction::Show(Locator::css("#password")),
                    Reaction::Show(Locator::css("button[type=submit]")),
                ],
            )
            .on_click(Locator::css("button[type=submit]"), on_submit)
            .on_goto(DASHBOARD, [Reaction::Show(Locator::css("#user-menu"))])
    }

    #[tokio::test(start_paused = true)]
    async fn fills_and_submits() {
        let browser = login_page(vec![
            Reaction::SetCookie(Cookie::new("hr_session", "x", "hr.test")),
            Reaction::Navigate(DASHBOARD.into()),
        ]);
        let provider = FormProvider::new(config()).unwrap();
        provider
            .login(&browser, &Credentials::new("bob@hr.test", "pw"))
            .await
            .unwrap();
        assert_eq!(browser.filled(&Locator::css("#email")).as_deref(), Some("bob@hr.test"));
        assert_eq!(browser.url(), DASHBOARD);
    }

    #[tokio::test(start_paused = true)]
    async fn error_selector_fails_credentials() {
        let browser = login_page(vec![Reaction::ShowText(
            Locator::css(".flash-error"),
            "Wrong email or password".into(),
        )]);
        let err = FormProvider::new(config())
            .unwrap()
            .login(&browser, &Credentials::new("bob@hr.test", "nope"))
            .await
            .unwrap_err();
        assert_eq!(err.phase, AuthPhase::Credentials);
        assert_eq!(err.idp_response.as_deref(), Some("Wrong email or password"));
    }

    #[tokio::test(start_paused = true)]
    async fn success_url_without_selector_keeps_waiting() {
        // Dashboard URL but the user menu never renders.
        let browser = MockBrowser::new()
            .on_goto(
                LOGIN,
                [
                    Reaction::Show(Locator::css("#email")),
                    Reaction::Show(Locator::css("#password")),
                    Reaction::Show(Locator::css("button[type=submit]")),
                ],
            )
            .on_click(
                Locator::css("button[type=submit]"),
                [Reaction::Navigate(DASHBOARD.into())],
            );
        let err = FormProvider::new(config())
            .unwrap()
            .login(&browser, &Credentials::new("bob@hr.test", "pw"))
            .await
            .unwrap_err();
        assert_eq!(err, LoginError::timeout(AuthPhase::Callback, Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_form_fails_navigation() {
        let browser = MockBrowser::new();
        let err = FormProvider::new(config())
            .unwrap()
            .login(&browser, &Credentials::new("bob@hr.test", "pw"))
            .await
            .unwrap_err();
        assert_eq!(err.phase, AuthPhase::Navigation);
    }

    enum Fault {
        HangFill,
        RejectClick,
    }

    /// Login page whose driver misbehaves on one action.
    struct FaultyDriver {
        page: MockBrowser,
        fault: Fault,
    }

    #[async_trait]
    impl BrowserSession for FaultyDriver {
        async fn goto(&self, url: &str) -> Result<(), DriverError> {
            self.page.goto(url).await
        }

        async fn current_url(&self) -> Result<String, DriverError> {
            self.page.current_url().await
        }

        async fn is_visible(&self, locator: &Locator) -> Result<bool, DriverError> {
            self.page.is_visible(locator).await
        }

        async fn fill(&self, locator: &Locator, value: &str) -> Result<(), DriverError> {
            match self.fault {
                Fault::HangFill => std::future::pending().await,
                Fault::RejectClick => self.page.fill(locator, value).await,
            }
        }

        async fn click(&self, locator: &Locator) -> Result<(), DriverError> {
            match self.fault {
                Fault::RejectClick => Err(DriverError::ElementNotFound("button[type=submit]".into())),
                Fault::HangFill => self.page.click(locator).await,
            }
        }

        async fn text_content(&self, locator: &Locator) -> Result<Option<String>, DriverError> {
            self.page.text_content(locator).await
        }

        async fn storage_state(&self) -> Result<crate::storage_state::StorageStateRecord, DriverError> {
            self.page.storage_state().await
        }

        async fn set_local_storage(
            &self,
            origin: &str,
            key: &str,
            value: &str,
        ) -> Result<(), DriverError> {
            self.page.set_local_storage(origin, key, value).await
        }

        async fn clear_session(&self) -> Result<(), DriverError> {
            self.page.clear_session().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_fill_times_out_in_credentials_phase() {
        let driver = FaultyDriver {
            page: login_page(vec![Reaction::Navigate(DASHBOARD.into())]),
            fault: Fault::HangFill,
        };
        let started = tokio::time::Instant::now();
        let result = tokio::time::timeout(
            Duration::from_secs(3_600),
            FormProvider::new(config())
                .unwrap()
                .login(&driver, &Credentials::new("bob@hr.test", "pw")),
        )
        .await
        .expect("login must give up within its own budget");

        assert_eq!(
            result.unwrap_err(),
            LoginError::timeout(AuthPhase::Credentials, Duration::from_secs(5))
        );
        assert!(started.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_submit_click_fails_credentials() {
        let driver = FaultyDriver {
            page: login_page(vec![]),
            fault: Fault::RejectClick,
        };
        let err = FormProvider::new(config())
            .unwrap()
            .login(&driver, &Credentials::new("bob@hr.test", "pw"))
            .await
            .unwrap_err();
        assert_eq!(err.phase, AuthPhase::Credentials);
        assert!(err.message.contains("button[type=submit]"));
        assert_eq!(driver.page.filled(&Locator::css("#password")).as_deref(), Some("pw"));
    }

    #[tokio::test(start_paused = true)]
    async fn session_validity() {
        let provider = FormProvider::new(config()).unwrap();
        let logged_out = login_page(vec![]);
        assert!(!provider.is_session_valid(&logged_out).await.unwrap());

        let logged_in = MockBrowser::new()
            .on_goto(LOGIN, [Reaction::Navigate(DASHBOARD.into())])
            .on_goto(DASHBOARD, [Reaction::Show(Locator::css("#user-menu"))]);
        assert!(provider.is_session_valid(&logged_in).await.unwrap());
    }
}
