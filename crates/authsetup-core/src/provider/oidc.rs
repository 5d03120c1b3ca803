//! OIDC login flow engine.
//!
//! Drives an identity provider's login UI through four ordered phases:
//!
//! ```text
//! navigation ─ goto(idpLoginUrl | loginUrl), wait for the username field
//!     │          └─ success condition already holds → done (IdP session alive)
//! credentials ─ username [→ next → wait for password] → password → submit
//!     │
//! mfa ───────── only if mfa.enabled
//!     │          ├─ success / stay-signed-in prompt → skipped (remembered device)
//!     │          ├─ totp: fill code, submit, wait for acceptance
//!     │          └─ push | sms: wait for approval, no input
//! callback ──── dismiss "stay signed in?" with No, wait for the success condition
//! ```
//!
//! Each phase has its own budget, capped by what is left of `loginFlowMs`.
//! An IdP error banner after the password was submitted ends the flow in the
//! `credentials` phase with the banner text as `idp_response`.

use std::time::Instant;

use async_trait::async_trait;

use super::{AuthProvider, SuccessMatcher, any_visible, banner_text};
use crate::browser::{BrowserSession, Locator};
use crate::config::{MfaConfig, MfaType, OidcConfig};
use crate::credentials::Credentials;
use crate::error::{AuthPhase, ConfigError, DriverError, LoginError};
use crate::idp::IdpSelectors;
use crate::totp::TotpGenerator;
use crate::wait::{Deadline, POLL_INTERVAL, bounded, first_visible, poll_until, wait_for_any, within};

/// Where navigation landed.
enum Landing {
    LoginForm,
    SignedIn,
}

/// What the page showed after the username step.
enum UsernameStep {
    Password,
    Rejected(String),
}

/// What the page showed when MFA was expected.
enum MfaPrompt {
    Skipped,
    Code(Locator),
    Rejected { text: String, on_password_page: bool },
}

pub struct OidcProvider {
    config: OidcConfig,
    selectors: IdpSelectors,
    success: SuccessMatcher,
    totp: Option<TotpGenerator>,
}

impl OidcProvider {
    /// `totp` is required when TOTP MFA is enabled.
    pub fn new(
        config: OidcConfig,
        selectors: IdpSelectors,
        totp: Option<TotpGenerator>,
    ) -> Result<Self, ConfigError> {
        let success = SuccessMatcher::new(&config.success_condition)?;
        if config
            .active_mfa()
            .is_some_and(|mfa| mfa.mfa_type == MfaType::Totp)
            && totp.is_none()
        {
            return Err(ConfigError::invalid(
                "auth.oidc.mfa",
                "TOTP MFA is enabled but no secret was provided",
            ));
        }
        if let Ok(Some(pattern)) = config.success_condition.url_pattern() {
            if pattern.matches(&config.login_url) && config.success_condition.selector.is_none() {
                tracing::warn!(
                    pattern = %pattern,
                    "successCondition.url also matches loginUrl; add a selector to avoid false positives"
                );
            }
        }
        Ok(Self {
            config,
            selectors,
            success,
            totp,
        })
    }

    #[must_use]
    pub fn selectors(&self) -> &IdpSelectors {
        &self.selectors
    }

    async fn navigate(
        &self,
        session: &dyn BrowserSession,
        deadline: &Deadline,
    ) -> Result<Landing, LoginError> {
        let phase = AuthPhase::Navigation;
        let budget = deadline.budget(self.config.timeouts.idp_redirect());
        let entry = self
            .config
            .idp_login_url
            .as_deref()
            .unwrap_or(&self.config.login_url);
        let success = &self.success;
        let username = self.selectors.username.as_slice();

        within(phase, budget, async {
            session
                .goto(entry)
                .await
                .map_err(|e| LoginError::driver(phase, e))?;
            poll_until(phase, budget, move || async move {
                if success.holds(session).await? {
                    return Ok(Some(Landing::SignedIn));
                }
                if any_visible(session, username).await? {
                    return Ok(Some(Landing::LoginForm));
                }
                Ok(None)
            })
            .await
        })
        .await
    }

    async fn submit_credentials(
        &self,
        session: &dyn BrowserSession,
        credentials: &Credentials,
        deadline: &Deadline,
    ) -> Result<(), LoginError> {
        let phase = AuthPhase::Credentials;
        let budget = deadline.budget(self.config.timeouts.credentials());
        let sel = &self.selectors;
        let driver = |e: DriverError| LoginError::driver(phase, e);

        within(phase, budget, async {
            let username = wait_for_any(session, &sel.username, phase, budget).await?;
            session
                .fill(username, &credentials.username)
                .await
                .map_err(driver)?;

            if sel.is_two_step() && !any_visible(session, &sel.password).await.map_err(driver)? {
                let next = wait_for_any(session, &sel.username_next, phase, budget).await?;
                session.click(next).await.map_err(driver)?;

                let errors = sel.error_message.as_slice();
                let password = sel.password.as_slice();
                let step = poll_until(phase, budget, move || async move {
                    if let Some(text) = banner_text(session, errors).await? {
                        return Ok(Some(UsernameStep::Rejected(text)));
                    }
                    if any_visible(session, password).await? {
                        return Ok(Some(UsernameStep::Password));
                    }
                    Ok(None)
                })
                .await?;
                if let UsernameStep::Rejected(text) = step {
                    return Err(LoginError::new(phase, "identity provider rejected the username")
                        .with_idp_response(text));
                }
            }

            let password = wait_for_any(session, &sel.password, phase, budget).await?;
            session
                .fill(password, &credentials.password)
                .await
                .map_err(driver)?;
            let submit = wait_for_any(session, &sel.submit, phase, budget).await?;
            session.click(submit).await.map_err(driver)?;
            Ok(())
        })
        .await
    }

    async fn complete_mfa(
        &self,
        session: &dyn BrowserSession,
        mfa: &MfaConfig,
        deadline: &Deadline,
    ) -> Result<(), LoginError> {
        let phase = AuthPhase::Mfa;
        let budget = deadline.budget(mfa.timeout());
        let sel = &self.selectors;
        let success = &self.success;
        let errors = sel.error_message.as_slice();
        let password = sel.password.as_slice();
        let stay = sel.stay_signed_in_no.as_slice();
        let mfa_input = sel.mfa_input.as_slice();
        let mfa_type = mfa.mfa_type;

        within(phase, budget, async {
            let prompt = poll_until(phase, budget, move || async move {
                if success.holds(session).await? || any_visible(session, stay).await? {
                    return Ok(Some(MfaPrompt::Skipped));
                }
                if let Some(text) = banner_text(session, errors).await? {
                    let on_password_page = any_visible(session, password).await?;
                    return Ok(Some(MfaPrompt::Rejected {
                        text,
                        on_password_page,
                    }));
                }
                if mfa_type == MfaType::Totp {
                    if let Some(input) = first_visible(session, mfa_input).await? {
                        return Ok(Some(MfaPrompt::Code(input.clone())));
                    }
                }
                // push / sms: approval happens elsewhere; keep waiting.
                Ok(None)
            })
            .await?;

            match prompt {
                MfaPrompt::Skipped => {
                    tracing::debug!("No MFA challenge shown");
                    Ok(())
                }
                MfaPrompt::Rejected {
                    text,
                    on_password_page: true,
                } => Err(LoginError::new(
                    AuthPhase::Credentials,
                    "identity provider rejected the credentials",
                )
                .with_idp_response(text)),
                MfaPrompt::Rejected { text, .. } => Err(LoginError::new(
                    phase,
                    "identity provider rejected the MFA step",
                )
                .with_idp_response(text)),
                MfaPrompt::Code(input) => self.submit_code(session, &input, budget).await,
            }
        })
        .await
    }

    async fn submit_code(
        &self,
        session: &dyn BrowserSession,
        input: &Locator,
        budget: std::time::Duration,
    ) -> Result<(), LoginError> {
        let phase = AuthPhase::Mfa;
        let driver = |e: DriverError| LoginError::driver(phase, e);
        let totp = self
            .totp
            .as_ref()
            .ok_or_else(|| LoginError::new(phase, "TOTP prompt shown but no secret is configured"))?;

        session
            .fill(input, &totp.current_code())
            .await
            .map_err(driver)?;
        if let Some(submit) = first_visible(session, &self.selectors.mfa_submit)
            .await
            .map_err(driver)?
        {
            session.click(submit).await.map_err(driver)?;
        }

        let success = &self.success;
        let errors = self.selectors.error_message.as_slice();
        let stay = self.selectors.stay_signed_in_no.as_slice();
        let mfa_input = self.selectors.mfa_input.as_slice();
        let rejection = poll_until(phase, budget, move || async move {
            if let Some(text) = banner_text(session, errors).await? {
                return Ok(Some(Some(text)));
            }
            if success.holds(session).await?
                || any_visible(session, stay).await?
                || !any_visible(session, mfa_input).await?
            {
                return Ok(Some(None));
            }
            Ok(None)
        })
        .await?;

        match rejection {
            None => Ok(()),
            Some(text) => Err(LoginError::new(phase, "identity provider rejected the one-time code")
                .with_idp_response(text)),
        }
    }

    async fn await_callback(
        &self,
        session: &dyn BrowserSession,
        deadline: &Deadline,
    ) -> Result<(), LoginError> {
        let phase = AuthPhase::Callback;
        let budget = deadline.budget(self.config.callback_timeout());
        let success = &self.success;
        let errors = self.selectors.error_message.as_slice();
        let stay = self.selectors.stay_signed_in_no.as_slice();

        let rejection = within(
            phase,
            budget,
            poll_until(phase, budget, move || async move {
                if success.holds(session).await? {
                    return Ok(Some(None));
                }
                if let Some(text) = banner_text(session, errors).await? {
                    return Ok(Some(Some(text)));
                }
                if let Some(no) = first_visible(session, stay).await? {
                    tracing::debug!("Declining stay-signed-in prompt");
                    session.click(no).await?;
                }
                Ok(None)
            }),
        )
        .await?;

        match rejection {
            None => Ok(()),
            Some(text) => Err(LoginError::new(
                AuthPhase::Credentials,
                "identity provider rejected the credentials",
            )
            .with_idp_response(text)),
        }
    }
}

#[async_trait]
impl AuthProvider for OidcProvider {
    fn name(&self) -> &str {
        "oidc"
    }

    async fn login(
        &self,
        session: &dyn BrowserSession,
        credentials: &Credentials,
    ) -> Result<(), LoginError> {
        let started = Instant::now();
        let deadline = Deadline::after(self.config.timeouts.login_flow());
        tracing::debug!(idp_type = %self.config.idp_type, "Starting OIDC login");

        if let Landing::SignedIn = self.navigate(session, &deadline).await? {
            tracing::info!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Identity provider session still active; skipped credentials"
            );
            return Ok(());
        }
        tracing::debug!(phase = %AuthPhase::Navigation, elapsed_ms = started.elapsed().as_millis() as u64, "Phase complete");

        self.submit_credentials(session, credentials, &deadline).await?;
        tracing::debug!(phase = %AuthPhase::Credentials, elapsed_ms = started.elapsed().as_millis() as u64, "Phase complete");

        if let Some(mfa) = self.config.active_mfa() {
            self.complete_mfa(session, mfa, &deadline).await?;
            tracing::debug!(phase = %AuthPhase::Mfa, elapsed_ms = started.elapsed().as_millis() as u64, "Phase complete");
        }

        self.await_callback(session, &deadline).await?;
        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "OIDC login complete"
        );
        Ok(())
    }

    async fn is_session_valid(&self, session: &dyn BrowserSession) -> Result<bool, LoginError> {
        let phase = AuthPhase::Navigation;
        let budget = self.config.timeouts.idp_redirect();
        bounded(phase, budget, session.goto(&self.config.login_url)).await?;

        let probe = async {
            loop {
                if self.success.holds(session).await? {
                    return Ok::<bool, DriverError>(true);
                }
                if any_visible(session, &self.selectors.username).await? {
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
            bounded(phase, self.config.timeouts.idp_redirect(), session.goto(url)).await?;
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
    use crate::config::{OidcTimeouts, SuccessCondition};
    use crate::idp::IdpRegistry;
    use crate::storage_state::Cookie;
    use std::time::Duration;

    const APP_LOGIN: &str = "https://app.test/login";
    const APP_HOME: &str = "https://app.test/home";
    const KC_AUTH: &str = "https://sso.test/realms/qa/auth";
    const RFC_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    fn config(idp: &str, mfa: Option<MfaConfig>) -> OidcConfig {
        OidcConfig {
            idp_type: idp.into(),
            login_url: APP_LOGIN.into(),
            success_condition: SuccessCondition {
                url: Some(APP_HOME.into()),
                ..SuccessCondition::default()
            },
            mfa,
            ..OidcConfig::default()
        }
    }

    fn provider(config: OidcConfig) -> OidcProvider {
        let selectors = IdpRegistry::with_builtins()
            .selectors_for(&config.idp_type, &config.selectors)
            .unwrap();
        let totp = config
            .active_mfa()
            .filter(|m| m.mfa_type == MfaType::Totp)
            .map(|_| TotpGenerator::from_base32(RFC_SECRET).unwrap());
        OidcProvider::new(config, selectors, totp).unwrap()
    }

    fn creds() -> Credentials {
        Credentials::new("alice", "correct-horse")
    }

    fn session_cookie() -> Reaction {
        Reaction::SetCookie(Cookie::new("SESSION", "s1", "app.test").http_only())
    }

    /// Keycloak login page; `on_submit` is what the IdP does with the form.
    fn keycloak(on_submit: Vec<Reaction>) -> MockBrowser {
        MockBrowser::new()
            .on_goto(APP_LOGIN, [Reaction::Navigate(KC_AUTH.into())])
            .on_goto(
                KC_AUTH,
                [
                    Reaction::Show(Locator::css("#username")),
                    Reaction::Show(Locator::css("#password")),
                    Reaction::Show(Locator::css("#kc-login")),
                ],
            )
            .on_click(Locator::css("#kc-login"), on_submit)
    }

    #[tokio::test(start_paused = true)]
    async fn keycloak_happy_path() {
        let browser = keycloak(vec![session_cookie(), Reaction::Navigate(APP_HOME.into())]);
        provider(config("keycloak", None))
            .login(&browser, &creds())
            .await
            .unwrap();

        assert_eq!(browser.url(), APP_HOME);
        assert_eq!(browser.filled(&Locator::css("#username")).as_deref(), Some("alice"));
        assert_eq!(
            browser.filled(&Locator::css("#password")).as_deref(),
            Some("correct-horse")
        );
        assert_eq!(browser.navigations(), vec![APP_LOGIN.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn idp_login_url_skips_app_redirect() {
        let browser = keycloak(vec![Reaction::Navigate(APP_HOME.into())]);
        let mut cfg = config("keycloak", None);
        cfg.idp_login_url = Some(KC_AUTH.into());
        provider(cfg).login(&browser, &creds()).await.unwrap();
        assert_eq!(browser.navigations(), vec![KC_AUTH.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn active_idp_session_skips_credentials() {
        let browser = MockBrowser::new().on_goto(APP_LOGIN, [Reaction::Navigate(APP_HOME.into())]);
        provider(config("keycloak", None))
            .login(&browser, &creds())
            .await
            .unwrap();
        assert!(browser.clicks().is_empty());
        assert!(browser.filled(&Locator::css("#username")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_navigation_fails_in_navigation_phase() {
        let browser = MockBrowser::new().hang_on_goto(APP_LOGIN);
        let err = provider(config("keycloak", None))
            .login(&browser, &creds())
            .await
            .unwrap_err();
        assert_eq!(err.phase, AuthPhase::Navigation);
        assert!(err.message.contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn redirect_that_never_lands_fails_in_navigation_phase() {
        let browser = MockBrowser::new().on_goto(APP_LOGIN, [Reaction::Navigate(KC_AUTH.into())]);
        let err = provider(config("keycloak", None))
            .login(&browser, &creds())
            .await
            .unwrap_err();
        assert_eq!(err.phase, AuthPhase::Navigation);
    }

    #[tokio::test(start_paused = true)]
    async fn login_flow_budget_caps_phases() {
        let browser = MockBrowser::new().hang_on_goto(APP_LOGIN);
        let mut cfg = config("keycloak", None);
        cfg.timeouts = OidcTimeouts {
            login_flow_ms: 1_000,
            ..OidcTimeouts::default()
        };
        let err = provider(cfg).login(&browser, &creds()).await.unwrap_err();
        assert_eq!(err, LoginError::timeout(AuthPhase::Navigation, Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn error_banner_fails_credentials_with_idp_response() {
        let browser = keycloak(vec![Reaction::ShowText(
            Locator::css("#input-error"),
            "Invalid username or password.".into(),
        )]);
        let err = provider(config("keycloak", None))
            .login(&browser, &creds())
            .await
            .unwrap_err();
        assert_eq!(err.phase, AuthPhase::Credentials);
        assert_eq!(err.idp_response.as_deref(), Some("Invalid username or password."));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_submit_button_fails_credentials() {
        let browser = MockBrowser::new()
            .on_goto(APP_LOGIN, [Reaction::Show(Locator::css("#username")), Reaction::Show(Locator::css("#password"))]);
        let err = provider(config("keycloak", None))
            .login(&browser, &creds())
            .await
            .unwrap_err();
        assert_eq!(err.phase, AuthPhase::Credentials);
    }

    #[tokio::test(start_paused = true)]
    async fn callback_mismatch_fails_callback() {
        let browser = keycloak(vec![Reaction::Navigate("https://app.test/onboarding".into())]);
        let err = provider(config("keycloak", None))
            .login(&browser, &creds())
            .await
            .unwrap_err();
        assert_eq!(err.phase, AuthPhase::Callback);
    }

    fn azure() -> MockBrowser {
        const MS_LOGIN: &str = "https://login.microsoftonline.test/authorize";
        const MS_PASSWORD: &str = "https://login.microsoftonline.test/password";
        const MS_KMSI: &str = "https://login.microsoftonline.test/kmsi";
        let next = Locator::role("button", "Next");
        let sign_in = Locator::role("button", "Sign in");
        let no = Locator::role("button", "No");
        MockBrowser::new()
            .on_goto(APP_LOGIN, [Reaction::Navigate(MS_LOGIN.into())])
            .on_goto(
                MS_LOGIN,
                [
                    Reaction::Show(Locator::css("input[name='loginfmt']")),
                    Reaction::Show(next.clone()),
                ],
            )
            .on_click(next, [Reaction::Navigate(MS_PASSWORD.into())])
            .on_goto(
                MS_PASSWORD,
                [
                    Reaction::Show(Locator::css("input[name='passwd']")),
                    Reaction::Show(sign_in.clone()),
                ],
            )
            .on_click(sign_in, [Reaction::Navigate(MS_KMSI.into())])
            .on_goto(MS_KMSI, [Reaction::Show(no.clone())])
            .on_click(no, [session_cookie(), Reaction::Navigate(APP_HOME.into())])
    }

    #[tokio::test(start_paused = true)]
    async fn azure_two_step_and_stay_signed_in() {
        let browser = azure();
        provider(config("azure-ad", None))
            .login(&browser, &creds())
            .await
            .unwrap();
        assert_eq!(browser.url(), APP_HOME);
        assert_eq!(
            browser.clicks(),
            vec![
                Locator::role("button", "Next"),
                Locator::role("button", "Sign in"),
                Locator::role("button", "No"),
            ]
        );
        assert_eq!(
            browser.filled(&Locator::css("input[name='passwd']")).as_deref(),
            Some("correct-horse")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn azure_unknown_user_is_rejected_after_next() {
        let browser = MockBrowser::new()
            .on_goto(
                APP_LOGIN,
                [
                    Reaction::Show(Locator::css("input[name='loginfmt']")),
                    Reaction::Show(Locator::css("#idSIButton9")),
                ],
            )
            .on_click(
                Locator::css("#idSIButton9"),
                [Reaction::ShowText(
                    Locator::css("#usernameError"),
                    "This username may be incorrect.".into(),
                )],
            );
        let err = provider(config("azure-ad", None))
            .login(&browser, &creds())
            .await
            .unwrap_err();
        assert_eq!(err.phase, AuthPhase::Credentials);
        assert!(err.idp_response.unwrap().contains("username may be incorrect"));
    }

    fn keycloak_with_otp(on_code: Vec<Reaction>) -> MockBrowser {
        keycloak(vec![
            Reaction::Hide(Locator::css("#username")),
            Reaction::Hide(Locator::css("#password")),
            Reaction::Show(Locator::css("#otp")),
        ])
        .on_fill(Locator::css("#otp"), on_code)
    }

    #[tokio::test(start_paused = true)]
    async fn totp_code_is_generated_and_submitted() {
        let browser = keycloak_with_otp(vec![
            Reaction::Hide(Locator::css("#otp")),
            session_cookie(),
            Reaction::Navigate(APP_HOME.into()),
        ]);
        provider(config("keycloak", Some(MfaConfig::default())))
            .login(&browser, &creds())
            .await
            .unwrap();

        let code = browser.filled(&Locator::css("#otp")).unwrap();
        let totp = TotpGenerator::from_base32(RFC_SECRET).unwrap();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        assert!(code == totp.code_at(now) || code == totp.code_at(now - 30));
        assert_eq!(browser.url(), APP_HOME);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_code_fails_in_mfa_phase() {
        let browser = keycloak_with_otp(vec![Reaction::ShowText(
            Locator::css("#input-error"),
            "Invalid authenticator code.".into(),
        )]);
        let err = provider(config("keycloak", Some(MfaConfig::default())))
            .login(&browser, &creds())
            .await
            .unwrap_err();
        assert_eq!(err.phase, AuthPhase::Mfa);
        assert_eq!(err.idp_response.as_deref(), Some("Invalid authenticator code."));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_mfa_prompt_times_out_in_mfa_phase() {
        let browser = keycloak(vec![
            Reaction::Hide(Locator::css("#username")),
            Reaction::Hide(Locator::css("#password")),
        ]);
        let err = provider(config("keycloak", Some(MfaConfig::default())))
            .login(&browser, &creds())
            .await
            .unwrap_err();
        assert_eq!(err.phase, AuthPhase::Mfa);
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_password_with_mfa_enabled_is_credentials() {
        let browser = keycloak(vec![Reaction::ShowText(
            Locator::css("#input-error"),
            "Invalid username or password.".into(),
        )]);
        let err = provider(config("keycloak", Some(MfaConfig::default())))
            .login(&browser, &creds())
            .await
            .unwrap_err();
        assert_eq!(err.phase, AuthPhase::Credentials);
    }

    #[tokio::test(start_paused = true)]
    async fn remembered_device_skips_mfa() {
        let browser = keycloak(vec![Reaction::Navigate(APP_HOME.into())]);
        provider(config("keycloak", Some(MfaConfig::default())))
            .login(&browser, &creds())
            .await
            .unwrap();
        assert!(browser.filled(&Locator::css("#otp")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn push_mfa_waits_for_approval() {
        let browser = keycloak(vec![
            Reaction::Hide(Locator::css("#username")),
            Reaction::Hide(Locator::css("#password")),
            Reaction::Show(Locator::text("Check your phone")),
        ])
        .on_goto("https://sso.test/approved", [Reaction::Navigate(APP_HOME.into())]);
        let provider = provider(config(
            "keycloak",
            Some(MfaConfig {
                mfa_type: MfaType::Push,
                ..MfaConfig::default()
            }),
        ));

        let creds = creds();
        let (result, ()) = tokio::join!(provider.login(&browser, &creds), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            // The user approves on their phone and the IdP redirects.
            browser.goto("https://sso.test/approved").await.unwrap();
        });
        result.unwrap();
        assert_eq!(browser.url(), APP_HOME);
    }

    #[tokio::test(start_paused = true)]
    async fn unapproved_push_times_out_in_mfa_phase() {
        let browser = keycloak(vec![Reaction::Show(Locator::text("Check your phone"))]);
        let err = provider(config(
            "keycloak",
            Some(MfaConfig {
                mfa_type: MfaType::Sms,
                timeout_ms: 3_000,
                ..MfaConfig::default()
            }),
        ))
        .login(&browser, &creds())
        .await
        .unwrap_err();
        assert_eq!(err, LoginError::timeout(AuthPhase::Mfa, Duration::from_secs(3)));
    }

    #[test]
    fn totp_mfa_without_generator_is_rejected() {
        let cfg = config("keycloak", Some(MfaConfig::default()));
        let selectors = IdpRegistry::with_builtins()
            .selectors_for("keycloak", &cfg.selectors)
            .unwrap();
        assert!(OidcProvider::new(cfg, selectors, None).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn session_validity_follows_landing_page() {
        let p = provider(config("keycloak", None));

        let logged_in = MockBrowser::new().on_goto(APP_LOGIN, [Reaction::Navigate(APP_HOME.into())]);
        assert!(p.is_session_valid(&logged_in).await.unwrap());

        let logged_out = keycloak(vec![]);
        assert!(!p.is_session_valid(&logged_out).await.unwrap());

        let blank = MockBrowser::new();
        assert!(!p.is_session_valid(&blank).await.unwrap());
    }

    #[tokio::test]
    async fn logout_visits_logout_url_and_clears() {
        let mut cfg = config("keycloak", None);
        cfg.logout_url = Some("https://sso.test/logout".into());
        let browser = MockBrowser::new();
        provider(cfg).logout(&browser).await.unwrap();
        assert_eq!(browser.navigations(), vec!["https://sso.test/logout".to_string()]);
        assert_eq!(browser.clear_count(), 1);
    }
}
