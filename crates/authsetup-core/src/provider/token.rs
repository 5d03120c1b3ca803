//! API credential exchange.
//!
//! POSTs the credentials as a form to `tokenUrl`, reads the token out of the
//! JSON response and writes it into the app origin's local storage, which is
//! what the storage-state record then carries.

use async_trait::async_trait;
use reqwest::Client;

use super::AuthProvider;
use crate::browser::BrowserSession;
use crate::config::TokenConfig;
use crate::credentials::Credentials;
use crate::error::{AuthPhase, ConfigError, LoginError};

pub struct TokenProvider {
    config: TokenConfig,
    client: Client,
}

impl TokenProvider {
    pub fn new(config: TokenConfig) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| ConfigError::invalid("auth.token", format!("HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    async fn exchange(&self, credentials: &Credentials) -> Result<String, LoginError> {
        let cfg = &self.config;
        let mut form: Vec<(&str, &str)> = vec![
            (cfg.username_field.as_str(), credentials.username.as_str()),
            (cfg.password_field.as_str(), credentials.password.as_str()),
        ];
        form.extend(cfg.extra_params.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let response = self
            .client
            .post(&cfg.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                let what = if e.is_timeout() { "timed out" } else { "failed" };
                LoginError::new(
                    AuthPhase::Navigation,
                    format!("token request {what}: {}", e.without_url()),
                )
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            LoginError::new(AuthPhase::Callback, format!("reading token response: {e}"))
        })?;

        if !status.is_success() {
            tracing::debug!(status = status.as_u16(), "Token endpoint rejected the credentials");
            return Err(LoginError::new(
                AuthPhase::Credentials,
                format!("token endpoint returned {status}"),
            )
            .with_idp_response(&body));
        }

        let json: serde_json::Value = serde_json::from_str(&body).map_err(|e| {
            LoginError::new(AuthPhase::Callback, format!("token response is not JSON: {e}"))
                .with_idp_response(&body)
        })?;
        match json.get(&cfg.token_field).and_then(serde_json::Value::as_str) {
            Some(token) if !token.is_empty() => Ok(token.to_string()),
            _ => Err(LoginError::new(
                AuthPhase::Callback,
                format!("token response has no '{}' string field", cfg.token_field),
            )),
        }
    }
}

#[async_trait]
impl AuthProvider for TokenProvider {
    fn name(&self) -> &str {
        "token"
    }

    async fn login(
        &self,
        session: &dyn BrowserSession,
        credentials: &Credentials,
    ) -> Result<(), LoginError> {
        let token = self.exchange(credentials).await?;
        session
            .set_local_storage(&self.config.app_origin, &self.config.storage_key, &token)
            .await
            .map_err(|e| LoginError::driver(AuthPhase::Callback, e))?;
        tracing::info!(origin = %self.config.app_origin, "Token stored in local storage");
        Ok(())
    }

    async fn is_session_valid(&self, session: &dyn BrowserSession) -> Result<bool, LoginError> {
        let record = session
            .storage_state()
            .await
            .map_err(|e| LoginError::driver(AuthPhase::Callback, e))?;
        Ok(record
            .local_storage(&self.config.app_origin, &self.config.storage_key)
            .is_some_and(|token| !token.is_empty()))
    }

    async fn logout(&self, session: &dyn BrowserSession) -> Result<(), LoginError> {
        session
            .clear_session()
            .await
            .map_err(|e| LoginError::driver(AuthPhase::Navigation, e))
    }
}
