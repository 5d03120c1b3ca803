//! Identity-provider adapters.
//!
//! An adapter knows where a given IdP puts its login form fields. The
//! registry maps `idpType` to an adapter and falls back to `generic`, which
//! has no built-in selectors and relies entirely on config overrides.
//!
//! Candidates within each list are tried in order. Label and role lookups
//! come before CSS because they survive markup changes better.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::browser::Locator;
use crate::config::SelectorOverrides;
use crate::error::ConfigError;

/// Where an IdP's login form lives on the page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdpSelectors {
    pub username: Vec<Locator>,
    pub password: Vec<Locator>,
    pub submit: Vec<Locator>,
    /// "Next" after the username on two-step IdPs. Empty on single-page forms.
    pub username_next: Vec<Locator>,
    /// Dismisses a "stay signed in?" prompt with "No".
    pub stay_signed_in_no: Vec<Locator>,
    pub error_message: Vec<Locator>,
    pub mfa_input: Vec<Locator>,
    pub mfa_submit: Vec<Locator>,
}

impl IdpSelectors {
    /// Config overrides first, built-ins after as fallback.
    #[must_use]
    pub fn with_overrides(mut self, overrides: &SelectorOverrides) -> Self {
        fn merge(ours: &mut Vec<Locator>, theirs: &[Locator]) {
            let mut merged = theirs.to_vec();
            merged.extend(ours.drain(..).filter(|l| !theirs.contains(l)));
            *ours = merged;
        }
        merge(&mut self.username, &overrides.username);
        merge(&mut self.password, &overrides.password);
        merge(&mut self.submit, &overrides.submit);
        merge(&mut self.username_next, &overrides.username_next);
        merge(&mut self.stay_signed_in_no, &overrides.stay_signed_in_no);
        merge(&mut self.error_message, &overrides.error_message);
        merge(&mut self.mfa_input, &overrides.mfa_input);
        merge(&mut self.mfa_submit, &overrides.mfa_submit);
        self
    }

    #[must_use]
    pub fn is_two_step(&self) -> bool {
        !self.username_next.is_empty()
    }

    /// Username, password and submit are all required to log in.
    pub fn ensure_complete(&self, idp: &str) -> Result<(), ConfigError> {
        let missing: Vec<&str> = [
            ("username", self.username.is_empty()),
            ("password", self.password.is_empty()),
            ("submit", self.submit.is_empty()),
        ]
        .into_iter()
        .filter_map(|(name, empty)| empty.then_some(name))
        .collect();
        if missing.is_empty() {
            return Ok(());
        }
        Err(ConfigError::invalid(
            "auth.oidc.selectors",
            format!(
                "idpType '{idp}' needs selectors for: {}",
                missing.join(", ")
            ),
        ))
    }
}

/// A login-page flavor.
pub trait IdpAdapter: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Built-in selectors, before config overrides.
    fn selectors(&self) -> IdpSelectors;
}

/// Keycloak login theme.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeycloakAdapter;

impl IdpAdapter for KeycloakAdapter {
    fn name(&self) -> &str {
        "keycloak"
    }

    fn selectors(&self) -> IdpSelectors {
        IdpSelectors {
            username: vec![
                Locator::label("Username or email"),
                Locator::css("#username"),
                Locator::css("input[name='username']"),
            ],
            password: vec![
                Locator::label("Password"),
                Locator::css("#password"),
                Locator::css("input[name='password']"),
            ],
            submit: vec![Locator::role("button", "Sign In"), Locator::css("#kc-login")],
            username_next: Vec::new(),
            stay_signed_in_no: Vec::new(),
            error_message: vec![
                Locator::css("#input-error"),
                Locator::css("#kc-error-message"),
                Locator::css(".alert-error"),
            ],
            mfa_input: vec![Locator::css("#otp"), Locator::css("input[name='otp']")],
            mfa_submit: vec![Locator::css("#kc-login")],
        }
    }
}

/// Microsoft Entra ID (Azure AD). Two-step, with a "Stay signed in?" prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct AzureAdAdapter;

impl IdpAdapter for AzureAdAdapter {
    fn name(&self) -> &str {
        "azure-ad"
    }

    fn selectors(&self) -> IdpSelectors {
        IdpSelectors {
            username: vec![
                Locator::role("textbox", "Enter your email, phone, or Skype."),
                Locator::css("input[name='loginfmt']"),
            ],
            password: vec![
                Locator::role("textbox", "Enter the password for your account."),
                Locator::css("input[name='passwd']"),
            ],
            submit: vec![Locator::role("button", "Sign in"), Locator::css("#idSIButton9")],
            username_next: vec![Locator::role("button", "Next"), Locator::css("#idSIButton9")],
            stay_signed_in_no: vec![Locator::role("button", "No"), Locator::css("#idBtn_Back")],
            error_message: vec![
                Locator::css("#usernameError"),
                Locator::css("#passwordError"),
                Locator::css("#idTD_Error"),
            ],
            mfa_input: vec![
                Locator::css("input[name='otc']"),
                Locator::css("#idTxtBx_SAOTCC_OTC"),
            ],
            mfa_submit: vec![
                Locator::role("button", "Verify"),
                Locator::css("#idSubmit_SAOTCC_Continue"),
            ],
        }
    }
}

/// Okta sign-in widget. Handles both the classic single page and the
/// identifier-first flow.
#[derive(Debug, Clone, Copy, Default)]
pub struct OktaAdapter;

impl IdpAdapter for OktaAdapter {
    fn name(&self) -> &str {
        "okta"
    }

    fn selectors(&self) -> IdpSelectors {
        IdpSelectors {
            username: vec![
                Locator::label("Username"),
                Locator::css("input[name='identifier']"),
                Locator::css("#okta-signin-username"),
            ],
            password: vec![
                Locator::label("Password"),
                Locator::css("input[name='credentials.passcode']"),
                Locator::css("#okta-signin-password"),
            ],
            submit: vec![
                Locator::role("button", "Verify"),
                Locator::role("button", "Sign in"),
                Locator::css("#okta-signin-submit"),
            ],
            username_next: vec![
                Locator::role("button", "Next"),
                Locator::css("input[type='submit'][value='Next']"),
            ],
            stay_signed_in_no: Vec::new(),
            error_message: vec![
                Locator::css(".o-form-error-container"),
                Locator::css(".okta-form-infobox-error"),
            ],
            mfa_input: vec![
                Locator::label("Enter code"),
                Locator::css("input[name='credentials.passcode']"),
                Locator::css("input[name='answer']"),
            ],
            mfa_submit: vec![
                Locator::role("button", "Verify"),
                Locator::css("input[type='submit']"),
            ],
        }
    }
}

/// No built-ins; config overrides supply everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericAdapter;

impl IdpAdapter for GenericAdapter {
    fn name(&self) -> &str {
        "generic"
    }

    fn selectors(&self) -> IdpSelectors {
        IdpSelectors::default()
    }
}

/// `idpType` to adapter, with a `generic` fallback.
#[derive(Debug, Clone)]
pub struct IdpRegistry {
    adapters: HashMap<String, Arc<dyn IdpAdapter>>,
    generic: Arc<dyn IdpAdapter>,
}

impl Default for IdpRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl IdpRegistry {
    /// Only the generic fallback.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            adapters: HashMap::new(),
            generic: Arc::new(GenericAdapter),
        }
    }

    /// keycloak, azure-ad (also `azure`, `entra`), okta, generic.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("keycloak", Arc::new(KeycloakAdapter));
        let azure: Arc<dyn IdpAdapter> = Arc::new(AzureAdAdapter);
        registry.register("azure-ad", Arc::clone(&azure));
        registry.register("azure", Arc::clone(&azure));
        registry.register("entra", azure);
        registry.register("okta", Arc::new(OktaAdapter));
        registry
    }

    /// Add or replace the adapter for `idp_type` (case-insensitive).
    pub fn register(&mut self, idp_type: &str, adapter: Arc<dyn IdpAdapter>) {
        self.adapters.insert(idp_type.to_ascii_lowercase(), adapter);
    }

    /// Adapter for `idp_type`; unknown types get `generic`.
    #[must_use]
    pub fn resolve(&self, idp_type: &str) -> Arc<dyn IdpAdapter> {
        let key = idp_type.trim().to_ascii_lowercase();
        if key == "generic" {
            return Arc::clone(&self.generic);
        }
        self.adapters.get(&key).map_or_else(
            || {
                tracing::warn!(idp_type, "No adapter for idpType; using generic selectors");
                Arc::clone(&self.generic)
            },
            Arc::clone,
        )
    }

    /// Merged, complete selectors for `idp_type`.
    pub fn selectors_for(
        &self,
        idp_type: &str,
        overrides: &SelectorOverrides,
    ) -> Result<IdpSelectors, ConfigError> {
        let adapter = self.resolve(idp_type);
        let selectors = adapter.selectors().with_overrides(overrides);
        selectors.ensure_complete(idp_type)?;
        Ok(selectors)
    }

    /// Registered type names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.push("generic".to_string());
        names.sort();
        names
    }
}
