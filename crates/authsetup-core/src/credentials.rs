//! Role credential resolution.

use std::fmt;

use crate::config::AuthSetupConfig;
use crate::env::EnvSource;
use crate::error::ConfigError;

/// Username and password for one role. Resolved per setup, never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Looks up a role's env var names in config and reads their values.
pub struct CredentialResolver<'a> {
    config: &'a AuthSetupConfig,
    env: &'a dyn EnvSource,
}

impl<'a> CredentialResolver<'a> {
    pub fn new(config: &'a AuthSetupConfig, env: &'a dyn EnvSource) -> Self {
        Self { config, env }
    }

    /// Fails before any browser work if a variable is unset or blank.
    pub fn resolve(&self, role: &str) -> Result<Credentials, ConfigError> {
        let role_config = self.config.role(role)?;
        let vars = &role_config.credentials_env;
        let username = self.read(role, "credentialsEnv.username", &vars.username)?;
        let password = self.read(role, "credentialsEnv.password", &vars.password)?;
        tracing::debug!(role, username_var = %vars.username, "Resolved credentials");
        Ok(Credentials { username, password })
    }

    fn read(&self, role: &str, field: &str, var: &str) -> Result<String, ConfigError> {
        self.env
            .non_empty(var)
            .ok_or_else(|| ConfigError::MissingEnvVar {
                role: role.to_string(),
                field: field.to_string(),
                var: var.to_string(),
            })
    }
}
