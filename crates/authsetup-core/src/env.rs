//! Environment variable access.
//!
//! Components never read `std::env` directly; they take an [`EnvSource`] so
//! tests can supply a fixed map.

use std::collections::HashMap;

/// Read-only view of environment variables.
pub trait EnvSource: Send + Sync {
    /// Value of `name`, or `None` if unset.
    fn var(&self, name: &str) -> Option<String>;

    /// Value of `name` if set and not blank.
    fn non_empty(&self, name: &str) -> Option<String> {
        self.var(name).filter(|v| !v.trim().is_empty())
    }
}

/// The real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// Fixed in-memory environment.
#[derive(Debug, Clone, Default)]
pub struct MapEnv {
    vars: HashMap<String, String>,
}

impl MapEnv {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }
}

impl<K, V> FromIterator<(K, V)> for MapEnv
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl EnvSource for MapEnv {
    fn var(&self, name: &str) -> Option<String> {
        self.vars.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_env_lookup() {
        let env = MapEnv::new().with("A", "1").with("BLANK", "   ");
        assert_eq!(env.var("A").as_deref(), Some("1"));
        assert_eq!(env.var("B"), None);
        assert_eq!(env.var("BLANK").as_deref(), Some("   "));
        assert_eq!(env.non_empty("BLANK"), None);
    }

    #[test]
    fn map_env_from_iter() {
        let env: MapEnv = [("X", "y")].into_iter().collect();
        assert_eq!(env.non_empty("X").as_deref(), Some("y"));
    }

    #[test]
    fn process_env_reads_path() {
        // PATH is set in every sane test environment.
        assert!(ProcessEnv.var("PATH").is_some());
    }
}
