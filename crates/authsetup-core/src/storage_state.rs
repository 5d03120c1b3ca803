//! Storage-state record: the serialized browser session.
//!
//! The JSON shape is the session-export format shared by browser automation
//! drivers (cookies plus per-origin local storage), so a file written here can
//! be handed straight to a driver's context-import primitive.

use serde::{Deserialize, Serialize};

/// A serialized browser session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageStateRecord {
    pub cookies: Vec<Cookie>,
    pub origins: Vec<OriginState>,
}

/// Cookie `SameSite` attribute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SameSite {
    Strict,
    #[default]
    Lax,
    None,
}

/// A domain-scoped cookie.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    /// Unix seconds; `-1` for session cookies.
    pub expires: f64,
    pub http_only: bool,
    pub secure: bool,
    pub same_site: SameSite,
}

impl Cookie {
    /// Session cookie on `/` with `Lax` same-site.
    pub fn new(name: impl Into<String>, value: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: "/".to_string(),
            expires: -1.0,
            http_only: false,
            secure: false,
            same_site: SameSite::Lax,
        }
    }

    #[must_use]
    pub fn http_only(mut self) -> Self {
        self.http_only = true;
        self
    }

    #[must_use]
    pub fn secure(mut self) -> Self {
        self.secure = true;
        self
    }
}

/// Local storage for one origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginState {
    pub origin: String,
    pub local_storage: Vec<LocalStorageEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalStorageEntry {
    pub name: String,
    pub value: String,
}

impl StorageStateRecord {
    /// Parse a record, requiring the full cookie/origin shape.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Structural checks beyond what deserialization enforces.
    pub fn validate(&self) -> Result<(), String> {
        for (idx, cookie) in self.cookies.iter().enumerate() {
            if cookie.name.is_empty() {
                return Err(format!("cookies[{idx}] has an empty name"));
            }
            if cookie.domain.is_empty() {
                return Err(format!("cookies[{idx}] ({}) has an empty domain", cookie.name));
            }
        }
        for (idx, origin) in self.origins.iter().enumerate() {
            if origin.origin.is_empty() {
                return Err(format!("origins[{idx}] has an empty origin"));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty() && self.origins.iter().all(|o| o.local_storage.is_empty())
    }

    /// Insert or replace a cookie keyed by (name, domain, path).
    pub fn upsert_cookie(&mut self, cookie: Cookie) {
        if let Some(existing) = self.cookies.iter_mut().find(|c| {
            c.name == cookie.name && c.domain == cookie.domain && c.path == cookie.path
        }) {
            *existing = cookie;
        } else {
            self.cookies.push(cookie);
        }
    }

    /// Insert or replace a local-storage entry for `origin`.
    pub fn set_local_storage(&mut self, origin: &str, name: &str, value: &str) {
        let idx = if let Some(idx) = self.origins.iter().position(|o| o.origin == origin) {
            idx
        } else {
            self.origins.push(OriginState {
                origin: origin.to_string(),
                local_storage: Vec::new(),
            });
            self.origins.len() - 1
        };
        let entries = &mut self.origins[idx].local_storage;
        if let Some(entry) = entries.iter_mut().find(|e| e.name == name) {
            entry.value = value.to_string();
        } else {
            entries.push(LocalStorageEntry {
                name: name.to_string(),
                value: value.to_string(),
            });
        }
    }

    #[must_use]
    pub fn local_storage(&self, origin: &str, name: &str) -> Option<&str> {
        self.origins
            .iter()
            .find(|o| o.origin == origin)?
            .local_storage
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value.as_str())
    }
}
