//! Browser driver seam.
//!
//! The login flows never talk to a browser directly. They drive a
//! [`BrowserSession`], which an external automation driver implements; the
//! browser lifecycle stays with whoever hands out sessions through a
//! [`SessionFactory`].
//!
//! Two implementations ship with the crate:
//!
//! - [`playwright`]: a long-lived `node` child process running Playwright.
//! - [`mock`]: a scripted in-memory page model for tests and dry runs.
//!
//! # Safety
//!
//! Values passed to [`BrowserSession::fill`] may be passwords or one-time
//! codes. Implementations must never log them.

use std::path::Path;

use async_trait::async_trait;

use crate::error::DriverError;
use crate::storage_state::StorageStateRecord;

mod locator;
pub mod mock;
pub mod playwright;

pub use locator::{Locator, UrlPattern};

/// One live browser page plus its context (cookies, local storage).
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Navigate and wait for the document to load.
    async fn goto(&self, url: &str) -> Result<(), DriverError>;

    async fn current_url(&self) -> Result<String, DriverError>;

    /// Whether the element is currently attached and visible. Never waits.
    async fn is_visible(&self, locator: &Locator) -> Result<bool, DriverError>;

    async fn fill(&self, locator: &Locator, value: &str) -> Result<(), DriverError>;

    async fn click(&self, locator: &Locator) -> Result<(), DriverError>;

    /// Text of the first matching element, if present.
    async fn text_content(&self, locator: &Locator) -> Result<Option<String>, DriverError>;

    /// Export cookies and local storage.
    async fn storage_state(&self) -> Result<StorageStateRecord, DriverError>;

    async fn set_local_storage(&self, origin: &str, key: &str, value: &str)
    -> Result<(), DriverError>;

    /// Drop cookies and local storage so the next attempt starts clean.
    async fn clear_session(&self) -> Result<(), DriverError>;

    async fn close(&self) -> Result<(), DriverError> {
        Ok(())
    }
}

/// Hands out browser sessions, optionally seeded with a stored state.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(
        &self,
        role: &str,
        seed_state: Option<&Path>,
    ) -> Result<Box<dyn BrowserSession>, DriverError>;
}
