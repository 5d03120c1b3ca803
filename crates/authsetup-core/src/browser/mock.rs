//! Scripted in-memory browser for tests and dry runs.
//!
//! A [`MockBrowser`] models one page as a URL plus a set of visible elements.
//! Scripted [`Reaction`]s fire on navigation, clicks and fills, which is
//! enough to replay a login page's state machine without a real browser.
//!
//! ```rust,ignore
//! let browser = MockBrowser::new()
//!     .on_goto("https://app.test/login", [Reaction::Navigate("https://sso.test/auth".into())])
//!     .on_goto("https://sso.test/auth", [Reaction::Show(Locator::css("#username"))])
//!     .on_click(Locator::css("#kc-login"), [Reaction::Navigate("https://app.test/home".into())]);
//! ```

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{BrowserSession, Locator, SessionFactory};
use crate::error::DriverError;
use crate::storage_state::{Cookie, StorageStateRecord};

/// Redirect chains longer than this are treated as a loop.
const MAX_REDIRECTS: usize = 8;

/// A scripted page change.
#[derive(Debug, Clone)]
pub enum Reaction {
    /// Change the URL and run that URL's `on_goto` reactions (redirect).
    Navigate(String),
    Show(Locator),
    Hide(Locator),
    /// Show an element with the given text content.
    ShowText(Locator, String),
    SetCookie(Cookie),
}

#[derive(Debug, Default)]
struct MockState {
    url: String,
    visible: HashSet<Locator>,
    texts: HashMap<Locator, String>,
    filled: Vec<(Locator, String)>,
    clicks: Vec<Locator>,
    navigations: Vec<String>,
    record: StorageStateRecord,
    clear_count: usize,
    closed: bool,
}

/// Scripted browser session.
#[derive(Debug, Default)]
pub struct MockBrowser {
    state: Mutex<MockState>,
    on_goto: HashMap<String, Vec<Reaction>>,
    on_click: HashMap<Locator, Vec<Reaction>>,
    on_fill: HashMap<Locator, Vec<Reaction>>,
    hang_on_goto: HashSet<String>,
}

impl MockBrowser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reactions when `url` is loaded, directly or by redirect.
    #[must_use]
    pub fn on_goto(mut self, url: &str, reactions: impl IntoIterator<Item = Reaction>) -> Self {
        self.on_goto
            .entry(url.to_string())
            .or_default()
            .extend(reactions);
        self
    }

    #[must_use]
    pub fn on_click(
        mut self,
        locator: Locator,
        reactions: impl IntoIterator<Item = Reaction>,
    ) -> Self {
        self.on_click.entry(locator).or_default().extend(reactions);
        self
    }

    #[must_use]
    pub fn on_fill(
        mut self,
        locator: Locator,
        reactions: impl IntoIterator<Item = Reaction>,
    ) -> Self {
        self.on_fill.entry(locator).or_default().extend(reactions);
        self
    }

    /// `goto(url)` never completes, like a server that stops responding.
    #[must_use]
    pub fn hang_on_goto(mut self, url: &str) -> Self {
        self.hang_on_goto.insert(url.to_string());
        self
    }

    /// Elements visible before any navigation.
    #[must_use]
    pub fn with_visible(self, locator: Locator) -> Self {
        self.lock().visible.insert(locator);
        self
    }

    #[must_use]
    pub fn with_record(self, record: StorageStateRecord) -> Self {
        self.lock().record = record;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A poisoned lock only means another test thread panicked.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn apply(&self, state: &mut MockState, reactions: &[Reaction], depth: usize) {
        for reaction in reactions {
            match reaction {
                Reaction::Navigate(url) => {
                    state.url.clone_from(url);
                    state.visible.clear();
                    state.texts.clear();
                    if depth < MAX_REDIRECTS {
                        if let Some(next) = self.on_goto.get(url) {
                            self.apply(state, next, depth + 1);
                        }
                    }
                }
                Reaction::Show(locator) => {
                    state.visible.insert(locator.clone());
                }
                Reaction::Hide(locator) => {
                    state.visible.remove(locator);
                    state.texts.remove(locator);
                }
                Reaction::ShowText(locator, text) => {
                    state.visible.insert(locator.clone());
                    state.texts.insert(locator.clone(), text.clone());
                }
                Reaction::SetCookie(cookie) => state.record.upsert_cookie(cookie.clone()),
            }
        }
    }

    fn ensure_open(state: &MockState) -> Result<(), DriverError> {
        if state.closed {
            Err(DriverError::Closed)
        } else {
            Ok(())
        }
    }

    // -- inspection -----------------------------------------------------

    #[must_use]
    pub fn url(&self) -> String {
        self.lock().url.clone()
    }

    /// Last value filled into `locator`.
    #[must_use]
    pub fn filled(&self, locator: &Locator) -> Option<String> {
        self.lock()
            .filled
            .iter()
            .rev()
            .find(|(l, _)| l == locator)
            .map(|(_, v)| v.clone())
    }

    #[must_use]
    pub fn clicks(&self) -> Vec<Locator> {
        self.lock().clicks.clone()
    }

    #[must_use]
    pub fn navigations(&self) -> Vec<String> {
        self.lock().navigations.clone()
    }

    #[must_use]
    pub fn clear_count(&self) -> usize {
        self.lock().clear_count
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[async_trait]
impl BrowserSession for MockBrowser {
    async fn goto(&self, url: &str) -> Result<(), DriverError> {
        if self.hang_on_goto.contains(url) {
            self.lock().navigations.push(url.to_string());
            std::future::pending::<()>().await;
        }
        let mut state = self.lock();
        Self::ensure_open(&state)?;
        state.navigations.push(url.to_string());
        self.apply(&mut state, &[Reaction::Navigate(url.to_string())], 0);
        Ok(())
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        let state = self.lock();
        Self::ensure_open(&state)?;
        Ok(state.url.clone())
    }

    async fn is_visible(&self, locator: &Locator) -> Result<bool, DriverError> {
        let state = self.lock();
        Self::ensure_open(&state)?;
        Ok(state.visible.contains(locator))
    }

    async fn fill(&self, locator: &Locator, value: &str) -> Result<(), DriverError> {
        let mut state = self.lock();
        Self::ensure_open(&state)?;
        if !state.visible.contains(locator) {
            return Err(DriverError::ElementNotFound(locator.to_string()));
        }
        state.filled.push((locator.clone(), value.to_string()));
        if let Some(reactions) = self.on_fill.get(locator) {
            self.apply(&mut state, reactions, 0);
        }
        Ok(())
    }

    async fn click(&self, locator: &Locator) -> Result<(), DriverError> {
        let mut state = self.lock();
        Self::ensure_open(&state)?;
        if !state.visible.contains(locator) {
            return Err(DriverError::ElementNotFound(locator.to_string()));
        }
        state.clicks.push(locator.clone());
        if let Some(reactions) = self.on_click.get(locator) {
            self.apply(&mut state, reactions, 0);
        }
        Ok(())
    }

    async fn text_content(&self, locator: &Locator) -> Result<Option<String>, DriverError> {
        let state = self.lock();
        Self::ensure_open(&state)?;
        if !state.visible.contains(locator) {
            return Ok(None);
        }
        Ok(state.texts.get(locator).cloned())
    }

    async fn storage_state(&self) -> Result<StorageStateRecord, DriverError> {
        let state = self.lock();
        Self::ensure_open(&state)?;
        Ok(state.record.clone())
    }

    async fn set_local_storage(
        &self,
        origin: &str,
        key: &str,
        value: &str,
    ) -> Result<(), DriverError> {
        let mut state = self.lock();
        Self::ensure_open(&state)?;
        state.record.set_local_storage(origin, key, value);
        Ok(())
    }

    async fn clear_session(&self) -> Result<(), DriverError> {
        let mut state = self.lock();
        Self::ensure_open(&state)?;
        state.record = StorageStateRecord::default();
        state.clear_count += 1;
        Ok(())
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.lock().closed = true;
        Ok(())
    }
}

#[async_trait]
impl BrowserSession for Arc<MockBrowser> {
    async fn goto(&self, url: &str) -> Result<(), DriverError> {
        self.as_ref().goto(url).await
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        self.as_ref().current_url().await
    }

    async fn is_visible(&self, locator: &Locator) -> Result<bool, DriverError> {
        self.as_ref().is_visible(locator).await
    }

    async fn fill(&self, locator: &Locator, value: &str) -> Result<(), DriverError> {
        self.as_ref().fill(locator, value).await
    }

    async fn click(&self, locator: &Locator) -> Result<(), DriverError> {
        self.as_ref().click(locator).await
    }

    async fn text_content(&self, locator: &Locator) -> Result<Option<String>, DriverError> {
        self.as_ref().text_content(locator).await
    }

    async fn storage_state(&self) -> Result<StorageStateRecord, DriverError> {
        self.as_ref().storage_state().await
    }

    async fn set_local_storage(
        &self,
        origin: &str,
        key: &str,
        value: &str,
    ) -> Result<(), DriverError> {
        self.as_ref().set_local_storage(origin, key, value).await
    }

    async fn clear_session(&self) -> Result<(), DriverError> {
        self.as_ref().clear_session().await
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.as_ref().close().await
    }
}

type BrowserTemplate = dyn Fn(&str) -> MockBrowser + Send + Sync;

/// Builds a fresh [`MockBrowser`] per `open()` and keeps a handle to each.
pub struct MockSessionFactory {
    template: Box<BrowserTemplate>,
    opened: Mutex<Vec<(String, Option<PathBuf>, Arc<MockBrowser>)>>,
}

impl MockSessionFactory {
    pub fn new(template: impl Fn(&str) -> MockBrowser + Send + Sync + 'static) -> Self {
        Self {
            template: Box::new(template),
            opened: Mutex::new(Vec::new()),
        }
    }

    fn opened(&self) -> MutexGuard<'_, Vec<(String, Option<PathBuf>, Arc<MockBrowser>)>> {
        self.opened
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Number of sessions handed out so far.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.opened().len()
    }

    /// The most recent session opened for `role`.
    #[must_use]
    pub fn last_for(&self, role: &str) -> Option<Arc<MockBrowser>> {
        self.opened()
            .iter()
            .rev()
            .find(|(r, _, _)| r == role)
            .map(|(_, _, b)| Arc::clone(b))
    }

    /// Seed path passed with the most recent `open()` for `role`.
    #[must_use]
    pub fn last_seed_for(&self, role: &str) -> Option<PathBuf> {
        self.opened()
            .iter()
            .rev()
            .find(|(r, _, _)| r == role)
            .and_then(|(_, seed, _)| seed.clone())
    }
}

#[async_trait]
impl SessionFactory for MockSessionFactory {
    async fn open(
        &self,
        role: &str,
        seed_state: Option<&Path>,
    ) -> Result<Box<dyn BrowserSession>, DriverError> {
        let mut browser = (self.template)(role);
        if let Some(path) = seed_state {
            let json = std::fs::read_to_string(path)
                .map_err(|e| DriverError::Launch(format!("cannot read {}: {e}", path.display())))?;
            let record = StorageStateRecord::from_json(&json)
                .map_err(|e| DriverError::Launch(format!("bad storage state: {e}")))?;
            browser = browser.with_record(record);
        }
        let browser = Arc::new(browser);
        self.opened().push((
            role.to_string(),
            seed_state.map(Path::to_path_buf),
            Arc::clone(&browser),
        ));
        Ok(Box::new(browser))
    }
}
