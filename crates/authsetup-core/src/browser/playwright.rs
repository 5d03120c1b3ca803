//! Playwright driver bridge.
//!
//! Each session is a long-lived `node -e <bridge script>` child running
//! Playwright. The protocol is JSON lines: one command per line on the
//! child's stdin, one reply per line on its stdout.
//!
//! ```text
//! → {"id":3,"op":"fill","locator":{"kind":"label","value":"Username"},"value":"…"}
//! ← {"id":3,"ok":true,"value":null}
//! ← {"id":4,"ok":false,"kind":"ElementNotFound","error":"…"}
//! ```
//!
//! Replies carry the command id, so a reply left over from a cancelled call
//! is skipped instead of being read as the answer to the next one.
//!
//! Requires `node` on `PATH` (or configured) and the `playwright` package
//! resolvable from the working directory.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use super::{BrowserSession, Locator, SessionFactory};
use crate::error::DriverError;
use crate::storage_state::StorageStateRecord;

/// How long to wait for the bridge to exit after `close`.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Launch settings shared by every session a launcher opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaywrightLauncher {
    node: PathBuf,
    /// `chromium`, `firefox` or `webkit`.
    browser: String,
    headless: bool,
    /// Playwright's own per-action timeout. Flow budgets are enforced on top.
    action_timeout: Duration,
    launch_timeout: Duration,
}

impl Default for PlaywrightLauncher {
    fn default() -> Self {
        Self {
            node: PathBuf::from("node"),
            browser: "chromium".to_string(),
            headless: true,
            action_timeout: Duration::from_secs(30),
            launch_timeout: Duration::from_secs(60),
        }
    }
}

impl PlaywrightLauncher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_node(mut self, node: impl Into<PathBuf>) -> Self {
        self.node = node.into();
        self
    }

    #[must_use]
    pub fn with_browser(mut self, browser: impl Into<String>) -> Self {
        self.browser = browser.into();
        self
    }

    #[must_use]
    pub const fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    #[must_use]
    pub const fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }

    /// The bridge program passed to `node -e`.
    fn build_bridge_script(&self) -> String {
        let browser = self.browser.replace(['\\', '\''], "");
        let timeout = self.action_timeout.as_millis();
        format!("const BROWSER = '{browser}';\nconst ACTION_TIMEOUT = {timeout};\n{BRIDGE_BODY}")
    }

    async fn launch(&self, role: &str, seed_state: Option<&Path>) -> Result<PlaywrightSession, DriverError> {
        let script = self.build_bridge_script();
        let mut child = Command::new(&self.node)
            .arg("-e")
            .arg(&script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DriverError::Launch(format!("failed to spawn {}: {e}", self.node.display()))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DriverError::Launch("bridge stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DriverError::Launch("bridge stdout unavailable".to_string()))?;

        let session = PlaywrightSession {
            bridge: Mutex::new(Bridge {
                child,
                stdin,
                stdout: BufReader::new(stdout).lines(),
                next_id: 0,
                closed: false,
            }),
        };

        let launch = BridgeCommand::Launch {
            browser_type: self.browser.clone(),
            headless: self.headless,
            storage_state: seed_state.map(|p| p.display().to_string()),
        };
        match tokio::time::timeout(self.launch_timeout, session.call(launch)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(DriverError::Launch(e.to_string())),
            Err(_) => {
                return Err(DriverError::Launch(format!(
                    "browser did not start within {}s",
                    self.launch_timeout.as_secs()
                )));
            }
        }
        tracing::debug!(
            role,
            browser = %self.browser,
            headless = self.headless,
            seeded = seed_state.is_some(),
            "Browser session launched"
        );
        Ok(session)
    }
}

#[async_trait]
impl SessionFactory for PlaywrightLauncher {
    async fn open(
        &self,
        role: &str,
        seed_state: Option<&Path>,
    ) -> Result<Box<dyn BrowserSession>, DriverError> {
        Ok(Box::new(self.launch(role, seed_state).await?))
    }
}

/// Wire form of a [`Locator`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum WireLocator {
    Css { value: String },
    Label { value: String },
    Role { role: String, name: Option<String> },
    Placeholder { value: String },
    Text { value: String },
}

impl From<&Locator> for WireLocator {
    fn from(locator: &Locator) -> Self {
        match locator {
            Locator::Css(value) => Self::Css { value: value.clone() },
            Locator::Label(value) => Self::Label { value: value.clone() },
            Locator::Role { role, name } => Self::Role {
                role: role.clone(),
                name: name.clone(),
            },
            Locator::Placeholder(value) => Self::Placeholder { value: value.clone() },
            Locator::Text(value) => Self::Text { value: value.clone() },
        }
    }
}

/// One request to the bridge.
#[derive(Serialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
enum BridgeCommand {
    Launch {
        browser_type: String,
        headless: bool,
        storage_state: Option<String>,
    },
    Goto {
        url: String,
    },
    CurrentUrl,
    IsVisible {
        locator: WireLocator,
    },
    Fill {
        locator: WireLocator,
        value: String,
    },
    Click {
        locator: WireLocator,
    },
    TextContent {
        locator: WireLocator,
    },
    StorageState,
    SetLocalStorage {
        origin: String,
        key: String,
        value: String,
    },
    ClearSession,
    Close,
}

impl BridgeCommand {
    /// Operation name for logs. Never the payload.
    const fn op(&self) -> &'static str {
        match self {
            Self::Launch { .. } => "launch",
            Self::Goto { .. } => "goto",
            Self::CurrentUrl => "currentUrl",
            Self::IsVisible { .. } => "isVisible",
            Self::Fill { .. } => "fill",
            Self::Click { .. } => "click",
            Self::TextContent { .. } => "textContent",
            Self::StorageState => "storageState",
            Self::SetLocalStorage { .. } => "setLocalStorage",
            Self::ClearSession => "clearSession",
            Self::Close => "close",
        }
    }
}

#[derive(Serialize)]
struct Request<'a> {
    id: u64,
    #[serde(flatten)]
    command: &'a BridgeCommand,
}

#[derive(Debug, Deserialize)]
struct Reply {
    id: u64,
    ok: bool,
    #[serde(default)]
    value: serde_json::Value,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl Reply {
    /// Parse one stdout line. Lines that are not replies (library noise)
    /// yield `None`.
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if !line.starts_with('{') {
            return None;
        }
        serde_json::from_str(line).ok()
    }

    fn into_result(self) -> Result<serde_json::Value, DriverError> {
        if self.ok {
            return Ok(self.value);
        }
        let message = self.error.unwrap_or_else(|| "unknown driver error".to_string());
        Err(match self.kind.as_deref() {
            Some("ElementNotFound") => DriverError::ElementNotFound(message),
            Some("Navigation") => DriverError::Navigation(message),
            Some("Closed") => DriverError::Closed,
            _ => DriverError::Protocol(message),
        })
    }
}

struct Bridge {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
    closed: bool,
}

/// A live Playwright page and its browser context.
pub struct PlaywrightSession {
    bridge: Mutex<Bridge>,
}

impl std::fmt::Debug for PlaywrightSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaywrightSession").finish_non_exhaustive()
    }
}

impl PlaywrightSession {
    async fn call(&self, command: BridgeCommand) -> Result<serde_json::Value, DriverError> {
        let mut bridge = self.bridge.lock().await;
        if bridge.closed {
            return Err(DriverError::Closed);
        }
        bridge.next_id += 1;
        let id = bridge.next_id;

        let mut line = serde_json::to_string(&Request {
            id,
            command: &command,
        })
        .map_err(|e| DriverError::Protocol(e.to_string()))?;
        line.push('\n');
        tracing::trace!(id, op = command.op(), "Bridge command");

        let io_closed = |_| DriverError::Closed;
        bridge.stdin.write_all(line.as_bytes()).await.map_err(io_closed)?;
        bridge.stdin.flush().await.map_err(io_closed)?;

        loop {
            let Some(raw) = bridge.stdout.next_line().await.map_err(io_closed)? else {
                bridge.closed = true;
                return Err(DriverError::Closed);
            };
            match Reply::parse(&raw) {
                Some(reply) if reply.id == id => return reply.into_result(),
                Some(reply) => tracing::debug!(stale_id = reply.id, id, "Skipping stale bridge reply"),
                None => tracing::trace!("Ignoring non-protocol bridge output"),
            }
        }
    }

    async fn call_unit(&self, command: BridgeCommand) -> Result<(), DriverError> {
        self.call(command).await.map(|_| ())
    }
}

#[async_trait]
impl BrowserSession for PlaywrightSession {
    async fn goto(&self, url: &str) -> Result<(), DriverError> {
        self.call_unit(BridgeCommand::Goto { url: url.to_string() }).await
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        match self.call(BridgeCommand::CurrentUrl).await? {
            serde_json::Value::String(url) => Ok(url),
            other => Err(DriverError::Protocol(format!("currentUrl returned {other}"))),
        }
    }

    async fn is_visible(&self, locator: &Locator) -> Result<bool, DriverError> {
        let value = self
            .call(BridgeCommand::IsVisible {
                locator: locator.into(),
            })
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn fill(&self, locator: &Locator, value: &str) -> Result<(), DriverError> {
        self.call_unit(BridgeCommand::Fill {
            locator: locator.into(),
            value: value.to_string(),
        })
        .await
    }

    async fn click(&self, locator: &Locator) -> Result<(), DriverError> {
        self.call_unit(BridgeCommand::Click {
            locator: locator.into(),
        })
        .await
    }

    async fn text_content(&self, locator: &Locator) -> Result<Option<String>, DriverError> {
        let value = self
            .call(BridgeCommand::TextContent {
                locator: locator.into(),
            })
            .await?;
        Ok(value.as_str().map(str::to_string))
    }

    async fn storage_state(&self) -> Result<StorageStateRecord, DriverError> {
        let value = self.call(BridgeCommand::StorageState).await?;
        serde_json::from_value(value)
            .map_err(|e| DriverError::Protocol(format!("bad storage state from driver: {e}")))
    }

    async fn set_local_storage(
        &self,
        origin: &str,
        key: &str,
        value: &str,
    ) -> Result<(), DriverError> {
        self.call_unit(BridgeCommand::SetLocalStorage {
            origin: origin.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        })
        .await
    }

    async fn clear_session(&self) -> Result<(), DriverError> {
        self.call_unit(BridgeCommand::ClearSession).await
    }

    async fn close(&self) -> Result<(), DriverError> {
        let result = self.call_unit(BridgeCommand::Close).await;
        let mut bridge = self.bridge.lock().await;
        bridge.closed = true;
        match tokio::time::timeout(CLOSE_GRACE, bridge.child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(%status, "Browser bridge exited"),
            _ => {
                tracing::debug!("Browser bridge did not exit; killing it");
                if let Err(e) = bridge.child.kill().await {
                    tracing::debug!(error = %e, "Could not kill browser bridge");
                }
            }
        }
        match result {
            Err(DriverError::Closed) | Ok(()) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Bridge program body. `BROWSER` and `ACTION_TIMEOUT` are prepended.
const BRIDGE_BODY: &str = r#"
const playwright = require('playwright');
const readline = require('readline');

let browser = null;
let context = null;
let page = null;

function locate(l) {
  switch (l.kind) {
    case 'label': return page.getByLabel(l.value).first();
    case 'role': return page.getByRole(l.role, l.name ? { name: l.name } : {}).first();
    case 'placeholder': return page.getByPlaceholder(l.value).first();
    case 'text': return page.getByText(l.value).first();
    default: return page.locator(l.value).first();
  }
}

function fail(kind, message) {
  const err = new Error(message);
  err.kind = kind;
  return err;
}

async function handle(cmd) {
  if (cmd.op !== 'launch' && !page) throw fail('Closed', 'browser not launched');
  switch (cmd.op) {
    case 'launch': {
      const type = playwright[cmd.browserType || BROWSER];
      if (!type) throw fail('Protocol', 'unknown browser ' + cmd.browserType);
      browser = await type.launch({ headless: cmd.headless });
      context = await browser.newContext(cmd.storageState ? { storageState: cmd.storageState } : {});
      context.setDefaultTimeout(ACTION_TIMEOUT);
      page = await context.newPage();
      return null;
    }
    case 'goto':
      try {
        await page.goto(cmd.url, { waitUntil: 'load' });
      } catch (e) {
        throw fail('Navigation', String(e.message).split('\n')[0]);
      }
      return null;
    case 'currentUrl':
      return page.url();
    case 'isVisible':
      return await locate(cmd.locator).isVisible();
    case 'fill':
      await locate(cmd.locator).fill(cmd.value);
      return null;
    case 'click':
      await locate(cmd.locator).click();
      return null;
    case 'textContent': {
      const el = locate(cmd.locator);
      return (await el.count()) > 0 ? await el.textContent() : null;
    }
    case 'storageState':
      return await context.storageState();
    case 'setLocalStorage': {
      const p = await context.newPage();
      try {
        await p.goto(cmd.origin, { waitUntil: 'domcontentloaded' });
        await p.evaluate(([k, v]) => window.localStorage.setItem(k, v), [cmd.key, cmd.value]);
      } finally {
        await p.close();
      }
      return null;
    }
    case 'clearSession':
      await context.clearCookies();
      await page.evaluate(() => {
        try { window.localStorage.clear(); window.sessionStorage.clear(); } catch (_) {}
      });
      return null;
    case 'close':
      if (browser) await browser.close();
      browser = context = page = null;
      return null;
    default:
      throw fail('Protocol', 'unknown op ' + cmd.op);
  }
}

function classify(e) {
  if (e.kind) return e.kind;
  const message = String(e.message || e);
  if (/Target .*closed|has been closed/.test(message)) return 'Closed';
  if (/Timeout .*exceeded|strict mode violation|waiting for/.test(message)) return 'ElementNotFound';
  return 'Protocol';
}

function reply(obj) {
  process.stdout.write(JSON.stringify(obj) + '\n');
}

const rl = readline.createInterface({ input: process.stdin });
let chain = Promise.resolve();
rl.on('line', (line) => {
  chain = chain.then(async () => {
    let cmd;
    try { cmd = JSON.parse(line); } catch (_) { return; }
    try {
      const value = await handle(cmd);
      reply({ id: cmd.id, ok: true, value: value === undefined ? null : value });
    } catch (e) {
      // First line only: Playwright call logs can echo page content.
      reply({ id: cmd.id, ok: false, kind: classify(e), error: String(e.message || e).split('\n')[0] });
    }
    if (cmd.op === 'close') process.exit(0);
  });
});
rl.on('close', () => {
  chain.then(() => browser && browser.close()).finally(() => process.exit(0));
});
"#;
