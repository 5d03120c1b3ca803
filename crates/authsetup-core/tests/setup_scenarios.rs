//! End-to-end setup scenarios against a scripted Keycloak login page.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use authsetup_core::browser::Locator;
use authsetup_core::browser::mock::{MockBrowser, MockSessionFactory, Reaction};
use authsetup_core::env::MapEnv;
use authsetup_core::storage_state::{Cookie, StorageStateRecord};
use authsetup_core::{AuthPhase, AuthSetup, AuthSetupConfig, Error, StorageStateStore};

const APP_LOGIN: &str = "https://app.test/login";
const APP_HOME: &str = "https://app.test/home";
const KC_AUTH: &str = "https://sso.test/realms/qa/protocol/openid-connect/auth";

fn config(dir: &Path) -> AuthSetupConfig {
    let toml = format!(
        r#"
[auth]
provider = "oidc"

[auth.oidc]
idpType = "keycloak"
loginUrl = "{APP_LOGIN}"
successCondition = {{ url = "{APP_HOME}" }}

[auth.roles.admin]
credentialsEnv = {{ username = "ADMIN_USER", password = "ADMIN_PASS" }}

[auth.roles.hr]
credentialsEnv = {{ username = "HR_USER", password = "HR_PASS" }}

[storageState]
directory = "{}"

[retry]
delayMs = 10
"#,
        dir.join("auth").display()
    );
    AuthSetupConfig::from_toml_str(&toml).unwrap()
}

/// Keycloak login page reached through the app's login redirect.
fn keycloak(_role: &str) -> MockBrowser {
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
}

fn accepting(role: &str) -> MockBrowser {
    keycloak(role).on_click(
        Locator::css("#kc-login"),
        [
            Reaction::SetCookie(Cookie::new("KC_SESSION", "k1", "sso.test").http_only()),
            Reaction::SetCookie(Cookie::new("SESSION", "s1", "app.test").http_only().secure()),
            Reaction::Navigate(APP_HOME.into()),
        ],
    )
}

fn rejecting(role: &str) -> MockBrowser {
    keycloak(role).on_click(
        Locator::css("#kc-login"),
        [Reaction::ShowText(
            Locator::css("#input-error"),
            "Invalid username or password.".into(),
        )],
    )
}

fn env() -> MapEnv {
    MapEnv::new()
        .with("ADMIN_USER", "admin-user")
        .with("ADMIN_PASS", "admin-pass")
}

fn setup(dir: &Path, sessions: Arc<MockSessionFactory>, env: MapEnv) -> AuthSetup {
    AuthSetup::new(config(dir), sessions)
        .unwrap()
        .with_env(Arc::new(env))
}

#[tokio::test]
async fn admin_login_writes_reusable_storage_state() {
    let dir = tempfile::tempdir().unwrap();
    let sessions = Arc::new(MockSessionFactory::new(accepting));
    let setup = setup(dir.path(), Arc::clone(&sessions), env());

    let outcome = setup.run_auth_setup("admin").await.unwrap();
    assert!(outcome.logged_in());
    assert_eq!(outcome.path(), dir.path().join("auth/admin.json"));

    let json = std::fs::read_to_string(outcome.path()).unwrap();
    let record = StorageStateRecord::from_json(&json).unwrap();
    let names: Vec<&str> = record.cookies.iter().map(|c| c.name.as_str()).collect();
    assert!(names.contains(&"SESSION"));
    assert!(!json.contains("admin-pass"));

    let browser = sessions.last_for("admin").unwrap();
    assert_eq!(browser.filled(&Locator::css("#username")).as_deref(), Some("admin-user"));
    assert!(browser.is_closed());

    // Workers resolve the same path without logging in again.
    let again = setup.run_auth_setup("admin").await.unwrap();
    assert!(!again.logged_in());
    assert_eq!(sessions.open_count(), 1);
    assert_eq!(setup.get_storage_state_path("admin").as_deref(), Some(outcome.path()));
}

#[tokio::test]
async fn missing_credentials_fail_before_any_navigation() {
    let dir = tempfile::tempdir().unwrap();
    let sessions = Arc::new(MockSessionFactory::new(accepting));
    let setup = setup(dir.path(), Arc::clone(&sessions), env());

    let err = setup.run_auth_setup("hr").await.unwrap_err();
    assert!(err.is_config());
    assert!(err.to_string().contains("HR_USER"));
    assert_eq!(sessions.open_count(), 0);
    assert!(setup.get_storage_state_path("hr").is_none());
}

#[tokio::test]
async fn rejected_password_is_retried_then_reported() {
    let dir = tempfile::tempdir().unwrap();
    let sessions = Arc::new(MockSessionFactory::new(rejecting));
    let setup = setup(dir.path(), Arc::clone(&sessions), env());

    let err = setup.run_auth_setup("admin").await.unwrap_err();
    let Error::Auth(auth) = err else {
        panic!("expected an auth failure, got {err:?}");
    };
    assert_eq!(auth.role, "admin");
    assert_eq!(auth.phase, AuthPhase::Credentials);
    assert_eq!(auth.attempts, 2);
    assert_eq!(auth.idp_response.as_deref(), Some("Invalid username or password."));
    assert!(auth.remediation.as_deref().unwrap_or_default().contains("role 'admin'"));

    assert!(setup.get_storage_state_path("admin").is_none());
    let marker = setup.store().last_failure("admin").unwrap();
    assert_eq!(marker.phase, AuthPhase::Credentials);
}

#[tokio::test]
async fn parallel_workers_share_one_login() {
    let dir = tempfile::tempdir().unwrap();
    let sessions = Arc::new(MockSessionFactory::new(accepting));
    let workers: Vec<AuthSetup> = (0..4)
        .map(|_| setup(dir.path(), Arc::clone(&sessions), env()))
        .collect();

    let outcomes =
        futures_util::future::join_all(workers.iter().map(|w| w.run_auth_setup("admin"))).await;

    let logged_in = outcomes
        .into_iter()
        .map(Result::unwrap)
        .filter(|o| o.logged_in())
        .count();
    assert_eq!(logged_in, 1);
    assert_eq!(sessions.open_count(), 1);
}

#[test]
fn readers_never_observe_a_partial_record() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let store = StorageStateStore::new(&config.storage_state);

    let mut record = StorageStateRecord::default();
    for i in 0..200 {
        record.upsert_cookie(Cookie::new(format!("c{i}"), "x".repeat(64), "app.test"));
    }
    let path = store.save_record("admin", &record).unwrap();

    let done = AtomicBool::new(false);
    std::thread::scope(|scope| {
        for _ in 0..2 {
            scope.spawn(|| {
                while !done.load(Ordering::Acquire) {
                    let json = std::fs::read_to_string(&path).unwrap();
                    assert_eq!(StorageStateRecord::from_json(&json).unwrap().cookies.len(), 200);
                }
            });
        }
        for _ in 0..50 {
            store.save_record("admin", &record).unwrap();
        }
        done.store(true, Ordering::Release);
    });
}

#[tokio::test]
async fn run_all_reports_each_role() {
    let dir = tempfile::tempdir().unwrap();
    let sessions = Arc::new(MockSessionFactory::new(accepting));
    let setup = setup(dir.path(), sessions, env());

    let report = setup
        .run_all(&["admin".to_string(), "hr".to_string()])
        .await
        .unwrap();
    assert!(!report.all_ok());
    assert!(report.has_config_error());
    assert_eq!(report.roles[0].role, "admin");
    assert!(report.roles[0].result.is_ok());
    let failed: Vec<&str> = report.failures().map(|(role, _)| role).collect();
    assert_eq!(failed, vec!["hr"]);
}
