//! authsetup CLI.
//!
//! Logs each configured test role in once, saves its browser storage state,
//! and hands the file path to test workers.
//!
//! # Usage
//!
//! ```bash
//! # Log every configured role in (reusing fresh records)
//! authsetup --config authsetup.toml setup
//!
//! # One role, JSON logs for CI
//! authsetup --config authsetup.toml --log-format json setup --role admin
//!
//! # Path for a worker; exit 1 when there is no fresh record
//! authsetup --config authsetup.toml path --role admin
//! ```
//!
//! Exit codes: 0 success, 1 no fresh record / session invalid,
//! 2 configuration error, 3 authentication or runtime failure.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use authsetup_core::browser::playwright::PlaywrightLauncher;
use authsetup_core::logging::{LogConfig, LogFormat, init_logging};
use authsetup_core::{AuthSetup, AuthSetupConfig, ConfigError, Error, lock};
use clap::{Parser, Subcommand};
use serde_json::json;

const EXIT_ABSENT: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_AUTH: u8 = 3;

/// Role-based browser login with reusable storage state.
#[derive(Parser, Debug)]
#[command(name = "authsetup")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "AUTHSETUP_CONFIG", default_value = "authsetup.toml")]
    config: PathBuf,

    /// Log output format (pretty or json).
    #[arg(long, default_value = "pretty")]
    log_format: LogFormat,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Show the browser window.
    #[arg(long, default_value_t = false)]
    headed: bool,

    /// Node.js binary used to run Playwright.
    #[arg(long, env = "AUTHSETUP_NODE", default_value = "node")]
    node: PathBuf,

    /// Browser engine: chromium, firefox or webkit.
    #[arg(long, default_value = "chromium")]
    browser: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Log roles in and save their storage state.
    Setup {
        /// Role to set up; repeatable. Defaults to every configured role.
        #[arg(long = "role")]
        roles: Vec<String>,
    },
    /// Show stored records and recent failures.
    Status {
        /// Output JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Print the path of a role's fresh storage state.
    Path {
        #[arg(long)]
        role: String,
    },
    /// Check that a role's stored session is still accepted.
    Verify {
        #[arg(long)]
        role: String,
    },
    /// Delete stored records and failure markers.
    Clear {
        /// Only this role. Defaults to all.
        #[arg(long)]
        role: Option<String>,
        /// Log the role out at the IdP before deleting its record.
        #[arg(long, default_value_t = false, requires = "role")]
        logout: bool,
    },
    /// Remove records past the 24h ceiling and leftover temp files.
    Cleanup,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let log_config = LogConfig {
        format: cli.log_format,
        level: level.to_string(),
    };
    if let Err(e) = init_logging(&log_config) {
        eprintln!("Error: {e}");
        return ExitCode::from(EXIT_CONFIG);
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<ConfigError>().is_some() {
        return EXIT_CONFIG;
    }
    match err.downcast_ref::<Error>() {
        Some(e) if e.is_config() => EXIT_CONFIG,
        _ => EXIT_AUTH,
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = AuthSetupConfig::load(&cli.config)?;
    let launcher = PlaywrightLauncher::new()
        .with_node(&cli.node)
        .with_browser(&cli.browser)
        .with_headless(!cli.headed);
    let setup = AuthSetup::new(config, Arc::new(launcher))?;

    match cli.command {
        Commands::Setup { roles } => setup_roles(&setup, roles).await,
        Commands::Status { json } => status(&setup, json),
        Commands::Path { role } => {
            setup.config().role(&role)?;
            match setup.get_storage_state_path(&role) {
                Some(path) => {
                    println!("{}", path.display());
                    Ok(ExitCode::SUCCESS)
                }
                None => {
                    eprintln!("No fresh storage state for role '{role}'");
                    Ok(ExitCode::from(EXIT_ABSENT))
                }
            }
        }
        Commands::Verify { role } => {
            setup.config().role(&role)?;
            if setup.verify_role(&role).await? {
                println!("{role}: session valid");
                Ok(ExitCode::SUCCESS)
            } else {
                println!("{role}: session invalid or missing");
                Ok(ExitCode::from(EXIT_ABSENT))
            }
        }
        Commands::Clear { role, logout } => {
            if let Some(role) = role.as_deref() {
                setup.config().role(role)?;
            }
            match (role.as_deref(), logout) {
                (Some(role), true) => setup.logout_role(role).await?,
                (role, _) => {
                    let removed = setup.store().clear(role).context("clearing storage state")?;
                    tracing::info!(removed, "Cleared storage state");
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Cleanup => {
            let removed = setup
                .store()
                .cleanup_expired()
                .context("sweeping storage state")?;
            println!("Removed {removed} expired record(s)");
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn setup_roles(setup: &AuthSetup, roles: Vec<String>) -> anyhow::Result<ExitCode> {
    let roles = if roles.is_empty() {
        setup.config().role_names()
    } else {
        roles
    };
    let report = setup.run_all(&roles).await?;

    for entry in &report.roles {
        match &entry.result {
            Ok(outcome) => {
                let how = if outcome.logged_in() { "logged in" } else { "reused" };
                println!("{}: {how} ({})", entry.role, outcome.path().display());
            }
            Err(Error::Auth(err)) => {
                eprintln!("{}: {err}", entry.role);
                if let Some(remediation) = &err.remediation {
                    eprintln!("  hint: {remediation}");
                }
            }
            Err(err) => eprintln!("{}: {err}", entry.role),
        }
    }

    Ok(if report.all_ok() {
        ExitCode::SUCCESS
    } else if report.has_config_error() {
        ExitCode::from(EXIT_CONFIG)
    } else {
        ExitCode::from(EXIT_AUTH)
    })
}

fn status(setup: &AuthSetup, as_json: bool) -> anyhow::Result<ExitCode> {
    let store = setup.store();
    let rows: Vec<serde_json::Value> = setup
        .config()
        .role_names()
        .into_iter()
        .map(|role| {
            json!({
                "role": role,
                "storageState": store.metadata(&role),
                "lastFailure": store.last_failure(&role),
                "lockHolder": lock::holder(store.dir(), &role),
            })
        })
        .collect();

    if as_json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(ExitCode::SUCCESS);
    }

    println!("Storage directory: {}", store.dir().display());
    for role in setup.config().role_names() {
        let state = match store.metadata(&role) {
            Some(meta) if meta.is_valid => format!("valid, {}s old", meta.age_seconds),
            Some(meta) => format!("stale, {}s old", meta.age_seconds),
            None => "none".to_string(),
        };
        println!("{role}: {state}");
        if let Some(failure) = store.last_failure(&role) {
            println!(
                "  last failure ({}): phase {} after {} attempt(s): {}",
                failure.failed_at.to_rfc3339(),
                failure.phase,
                failure.attempts,
                failure.message
            );
        }
        if let Some(holder) = lock::holder(store.dir(), &role) {
            println!("  setup in progress (pid {}, since {})", holder.pid, holder.started_at);
        }
    }
    Ok(ExitCode::SUCCESS)
}
