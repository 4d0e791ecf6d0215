pub mod models {
    pub mod api;
}

pub mod app;
pub mod client;
pub mod config;
pub mod db {
    pub mod models;
}
pub mod env_file;
pub mod error;
pub mod schema;
pub mod store;
pub mod utils;
pub mod services {
    pub mod accounts;
    pub mod automation;
    pub mod password;
    pub mod provisioning;
    pub mod schedule;
    pub mod tokens;

    #[cfg(test)]
    pub mod fixtures;
}

use crate::app::App;
use crate::client::DeviceClient;
use crate::config::Config;
use crate::models::api::NewAccount;
use crate::services::accounts;
use diesel::prelude::*;
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[derive(Debug, PartialEq)]
enum Command {
    Serve,
    Signup {
        username: String,
        password: String,
        first_name: String,
        last_name: String,
    },
    GrantRole {
        user_id: i64,
        role: String,
    },
}

#[derive(Debug, PartialEq)]
struct Cli {
    env_file: Option<PathBuf>,
    command: Command,
}

const USAGE: &str = "usage: homehub [--env-file PATH] [serve | signup USERNAME PASSWORD FIRST LAST | grant-role USER_ID ROLE]";

fn parse_cli<I: IntoIterator<Item = String>>(args: I) -> Result<Cli, String> {
    let mut env_file = None;
    let mut positional = Vec::new();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        let path = if arg == "--env-file" {
            Some(args.next().ok_or("`--env-file` requires a path argument")?)
        } else {
            arg.strip_prefix("--env-file=").map(str::to_string)
        };
        match path {
            Some(p) if p.is_empty() => return Err("`--env-file` requires a path argument".into()),
            Some(_) if env_file.is_some() => return Err("`--env-file` provided more than once".into()),
            Some(p) => env_file = Some(PathBuf::from(p)),
            None if arg.starts_with("--") => return Err(format!("unrecognised option: {}\n{}", arg, USAGE)),
            None => positional.push(arg),
        }
    }

    let command = match positional.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        [] | ["serve"] => Command::Serve,
        ["signup", username, password, first, last] => Command::Signup {
            username: username.to_string(),
            password: password.to_string(),
            first_name: first.to_string(),
            last_name: last.to_string(),
        },
        ["grant-role", user_id, role] => Command::GrantRole {
            user_id: user_id
                .parse()
                .map_err(|_| format!("USER_ID must be a number, got {}", user_id))?,
            role: role.to_string(),
        },
        _ => return Err(USAGE.to_string()),
    };
    Ok(Cli { env_file, command })
}

/// Load the explicit env file, or `./.env` when present. Returns the loaded path.
fn load_environment(explicit: Option<&PathBuf>) -> Result<Option<PathBuf>, String> {
    let path = match explicit {
        Some(path) if !path.is_file() => return Err(format!("env file not found: {}", path.display())),
        Some(path) => path.clone(),
        None => {
            let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
            let default_path = cwd.join(".env");
            if !default_path.is_file() {
                return Ok(None);
            }
            default_path
        }
    };
    env_file::load(&path)?;
    Ok(Some(path))
}

fn apply_database_migrations(conn: &mut PgConnection) -> Result<(), String> {
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| format!("Applying database migrations failed: {}", e))?;
    if applied.is_empty() {
        info!("Database schema is up to date; no migrations were applied");
    } else {
        let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
        info!("Applied {} database migration(s): {}", applied.len(), names);
    }
    Ok(())
}

fn connect(cfg: &Config) -> Result<PgConnection, String> {
    PgConnection::establish(&cfg.database_url).map_err(|e| format!("DB connection failed: {}", e))
}

fn run(command: Command) -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (automation_enabled={}, tick={}s, alarm_join_timeout={}s, device_timeout={}s)",
        cfg.automation_enabled,
        cfg.automation_tick.as_secs(),
        cfg.alarm_join_timeout.as_secs(),
        cfg.device_timeout.as_secs()
    );

    // 2) Connect DB and bring the schema up to date
    let mut conn = connect(&cfg)?;
    info!("Connected to database");
    apply_database_migrations(&mut conn)?;
    let seeded = accounts::seed_role_catalog(&mut conn).map_err(|e| format!("seeding roles failed: {}", e))?;
    if seeded > 0 {
        info!("Seeded {} role(s)", seeded);
    }

    let app = App::new(&cfg, Arc::new(DeviceClient::new(cfg.device_timeout)));

    match command {
        Command::Signup {
            username,
            password,
            first_name,
            last_name,
        } => {
            let account = NewAccount {
                username,
                password,
                first_name,
                last_name,
                email: None,
            };
            let user = app.signup(&mut conn, &account).map_err(|e| e.to_string())?;
            info!("Created user {}", user.id);
            Ok(())
        }
        Command::GrantRole { user_id, role } => {
            app.grant_role(&mut conn, user_id, &role).map_err(|e| e.to_string())?;
            info!("Granted role {} to user {}", role, user_id);
            Ok(())
        }
        Command::Serve => {
            if !cfg.automation_enabled {
                info!("Automation disabled via AUTOMATION_ENABLED=false; nothing to serve");
                return Ok(());
            }
            // the worker owns a connection of its own
            let worker_conn = connect(&cfg)?;
            app.engine.start(worker_conn).map_err(|e| e.to_string())?;
            app.engine.wait();
            Ok(())
        }
    }
}

fn main() {
    let cli = match parse_cli(std::env::args().skip(1)) {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };
    let loaded_env = match load_environment(cli.env_file.as_ref()) {
        Ok(path) => path,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(path) = loaded_env {
        info!("Environment loaded from {}", path.display());
    }
    info!(
        "homehub {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run(cli.command) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
