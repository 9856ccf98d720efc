mod logging;
mod ws;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use clap::{Parser, Subcommand};
use fw_core::{
    config::ConfigStore,
    dashboard::{Dashboard, DashboardOptions},
};
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{error, info};
use ws::AppState;

const DEFAULT_ADDR: &str = "127.0.0.1:8088";
const ROOT_DIR_NAME: &str = ".forever";

#[derive(Parser, Debug)]
#[command(name = "fw-hub")]
#[command(about = "Web dashboard hub for forever supervised processes", long_about = None)]
struct Args {
    /// Listen address; falls back to FW_ADDR.
    #[arg(long, default_value = "")]
    addr: String,
    /// Forever root holding `sock/` and `pids/`; falls back to FOREVER_ROOT.
    #[arg(long, default_value = "")]
    root: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Inspect or edit the dashboard configuration
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    Get { key: String },
    Set { key: String, value: String },
    Clear { key: String },
    List,
}

#[derive(Clone, Debug)]
struct Settings {
    addr: String,
    root: PathBuf,
    debug: bool,
    write_timeout: Duration,
    log_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let root = resolve_root(&args.root, dirs::home_dir().as_deref())
        .context("Failed to locate the forever root; pass --root or set FOREVER_ROOT")?;

    if let Some(Commands::Config { action }) = args.command {
        return run_config(&root, action);
    }

    let settings = Settings {
        addr: resolve_addr(&args.addr),
        root,
        debug: args.debug || env_true("FW_DEBUG"),
        write_timeout: Duration::from_secs(args.write_timeout.max(1)),
        log_dir: resolve_log_dir(&args.log_dir),
    };
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;
    runtime.block_on(serve(settings));
    Ok(())
}

async fn serve(settings: Settings) {
    let _log_guard = logging::init_logging(settings.debug, settings.log_dir.as_deref());
    let addr: SocketAddr = match settings.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %settings.addr);
            return;
        }
    };
    if !addr.ip().is_loopback() {
        error!(event = "invalid_addr", addr = %settings.addr, reason = "not loopback");
        return;
    }

    let dashboard = match Dashboard::build(settings.root.clone(), DashboardOptions::default()) {
        Ok(value) => value,
        Err(err) => {
            error!(event = "dashboard_error", error = %err);
            return;
        }
    };
    let watch_task = dashboard.spawn_watch().await;

    let app = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(AppState {
            dashboard: dashboard.clone(),
            write_timeout: settings.write_timeout,
        });

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };

    info!(
        event = "hub_start",
        addr = %settings.addr,
        root = %dashboard.paths().root().display()
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(event = "hub_error", error = %err);
    }

    dashboard.shutdown().await;
    if let Some(task) = watch_task {
        let _ = task.await;
    }
    info!(event = "hub_stop");
}

fn run_config(root: &Path, action: ConfigCommands) -> Result<()> {
    let store = ConfigStore::open(root);
    let path = store.path().display().to_string();
    match action {
        ConfigCommands::Get { key } => {
            let value = store
                .get(&key)
                .with_context(|| format!("Failed to read {path}"))?;
            match value {
                Some(value) => println!("{value}"),
                None => println!("{key} is not set"),
            }
        }
        ConfigCommands::Set { key, value } => {
            let stored = store
                .set_raw(&key, &value)
                .with_context(|| format!("Failed to write {path}"))?;
            println!("{key} = {stored}");
        }
        ConfigCommands::Clear { key } => {
            let restored = store
                .clear(&key)
                .with_context(|| format!("Failed to write {path}"))?;
            match restored {
                Some(value) => println!("{key} reset to {value}"),
                None => println!("{key} cleared"),
            }
        }
        ConfigCommands::List => {
            let values = store
                .list()
                .with_context(|| format!("Failed to read {path}"))?;
            for (key, value) in values {
                println!("{key}: {value}");
            }
        }
    }
    Ok(())
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn resolve_root(root_flag: &str, home: Option<&Path>) -> Option<PathBuf> {
    if !root_flag.trim().is_empty() {
        return Some(PathBuf::from(root_flag));
    }
    if let Some(value) = non_empty_env("FOREVER_ROOT") {
        return Some(PathBuf::from(value));
    }
    home.map(|home| home.join(ROOT_DIR_NAME))
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    non_empty_env("FW_ADDR").unwrap_or_else(|| DEFAULT_ADDR.to_string())
}

fn resolve_log_dir(log_dir_flag: &str) -> Option<PathBuf> {
    if !log_dir_flag.trim().is_empty() {
        return Some(PathBuf::from(log_dir_flag));
    }
    non_empty_env("FW_LOG_DIR").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_flag_beats_home_default() {
        assert_eq!(
            resolve_root("/srv/forever", Some(Path::new("/home/me"))),
            Some(PathBuf::from("/srv/forever"))
        );
        if std::env::var("FOREVER_ROOT").is_err() {
            assert_eq!(
                resolve_root("", Some(Path::new("/home/me"))),
                Some(PathBuf::from("/home/me/.forever"))
            );
            assert_eq!(resolve_root("", None), None);
        }
    }

    #[test]
    fn explicit_flags_are_used_verbatim() {
        assert_eq!(resolve_addr("127.0.0.1:9000"), "127.0.0.1:9000");
        assert_eq!(
            resolve_log_dir("/tmp/fw-logs"),
            Some(PathBuf::from("/tmp/fw-logs"))
        );
    }

    #[test]
    fn config_commands_round_through_the_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        run_config(
            dir.path(),
            ConfigCommands::Set {
                key: "refresh".into(),
                value: "2500".into(),
            },
        )
        .expect("set");
        let store = ConfigStore::open(dir.path());
        assert_eq!(store.refresh_interval(), Duration::from_millis(2500));

        run_config(dir.path(), ConfigCommands::Clear { key: "refresh".into() }).expect("clear");
        assert_eq!(store.refresh_interval(), Duration::from_millis(5000));
        run_config(dir.path(), ConfigCommands::List).expect("list");
        run_config(dir.path(), ConfigCommands::Get { key: "missing".into() }).expect("get");
    }

    #[test]
    fn cli_parses_config_subcommand() {
        let args = Args::try_parse_from(["fw-hub", "config", "set", "forever", "/srv/forever"])
            .expect("parse");
        match args.command {
            Some(Commands::Config {
                action: ConfigCommands::Set { key, value },
            }) => {
                assert_eq!(key, "forever");
                assert_eq!(value, "/srv/forever");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
