//! Waypoint application binary - composition root.
//!
//! 1. Parse CLI arguments and load configuration from TOML
//! 2. Initialize tracing
//! 3. Open the history profile on a service worker
//! 4. Run one command and print its result as JSON
//! 5. Shut the worker down, which commits any pending writes

mod cli;

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{Duration, Utc};
use clap::Parser;
use serde_json::json;
use url::Url;

use waypoint_core::config::WaypointConfig;
use waypoint_core::error::WaypointError;
use waypoint_core::types::{PageTransition, QueryOptions};
use waypoint_history::{AddPageArgs, HistoryDeps, HistoryService};

use cli::{CliArgs, Command};

/// Expand ~ to home directory in a path string.
fn resolve_data_dir(data_dir: &str) -> PathBuf {
    if data_dir.starts_with("~/") || data_dir.starts_with("~\\") {
        #[cfg(target_os = "windows")]
        let home = std::env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string());
        #[cfg(not(target_os = "windows"))]
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(&data_dir[2..])
    } else {
        PathBuf::from(data_dir)
    }
}

fn parse_url(s: &str) -> Result<Url, WaypointError> {
    Url::parse(s).map_err(|e| WaypointError::Url(format!("{}: {}", s, e)))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), WaypointError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(service: &HistoryService, command: Command) -> Result<(), WaypointError> {
    match command {
        Command::Visit {
            url,
            transition,
            referrer,
            redirects,
            title,
        } => {
            let url = parse_url(&url)?;
            let transition = PageTransition::from_core_name(&transition).ok_or_else(|| {
                WaypointError::Config(format!("Unknown transition type: {}", transition))
            })?;
            let mut args = AddPageArgs::new(url.clone(), Utc::now(), transition);
            args.referrer = referrer.as_deref().map(parse_url).transpose()?;
            args.redirects = redirects
                .iter()
                .map(|r| parse_url(r))
                .collect::<Result<Vec<_>, _>>()?;
            service.add_page(args)?;
            if let Some(title) = title {
                service.set_page_title(url.clone(), title)?;
            }
            let row = service.query_url(url, false).wait().await??;
            print_json(&row.map(|(row, _)| row))
        }
        Command::Title { url, title } => {
            service.set_page_title(parse_url(&url)?, title)?;
            print_json(&json!({ "ok": true }))
        }
        Command::Query { text, max, days } => {
            let mut options = QueryOptions::with_max_count(max);
            options.begin_time = days.map(|d| Utc::now() - Duration::days(d));
            let results = service
                .query_history(text.unwrap_or_default(), options)
                .wait()
                .await??;
            print_json(&results)
        }
        Command::Top { count, days } => {
            let top = service.query_most_visited_urls(count, days).wait().await??;
            print_json(&top)
        }
        Command::Redirects { url } => {
            let chain = service
                .query_redirects_from(parse_url(&url)?)
                .wait()
                .await??;
            print_json(&chain)
        }
        Command::Delete { urls } => {
            let urls = urls
                .iter()
                .map(|u| parse_url(u))
                .collect::<Result<Vec<_>, _>>()?;
            let count = urls.len();
            service.delete_urls(urls).wait().await??;
            print_json(&json!({ "deleted": count }))
        }
        Command::Wipe => {
            service
                .expire_history_between(BTreeSet::new(), None, None)
                .wait()
                .await??;
            print_json(&json!({ "wiped": true }))
        }
        Command::Archive => {
            let moved = service.archive_old_visits().wait().await??;
            print_json(&json!({ "archived_visits": moved }))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config.
    let config_file = args.resolve_config_path();
    let mut config = WaypointConfig::load_or_default(&config_file);
    if let Some(data_dir) = args.resolve_data_dir() {
        config.general.data_dir = data_dir;
    }
    if let Some(level) = args.resolve_log_level() {
        config.general.log_level = level;
    }

    // Tracing. Logs go to stderr so stdout stays valid JSON.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.general.log_level)),
        )
        .init();

    tracing::info!("Starting Waypoint v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(path = %config_file.display(), "Configuration resolved");

    // Profile.
    let data_dir = resolve_data_dir(&config.general.data_dir);
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::error!(path = %data_dir.display(), error = %e, "Failed to create data directory");
        return Err(e.into());
    }

    let service = HistoryService::open(&data_dir, config.history.clone(), HistoryDeps::detached());
    tracing::info!(path = %data_dir.display(), "History profile opened");

    let result = run(&service, args.command).await;
    service.shutdown().await;
    result?;
    Ok(())
}
