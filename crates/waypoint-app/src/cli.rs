//! CLI argument definitions for the Waypoint application.
//!
//! Uses `clap` with derive macros for ergonomic argument parsing.
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Waypoint - a browsing history store you can query from the shell.
#[derive(Parser, Debug)]
#[command(name = "waypoint", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Profile directory holding the history stores.
    #[arg(short = 'd', long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Record a navigation.
    Visit {
        url: String,
        /// Core transition type (link, typed, reload, ...).
        #[arg(short = 't', long, default_value = "link")]
        transition: String,
        /// Page the navigation came from.
        #[arg(long)]
        referrer: Option<String>,
        /// Redirect hops in order, ending with the visited URL.
        #[arg(long = "redirect")]
        redirects: Vec<String>,
        /// Title to record for the page.
        #[arg(long)]
        title: Option<String>,
    },
    /// Set the title of a visited page.
    Title { url: String, title: String },
    /// List history, or search it when a query is given.
    Query {
        text: Option<String>,
        /// Maximum number of results (0 for no limit).
        #[arg(short = 'n', long, default_value_t = 50)]
        max: usize,
        /// Only look this many days back.
        #[arg(long)]
        days: Option<i64>,
    },
    /// Show the most visited pages.
    Top {
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,
        #[arg(long, default_value_t = 90)]
        days: i64,
    },
    /// Show the redirect chain that starts at a URL.
    Redirects { url: String },
    /// Delete URLs from all stores.
    Delete {
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Delete all history except bookmarked URLs.
    Wipe,
    /// Move old visits into the archived store now.
    Archive,
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > WAYPOINT_CONFIG env var > platform default (~/.waypoint/config.toml).
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("WAYPOINT_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Resolve the profile directory.
    ///
    /// Priority: --data-dir flag > WAYPOINT_DATA_DIR env var > config file value.
    /// Returns `None` if neither is overridden (use config default).
    pub fn resolve_data_dir(&self) -> Option<String> {
        if let Some(ref p) = self.data_dir {
            return Some(p.to_string_lossy().to_string());
        }
        std::env::var("WAYPOINT_DATA_DIR").ok()
    }

    /// Resolve the log level.
    ///
    /// Priority: --log-level flag > config file value.
    /// Returns `None` if not overridden.
    pub fn resolve_log_level(&self) -> Option<String> {
        self.log_level.clone()
    }
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".waypoint").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".waypoint").join("config.toml");
    }
    PathBuf::from("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_visit_with_redirects() {
        let args = CliArgs::parse_from([
            "waypoint",
            "visit",
            "https://c.test/",
            "--transition",
            "typed",
            "--redirect",
            "https://a.test/",
            "--redirect",
            "https://c.test/",
        ]);
        match args.command {
            Command::Visit {
                url,
                transition,
                redirects,
                ..
            } => {
                assert_eq!(url, "https://c.test/");
                assert_eq!(transition, "typed");
                assert_eq!(redirects.len(), 2);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = CliArgs::parse_from(["waypoint", "wipe", "--data-dir", "/tmp/profile"]);
        assert!(matches!(args.command, Command::Wipe));
        assert_eq!(args.resolve_data_dir().as_deref(), Some("/tmp/profile"));
    }

    #[test]
    fn test_explicit_config_wins() {
        let args = CliArgs::parse_from(["waypoint", "-c", "/etc/waypoint.toml", "archive"]);
        assert_eq!(args.resolve_config_path(), PathBuf::from("/etc/waypoint.toml"));
    }

    #[test]
    fn test_query_defaults() {
        let args = CliArgs::parse_from(["waypoint", "query"]);
        match args.command {
            Command::Query { text, max, days } => {
                assert!(text.is_none());
                assert_eq!(max, 50);
                assert!(days.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
