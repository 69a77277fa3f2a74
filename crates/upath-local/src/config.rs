use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use upath_core::LockConfig;

/// Configuration for the upath-local command line tool.
#[derive(Parser, Debug, Clone)]
#[command(name = "upath-local")]
#[command(about = "Distributed lock and dataset multiplexer over a local directory")]
pub struct Config {
    /// Root directory of the blob store
    #[arg(long, global = true, env = "UPATH_ROOT")]
    pub root: Option<PathBuf>,

    /// Seconds after which an unrenewed lock marker is considered dead
    #[arg(long, global = true, default_value = "120", env = "UPATH_LOCK_EXPIRY_SECS")]
    pub lock_expiry_secs: u64,

    /// Seconds to wait for a lock before giving up
    #[arg(long, global = true, default_value = "300", env = "UPATH_TIMEOUT_SECS")]
    pub timeout_secs: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Persist a dataset and print its id
    New {
        /// Directory that receives the dataset's versioned sub-directory
        #[arg(long)]
        location: String,

        /// Suffix appended to the version name
        #[arg(long)]
        tag: Option<String>,

        /// Elements as JSON; anything that does not parse is taken as a string
        #[arg(required = true)]
        elements: Vec<String>,
    },

    /// Start a read session over a dataset and print the session id
    Session { dataset_id: String },

    /// Print a session's progress as JSON
    Stat { id: String },

    /// Print whether a session is exhausted
    Done { id: String },

    /// Delete a dataset together with all of its sessions
    Destroy { id: String },

    /// List the read sessions of a dataset
    Sessions { dataset_id: String },

    /// Pull elements from a session, one JSON line each, until exhausted
    Work {
        session_id: String,

        /// Name recorded in the session status
        #[arg(long, env = "UPATH_WORKER_ID")]
        worker_id: Option<String>,
    },

    /// Acquire a lock on a path, hold it, then release it
    Lock {
        path: String,

        /// Seconds to hold the lock; holds until Ctrl+C when omitted
        #[arg(long)]
        hold_secs: Option<u64>,
    },
}

impl Config {
    /// Get the effective store root.
    pub fn effective_root(&self) -> PathBuf {
        self.root.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("upath")
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Lock settings derived from the command line.
    pub fn lock_config(&self) -> LockConfig {
        let expiry = Duration::from_secs(self.lock_expiry_secs);
        LockConfig {
            expiry,
            default_timeout: self.timeout(),
            renew_interval: Some(expiry / 4),
            ..LockConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_new() {
        let config = Config::parse_from([
            "upath-local",
            "--root",
            "/tmp/store",
            "new",
            "--location",
            "jobs",
            "--tag",
            "sweep",
            "1",
            "two",
        ]);
        assert_eq!(config.effective_root(), PathBuf::from("/tmp/store"));
        match config.command {
            Command::New {
                location,
                tag,
                elements,
            } => {
                assert_eq!(location, "jobs");
                assert_eq!(tag.as_deref(), Some("sweep"));
                assert_eq!(elements, vec!["1", "two"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_lock_config_from_flags() {
        let config = Config::parse_from([
            "upath-local",
            "lock",
            "res",
            "--lock-expiry-secs",
            "10",
            "--timeout-secs",
            "3",
        ]);
        let lock = config.lock_config();
        assert_eq!(lock.expiry, Duration::from_secs(10));
        assert_eq!(lock.default_timeout, Duration::from_secs(3));
        assert_eq!(lock.renew_interval, Some(Duration::from_millis(2500)));
        assert!(matches!(config.command, Command::Lock { hold_secs: None, .. }));
    }
}
