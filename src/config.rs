//! Daemon configuration.
//!
//! Every option can be given on the command line or through a `CONSENT_*`
//! environment variable. [`RelayConfig::validate`] runs before anything is
//! opened; a failure is a startup error and the daemon exits non-zero.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::coordinator::CoordinatorConfig;
use crate::error::{RelayError, RelayResult};
use crate::publisher::PublisherConfig;
use crate::session::MIN_SECRET_LEN;

/// Where a store, cursor or bus lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// Process memory; lost on exit.
    Memory,
    /// A directory owned by this process (file locked).
    Directory(PathBuf),
}

impl Location {
    /// `memory` (case-insensitive) or a directory path.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("memory") {
            Self::Memory
        } else {
            Self::Directory(PathBuf::from(raw))
        }
    }

    /// True for the in-memory backend.
    #[must_use]
    pub const fn is_memory(&self) -> bool {
        matches!(self, Self::Memory)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::Directory(dir) => write!(f, "{}", dir.display()),
        }
    }
}

/// consent-relayd configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "consent-relayd")]
#[command(about = "Consent store change relay: publishes consent deltas to an event bus", long_about = None)]
#[command(version)]
pub struct RelayConfig {
    /// Event bus: `memory` or a log bus directory
    #[arg(long, env = "CONSENT_BUS", default_value = "memory")]
    pub bus: String,

    /// Topic consent deltas are published to
    #[arg(long, env = "CONSENT_TOPIC", default_value = "consent-deltas")]
    pub topic: String,

    /// Consent store: `memory` or a database directory
    #[arg(long, env = "CONSENT_STORE", default_value = "memory")]
    pub store: String,

    /// Cursor directory (defaults to the store directory)
    #[arg(long, env = "CONSENT_CURSOR_DIR")]
    pub cursor_dir: Option<PathBuf>,

    /// HTTP listen address
    #[arg(long, env = "CONSENT_HTTP_HOST", default_value = "0.0.0.0")]
    pub http_host: IpAddr,

    /// HTTP listen port
    #[arg(short, long, env = "CONSENT_HTTP_PORT", default_value_t = 8081)]
    pub port: u16,

    /// Secret used to verify session tokens
    #[arg(long, env = "CONSENT_SESSION_SECRET", hide_env_values = true)]
    pub session_secret: Option<String>,

    /// Maximum concurrently served HTTP requests
    #[arg(long, env = "CONSENT_MAX_SOCKETS", default_value_t = 256)]
    pub max_sockets: usize,

    /// Time allowed for in-flight events at shutdown, in milliseconds
    #[arg(long, env = "CONSENT_SHUTDOWN_GRACE_MS", default_value_t = 10_000)]
    pub shutdown_grace_ms: u64,

    /// Publisher queue capacity
    #[arg(long, env = "CONSENT_QUEUE_CAP", default_value_t = 10_000)]
    pub queue_cap: usize,

    /// How long a publish may wait for queue space before it is shed, in milliseconds
    #[arg(long, env = "CONSENT_SHED_TIMEOUT_MS", default_value_t = 60_000)]
    pub shed_timeout_ms: u64,

    /// Worker lanes (defaults to available parallelism)
    #[arg(long, env = "CONSENT_LANES")]
    pub lanes: Option<usize>,

    /// Rewinds allowed for an event the bus rejects before it is dead-lettered
    #[arg(long, env = "CONSENT_MAX_EVENT_REWINDS", default_value_t = 5)]
    pub max_event_rewinds: u32,

    /// Publish updates that neither grant nor withdraw anything
    #[arg(long, env = "CONSENT_EMIT_EMPTY_UPDATES")]
    pub emit_empty_updates: bool,

    /// Skip fsync on store, cursor-adjacent and bus writes
    #[arg(long, env = "CONSENT_NO_FSYNC")]
    pub no_fsync: bool,

    /// Insert the demo policies, applications and subjects at startup
    #[arg(long, env = "CONSENT_SEED_DEMO")]
    pub seed_demo: bool,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, env = "CONSENT_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long, env = "CONSENT_LOG_JSON")]
    pub log_json: bool,
}

impl RelayConfig {
    /// Checks every option; the first problem is reported.
    pub fn validate(&self) -> RelayResult<()> {
        if self.topic.trim().is_empty() {
            return Err(RelayError::config("topic must not be empty"));
        }
        if self.bus.trim().is_empty() {
            return Err(RelayError::config("bus location must not be empty"));
        }
        if self.store.trim().is_empty() {
            return Err(RelayError::config("store location must not be empty"));
        }
        match &self.session_secret {
            None => return Err(RelayError::config("session secret is required (CONSENT_SESSION_SECRET)")),
            Some(secret) if secret.len() < MIN_SECRET_LEN => {
                return Err(RelayError::config(format!(
                    "session secret must be at least {MIN_SECRET_LEN} bytes"
                )));
            }
            Some(_) => {}
        }
        if self.max_sockets == 0 {
            return Err(RelayError::config("max sockets must be positive"));
        }
        if self.queue_cap == 0 {
            return Err(RelayError::config("publisher queue cap must be positive"));
        }
        if self.shed_timeout_ms == 0 {
            return Err(RelayError::config("publisher shed timeout must be positive"));
        }
        if self.lanes == Some(0) {
            return Err(RelayError::config("lane count must be positive"));
        }
        if self.store_location().is_memory() && self.cursor_dir.is_some() {
            return Err(RelayError::config(
                "a durable cursor over an in-memory store would skip changes after restart",
            ));
        }
        Ok(())
    }

    /// Where subjects and catalogs live.
    #[must_use]
    pub fn store_location(&self) -> Location {
        Location::parse(&self.store)
    }

    /// Where bus records are appended.
    #[must_use]
    pub fn bus_location(&self) -> Location {
        Location::parse(&self.bus)
    }

    /// Explicit cursor directory, else the store directory, else memory.
    #[must_use]
    pub fn cursor_location(&self) -> Location {
        match (&self.cursor_dir, self.store_location()) {
            (Some(dir), _) => Location::Directory(dir.clone()),
            (None, store) => store,
        }
    }

    /// Address the HTTP API binds to.
    #[must_use]
    pub const fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.http_host, self.port)
    }

    /// Grace period for in-flight events at shutdown.
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Whether store writes are fsynced.
    #[must_use]
    pub const fn sync_on_write(&self) -> bool {
        !self.no_fsync
    }

    /// Publisher settings derived from the flags.
    #[must_use]
    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            topic: self.topic.clone(),
            queue_capacity: self.queue_cap,
            shed_timeout: Duration::from_millis(self.shed_timeout_ms),
            ..PublisherConfig::default()
        }
    }

    /// Coordinator settings derived from the flags.
    #[must_use]
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        let defaults = CoordinatorConfig::default();
        CoordinatorConfig {
            lanes: self.lanes.unwrap_or(defaults.lanes),
            shutdown_grace: self.shutdown_grace(),
            emit_empty_updates: self.emit_empty_updates,
            max_event_rewinds: self.max_event_rewinds,
            ..defaults
        }
    }
}
