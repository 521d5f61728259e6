//! Runtime configuration for the sync broker server (§6).

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory holding one file-backed store per room, named after the
    /// room's path with `/` replaced by `_`. Omit to run without
    /// persistence — rooms still work, they just don't survive a restart.
    /// Ignored if `database_url` is also set.
    #[serde(default)]
    pub store_dir: Option<String>,

    /// SQLite connection string for the DB-backed store
    /// (`syncboard_store::SqliteYStore`), one pool shared across every
    /// room's table rows. Takes priority over `store_dir` when both are
    /// set, since a deployment naming a database clearly wants its
    /// updates to live there.
    #[serde(default)]
    pub database_url: Option<String>,

    /// Entry expiry for the awareness registry, §6 `awareness_ttl_ms`.
    #[serde(default = "default_awareness_ttl_ms")]
    pub awareness_ttl_ms: u64,

    /// Per-client backpressure bound, §6 `client_send_queue_capacity`. Also
    /// sizes each room's fan-out channel, since that's where the bound is
    /// actually enforced (see `syncboard_room::RoomConfig`).
    #[serde(default = "default_send_queue_capacity")]
    pub client_send_queue_capacity: usize,

    /// Grace period given to in-flight client sends during shutdown before
    /// their tasks are aborted outright.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_port() -> u16 {
    3000
}

fn default_awareness_ttl_ms() -> u64 {
    30_000
}

fn default_send_queue_capacity() -> usize {
    1024
}

fn default_shutdown_grace_ms() -> u64 {
    2_000
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("SYNCBOARD"))
            .set_default("port", default_port())?
            .set_default("awareness_ttl_ms", default_awareness_ttl_ms())?
            .set_default("client_send_queue_capacity", default_send_queue_capacity() as i64)?
            .set_default("shutdown_grace_ms", default_shutdown_grace_ms())?
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn awareness_ttl(&self) -> Duration {
        Duration::from_millis(self.awareness_ttl_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            store_dir: None,
            database_url: None,
            awareness_ttl_ms: default_awareness_ttl_ms(),
            client_send_queue_capacity: default_send_queue_capacity(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}
