use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::transport::ReconnectPolicy;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [session]
//                    rejoin_timeout_ms = 8000
//
//   env var:         ROOMSYNC_SESSION__REJOIN_TIMEOUT_MS=8000   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub relay: RelayFileConfig,
    #[serde(default)]
    pub session: SessionFileConfig,
    #[serde(default)]
    pub transport: TransportFileConfig,
    #[serde(default)]
    pub client: ClientFileConfig,
}

/// Relay endpoints (lives under `[relay]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayFileConfig {
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    /// Base URL of the REST surface (`/sessions/{code}/exists`).
    #[serde(default = "default_http_url")]
    pub http_url: String,
}

impl Default for RelayFileConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            http_url: default_http_url(),
        }
    }
}

/// Session timing (lives under `[session]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionFileConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_rejoin_timeout_ms")]
    pub rejoin_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// How long widgets get to remount after a recovery before orphan cleanup.
    #[serde(default = "default_orphan_settle_ms")]
    pub orphan_settle_ms: u64,
}

impl Default for SessionFileConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            rejoin_timeout_ms: default_rejoin_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            orphan_settle_ms: default_orphan_settle_ms(),
        }
    }
}

/// Reconnect backoff (lives under `[transport]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportFileConfig {
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

impl Default for TransportFileConfig {
    fn default() -> Self {
        Self {
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

/// Client identity (lives under `[client]` in config.toml).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClientFileConfig {
    #[serde(default)]
    pub display_name: Option<String>,
    /// Stable client id. Generated (and persisted with the session) when unset.
    #[serde(default)]
    pub client_id: Option<String>,
}

fn default_ws_url() -> String {
    "ws://127.0.0.1:3001/ws".to_string()
}
fn default_http_url() -> String {
    "http://127.0.0.1:3001".to_string()
}
fn default_ttl_secs() -> u64 {
    2 * 60 * 60
}
fn default_rejoin_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_orphan_settle_ms() -> u64 {
    1_000
}
fn default_reconnect_base_ms() -> u64 {
    500
}
fn default_reconnect_max_ms() -> u64 {
    30_000
}

/// Build a figment that layers: defaults → config.toml → ROOMSYNC_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `ROOMSYNC_RELAY__WS_URL=wss://relay.example/ws`  →  `relay.ws_url`
///   `ROOMSYNC_SESSION__TTL_SECS=60`  →  `session.ttl_secs = 60`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("ROOMSYNC_").split("__"))
}

/// Resolved configuration (runtime view).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncConfig {
    pub ws_url: String,
    pub http_url: String,
    pub session_ttl: Duration,
    pub rejoin_timeout: Duration,
    pub request_timeout: Duration,
    pub orphan_settle: Duration,
    pub reconnect: ReconnectPolicy,
    pub display_name: String,
    pub client_id: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}

impl SyncConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            ws_url: fc.relay.ws_url.clone(),
            http_url: fc.relay.http_url.clone(),
            session_ttl: Duration::from_secs(fc.session.ttl_secs),
            rejoin_timeout: Duration::from_millis(fc.session.rejoin_timeout_ms),
            request_timeout: Duration::from_millis(fc.session.request_timeout_ms),
            orphan_settle: Duration::from_millis(fc.session.orphan_settle_ms),
            reconnect: ReconnectPolicy {
                base: Duration::from_millis(fc.transport.reconnect_base_ms),
                max: Duration::from_millis(fc.transport.reconnect_max_ms),
            },
            display_name: fc
                .client
                .display_name
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "Participant".to_string()),
            client_id: fc.client.client_id.clone().filter(|s| !s.is_empty()),
        }
    }
}

/// On-disk home of a client: `~/.roomsync` unless overridden.
#[derive(Clone, Debug)]
pub struct DataDir {
    pub path: PathBuf,
}

impl DataDir {
    pub fn new(custom_dir: Option<PathBuf>) -> io::Result<Self> {
        let path = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no home directory"))?
                .join(".roomsync"),
        };
        std::fs::create_dir_all(path.join("state"))?;
        info!("Data directory: {}", path.display());
        Ok(Self { path })
    }

    pub fn state_dir(&self) -> PathBuf {
        self.path.join("state")
    }

    pub fn session_path(&self) -> PathBuf {
        self.state_dir().join("session.json")
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.path.join("config.toml")
    }
}
