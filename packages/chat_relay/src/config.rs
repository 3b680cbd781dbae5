use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Two equivalent ways to configure:
//
//   config.toml:     [server]
//                    port = 4820
//
//   env var:         CHAT_RELAY_SERVER__PORT=4820   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub client: ClientFileConfig,
    #[serde(default)]
    pub responder: ResponderFileConfig,
}

/// Server tunables (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Client tunables (lives under `[client]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientFileConfig {
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

impl Default for ClientFileConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

/// Mock responder pacing (lives under `[responder]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponderFileConfig {
    #[serde(default = "default_char_delay_ms")]
    pub char_delay_ms: u64,
    #[serde(default = "default_tool_delay_ms")]
    pub tool_delay_ms: u64,
    #[serde(default = "default_finish_delay_ms")]
    pub finish_delay_ms: u64,
}

impl Default for ResponderFileConfig {
    fn default() -> Self {
        Self {
            char_delay_ms: default_char_delay_ms(),
            tool_delay_ms: default_tool_delay_ms(),
            finish_delay_ms: default_finish_delay_ms(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    4820
}
fn default_reconnect_delay_ms() -> u64 {
    1000
}
fn default_char_delay_ms() -> u64 {
    30
}
fn default_tool_delay_ms() -> u64 {
    2000
}
fn default_finish_delay_ms() -> u64 {
    1000
}

impl ServerFileConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl ClientFileConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl ResponderFileConfig {
    pub fn to_responder_config(&self) -> crate::responder::ResponderConfig {
        crate::responder::ResponderConfig {
            char_delay: Duration::from_millis(self.char_delay_ms),
            tool_delay: Duration::from_millis(self.tool_delay_ms),
            finish_delay: Duration::from_millis(self.finish_delay_ms),
        }
    }
}

/// Build a figment that layers: defaults → config.toml → CHAT_RELAY_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `CHAT_RELAY_SERVER__PORT=5000`  →  `server.port = 5000`
///   `CHAT_RELAY_RESPONDER__CHAR_DELAY_MS=0`  →  `responder.char_delay_ms = 0`
pub fn load_config(config_path: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_path))
        .merge(Env::prefixed("CHAT_RELAY_").split("__"))
}

pub fn resolved_addr(config: &FileConfig) -> anyhow::Result<SocketAddr> {
    use anyhow::Context;
    config
        .server
        .bind_addr()
        .parse()
        .with_context(|| format!("invalid bind address {:?}", config.server.bind_addr()))
}
