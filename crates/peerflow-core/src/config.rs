use anyhow::{Context, Result};
use relay_core::DeviceClass;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Websocket URL of the signaling relay
    pub signaling_url: String,

    /// Name shown to other peers; a memorable one is generated when unset
    pub display_name: Option<String>,

    pub device_class: DeviceClass,

    pub heartbeat_secs: u64,

    /// Reconnect backoff starts here and doubles on every failed attempt
    pub reconnect_initial_secs: u64,
    pub reconnect_max_secs: u64,

    /// A session still negotiating after this long is torn down
    pub negotiation_timeout_secs: u64,

    /// Payload bytes per chunk frame (16 KiB)
    pub chunk_size: usize,

    /// Pause between two chunk frames
    pub chunk_pause_ms: u64,

    /// Sending waits while the channel has more than this many bytes queued
    pub max_buffered_amount: usize,

    /// Largest file accepted from, or sent to, a remote peer
    pub max_file_size: u64,

    /// Upper bound on `totalChunks` of an incoming file-info frame
    pub max_total_chunks: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://127.0.0.1:8080/ws".to_string(),
            display_name: None,
            device_class: DeviceClass::Desktop,
            heartbeat_secs: 10,
            reconnect_initial_secs: 3,
            reconnect_max_secs: 30,
            negotiation_timeout_secs: 30,
            chunk_size: 16 * 1024, // 16 KiB
            chunk_pause_ms: 5,
            max_buffered_amount: 1024 * 1024,
            max_file_size: 1024 * 1024 * 1024,
            max_total_chunks: 65_536,
        }
    }
}

impl ClientConfig {
    pub fn with_signaling_url(mut self, url: impl Into<String>) -> Self {
        self.signaling_url = url.into();
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_secs(self.reconnect_initial_secs.max(1))
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_secs.max(self.reconnect_initial_secs).max(1))
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs.max(1))
    }

    pub fn chunk_pause(&self) -> Duration {
        Duration::from_millis(self.chunk_pause_ms)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg: Self = serde_json::from_str(&raw).context("parsing config")?;
        if cfg.chunk_size == 0 {
            anyhow::bail!("chunk_size must be greater than zero");
        }
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw).context("writing config file")?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}
