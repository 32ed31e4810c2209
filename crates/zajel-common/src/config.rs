//! Transport configuration.
//!
//! Layering: defaults, then an optional JSON file, then `ZAJEL_*`
//! environment variables. The CLI applies its own flags last.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::helpers::{env_string, env_u64};
use crate::protocol::{DEFAULT_CHUNK_SIZE, MAX_MESSAGE_SIZE};

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub transfer: TransferConfig,
    pub negotiation: NegotiationConfig,
    pub signaling: SignalingConfig,
    pub max_message_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            transfer: TransferConfig::default(),
            negotiation: NegotiationConfig::default(),
            signaling: SignalingConfig::default(),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub chunk_size: u32,
    pub max_chunks_in_flight: usize,
    /// Base per-chunk ack timeout; repeated timeouts back off exponentially.
    pub chunk_timeout_ms: u64,
    pub max_chunk_timeout_ms: u64,
    pub max_retries_per_chunk: u32,
    pub buffer_high_water: usize,
    pub buffer_low_water: usize,
    pub buffer_stall_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub max_file_size: u64,
    pub max_chunks: u32,
    pub max_concurrent_transfers: usize,
    pub receive_dir: PathBuf,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_chunks_in_flight: 10,
            chunk_timeout_ms: 5_000,
            max_chunk_timeout_ms: 30_000,
            max_retries_per_chunk: 3,
            buffer_high_water: 1024 * 1024,
            buffer_low_water: 256 * 1024,
            buffer_stall_timeout_ms: 30_000,
            idle_timeout_ms: 60_000,
            max_file_size: 100 * 1024 * 1024,
            max_chunks: 10_000,
            max_concurrent_transfers: 10,
            receive_dir: PathBuf::from("./received_files"),
        }
    }
}

impl TransferConfig {
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }

    pub fn max_chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.max_chunk_timeout_ms)
    }

    pub fn buffer_stall_timeout(&self) -> Duration {
        Duration::from_millis(self.buffer_stall_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    pub ice_servers: Vec<String>,
    /// Remote candidates held while no remote description is set; oldest
    /// are dropped beyond this.
    pub max_pending_candidates: usize,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            max_pending_candidates: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    pub url: Option<String>,
    pub heartbeat_interval_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: None,
            heartbeat_interval_ms: 30_000,
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 60_000,
        }
    }
}

impl SignalingConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

impl TransportConfig {
    /// Load from a JSON file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {e}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| Error::config(format!("invalid config {}: {e}", path.display())))
    }

    /// Defaults, overlaid with the optional file, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = env_string("ZAJEL_SIGNALING_URL") {
            self.signaling.url = Some(url);
        }
        if let Some(dir) = env_string("ZAJEL_RECEIVE_DIR") {
            self.transfer.receive_dir = PathBuf::from(dir);
        }
        if let Some(servers) = env_string("ZAJEL_ICE_SERVERS") {
            self.negotiation.ice_servers = servers
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = env_u64_checked("ZAJEL_MAX_FILE_SIZE")? {
            self.transfer.max_file_size = v;
        }
        if let Some(v) = env_u64_checked("ZAJEL_CHUNK_TIMEOUT_MS")? {
            self.transfer.chunk_timeout_ms = v;
        }
        if let Some(v) = env_u64_checked("ZAJEL_IDLE_TIMEOUT_MS")? {
            self.transfer.idle_timeout_ms = v;
        }
        if let Some(v) = env_u64_checked("ZAJEL_HEARTBEAT_INTERVAL_MS")? {
            self.signaling.heartbeat_interval_ms = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let t = &self.transfer;
        if t.chunk_size == 0 {
            return Err(Error::config("transfer.chunk_size must be non-zero"));
        }
        if t.max_chunks_in_flight == 0 {
            return Err(Error::config("transfer.max_chunks_in_flight must be non-zero"));
        }
        if t.buffer_low_water >= t.buffer_high_water {
            return Err(Error::config(format!(
                "transfer.buffer_low_water ({}) must be below buffer_high_water ({})",
                t.buffer_low_water, t.buffer_high_water
            )));
        }
        if t.chunk_timeout_ms == 0 || t.max_chunk_timeout_ms < t.chunk_timeout_ms {
            return Err(Error::config(
                "transfer.max_chunk_timeout_ms must be >= chunk_timeout_ms > 0",
            ));
        }
        if t.max_concurrent_transfers == 0 {
            return Err(Error::config("transfer.max_concurrent_transfers must be non-zero"));
        }
        // chunk -> base64 inside JSON -> AEAD -> base64 frame
        let frame_estimate = encoded_len(encoded_len(t.chunk_size as usize + 256) + 32);
        if frame_estimate > self.max_message_size {
            return Err(Error::config(format!(
                "transfer.chunk_size {} does not fit max_message_size {}",
                t.chunk_size, self.max_message_size
            )));
        }
        if self.signaling.heartbeat_interval_ms == 0 || self.signaling.reconnect_initial_ms == 0 {
            return Err(Error::config(
                "signaling.heartbeat_interval_ms and reconnect_initial_ms must be non-zero",
            ));
        }
        if self.negotiation.max_pending_candidates == 0 {
            return Err(Error::config("negotiation.max_pending_candidates must be non-zero"));
        }
        Ok(())
    }
}

fn encoded_len(raw: usize) -> usize {
    raw.div_ceil(3) * 4
}

fn env_u64_checked(name: &str) -> Result<Option<u64>> {
    env_u64(name).map_err(|raw| Error::config(format!("{name}: invalid integer {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = TransportConfig::default();
        config.validate().unwrap();
        assert_eq!(config.transfer.chunk_size, 16 * 1024);
        assert_eq!(config.transfer.max_chunks_in_flight, 10);
        assert_eq!(config.transfer.chunk_timeout(), Duration::from_secs(5));
        assert_eq!(config.transfer.idle_timeout(), Duration::from_secs(60));
        assert_eq!(config.negotiation.ice_servers, vec![DEFAULT_STUN_SERVER]);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: TransportConfig =
            serde_json::from_str(r#"{"transfer":{"max_chunks_in_flight":4}}"#).unwrap();
        assert_eq!(config.transfer.max_chunks_in_flight, 4);
        assert_eq!(config.transfer.buffer_high_water, 1024 * 1024);
        assert_eq!(config.signaling.reconnect_max_ms, 60_000);
    }

    #[test]
    fn rejects_inverted_watermarks() {
        let mut config = TransportConfig::default();
        config.transfer.buffer_low_water = config.transfer.buffer_high_water;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_chunk_larger_than_message_limit() {
        let mut config = TransportConfig::default();
        config.transfer.chunk_size = 900 * 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_file_reads_json() {
        let path = std::env::temp_dir().join(format!("zajel-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"signaling":{"url":"wss://relay.example"}}"#).unwrap();
        let config = TransportConfig::from_file(&path).unwrap();
        assert_eq!(config.signaling.url.as_deref(), Some("wss://relay.example"));
        std::fs::remove_file(&path).unwrap();
    }
}
