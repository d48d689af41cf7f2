use crate::coordinator::CoordinatorConfig;
use crate::events::EmitterConfig;
use crate::gate::GatesConfig;
use crate::logging::LogConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// One upstream API endpoint. The key is read from the named environment
/// variable so secrets never land in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub api_key_env: String,
    pub model: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.groq.com/openai/v1".to_string(),
            api_key_env: "GROQ_API_KEY".to_string(),
            model: "whisper-large-v3".to_string(),
        }
    }
}

impl UpstreamConfig {
    pub fn api_key(&self) -> String {
        std::env::var(&self.api_key_env).unwrap_or_default()
    }
}

/// Engine configuration, stored as JSON. Every field has a default so a
/// missing or partial file still yields a working service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub bind_addr: String,
    /// Root of the on-disk object store. None means `~/.chunkscribe/data`.
    pub data_dir: Option<PathBuf>,
    /// Directory for rotating log files. None means `~/.chunkscribe/logs`.
    pub log_dir: Option<PathBuf>,
    pub log_to_file: bool,
    /// Filter directive applied when `RUST_LOG` is unset.
    pub log_level: String,
    pub log_max_files: usize,
    pub default_chunk_size_mb: u64,
    /// Byte-splitter overlap as a percent of the chunk.
    pub overlap_percent: u64,
    pub overlap_cap_kb: u64,
    pub max_workers: usize,
    pub record_ttl_hours: u64,
    pub sweep_interval_secs: u64,
    pub sse_tick_secs: u64,
    pub sse_max_minutes: u64,
    pub url_fetch_timeout_secs: u64,
    pub http_connect_timeout_secs: u64,
    pub gates: GatesConfig,
    pub transcription: UpstreamConfig,
    pub correction: UpstreamConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            data_dir: None,
            log_dir: None,
            log_to_file: true,
            log_level: "info".to_string(),
            log_max_files: 5,
            default_chunk_size_mb: 10,
            overlap_percent: 5,
            overlap_cap_kb: 50,
            max_workers: 4,
            record_ttl_hours: 24,
            sweep_interval_secs: 300,
            sse_tick_secs: 2,
            sse_max_minutes: 30,
            url_fetch_timeout_secs: 30,
            http_connect_timeout_secs: 10,
            gates: GatesConfig::default(),
            transcription: UpstreamConfig::default(),
            correction: UpstreamConfig {
                model: "llama-3.3-70b-versatile".to_string(),
                ..UpstreamConfig::default()
            },
        }
    }
}

impl EngineConfig {
    /// Loads from `CHUNKSCRIBE_CONFIG` or `~/.chunkscribe/config.json`,
    /// falling back to defaults when no file exists.
    pub fn load() -> Result<Self> {
        let path = match std::env::var_os("CHUNKSCRIBE_CONFIG") {
            Some(path) => PathBuf::from(path),
            None => Self::default_config_path()?,
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    fn default_config_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("failed to resolve home directory")?;
        Ok(home.join(".chunkscribe").join("config.json"))
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => {
                let home = dirs::home_dir().context("failed to resolve home directory")?;
                Ok(home.join(".chunkscribe").join("data"))
            }
        }
    }

    pub fn log_config(&self) -> Result<LogConfig> {
        let log_dir = match &self.log_dir {
            Some(dir) => dir.clone(),
            None => {
                let home = dirs::home_dir().context("failed to resolve home directory")?;
                home.join(".chunkscribe").join("logs")
            }
        };
        Ok(LogConfig {
            log_dir,
            file_prefix: "chunkscribe".to_string(),
            max_files: self.log_max_files.max(1),
            log_to_file: self.log_to_file,
            default_directive: self.log_level.clone(),
        })
    }

    pub fn record_ttl(&self) -> Duration {
        Duration::from_secs(self.record_ttl_hours.max(1) * 3600)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn emitter_config(&self) -> EmitterConfig {
        EmitterConfig {
            tick: Duration::from_secs(self.sse_tick_secs.max(1)),
            max_duration: Duration::from_secs(self.sse_max_minutes.max(1) * 60),
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            overlap_percent: self.overlap_percent,
            overlap_cap_bytes: self.overlap_cap_kb * 1024,
            url_fetch_timeout: Duration::from_secs(self.url_fetch_timeout_secs.max(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_contract() {
        let config = EngineConfig::default();
        assert_eq!(config.default_chunk_size_mb, 10);
        assert_eq!(config.overlap_percent, 5);
        assert_eq!(config.overlap_cap_kb, 50);
        assert_eq!(config.record_ttl(), Duration::from_secs(24 * 3600));
        assert_eq!(config.emitter_config().tick, Duration::from_secs(2));
        assert_eq!(
            config.emitter_config().max_duration,
            Duration::from_secs(30 * 60)
        );
    }

    #[test]
    fn log_config_follows_engine_settings() {
        let config = EngineConfig {
            log_dir: Some(PathBuf::from("/var/log/scribe")),
            log_to_file: false,
            log_level: "api=debug,jobs=info".to_string(),
            log_max_files: 0,
            ..EngineConfig::default()
        };
        let log = config.log_config().unwrap();
        assert_eq!(log.log_dir, PathBuf::from("/var/log/scribe"));
        assert!(!log.log_to_file);
        assert_eq!(log.default_directive, "api=debug,jobs=info");
        // Rotation always keeps at least one file.
        assert_eq!(log.max_files, 1);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"bind_addr": "127.0.0.1:8080"}"#).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.transcription.model, "whisper-large-v3");
    }
}
