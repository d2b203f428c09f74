//! Configuration types for the voice session client.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for a voice session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Audio capture/render settings.
    pub audio: AudioConfig,
    /// Remote agent session settings.
    pub agent: AgentConfig,
    /// Agent speaking-activity signal settings.
    pub activity: ActivityConfig,
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture sample rate in Hz (the rate sent to the agent).
    pub input_sample_rate: u32,
    /// Render sample rate in Hz (the rate the agent streams back).
    pub output_sample_rate: u32,
    /// Capture frame size in samples (one encoded frame per wire message).
    pub frame_size: usize,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            frame_size: 4096,
            input_device: None,
            output_device: None,
        }
    }
}

/// Remote agent session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Model identifier for the live session.
    pub model: String,
    /// Prebuilt voice name for the agent's audio responses.
    pub voice: String,
    /// Optional system instruction text supplied to the agent verbatim.
    pub instructions: Option<String>,
    /// API key. Falls back to the `GEMINI_API_KEY` environment variable.
    pub api_key: Option<String>,
    /// WebSocket endpoint for the live session.
    pub endpoint: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "gemini-2.5-flash-native-audio-preview-09-2025".to_owned(),
            voice: "Kore".to_owned(),
            instructions: None,
            api_key: None,
            endpoint: crate::session::gemini::DEFAULT_ENDPOINT.to_owned(),
        }
    }
}

/// Agent speaking-activity signal configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityConfig {
    /// Quiet interval in ms after which "agent speaking" decays to false
    /// when no playback-idle notification arrived.
    pub quiet_interval_ms: u64,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            quiet_interval_ms: 2000,
        }
    }
}

impl VoiceConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::VoiceError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::VoiceError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `<config dir>/selkie/config.toml`.
    ///
    /// Resolves via the platform config directory. Override with the
    /// `SELKIE_CONFIG_DIR` environment variable.
    pub fn default_config_path() -> PathBuf {
        if let Some(override_dir) = std::env::var_os("SELKIE_CONFIG_DIR") {
            return PathBuf::from(override_dir).join("config.toml");
        }
        dirs::config_dir()
            .map(|d| d.join("selkie"))
            .unwrap_or_else(|| PathBuf::from("/tmp/selkie-config"))
            .join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = VoiceConfig::default();
        assert!(config.audio.input_sample_rate > 0);
        assert!(config.audio.output_sample_rate > 0);
        assert!(config.audio.frame_size > 0);
        assert!(!config.agent.model.is_empty());
        assert!(!config.agent.voice.is_empty());
        assert!(config.agent.endpoint.starts_with("wss://"));
        assert!(config.activity.quiet_interval_ms > 0);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");

        let mut config = VoiceConfig::default();
        config.audio.frame_size = 2048;
        config.agent.voice = "Puck".to_owned();
        config.activity.quiet_interval_ms = 500;

        config.save_to_file(&path).expect("save");
        assert!(path.exists());

        let loaded = VoiceConfig::from_file(&path).expect("load");
        assert_eq!(loaded.audio.frame_size, 2048);
        assert_eq!(loaded.agent.voice, "Puck");
        assert_eq!(loaded.activity.quiet_interval_ms, 500);
    }

    #[test]
    fn from_file_nonexistent_returns_error() {
        let result = VoiceConfig::from_file(std::path::Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn from_file_invalid_toml_returns_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "this is not valid toml {{{").expect("write");

        let result = VoiceConfig::from_file(&path);
        assert!(result.is_err());
    }

    #[test]
    fn empty_toml_deserializes_to_defaults() {
        let config: VoiceConfig = toml::from_str("").expect("deserialize empty TOML");
        assert_eq!(config.audio.input_sample_rate, 16_000);
        assert_eq!(config.audio.output_sample_rate, 24_000);
        assert_eq!(config.audio.frame_size, 4096);
        assert_eq!(config.activity.quiet_interval_ms, 2000);
    }

    #[test]
    fn default_config_path_ends_with_config_toml() {
        let path = VoiceConfig::default_config_path();
        let path_str = path.to_string_lossy();
        assert!(path_str.ends_with("config.toml"));
        assert!(path_str.contains("selkie"));
    }
}
