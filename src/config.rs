//! Configuration types for the speaker bridge.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Top-level configuration for the bridge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Vendor account, device and cloud endpoint settings.
    pub speaker: SpeakerConfig,
    /// Chat completion provider settings.
    pub chat: ChatConfig,
    /// Sentence segmentation settings.
    pub segment: SegmentConfig,
    /// Poll and backoff intervals.
    pub timing: TimingConfig,
}

/// Vendor account and device configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeakerConfig {
    /// Vendor account name (phone number or email).
    pub account: String,
    /// Vendor account password.
    ///
    /// Leave empty in the config file and set `SONA_PASSWORD` instead.
    pub password: String,
    /// Speaker hardware model, e.g. "LX06".
    pub hardware: String,
    /// Base URL of the account/login service.
    pub account_url: String,
    /// Base URL of the device control service.
    pub service_url: String,
    /// Base URL of the conversation profile service.
    pub profile_url: String,
    /// Emit TTS through a local vendor CLI instead of the cloud API.
    pub use_local_tts: bool,
    /// Binary invoked for local TTS (`{tts_bin} {slot} {text}`).
    pub tts_bin: String,
    /// Hardware model → CLI command slot.
    ///
    /// Only consulted when `use_local_tts` is enabled; the configured
    /// `hardware` must have an entry then.
    pub tts_slots: BTreeMap<String, String>,
    /// Override for the session token file path.
    ///
    /// Defaults to `~/.{account}.sona.token`.
    pub token_file: Option<PathBuf>,
}

impl Default for SpeakerConfig {
    fn default() -> Self {
        Self {
            account: String::new(),
            password: String::new(),
            hardware: String::new(),
            account_url: "https://account.xiaomi.com".to_owned(),
            service_url: "https://api2.mina.mi.com".to_owned(),
            profile_url: "https://userprofile.mina.mi.com".to_owned(),
            use_local_tts: false,
            tts_bin: "micli".to_owned(),
            tts_slots: default_tts_slots(),
            token_file: None,
        }
    }
}

impl SpeakerConfig {
    /// Path of the persisted session token file.
    pub fn token_path(&self) -> PathBuf {
        if let Some(ref path) = self.token_file {
            return path.clone();
        }
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
        home.join(format!(".{}.sona.token", self.account))
    }
}

/// Known speaker models and their local-CLI command slots.
fn default_tts_slots() -> BTreeMap<String, String> {
    [
        ("LX06", "5-1"),
        ("L05B", "5-3"),
        ("S12A", "5-1"),
        ("LX01", "5-1"),
        ("L06A", "5-1"),
        ("LX04", "5-1"),
        ("L05C", "5-3"),
        ("L17A", "7-3"),
        ("X08E", "7-3"),
        ("LX05A", "5-1"),
        ("LX5A", "5-1"),
    ]
    .into_iter()
    .map(|(hw, slot)| (hw.to_owned(), slot.to_owned()))
    .collect()
}

/// Chat completion provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Base URL of the OpenAI-compatible API.
    pub api_base: String,
    /// API key for the provider.
    ///
    /// Leave empty in the config file and set `SONA_API_KEY` instead.
    pub api_key: String,
    /// Model name to request.
    pub model: String,
    /// System prompt installed at the start of the conversation.
    pub system_prompt: String,
    /// Suffix appended to every forwarded voice query.
    ///
    /// Keeps spoken replies short and front-loads the first sentence so
    /// playback can start early.
    pub brevity_prompt: String,
    /// Sampling temperature.
    pub temperature: f64,
    /// Top-p (nucleus) sampling threshold.
    pub top_p: f64,
    /// Maximum tokens to generate per reply.
    pub max_tokens: usize,
    /// Maximum messages retained in the chat history, system prompt
    /// included. Bounds context growth over time; 0 disables trimming.
    pub max_history_messages: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com".to_owned(),
            api_key: String::new(),
            model: "gpt-3.5-turbo".to_owned(),
            system_prompt: "You are a helpful voice assistant. Respond conversationally."
                .to_owned(),
            brevity_prompt: "请用100字以内回答，第一句一定不要超过10个汉字或5个单词，并且请快速生成前几句话"
                .to_owned(),
            temperature: 0.5,
            top_p: 1.0,
            max_tokens: 512,
            max_history_messages: 24,
        }
    }
}

/// Sentence segmentation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    /// Boundary characters accepted while the early policy is active.
    ///
    /// Includes soft separators (commas) so the first fragments are short
    /// and playback starts quickly.
    pub early_boundaries: String,
    /// Boundary characters accepted after the early policy expires.
    pub strong_boundaries: String,
    /// Number of boundary hits after which extraction switches from the
    /// early set to the strong set.
    pub early_fragment_limit: usize,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            early_boundaries: "，。？！；,.?!;".to_owned(),
            strong_boundaries: "。？！；.?!;".to_owned(),
            early_fragment_limit: 3,
        }
    }
}

/// Poll and backoff intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Sleep between fragment-extraction attempts in ms.
    pub extract_backoff_ms: u64,
    /// Sleep between playback/interrupt polls while speaking, in ms.
    pub idle_poll_ms: u64,
    /// Sleep between main-loop query polls in ms.
    pub query_poll_ms: u64,
    /// Sleep before a full session renewal after a transport failure, in ms.
    pub reauth_backoff_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            extract_backoff_ms: 10,
            idle_poll_ms: 100,
            query_poll_ms: 500,
            reauth_backoff_ms: 1_000,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| BridgeError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| BridgeError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/sona/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("sona").join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("sona")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/sona-config/config.toml")
        }
    }

    /// Load from the given path, or the default path, or defaults when no
    /// file exists yet.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_or_default(path: Option<&std::path::Path>) -> Result<Self> {
        let path = path
            .map(PathBuf::from)
            .unwrap_or_else(Self::default_config_path);
        if path.exists() {
            Self::from_file(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Fill empty secrets from the environment.
    ///
    /// `SONA_ACCOUNT`, `SONA_PASSWORD` and `SONA_API_KEY` are consulted only
    /// when the corresponding field is empty, so file values win.
    pub fn apply_env(&mut self) {
        fill_from_env(&mut self.speaker.account, "SONA_ACCOUNT");
        fill_from_env(&mut self.speaker.password, "SONA_PASSWORD");
        fill_from_env(&mut self.chat.api_key, "SONA_API_KEY");
    }

    /// Check that everything required to start is present.
    ///
    /// # Errors
    ///
    /// Returns a config error naming the first missing or inconsistent
    /// setting.
    pub fn validate(&self) -> Result<()> {
        if self.speaker.account.is_empty() {
            return Err(BridgeError::Config(
                "speaker.account is not set (or SONA_ACCOUNT)".to_owned(),
            ));
        }
        if self.speaker.password.is_empty() {
            return Err(BridgeError::Config(
                "speaker.password is not set (or SONA_PASSWORD)".to_owned(),
            ));
        }
        if self.speaker.hardware.is_empty() {
            return Err(BridgeError::Config("speaker.hardware is not set".to_owned()));
        }
        if self.chat.api_key.is_empty() {
            return Err(BridgeError::Config(
                "chat.api_key is not set (or SONA_API_KEY)".to_owned(),
            ));
        }
        if self.speaker.use_local_tts && !self.speaker.tts_slots.contains_key(&self.speaker.hardware)
        {
            return Err(BridgeError::Config(format!(
                "hardware {} has no entry in speaker.tts_slots",
                self.speaker.hardware
            )));
        }
        if self.segment.early_boundaries.is_empty() || self.segment.strong_boundaries.is_empty() {
            return Err(BridgeError::Config(
                "segment boundary sets must not be empty".to_owned(),
            ));
        }
        Ok(())
    }
}

fn fill_from_env(field: &mut String, var: &str) {
    if field.is_empty()
        && let Ok(value) = std::env::var(var)
        && !value.is_empty()
    {
        *field = value;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn filled() -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.speaker.account = "13800000000".to_owned();
        config.speaker.password = "secret".to_owned();
        config.speaker.hardware = "LX06".to_owned();
        config.chat.api_key = "sk-test".to_owned();
        config
    }

    #[test]
    fn default_config_is_consistent() {
        let config = BridgeConfig::default();
        assert!(!config.speaker.account_url.is_empty());
        assert!(!config.speaker.service_url.is_empty());
        assert!(!config.speaker.profile_url.is_empty());
        assert_eq!(config.speaker.tts_slots.get("LX06").map(String::as_str), Some("5-1"));
        assert_eq!(config.speaker.tts_slots.get("L17A").map(String::as_str), Some("7-3"));
        assert_eq!(config.segment.early_fragment_limit, 3);
        assert!(config.chat.temperature >= 0.0);
        assert!(config.chat.top_p > 0.0 && config.chat.top_p <= 1.0);
        assert!(config.chat.max_tokens > 0);
        // Every strong boundary is also an early boundary.
        for c in config.segment.strong_boundaries.chars() {
            assert!(config.segment.early_boundaries.contains(c));
        }
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = std::env::temp_dir().join("sona-test-config-roundtrip");
        let path = dir.join("config.toml");

        let mut config = filled();
        config.segment.early_fragment_limit = 5;
        config.timing.query_poll_ms = 250;

        assert!(config.save_to_file(&path).is_ok());
        assert!(path.exists());

        let loaded = BridgeConfig::from_file(&path).expect("load saved config");
        assert_eq!(loaded.speaker.account, "13800000000");
        assert_eq!(loaded.segment.early_fragment_limit, 5);
        assert_eq!(loaded.timing.query_poll_ms, 250);
        assert_eq!(loaded.speaker.tts_slots.len(), config.speaker.tts_slots.len());

        // Cleanup
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn from_file_nonexistent_returns_error() {
        let result = BridgeConfig::from_file(std::path::Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn from_file_invalid_toml_returns_error() {
        let dir = std::env::temp_dir().join("sona-test-config-invalid");
        let path = dir.join("bad.toml");
        let _ = std::fs::create_dir_all(&dir);
        std::fs::write(&path, "this is not valid toml {{{").ok();

        let result = BridgeConfig::from_file(&path);
        assert!(result.is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn default_config_path_ends_with_config_toml() {
        let path = BridgeConfig::default_config_path();
        let path_str = path.to_string_lossy();
        assert!(path_str.ends_with("config.toml"));
        assert!(path_str.contains("sona"));
    }

    #[test]
    fn partial_file_uses_defaults_for_missing_fields() {
        let toml_str = r#"
[speaker]
hardware = "L05B"

[timing]
idle_poll_ms = 50
"#;
        let config: BridgeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.speaker.hardware, "L05B");
        assert_eq!(config.timing.idle_poll_ms, 50);
        assert_eq!(config.timing.query_poll_ms, 500);
        assert_eq!(config.chat.model, "gpt-3.5-turbo");
    }

    #[test]
    fn validate_rejects_missing_account() {
        let mut config = filled();
        config.speaker.account = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_missing_api_key() {
        let mut config = filled();
        config.chat.api_key = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_unknown_hardware_for_local_tts() {
        let mut config = filled();
        config.speaker.hardware = "ZZ99".to_owned();
        assert!(config.validate().is_ok());

        config.speaker.use_local_tts = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_accepts_filled_config() {
        assert!(filled().validate().is_ok());
    }

    #[test]
    fn token_path_uses_account_name() {
        let mut config = filled();
        config.speaker.token_file = None;
        let path = config.speaker.token_path();
        assert!(path.to_string_lossy().contains("13800000000"));

        config.speaker.token_file = Some(PathBuf::from("/tmp/custom.token"));
        assert_eq!(config.speaker.token_path(), PathBuf::from("/tmp/custom.token"));
    }

    #[test]
    fn apply_env_fills_only_empty_fields() {
        // No other test touches SONA_API_KEY, so mutating it here is safe.
        unsafe {
            std::env::set_var("SONA_API_KEY", "sk-from-env");
        }
        let mut config = filled();
        config.chat.api_key = "sk-file".to_owned();
        config.apply_env();
        assert_eq!(config.chat.api_key, "sk-file");

        config.chat.api_key = String::new();
        config.apply_env();
        assert_eq!(config.chat.api_key, "sk-from-env");
        unsafe {
            std::env::remove_var("SONA_API_KEY");
        }
    }
}
