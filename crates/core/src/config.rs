use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub ui: UiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            ws_url: default_ws_url(),
            request_timeout_seconds: default_request_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionConfig {
    /// File holding the bearer token. Defaults to `token` in the data dir.
    pub token_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RealtimeConfig {
    #[serde(default = "default_heartbeat_interval_seconds")]
    pub heartbeat_interval_seconds: u64,
    #[serde(default = "default_reconnect_delay_seconds")]
    pub reconnect_delay_seconds: u64,
    /// 0 retries forever.
    #[serde(default)]
    pub max_reconnect_attempts: u32,
    #[serde(default)]
    pub reconnect_jitter: f64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: default_heartbeat_interval_seconds(),
            reconnect_delay_seconds: default_reconnect_delay_seconds(),
            max_reconnect_attempts: 0,
            reconnect_jitter: 0.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_unread_refresh_seconds")]
    pub unread_refresh_seconds: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            unread_refresh_seconds: default_unread_refresh_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UiConfig {
    #[serde(default = "default_true")]
    pub notifications: bool,
    #[serde(default = "default_true")]
    pub sound: bool,
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            notifications: true,
            sound: true,
            preview_chars: default_preview_chars(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct ConfigOverrides {
    api_base_url: Option<String>,
    ws_url: Option<String>,
    token_path: Option<String>,
    log_level: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_api_base_url() -> String {
    "http://localhost:8080/api".to_string()
}

fn default_ws_url() -> String {
    "ws://localhost:8080/ws/message".to_string()
}

fn default_request_timeout_seconds() -> u64 {
    10
}

fn default_heartbeat_interval_seconds() -> u64 {
    30
}

fn default_reconnect_delay_seconds() -> u64 {
    3
}

fn default_unread_refresh_seconds() -> u64 {
    60
}

fn default_preview_chars() -> usize {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

const DEFAULT_CONFIG_TOML: &str = r#"[server]
api_base_url = "http://localhost:8080/api"
ws_url = "ws://localhost:8080/ws/message"
request_timeout_seconds = 10

[session]
# token_path = "~/.local/share/exchange/token"

[realtime]
heartbeat_interval_seconds = 30
reconnect_delay_seconds = 3
# 0 keeps retrying until logout
max_reconnect_attempts = 0
reconnect_jitter = 0.0

[sync]
unread_refresh_seconds = 60

[ui]
notifications = true
sound = true
preview_chars = 30

[logging]
level = "info"
"#;

/// Return the resolved platform-appropriate configuration file path.
#[cfg(feature = "native")]
pub fn config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("edu", "campus-exchange", "exchange") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        PathBuf::from("config.toml")
    }
}

/// Default location of the persisted credential token.
#[cfg(feature = "native")]
pub fn default_token_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("edu", "campus-exchange", "exchange") {
        proj_dirs.data_dir().join("token")
    } else {
        PathBuf::from("token")
    }
}

/// Load configuration from the platform config path, merging environment
/// variable overrides. A missing file is created with defaults.
#[cfg(feature = "native")]
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(config_path())
}

/// Load configuration from a specific path. Used by `load_config()` and tests.
pub fn load_config_from(path: PathBuf) -> Result<Config, ConfigError> {
    load_config_from_with_overrides(&path, config_overrides_from_env())
}

/// Parse configuration from a TOML string directly.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    load_config_from_str_with_overrides(toml_str, config_overrides_from_env())
}

fn load_config_from_with_overrides(
    path: &Path,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            create_default_config(path)?;
            tracing::info!(path = %path.display(), "wrote default configuration");
            DEFAULT_CONFIG_TOML.to_string()
        }
        Err(e) => return Err(ConfigError::Io(e)),
    };

    load_config_from_str_with_overrides(&contents, overrides)
}

fn load_config_from_str_with_overrides(
    toml_str: &str,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let mut config: Config = toml::from_str(toml_str).map_err(|e| {
        let (line, column) = e.span().map_or((0, 0), |span| {
            let before = &toml_str[..span.start];
            let line = before.chars().filter(|&c| c == '\n').count() + 1;
            let column = before
                .rfind('\n')
                .map_or(span.start + 1, |nl| span.start - nl);
            (line, column)
        });
        ConfigError::InvalidToml {
            line,
            column,
            message: e.message().to_string(),
        }
    })?;

    apply_overrides(&mut config, overrides);
    validate(&config)?;

    Ok(config)
}

fn config_overrides_from_env() -> ConfigOverrides {
    ConfigOverrides {
        api_base_url: std::env::var("EXCHANGE_API_URL").ok(),
        ws_url: std::env::var("EXCHANGE_WS_URL").ok(),
        token_path: std::env::var("EXCHANGE_TOKEN_PATH").ok(),
        log_level: std::env::var("EXCHANGE_LOG_LEVEL").ok(),
    }
}

fn apply_overrides(config: &mut Config, overrides: ConfigOverrides) {
    if let Some(url) = overrides.api_base_url {
        config.server.api_base_url = url;
    }
    if let Some(url) = overrides.ws_url {
        config.server.ws_url = url;
    }
    if let Some(path) = overrides.token_path {
        config.session.token_path = Some(path);
    }
    if let Some(level) = overrides.log_level {
        config.logging.level = level;
    }
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.into(),
    }
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    let api = Url::parse(&config.server.api_base_url)
        .map_err(|e| invalid("server.api_base_url", e.to_string()))?;
    if !matches!(api.scheme(), "http" | "https") {
        return Err(invalid("server.api_base_url", "scheme must be http or https"));
    }

    let ws =
        Url::parse(&config.server.ws_url).map_err(|e| invalid("server.ws_url", e.to_string()))?;
    if !matches!(ws.scheme(), "ws" | "wss") {
        return Err(invalid("server.ws_url", "scheme must be ws or wss"));
    }

    if config.server.request_timeout_seconds == 0 {
        return Err(invalid("server.request_timeout_seconds", "must be positive"));
    }
    if config.realtime.heartbeat_interval_seconds == 0 {
        return Err(invalid(
            "realtime.heartbeat_interval_seconds",
            "must be positive",
        ));
    }
    if config.realtime.reconnect_delay_seconds == 0 {
        return Err(invalid("realtime.reconnect_delay_seconds", "must be positive"));
    }
    if !(0.0..=1.0).contains(&config.realtime.reconnect_jitter) {
        return Err(invalid(
            "realtime.reconnect_jitter",
            "must be between 0.0 and 1.0",
        ));
    }
    if config.sync.unread_refresh_seconds == 0 {
        return Err(invalid("sync.unread_refresh_seconds", "must be positive"));
    }

    if !VALID_LOG_LEVELS.contains(&config.logging.level.as_str()) {
        return Err(invalid(
            "logging.level",
            format!("must be one of: {}", VALID_LOG_LEVELS.join(", ")),
        ));
    }

    Ok(())
}

fn create_default_config(path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, DEFAULT_CONFIG_TOML)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn parse_without_env(toml_str: &str) -> Result<Config, ConfigError> {
        load_config_from_str_with_overrides(toml_str, ConfigOverrides::default())
    }

    // ── Parsing ─────────────────────────────────────────────────────

    #[test]
    fn default_file_parses_to_defaults() {
        let config = parse_without_env(DEFAULT_CONFIG_TOML).unwrap();
        assert_eq!(config.server.api_base_url, "http://localhost:8080/api");
        assert_eq!(config.server.ws_url, "ws://localhost:8080/ws/message");
        assert_eq!(config.server.request_timeout(), Duration::from_secs(10));
        assert!(config.session.token_path.is_none());
        assert_eq!(config.realtime.heartbeat_interval_seconds, 30);
        assert_eq!(config.realtime.reconnect_delay_seconds, 3);
        assert_eq!(config.realtime.max_reconnect_attempts, 0);
        assert_eq!(config.realtime.reconnect_jitter, 0.0);
        assert_eq!(config.sync.unread_refresh_seconds, 60);
        assert!(config.ui.notifications);
        assert!(config.ui.sound);
        assert_eq!(config.ui.preview_chars, 30);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = parse_without_env("").unwrap();
        assert_eq!(config.realtime.heartbeat_interval_seconds, 30);
        assert_eq!(config.ui.preview_chars, 30);
    }

    #[test]
    fn parses_custom_values() {
        let toml = r#"
[server]
api_base_url = "https://market.example.edu/api"
ws_url = "wss://market.example.edu/ws/message"

[session]
token_path = "/tmp/exchange-token"

[realtime]
max_reconnect_attempts = 5
reconnect_jitter = 0.25

[ui]
sound = false
"#;
        let config = parse_without_env(toml).unwrap();
        assert_eq!(config.server.ws_url, "wss://market.example.edu/ws/message");
        assert_eq!(
            config.session.token_path.as_deref(),
            Some("/tmp/exchange-token")
        );
        assert_eq!(config.realtime.max_reconnect_attempts, 5);
        assert_eq!(config.realtime.reconnect_jitter, 0.25);
        assert!(!config.ui.sound);
        assert!(config.ui.notifications);
    }

    // ── Validation ──────────────────────────────────────────────────

    #[test]
    fn rejects_non_websocket_scheme() {
        let err = parse_without_env("[server]\nws_url = \"http://localhost/ws\"\n").unwrap_err();
        assert_matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "server.ws_url");
    }

    #[test]
    fn rejects_unparseable_api_url() {
        let err = parse_without_env("[server]\napi_base_url = \"not a url\"\n").unwrap_err();
        assert_matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "server.api_base_url");
    }

    #[test]
    fn rejects_zero_heartbeat_interval() {
        let err =
            parse_without_env("[realtime]\nheartbeat_interval_seconds = 0\n").unwrap_err();
        assert_matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "realtime.heartbeat_interval_seconds");
    }

    #[test]
    fn rejects_out_of_range_jitter() {
        let err = parse_without_env("[realtime]\nreconnect_jitter = 1.5\n").unwrap_err();
        assert_matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "realtime.reconnect_jitter");
    }

    #[test]
    fn rejects_invalid_log_level() {
        let err = parse_without_env("[logging]\nlevel = \"verbose\"\n").unwrap_err();
        assert_matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "logging.level");
    }

    #[test]
    fn invalid_toml_reports_position() {
        let toml = "[server]\nws_url = \n";
        let err = parse_without_env(toml).unwrap_err();
        match err {
            ConfigError::InvalidToml { line, .. } => assert_eq!(line, 2),
            other => panic!("expected InvalidToml, got {other:?}"),
        }
    }

    // ── Overrides ───────────────────────────────────────────────────

    #[test]
    fn env_overrides_take_precedence() {
        let overrides = ConfigOverrides {
            api_base_url: Some("https://env.example.edu/api".to_string()),
            ws_url: Some("wss://env.example.edu/ws".to_string()),
            token_path: Some("/run/token".to_string()),
            log_level: Some("debug".to_string()),
        };
        let config = load_config_from_str_with_overrides(DEFAULT_CONFIG_TOML, overrides).unwrap();
        assert_eq!(config.server.api_base_url, "https://env.example.edu/api");
        assert_eq!(config.server.ws_url, "wss://env.example.edu/ws");
        assert_eq!(config.session.token_path.as_deref(), Some("/run/token"));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn invalid_env_override_is_rejected() {
        let overrides = ConfigOverrides {
            ws_url: Some("ftp://nope".to_string()),
            ..ConfigOverrides::default()
        };
        let err = load_config_from_str_with_overrides("", overrides).unwrap_err();
        assert_matches!(err, ConfigError::InvalidValue { .. });
    }

    // ── Files ───────────────────────────────────────────────────────

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sync]\nunread_refresh_seconds = 15\n").unwrap();

        let config = load_config_from_with_overrides(&path, ConfigOverrides::default()).unwrap();
        assert_eq!(config.sync.unread_refresh_seconds, 15);
    }

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = load_config_from_with_overrides(&path, ConfigOverrides::default()).unwrap();

        assert!(path.exists());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), DEFAULT_CONFIG_TOML);
        assert_eq!(config.realtime.reconnect_delay_seconds, 3);
    }
}
