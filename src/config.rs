use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::routing::RouteTable;

/// Prefix of environment variables that add a chat → webhook route,
/// e.g. `WEBHOOK_1001234567890=https://discord.com/api/webhooks/...`.
pub const WEBHOOK_ENV_PREFIX: &str = "WEBHOOK_";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub watermark: WatermarkConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Alternative Bot API server, e.g. a self-hosted one without the 20 MB
    /// download cap of the public API
    #[serde(default)]
    pub api_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscordConfig {
    /// Source chat id (as a string key) → webhook URL
    #[serde(default)]
    pub webhooks: HashMap<String, String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReplicationConfig {
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: f64,
    #[serde(default = "default_true")]
    pub auto_compress: bool,
    #[serde(default = "default_compression_quality")]
    pub compression_quality: u8,
    #[serde(default = "default_processing_timeout_secs")]
    pub processing_timeout_secs: u64,
    #[serde(default = "default_image_download_timeout_secs")]
    pub image_download_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_processing")]
    pub max_concurrent_processing: usize,
    #[serde(default = "default_video_crf")]
    pub video_crf: u8,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_ffmpeg_timeout_secs")]
    pub ffmpeg_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum WatermarkPosition {
    TopLeft,
    TopRight,
    BottomLeft,
    #[default]
    BottomRight,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatermarkConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub text_prefix: Option<String>,
    #[serde(default)]
    pub text_suffix: Option<String>,
    /// Logo overlaid on images
    #[serde(default)]
    pub image_path: Option<PathBuf>,
    #[serde(default)]
    pub position: WatermarkPosition,
    #[serde(default = "default_opacity")]
    pub opacity: f32,
    /// Overlay the logo on videos as well (needs ffmpeg)
    #[serde(default = "default_true")]
    pub video: bool,
    /// Per-chat overrides, keyed by chat id
    #[serde(default)]
    pub groups: HashMap<String, WatermarkOverride>,
}

/// Fields left unset fall back to the top-level `[watermark]` values.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct WatermarkOverride {
    pub enabled: Option<bool>,
    pub text_prefix: Option<String>,
    pub text_suffix: Option<String>,
    pub image_path: Option<PathBuf>,
    pub position: Option<WatermarkPosition>,
    pub opacity: Option<f32>,
    pub video: Option<bool>,
}

impl WatermarkConfig {
    /// Effective settings for one chat.
    pub fn merged(&self, group: &WatermarkOverride) -> WatermarkConfig {
        WatermarkConfig {
            enabled: group.enabled.unwrap_or(self.enabled),
            text_prefix: group.text_prefix.clone().or_else(|| self.text_prefix.clone()),
            text_suffix: group.text_suffix.clone().or_else(|| self.text_suffix.clone()),
            image_path: group.image_path.clone().or_else(|| self.image_path.clone()),
            position: group.position.unwrap_or(self.position),
            opacity: group.opacity.unwrap_or(self.opacity),
            video: group.video.unwrap_or(self.video),
            groups: HashMap::new(),
        }
    }

    /// Overrides whose key parses as a chat id, merged over the defaults.
    pub fn group_configs(&self) -> HashMap<i64, WatermarkConfig> {
        self.groups
            .iter()
            .filter_map(|(key, group)| match parse_chat_id(key) {
                Some(id) => Some((id, self.merged(group))),
                None => {
                    warn!(key = %key, "Ignoring watermark override with invalid chat id");
                    None
                }
            })
            .collect()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_ws_interval_secs")]
    pub ws_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u64,
    #[serde(default = "default_cleanup_cron")]
    pub cleanup_cron: String,
    #[serde(default = "default_health_check_cron")]
    pub health_check_cron: String,
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> usize {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_max_file_size_mb() -> f64 {
    25.0
}

fn default_compression_quality() -> u8 {
    75
}

fn default_processing_timeout_secs() -> u64 {
    300
}

fn default_image_download_timeout_secs() -> u64 {
    60
}

fn default_max_concurrent_processing() -> usize {
    10
}

fn default_video_crf() -> u8 {
    28
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffmpeg_timeout_secs() -> u64 {
    180
}

fn default_opacity() -> f32 {
    0.3
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_ws_interval_secs() -> u64 {
    5
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("temp_files")
}

fn default_max_age_hours() -> u64 {
    24
}

fn default_cleanup_cron() -> String {
    // sec min hour day month weekday
    "0 0 * * * *".to_string()
}

fn default_health_check_cron() -> String {
    "*/30 * * * * *".to_string()
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            webhooks: HashMap::new(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: default_max_file_size_mb(),
            auto_compress: true,
            compression_quality: default_compression_quality(),
            processing_timeout_secs: default_processing_timeout_secs(),
            image_download_timeout_secs: default_image_download_timeout_secs(),
            max_concurrent_processing: default_max_concurrent_processing(),
            video_crf: default_video_crf(),
            ffmpeg_path: default_ffmpeg_path(),
            ffmpeg_timeout_secs: default_ffmpeg_timeout_secs(),
        }
    }
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            text_prefix: None,
            text_suffix: None,
            image_path: None,
            position: WatermarkPosition::default(),
            opacity: default_opacity(),
            video: true,
            groups: HashMap::new(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_port(),
            ws_interval_secs: default_ws_interval_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            temp_dir: default_temp_dir(),
            max_age_hours: default_max_age_hours(),
            cleanup_cron: default_cleanup_cron(),
            health_check_cron: default_health_check_cron(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        if !config.storage.temp_dir.exists() {
            std::fs::create_dir_all(&config.storage.temp_dir).with_context(|| {
                format!(
                    "Failed to create temp directory: {}",
                    config.storage.temp_dir.display()
                )
            })?;
        }

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            bail!("telegram.bot_token must not be empty");
        }
        if self.replication.max_file_size_mb <= 0.0 {
            bail!("replication.max_file_size_mb must be positive");
        }
        if self.replication.max_concurrent_processing == 0 {
            bail!("replication.max_concurrent_processing must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.watermark.opacity) {
            bail!("watermark.opacity must be between 0.0 and 1.0");
        }
        for (key, group) in &self.watermark.groups {
            if let Some(opacity) = group.opacity {
                if !(0.0..=1.0).contains(&opacity) {
                    bail!("watermark.groups.{key}.opacity must be between 0.0 and 1.0");
                }
            }
        }
        Ok(())
    }

    /// Routes from `[discord.webhooks]` merged with `WEBHOOK_<chat_id>`
    /// environment variables. Environment entries win on conflict.
    pub fn route_table(&self) -> RouteTable {
        let mut routes = parse_webhooks(&self.discord.webhooks);
        routes.extend(webhooks_from_env(std::env::vars()));
        let table = RouteTable::new(routes);
        if table.is_empty() {
            warn!("No webhook routes configured, every message will be ignored");
        }
        table
    }
}

/// Parse string chat id keys, skipping entries that are not valid ids.
pub fn parse_webhooks(raw: &HashMap<String, String>) -> HashMap<i64, String> {
    raw.iter()
        .filter_map(|(key, url)| match parse_chat_id(key) {
            Some(id) if !url.trim().is_empty() => Some((id, url.trim().to_string())),
            _ => {
                warn!(key = %key, "Ignoring invalid webhook entry");
                None
            }
        })
        .collect()
}

/// Collect `WEBHOOK_<chat_id>` variables. Ids without a leading `-` get one,
/// since group and channel ids are always negative.
pub fn webhooks_from_env<I>(vars: I) -> HashMap<i64, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter()
        .filter_map(|(key, value)| {
            let raw_id = key.strip_prefix(WEBHOOK_ENV_PREFIX)?;
            let value = value.trim();
            if value.is_empty() {
                return None;
            }
            let id = if raw_id.starts_with('-') {
                raw_id.to_string()
            } else {
                format!("-{}", raw_id)
            };
            parse_chat_id(&id).map(|id| (id, value.to_string()))
        })
        .collect()
}

fn parse_chat_id(raw: &str) -> Option<i64> {
    raw.trim().parse::<i64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[telegram]
bot_token = "123:abc"
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::parse(MINIMAL).unwrap();
        assert_eq!(config.replication.max_file_size_mb, 25.0);
        assert_eq!(config.replication.compression_quality, 75);
        assert_eq!(config.replication.max_concurrent_processing, 10);
        assert_eq!(config.replication.processing_timeout_secs, 300);
        assert_eq!(config.discord.max_retries, 3);
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.storage.max_age_hours, 24);
        assert!(!config.watermark.enabled);
        assert_eq!(config.watermark.position, WatermarkPosition::BottomRight);
    }

    #[test]
    fn test_full_config() {
        let config = Config::parse(
            r#"
[telegram]
bot_token = "123:abc"
api_url = "http://localhost:8081"

[discord]
max_retries = 5

[discord.webhooks]
"-1001234567890" = "https://discord.com/api/webhooks/1/a"

[replication]
max_file_size_mb = 8.0
auto_compress = false

[watermark]
enabled = true
text_prefix = "[TG]"
position = "top-left"
opacity = 0.5
"#,
        )
        .unwrap();

        assert_eq!(config.telegram.api_url.as_deref(), Some("http://localhost:8081"));
        assert_eq!(config.discord.max_retries, 5);
        assert_eq!(config.replication.max_file_size_mb, 8.0);
        assert!(!config.replication.auto_compress);
        assert_eq!(config.watermark.position, WatermarkPosition::TopLeft);

        let routes = parse_webhooks(&config.discord.webhooks);
        assert_eq!(
            routes.get(&-1001234567890).map(String::as_str),
            Some("https://discord.com/api/webhooks/1/a")
        );
    }

    #[test]
    fn test_empty_token_is_rejected() {
        let err = Config::parse("[telegram]\nbot_token = \"  \"\n").unwrap_err();
        assert!(err.to_string().contains("bot_token"));
    }

    #[test]
    fn test_bad_opacity_is_rejected() {
        let content = format!("{MINIMAL}\n[watermark]\nopacity = 1.5\n");
        assert!(Config::parse(&content).is_err());
    }

    #[test]
    fn test_invalid_webhook_keys_are_skipped() {
        let mut raw = HashMap::new();
        raw.insert("not-a-number".to_string(), "https://x".to_string());
        raw.insert("-42".to_string(), "https://y".to_string());
        raw.insert("-43".to_string(), "   ".to_string());

        let routes = parse_webhooks(&raw);
        assert_eq!(routes.len(), 1);
        assert!(routes.contains_key(&-42));
    }

    #[test]
    fn test_webhooks_from_env_adds_minus_sign() {
        let vars = vec![
            ("WEBHOOK_1001234".to_string(), "https://a".to_string()),
            ("WEBHOOK_-77".to_string(), "https://b".to_string()),
            ("WEBHOOK_abc".to_string(), "https://c".to_string()),
            ("PATH".to_string(), "/usr/bin".to_string()),
        ];
        let routes = webhooks_from_env(vars);
        assert_eq!(routes.len(), 2);
        assert_eq!(routes.get(&-1001234).map(String::as_str), Some("https://a"));
        assert_eq!(routes.get(&-77).map(String::as_str), Some("https://b"));
    }

    #[test]
    fn test_load_creates_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("scratch");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            format!(
                "{MINIMAL}\n[storage]\ntemp_dir = \"{}\"\n",
                temp.display()
            ),
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.storage.temp_dir, temp);
        assert!(temp.exists());
    }

    #[test]
    fn test_example_config_parses() {
        let config = Config::parse(include_str!("../config.example.toml")).unwrap();
        assert_eq!(config.watermark.position, WatermarkPosition::BottomRight);
        assert_eq!(parse_webhooks(&config.discord.webhooks).len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_watermark_group_overrides() {
        let content = format!(
            r#"{MINIMAL}
[watermark]
enabled = true
text_prefix = "[TG]"
position = "top-left"

[watermark.groups."-100123"]
text_prefix = "[News]"
video = false

[watermark.groups."-42"]
enabled = false

[watermark.groups."general"]
enabled = false
"#
        );
        let config = Config::parse(&content).unwrap();
        let groups = config.watermark.group_configs();
        assert_eq!(groups.len(), 2);

        let news = &groups[&-100123];
        assert!(news.enabled);
        assert_eq!(news.text_prefix.as_deref(), Some("[News]"));
        assert_eq!(news.position, WatermarkPosition::TopLeft);
        assert!(!news.video);

        let quiet = &groups[&-42];
        assert!(!quiet.enabled);
        assert_eq!(quiet.text_prefix.as_deref(), Some("[TG]"));
        assert!(quiet.video);
    }

    #[test]
    fn test_bad_group_opacity_is_rejected() {
        let content = format!("{MINIMAL}\n[watermark.groups.\"-1\"]\nopacity = 2.0\n");
        assert!(Config::parse(&content).is_err());
    }
}
