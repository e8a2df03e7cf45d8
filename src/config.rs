use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

const ENV_FILE: &str = ".env";
pub const DEFAULT_HOME_ADVANTAGE: f64 = 0.12;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub providers: Vec<ProviderConfig>,
    pub competitions: Vec<CompetitionConfig>,
    #[serde(default = "default_window_days_ahead")]
    pub window_days_ahead: i64,
    #[serde(default = "default_form_window")]
    pub form_window: usize,
    #[serde(default = "default_form_ttl")]
    pub form_ttl_seconds: u64,
    #[serde(default = "default_ingest_interval")]
    pub ingest_interval_seconds: u64,
    #[serde(default = "default_predict_interval")]
    pub predict_interval_seconds: u64,
    #[serde(default = "default_dispatch_interval")]
    pub dispatch_interval_seconds: u64,
    #[serde(default)]
    pub subscribers: Vec<SubscriberConfig>,
    #[serde(default = "default_engine_version")]
    pub engine_version: String,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_requests: usize,
    #[serde(default = "default_predict_horizon")]
    pub predict_horizon_hours: i64,
    #[serde(default = "default_predict_lead")]
    pub predict_lead_minutes: i64,
    #[serde(default = "default_true")]
    pub allow_neutral_priors: bool,
    #[serde(default = "default_value_threshold")]
    pub value_threshold: f64,
    #[serde(default)]
    pub fetch_market_odds: bool,
    #[serde(default = "default_home_advantage")]
    pub default_home_advantage: f64,
    /// country -> home advantage, used when the competition has no override
    #[serde(default)]
    pub home_advantage_by_country: BTreeMap<String, f64>,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
    #[serde(default = "default_dispatch_error_threshold")]
    pub dispatch_error_threshold: u32,
    #[serde(default = "default_dispatch_mute")]
    pub dispatch_mute_seconds: u64,
    #[serde(default)]
    pub teams: TeamsConfig,
    #[serde(default)]
    pub messaging: MessagingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    FootballData,
    ApiFootball,
}

impl ProviderKind {
    pub fn default_auth_header(self) -> &'static str {
        match self {
            ProviderKind::FootballData => "X-Auth-Token",
            ProviderKind::ApiFootball => "x-apisports-key",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    pub base_url: String,
    pub auth_header: Option<String>,
    /// Literal value, or `env:NAME`.
    #[serde(default)]
    pub auth_value: String,
    pub requests_per_minute: u32,
    #[serde(default)]
    pub requests_per_day: Option<u32>,
    #[serde(default)]
    pub precedence: i32,
    /// internal competition id -> provider competition id
    #[serde(default)]
    pub competition_ids: BTreeMap<String, String>,
    #[serde(default)]
    pub season: Option<u16>,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl ProviderConfig {
    pub fn auth_header(&self) -> &str {
        self.auth_header
            .as_deref()
            .unwrap_or_else(|| self.kind.default_auth_header())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompetitionConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub home_advantage: Option<f64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SubscriberConfig {
    pub handle: String,
    #[serde(default)]
    pub min_confidence: f64,
    #[serde(default)]
    pub allowed_competitions: Vec<String>,
    pub max_per_day: u32,
    #[serde(default)]
    pub min_interval_seconds: u64,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TeamsConfig {
    /// display name -> canonical team key
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub allow_unlisted: bool,
}

impl Default for TeamsConfig {
    fn default() -> Self {
        Self {
            aliases: BTreeMap::new(),
            allow_unlisted: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MessagingKind {
    Telegram,
    #[default]
    Log,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MessagingConfig {
    #[serde(default)]
    pub kind: MessagingKind,
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default = "default_telegram_base")]
    pub api_base: String,
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,
    #[serde(default = "default_send_timeout")]
    pub timeout_seconds: u64,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            kind: MessagingKind::Log,
            bot_token: None,
            api_base: default_telegram_base(),
            max_message_len: default_max_message_len(),
            timeout_seconds: default_send_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct HealthConfig {
    /// `host:port` for the HTTP status endpoint.
    #[serde(default)]
    pub listen: Option<String>,
}

fn default_window_days_ahead() -> i64 { 7 }
fn default_form_window() -> usize { 10 }
fn default_form_ttl() -> u64 { 21_600 }
fn default_ingest_interval() -> u64 { 900 }
fn default_predict_interval() -> u64 { 3_600 }
fn default_dispatch_interval() -> u64 { 300 }
fn default_engine_version() -> String { crate::engine::ENGINE_VERSION.to_string() }
fn default_max_in_flight() -> usize { 8 }
fn default_predict_horizon() -> i64 { 48 }
fn default_predict_lead() -> i64 { 30 }
fn default_true() -> bool { true }
fn default_value_threshold() -> f64 { 0.05 }
fn default_home_advantage() -> f64 { DEFAULT_HOME_ADVANTAGE }
fn default_shutdown_grace() -> u64 { 20 }
fn default_dispatch_error_threshold() -> u32 { 5 }
fn default_dispatch_mute() -> u64 { 3_600 }
fn default_timeout() -> u64 { 30 }
fn default_max_retries() -> u32 { 3 }
fn default_top_k() -> usize { 5 }
fn default_telegram_base() -> String { "https://api.telegram.org".to_string() }
fn default_max_message_len() -> usize { 4096 }
fn default_send_timeout() -> u64 { 10 }

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).with_context(|| "Failed to parse config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.providers.is_empty() {
            anyhow::bail!("at least one provider must be configured");
        }
        let mut names = HashSet::new();
        for p in &self.providers {
            if !names.insert(p.name.as_str()) {
                anyhow::bail!("duplicate provider name: {}", p.name);
            }
            if p.requests_per_minute == 0 {
                anyhow::bail!("provider {}: requests_per_minute must be > 0", p.name);
            }
            if p.requests_per_day == Some(0) {
                anyhow::bail!("provider {}: requests_per_day must be > 0", p.name);
            }
            if p.base_url.trim().is_empty() {
                anyhow::bail!("provider {}: base_url is empty", p.name);
            }
        }
        if self.competitions.is_empty() {
            anyhow::bail!("at least one competition must be configured");
        }
        if !(1..=50).contains(&self.form_window) {
            anyhow::bail!("form_window must be within 1..=50 (got {})", self.form_window);
        }
        if self.ingest_interval_seconds == 0
            || self.predict_interval_seconds == 0
            || self.dispatch_interval_seconds == 0
        {
            anyhow::bail!("job intervals must be > 0");
        }
        if self.max_in_flight_requests == 0 {
            anyhow::bail!("max_in_flight_requests must be > 0");
        }
        let mut handles = HashSet::new();
        for s in &self.subscribers {
            if !handles.insert(s.handle.as_str()) {
                anyhow::bail!("duplicate subscriber handle: {}", s.handle);
            }
            if s.max_per_day == 0 {
                anyhow::bail!("subscriber {}: max_per_day must be > 0", s.handle);
            }
            if !(0.0..=1.0).contains(&s.min_confidence) {
                anyhow::bail!("subscriber {}: min_confidence must be within [0, 1]", s.handle);
            }
        }
        if self.messaging.max_message_len < 64 {
            anyhow::bail!("messaging.max_message_len is too small");
        }
        Ok(())
    }

    /// Providers ordered by precedence (lower = preferred), ties by name.
    pub fn providers_by_precedence(&self) -> Vec<&ProviderConfig> {
        let mut out: Vec<&ProviderConfig> = self.providers.iter().collect();
        out.sort_by(|a, b| a.precedence.cmp(&b.precedence).then(a.name.cmp(&b.name)));
        out
    }

    pub fn competition(&self, id: &str) -> Option<&CompetitionConfig> {
        self.competitions.iter().find(|c| c.id == id)
    }

    /// Competition override, then the per-country table, then the global default.
    pub fn home_advantage(&self, competition_id: &str) -> f64 {
        let Some(comp) = self.competition(competition_id) else {
            return self.default_home_advantage;
        };
        comp.home_advantage
            .or_else(|| self.home_advantage_by_country.get(&comp.country).copied())
            .unwrap_or(self.default_home_advantage)
    }

    /// Load .env file into process environment. Real env vars take precedence.
    pub fn load_env_file() {
        let path = Path::new(ENV_FILE);
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => return,
        };
        // Strip BOM if present (common on Windows-created files)
        let content = content.strip_prefix('\u{feff}').unwrap_or(&content);
        for line in content.lines() {
            let line = line.trim().trim_matches('\r');
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim().trim_matches('"').trim_matches('\'');
                if std::env::var(key).is_err() {
                    std::env::set_var(key, value);
                }
            }
        }
    }
}

/// Resolve a config value that may point at the environment (`env:NAME`).
pub fn resolve_secret(raw: &str) -> Result<String> {
    match raw.strip_prefix("env:") {
        Some(var) => {
            let value = std::env::var(var.trim())
                .with_context(|| format!("environment variable {} is not set", var.trim()))?;
            let value = sanitize_key(&value);
            if value.is_empty() {
                anyhow::bail!("environment variable {} is empty", var.trim());
            }
            Ok(value)
        }
        None => Ok(sanitize_key(raw)),
    }
}

/// Strip carriage returns, BOM, and other invisible chars from a key/path value.
fn sanitize_key(raw: &str) -> String {
    raw.replace(['\r', '\u{feff}', '\u{200b}'], "")
        .trim()
        .to_string()
}

#[cfg(test)]
pub(crate) const SAMPLE_CONFIG: &str = r#"
engine_version = "1.0.0"
value_threshold = 0.05

[[providers]]
name = "football-data"
kind = "football-data"
base_url = "https://api.football-data.org/v4"
auth_value = "env:FOOTBALL_DATA_TOKEN"
requests_per_minute = 10
requests_per_day = 1000
precedence = 0
competition_ids = { PL = "PL", BSA = "BSA" }

[[providers]]
name = "api-football"
kind = "api-football"
base_url = "https://v3.football.api-sports.io"
auth_value = "literal-key"
requests_per_minute = 30
requests_per_day = 100
precedence = 1
season = 2024
competition_ids = { PL = "39", BSA = "71" }

[[competitions]]
id = "PL"
name = "Premier League"
country = "England"

[[competitions]]
id = "BSA"
name = "Brasileirao Serie A"
country = "Brazil"
home_advantage = 0.15

[home_advantage_by_country]
England = 0.10

[teams.aliases]
"Man Utd" = "manchester-united"
"Manchester United FC" = "manchester-united"

[[subscribers]]
handle = "-100123"
min_confidence = 0.4
allowed_competitions = ["PL", "BSA"]
max_per_day = 3
min_interval_seconds = 600
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_parses_with_defaults() {
        let config = Config::from_toml_str(SAMPLE_CONFIG).unwrap();
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.window_days_ahead, 7);
        assert_eq!(config.form_window, 10);
        assert_eq!(config.form_ttl_seconds, 21_600);
        assert_eq!(config.ingest_interval_seconds, 900);
        assert_eq!(config.predict_interval_seconds, 3_600);
        assert_eq!(config.dispatch_interval_seconds, 300);
        assert_eq!(config.max_in_flight_requests, 8);
        assert_eq!(config.subscribers[0].top_k, 5);
        assert_eq!(config.messaging.kind, MessagingKind::Log);
        assert_eq!(config.messaging.max_message_len, 4096);
        assert!(config.teams.allow_unlisted);
        assert_eq!(config.providers[1].auth_header(), "x-apisports-key");
        assert_eq!(config.providers[0].auth_header(), "X-Auth-Token");
    }

    #[test]
    fn test_home_advantage_resolution() {
        let config = Config::from_toml_str(SAMPLE_CONFIG).unwrap();
        assert_eq!(config.home_advantage("BSA"), 0.15);
        assert_eq!(config.home_advantage("PL"), 0.10);
        assert_eq!(config.home_advantage("UNKNOWN"), DEFAULT_HOME_ADVANTAGE);
    }

    #[test]
    fn test_precedence_order() {
        let config = Config::from_toml_str(SAMPLE_CONFIG).unwrap();
        let names: Vec<_> = config
            .providers_by_precedence()
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(names, vec!["football-data", "api-football"]);
    }

    #[test]
    fn test_rejects_zero_rate() {
        let bad = SAMPLE_CONFIG.replace("requests_per_minute = 10", "requests_per_minute = 0");
        assert!(Config::from_toml_str(&bad).is_err());
    }

    #[test]
    fn test_rejects_bad_subscriber() {
        let bad = SAMPLE_CONFIG.replace("min_confidence = 0.4", "min_confidence = 1.4");
        assert!(Config::from_toml_str(&bad).is_err());
        let bad = SAMPLE_CONFIG.replace("max_per_day = 3", "max_per_day = 0");
        assert!(Config::from_toml_str(&bad).is_err());
    }

    #[test]
    fn test_resolve_secret() {
        assert_eq!(resolve_secret("  abc\r").unwrap(), "abc");
        std::env::set_var("MATCHCAST_TEST_SECRET", "s3cret");
        assert_eq!(resolve_secret("env:MATCHCAST_TEST_SECRET").unwrap(), "s3cret");
        assert!(resolve_secret("env:MATCHCAST_DEFINITELY_UNSET").is_err());
    }
}
