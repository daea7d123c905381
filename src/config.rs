use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::FixedOffset;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::cost::ModelPricing;
use crate::error::{MonitorError, Result};
use crate::timeframe::WeekStart;

const CONFIG_SCHEMA_VERSION: u32 = 1;
const DEFAULT_REFRESH_SECONDS: u64 = 5;
const MIN_REFRESH_SECONDS: u64 = 1;
const MAX_REFRESH_SECONDS: u64 = 60;
const DEFAULT_RECENT_SESSIONS_LIMIT: usize = 50;
const MAX_RECENT_SESSIONS_LIMIT: usize = 1000;
const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
const MAX_UTC_OFFSET_MINUTES: i32 = 14 * 60;

pub const MESSAGES_DIR_ENV: &str = "SESSION_MONITOR_MESSAGES_DIR";
pub const REFRESH_SECONDS_ENV: &str = "SESSION_MONITOR_REFRESH_SECONDS";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    pub schema_version: u32,
    pub paths: PathsConfig,
    pub ui: UiConfig,
    pub export: ExportConfig,
    pub analytics: AnalyticsConfig,
    pub pricing: PricingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    pub messages_dir: PathBuf,
    pub export_dir: PathBuf,
    pub pricing_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TableStyle {
    #[default]
    Rich,
    Simple,
    Minimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UiConfig {
    pub table_style: TableStyle,
    pub progress_bars: bool,
    pub colors: bool,
    pub live_refresh_interval: u64,
    pub failure_threshold: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    #[default]
    Csv,
    Json,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExportConfig {
    pub default_format: ExportFormat,
    pub include_metadata: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub week_start: WeekStart,
    pub group_workflows: bool,
    pub infer_agent_parents: bool,
    pub recent_sessions_limit: usize,
    /// Fixed offset for calendar buckets and printed times; unset means the
    /// system local zone.
    pub utc_offset_minutes: Option<i32>,
}

impl AnalyticsConfig {
    pub fn offset(&self) -> Option<FixedOffset> {
        self.utc_offset_minutes
            .and_then(|minutes| FixedOffset::east_opt(minutes.checked_mul(60)?))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnknownModelPolicy {
    /// Unknown models cost nothing but are flagged as estimated.
    #[default]
    Zero,
    /// Unknown models are billed at `PricingConfig::default_rate`.
    DefaultRate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PricingConfig {
    pub unknown_model: UnknownModelPolicy,
    pub default_rate: ModelPricing,
    pub aliases: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct LiveSettings {
    pub messages_dir: PathBuf,
    pub refresh_interval: Duration,
    pub failure_threshold: u32,
    pub group_workflows: bool,
    pub infer_agent_parents: bool,
    pub recent_limit: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            paths: PathsConfig::default(),
            ui: UiConfig::default(),
            export: ExportConfig::default(),
            analytics: AnalyticsConfig::default(),
            pricing: PricingConfig::default(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            messages_dir: default_messages_dir(),
            export_dir: PathBuf::from("./exports"),
            pricing_file: None,
        }
    }
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            table_style: TableStyle::Rich,
            progress_bars: true,
            colors: true,
            live_refresh_interval: DEFAULT_REFRESH_SECONDS,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            default_format: ExportFormat::Csv,
            include_metadata: true,
        }
    }
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            week_start: WeekStart::Monday,
            group_workflows: true,
            infer_agent_parents: true,
            recent_sessions_limit: DEFAULT_RECENT_SESSIONS_LIMIT,
            utc_offset_minutes: None,
        }
    }
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            unknown_model: UnknownModelPolicy::Zero,
            default_rate: ModelPricing::conservative_default(),
            aliases: BTreeMap::new(),
        }
    }
}

impl MonitorConfig {
    /// Loads the JSON config at `path` (or the default location). A missing
    /// file yields defaults; a malformed one is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let cfg_path = path.map(Path::to_path_buf).unwrap_or_else(config_path);
        let mut config = if cfg_path.exists() {
            let raw = fs::read_to_string(&cfg_path).map_err(|err| MonitorError::Config {
                path: cfg_path.clone(),
                reason: err.to_string(),
            })?;
            serde_json::from_str::<MonitorConfig>(&raw).map_err(|err| MonitorError::Config {
                path: cfg_path.clone(),
                reason: err.to_string(),
            })?
        } else {
            MonitorConfig::default()
        };

        if config.normalize() {
            tracing::debug!(path = %cfg_path.display(), "configuration values normalized");
        }
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn live_settings(&self) -> LiveSettings {
        LiveSettings {
            messages_dir: self.paths.messages_dir.clone(),
            refresh_interval: Duration::from_secs(self.ui.live_refresh_interval),
            failure_threshold: self.ui.failure_threshold,
            group_workflows: self.analytics.group_workflows,
            infer_agent_parents: self.analytics.infer_agent_parents,
            recent_limit: self.analytics.recent_sessions_limit,
        }
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(dir) = env::var(MESSAGES_DIR_ENV)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
        {
            self.paths.messages_dir = expand_home(&dir);
        }
        self.ui.live_refresh_interval =
            env_u64(REFRESH_SECONDS_ENV, self.ui.live_refresh_interval)
                .clamp(MIN_REFRESH_SECONDS, MAX_REFRESH_SECONDS);
    }

    /// Repairs out-of-range values in place. Returns whether anything changed.
    pub fn normalize(&mut self) -> bool {
        let mut changed = false;

        if self.schema_version < CONFIG_SCHEMA_VERSION {
            self.schema_version = CONFIG_SCHEMA_VERSION;
            changed = true;
        }

        let interval = self
            .ui
            .live_refresh_interval
            .clamp(MIN_REFRESH_SECONDS, MAX_REFRESH_SECONDS);
        if interval != self.ui.live_refresh_interval {
            self.ui.live_refresh_interval = interval;
            changed = true;
        }
        if self.ui.failure_threshold == 0 {
            self.ui.failure_threshold = DEFAULT_FAILURE_THRESHOLD;
            changed = true;
        }

        let limit = self
            .analytics
            .recent_sessions_limit
            .clamp(1, MAX_RECENT_SESSIONS_LIMIT);
        if limit != self.analytics.recent_sessions_limit {
            self.analytics.recent_sessions_limit = limit;
            changed = true;
        }

        for path in [&mut self.paths.messages_dir, &mut self.paths.export_dir] {
            let expanded = expand_home(&path.to_string_lossy());
            if expanded != *path {
                *path = expanded;
                changed = true;
            }
        }
        if self.paths.messages_dir.as_os_str().is_empty() {
            self.paths.messages_dir = default_messages_dir();
            changed = true;
        }
        if let Some(file) = self.paths.pricing_file.as_mut() {
            if file.as_os_str().is_empty() {
                self.paths.pricing_file = None;
                changed = true;
            } else {
                let expanded = expand_home(&file.to_string_lossy());
                if expanded != *file {
                    *file = expanded;
                    changed = true;
                }
            }
        }

        if self
            .analytics
            .utc_offset_minutes
            .is_some_and(|minutes| minutes.abs() > MAX_UTC_OFFSET_MINUTES)
        {
            self.analytics.utc_offset_minutes = None;
            changed = true;
        }

        if normalize_aliases(&mut self.pricing.aliases) {
            changed = true;
        }
        if !self.pricing.default_rate.is_valid() {
            self.pricing.default_rate = ModelPricing::conservative_default();
            changed = true;
        }

        changed
    }
}

pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("session-usage-monitor")
        .join("config.json")
}

pub fn default_messages_dir() -> PathBuf {
    let data_home = env::var("XDG_DATA_HOME")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local")
                .join("share")
        });
    data_home.join("opencode").join("storage").join("message")
}

pub fn expand_home(raw: &str) -> PathBuf {
    let path = raw.trim();
    if path == "~"
        && let Some(home) = dirs::home_dir()
    {
        return home;
    }
    if let Some(stripped) = path.strip_prefix("~/").or_else(|| path.strip_prefix("~\\"))
        && let Some(home) = dirs::home_dir()
    {
        return home.join(stripped);
    }
    PathBuf::from(path)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn normalize_aliases(aliases: &mut BTreeMap<String, String>) -> bool {
    let mut normalized = BTreeMap::new();
    for (raw_key, raw_target) in aliases.iter() {
        let key = raw_key.trim().to_ascii_lowercase();
        let target = raw_target.trim().to_ascii_lowercase();
        if key.is_empty() || target.is_empty() || key == target {
            continue;
        }
        normalized.insert(key, target);
    }
    if *aliases != normalized {
        *aliases = normalized;
        return true;
    }
    false
}
