use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Weekday;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::clock::LocalZone;

const APP_DOMAIN: &str = "io";
const APP_ORG: &str = "Planner";
const APP_NAME: &str = "planner";

pub const CONFIG_ENV: &str = "PLANNER_CONFIG";
pub const DATA_ENV: &str = "PLANNER_DATA";

pub struct ConfigLoader {
    paths: ConfigPaths,
}

impl ConfigLoader {
    pub fn discover() -> Result<Self> {
        let paths = ConfigPaths::discover()?;
        Ok(Self { paths })
    }

    pub fn from_paths(paths: ConfigPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &ConfigPaths {
        &self.paths
    }

    pub fn load_or_init(&self) -> Result<AppConfig> {
        self.paths.ensure_directories()?;
        if !self.paths.config_file.exists() {
            let mut default_cfg = AppConfig::default();
            default_cfg.post_load(&self.paths)?;
            self.write_default_config(&default_cfg)?;
            return Ok(default_cfg);
        }

        self.load()
    }

    pub fn load(&self) -> Result<AppConfig> {
        let raw = fs::read_to_string(&self.paths.config_file)
            .with_context(|| format!("reading config {}", self.paths.config_file.display()))?;
        let mut cfg: AppConfig = toml::from_str(&raw).context("parsing config toml")?;
        cfg.post_load(&self.paths)?;
        Ok(cfg)
    }

    fn write_default_config(&self, cfg: &AppConfig) -> Result<()> {
        let toml = toml::to_string_pretty(cfg).context("serializing default config")?;
        if let Some(parent) = self.paths.config_file.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut file = fs::File::create(&self.paths.config_file)
            .with_context(|| format!("creating config {}", self.paths.config_file.display()))?;
        file.write_all(toml.as_bytes())
            .context("writing default config")?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub config_dir: PathBuf,
    pub config_file: PathBuf,
    pub data_dir: PathBuf,
    pub database_path: PathBuf,
    pub cache_dir: PathBuf,
    pub log_dir: PathBuf,
    pub state_dir: PathBuf,
}

impl ConfigPaths {
    pub fn discover() -> Result<Self> {
        let override_config = env::var(CONFIG_ENV).ok().map(PathBuf::from);
        let override_data = env::var(DATA_ENV).ok().map(PathBuf::from);

        let project_dirs = ProjectDirs::from(APP_DOMAIN, APP_ORG, APP_NAME)
            .context("resolving XDG project directories")?;

        let config_dir = override_config
            .clone()
            .map(|p| {
                if p.is_dir() {
                    p
                } else {
                    p.parent().map(Path::to_path_buf).unwrap_or(p)
                }
            })
            .unwrap_or_else(|| project_dirs.config_dir().to_path_buf());

        let config_file = override_config
            .filter(|p| p.is_file() || p.extension().is_some())
            .unwrap_or_else(|| config_dir.join("config.toml"));

        let data_root = override_data.unwrap_or_else(|| project_dirs.data_dir().to_path_buf());
        let database_path = data_root.join("planner.db");

        let cache_dir = project_dirs.cache_dir().to_path_buf();
        let state_dir = project_dirs
            .state_dir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| data_root.join("state"));
        let log_dir = state_dir.join("logs");

        Ok(Self {
            config_dir,
            config_file,
            data_dir: data_root,
            database_path,
            cache_dir,
            log_dir,
            state_dir,
        })
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            &self.config_dir,
            &self.data_dir,
            &self.cache_dir,
            &self.log_dir,
            &self.state_dir,
        ] {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating application directory {}", dir.display()))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub reminders: ReminderOptions,
    pub calendar: CalendarOptions,
    pub storage: StorageOptions,
    pub notes: NoteOptions,
}

impl AppConfig {
    fn post_load(&mut self, paths: &ConfigPaths) -> Result<()> {
        self.storage
            .resolve(paths)
            .context("resolving storage paths")?;
        self.reminders.normalize();
        if let Err(err) = LocalZone::parse(&self.calendar.timezone) {
            tracing::warn!(
                timezone = %self.calendar.timezone,
                %err,
                "unknown timezone in config, falling back to the system zone"
            );
            self.calendar.timezone = "local".into();
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReminderOptions {
    /// Occurrences of a repeating task that carry reminders at any time.
    pub occurrence_window: usize,
    /// Snooze choices offered on a fired reminder, in minutes.
    pub snooze_minutes: Vec<u32>,
    /// Leads applied to new tasks when none are given.
    pub default_leads: Vec<u32>,
    /// How often `run` refreshes rolling windows and looks for outside edits.
    pub refresh_interval_secs: u64,
}

impl Default for ReminderOptions {
    fn default() -> Self {
        Self {
            occurrence_window: 7,
            snooze_minutes: vec![10, 30, 60],
            default_leads: vec![0],
            refresh_interval_secs: 30,
        }
    }
}

impl ReminderOptions {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    fn normalize(&mut self) {
        if self.occurrence_window == 0 {
            tracing::warn!("reminders.occurrence_window must be at least 1, using 1");
            self.occurrence_window = 1;
        }
        self.snooze_minutes.retain(|minutes| *minutes > 0);
        if self.snooze_minutes.is_empty() {
            self.snooze_minutes = Self::default().snooze_minutes;
        }
        self.snooze_minutes.sort_unstable();
        self.snooze_minutes.dedup();
        if self.refresh_interval_secs == 0 {
            self.refresh_interval_secs = Self::default().refresh_interval_secs;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalendarOptions {
    /// `local`, `utc` or a fixed offset such as `+02:00`.
    pub timezone: String,
    pub week_starts_on: WeekStart,
}

impl Default for CalendarOptions {
    fn default() -> Self {
        Self {
            timezone: "local".into(),
            week_starts_on: WeekStart::Monday,
        }
    }
}

impl CalendarOptions {
    pub fn zone(&self) -> Result<LocalZone> {
        LocalZone::parse(&self.timezone)
            .with_context(|| format!("parsing timezone '{}'", self.timezone))
    }

    pub fn first_weekday(&self) -> Weekday {
        match self.week_starts_on {
            WeekStart::Monday => Weekday::Mon,
            WeekStart::Sunday => Weekday::Sun,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum WeekStart {
    #[default]
    Monday,
    Sunday,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    #[serde(skip)]
    pub database_path: PathBuf,
    pub wal_autocheckpoint: u32,
    pub busy_timeout_ms: u64,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            database_path: PathBuf::new(),
            wal_autocheckpoint: 1000,
            busy_timeout_ms: 5_000,
        }
    }
}

impl StorageOptions {
    fn resolve(&mut self, paths: &ConfigPaths) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            self.database_path = paths.database_path.clone();
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NoteOptions {
    pub max_results: usize,
    pub regex_default: bool,
}

impl Default for NoteOptions {
    fn default() -> Self {
        Self {
            max_results: 200,
            regex_default: false,
        }
    }
}
