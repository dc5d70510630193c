use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context as _;
use hyper::Uri;
use serde::Deserialize;

pub const PROJECT_CONFIG_FILENAME: &str = "statediff-proxy.toml";
pub const DEFAULT_LISTEN: &str = "0.0.0.0:8081";
pub const DEFAULT_BACKEND: &str = "http://localhost:8080";
pub const DEFAULT_MAX_BODY_BYTES: usize = 8 * 1024 * 1024;
pub const DEFAULT_LOG_DIR: &str = "results";
pub const DEFAULT_LOG_FILE: &str = "statediff_log.csv";
pub const DEFAULT_LOG_HEADER: &str = "x-statediff-log";
pub const DEFAULT_CYCLE_SIZE: usize = 4;
pub const DEFAULT_MODES: [&str; 5] = [
    "baseline",
    "no_optimization",
    "plus_write_coalescing",
    "plus_prune",
    "plus_compression",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub measure: MeasureConfig,
    #[serde(default)]
    pub run_log: RunLogConfig,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
    #[serde(default)]
    pub summary: SummaryConfig,
    #[serde(skip)]
    source_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig::default(),
            measure: MeasureConfig::default(),
            run_log: RunLogConfig::default(),
            logging: None,
            summary: SummaryConfig::default(),
            source_path: None,
        }
    }
}

impl Config {
    /// Loads the explicit path when given, otherwise `./statediff-proxy.toml`
    /// if present, otherwise built-in defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = path {
            return Self::from_path(path);
        }

        let project_config = PathBuf::from(PROJECT_CONFIG_FILENAME);
        if project_config.is_file() {
            return Self::from_path(&project_config);
        }

        Ok(Self::default())
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        let mut config = Self::from_toml_str(&toml)
            .with_context(|| format!("load config {}", path.display()))?;
        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    pub fn backend_uri(&self) -> anyhow::Result<Uri> {
        let uri: Uri = self
            .proxy
            .backend
            .parse()
            .with_context(|| format!("parse backend url `{}`", self.proxy.backend))?;
        if uri.scheme_str() != Some("http") {
            anyhow::bail!(
                "backend url `{}` must use plain http://",
                self.proxy.backend
            );
        }
        if uri.authority().is_none() {
            anyhow::bail!("backend url `{}` is missing a host", self.proxy.backend);
        }
        Ok(uri)
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(s).context("parse config TOML")?;
        config.validate()?;
        Ok(config)
    }
}

impl Config {
    fn validate(&self) -> anyhow::Result<()> {
        if self.measure.command.is_empty() {
            anyhow::bail!("`measure.command` must name a program");
        }
        if self.run_log.default_file.trim().is_empty() {
            anyhow::bail!("`run_log.default_file` cannot be empty");
        }
        if self.measure.timeout_ms == Some(0) {
            anyhow::bail!("`measure.timeout_ms` must be greater than zero");
        }
        self.backend_uri()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default)]
    pub serialize: SerializeScope,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backend: default_backend(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            serialize: SerializeScope::default(),
        }
    }
}

/// How much of an exchange runs while holding the measurement slot.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SerializeScope {
    /// Forward, measure and log run as one critical section.
    #[default]
    Exchange,
    /// Only measure and log are serialized; backend calls may overlap.
    Measurement,
}

impl SerializeScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exchange => "exchange",
            Self::Measurement => "measurement",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeasureConfig {
    #[serde(default = "default_measure_command")]
    pub command: Vec<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Default for MeasureConfig {
    fn default() -> Self {
        Self {
            command: default_measure_command(),
            timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunLogConfig {
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_log_file")]
    pub default_file: String,
    #[serde(default = "default_log_header")]
    pub header: String,
}

impl Default for RunLogConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            default_file: default_log_file(),
            header: default_log_header(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SummaryConfig {
    #[serde(default = "default_cycle_size")]
    pub cycle_size: usize,
    #[serde(default = "default_modes")]
    pub modes: Vec<String>,
    #[serde(default)]
    pub chart_command: Option<Vec<String>>,
    #[serde(default = "default_log_scale")]
    pub log_scale: bool,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            cycle_size: DEFAULT_CYCLE_SIZE,
            modes: default_modes(),
            chart_command: None,
            log_scale: default_log_scale(),
        }
    }
}

fn default_listen() -> SocketAddr {
    DEFAULT_LISTEN
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8081)))
}

fn default_backend() -> String {
    DEFAULT_BACKEND.to_owned()
}

fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

fn default_measure_command() -> Vec<String> {
    vec!["sudo".to_owned(), "./fuse_rust/target/release/get_diff".to_owned()]
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(DEFAULT_LOG_DIR)
}

fn default_log_file() -> String {
    DEFAULT_LOG_FILE.to_owned()
}

fn default_log_header() -> String {
    DEFAULT_LOG_HEADER.to_owned()
}

fn default_cycle_size() -> usize {
    DEFAULT_CYCLE_SIZE
}

fn default_modes() -> Vec<String> {
    DEFAULT_MODES.iter().map(|mode| (*mode).to_owned()).collect()
}

fn default_log_scale() -> bool {
    true
}
