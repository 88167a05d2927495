// Configuration management for keel services
//
// Sources are layered: built-in defaults, then configuration files in the
// order given, then `.env`, then prefixed environment variables.

pub mod env;
pub mod error;
pub mod loader;
pub mod validation;

pub use env::EnvLoader;
pub use error::{ConfigError, Result};
pub use loader::{ConfigLoader, FileFormat};
pub use validation::{ConfigValidator, Validate};

use keel_core::logging::{LogConfig, LogFormat, LogLevel, LogOutput};
use keel_core::scheduler::{self, BoundedConfig, Scheduler, Schedulers, TimeoutPolicy};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// `[server]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8080".into(),
        }
    }
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    /// `stdout`, `stderr`, or a file path.
    pub output: String,
    /// Explicit filter directives, e.g. `keel_core=debug`.
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "json".into(),
            output: "stdout".into(),
            filter: None,
        }
    }
}

/// A named scheduler beyond the built-in `biz` and `io`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerEntry {
    pub name: String,
    /// `bounded` or `direct`.
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub max_concurrent: Option<usize>,
    #[serde(default)]
    pub queue_capacity: Option<usize>,
    /// Threads of the pool runtime for a `bounded` scheduler.
    #[serde(default)]
    pub worker_threads: Option<usize>,
    #[serde(default)]
    pub queued_timeout_ms: Option<u64>,
    #[serde(default)]
    pub first_byte_timeout_ms: Option<u64>,
}

fn default_kind() -> String {
    "bounded".into()
}

/// `[scheduling]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    pub default: String,
    /// Concurrency of `biz`; twice the available cores when unset.
    pub biz_pool_size: Option<usize>,
    pub biz_queue_capacity: usize,
    /// Default policy of `biz`. At most one of the two may be set.
    pub queued_timeout_ms: Option<u64>,
    pub first_byte_timeout_ms: Option<u64>,
    pub schedulers: Vec<SchedulerEntry>,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            default: scheduler::BIZ.into(),
            biz_pool_size: None,
            biz_queue_capacity: 1024,
            queued_timeout_ms: None,
            first_byte_timeout_ms: None,
            schedulers: Vec::new(),
        }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeelConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub scheduling: SchedulingConfig,
}

impl KeelConfig {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Reads `keel.toml` if present, then `.env` and `KEEL_` variables.
    pub fn load() -> Result<Self> {
        Self::builder()
            .optional_file("keel.toml")
            .dotenv(None)
            .env()
            .build()
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Self::from_value(ConfigLoader::new(FileFormat::Toml).parse(content)?)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        Self::from_value(ConfigLoader::new(FileFormat::Json).parse(content)?)
    }

    fn from_value(value: Value) -> Result<Self> {
        let config: KeelConfig =
            serde_json::from_value(value).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server
            .addr
            .parse()
            .map_err(|e| ConfigError::invalid("server.addr", format!("{e}")))
    }

    pub fn log_config(&self) -> Result<LogConfig> {
        let level = LogLevel::parse(&self.logging.level)
            .ok_or_else(|| ConfigError::invalid("logging.level", self.logging.level.clone()))?;
        let format = LogFormat::parse(&self.logging.format)
            .ok_or_else(|| ConfigError::invalid("logging.format", self.logging.format.clone()))?;
        let output = match self.logging.output.to_ascii_lowercase().as_str() {
            "stdout" => LogOutput::Stdout,
            "stderr" => LogOutput::Stderr,
            _ => LogOutput::File(self.logging.output.clone()),
        };
        let mut log = LogConfig::new().level(level).format(format).output(output);
        if let Some(filter) = &self.logging.filter {
            log = log.with_env_filter(filter.clone());
        }
        Ok(log)
    }

    /// Builds `biz`, `io` and every configured scheduler.
    pub fn scheduler_registry(&self) -> Result<Schedulers> {
        let scheduling = &self.scheduling;
        let mut registry = Schedulers::empty();

        let pool_size = scheduling.biz_pool_size.unwrap_or_else(|| {
            std::thread::available_parallelism().map_or(4, |n| n.get()) * 2
        });
        let biz = Scheduler::bounded(
            BoundedConfig::new(scheduler::BIZ, pool_size)
                .queue_capacity(scheduling.biz_queue_capacity),
        );
        registry.register(with_policy(
            biz,
            "scheduling",
            scheduling.queued_timeout_ms,
            scheduling.first_byte_timeout_ms,
        )?);
        registry.register(Scheduler::direct(scheduler::IO));

        for entry in &scheduling.schedulers {
            let key = format!("scheduling.schedulers.{}", entry.name);
            let base = if entry.kind.eq_ignore_ascii_case("direct") {
                Scheduler::direct(entry.name.clone())
            } else {
                let mut bounded = BoundedConfig::new(
                    entry.name.clone(),
                    entry.max_concurrent.unwrap_or(pool_size),
                );
                if let Some(capacity) = entry.queue_capacity {
                    bounded = bounded.queue_capacity(capacity);
                }
                if let Some(threads) = entry.worker_threads {
                    bounded = bounded.worker_threads(threads);
                }
                Scheduler::bounded(bounded)
            };
            registry.register(with_policy(
                base,
                &key,
                entry.queued_timeout_ms,
                entry.first_byte_timeout_ms,
            )?);
        }

        if registry.get(&scheduling.default).is_none() {
            return Err(ConfigError::invalid(
                "scheduling.default",
                format!("no scheduler named '{}'", scheduling.default),
            ));
        }
        registry.set_default(scheduling.default.clone());
        Ok(registry)
    }
}

fn with_policy(
    scheduler: Scheduler,
    key: &str,
    queued_ms: Option<u64>,
    first_byte_ms: Option<u64>,
) -> Result<Scheduler> {
    match (queued_ms, first_byte_ms) {
        (Some(_), Some(_)) => Err(ConfigError::invalid(
            key,
            "set either queued_timeout_ms or first_byte_timeout_ms, not both",
        )),
        (Some(ms), None) => {
            Ok(scheduler.with_policy(TimeoutPolicy::QueuedTimeout(Duration::from_millis(ms))))
        }
        (None, Some(ms)) => {
            Ok(scheduler.with_policy(TimeoutPolicy::TimeToFirstByte(Duration::from_millis(ms))))
        }
        (None, None) => Ok(scheduler),
    }
}

impl Validate for KeelConfig {
    fn validate(&self) -> Result<()> {
        ConfigValidator::not_empty(&self.server.addr, "server.addr")?;
        ConfigValidator::not_empty(&self.scheduling.default, "scheduling.default")?;
        if let Some(size) = self.scheduling.biz_pool_size {
            ConfigValidator::in_range(size, 1, 65_536, "scheduling.biz_pool_size")?;
        }
        for entry in &self.scheduling.schedulers {
            ConfigValidator::not_empty(&entry.name, "scheduling.schedulers.name")?;
            ConfigValidator::one_of(&entry.kind, &["bounded", "direct"], "scheduling.schedulers.kind")?;
            if let Some(max) = entry.max_concurrent {
                ConfigValidator::in_range(max, 1, 65_536, "scheduling.schedulers.max_concurrent")?;
            }
            if let Some(threads) = entry.worker_threads {
                ConfigValidator::in_range(threads, 1, 1_024, "scheduling.schedulers.worker_threads")?;
            }
        }
        Ok(())
    }
}

/// Layered loading of a [`KeelConfig`].
pub struct ConfigBuilder {
    files: Vec<(PathBuf, bool)>,
    load_dotenv: bool,
    dotenv_path: Option<PathBuf>,
    env_prefix: Option<String>,
    overrides: Vec<Value>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            files: Vec::new(),
            load_dotenv: false,
            dotenv_path: None,
            env_prefix: None,
            overrides: Vec::new(),
        }
    }

    /// Adds a required TOML or JSON file.
    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.files.push((path.into(), true));
        self
    }

    /// Adds a file that is skipped when missing.
    pub fn optional_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.files.push((path.into(), false));
        self
    }

    /// Loads `.env`, or the given file, into the process environment before
    /// environment variables are read.
    pub fn dotenv(mut self, path: Option<PathBuf>) -> Self {
        self.load_dotenv = true;
        self.dotenv_path = path;
        self
    }

    /// Reads `KEEL_` variables.
    pub fn env(self) -> Self {
        self.env_prefix(env::DEFAULT_PREFIX)
    }

    pub fn env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = Some(prefix.into());
        self
    }

    /// Layers a table on top of everything else.
    pub fn set(mut self, value: Value) -> Self {
        self.overrides.push(value);
        self
    }

    pub fn build(self) -> Result<KeelConfig> {
        let mut merged = serde_json::to_value(KeelConfig::default())
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        for (path, required) in &self.files {
            match ConfigLoader::auto(path)?.load_file(path) {
                Ok(value) => loader::merge(&mut merged, value),
                Err(ConfigError::FileNotFound(missing)) if !required => {
                    tracing::debug!(path = %missing, "Optional config file not found");
                }
                Err(err) => return Err(err),
            }
        }

        if self.load_dotenv {
            let loaded = match &self.dotenv_path {
                Some(path) => dotenvy::from_path(path).map(|_| ()),
                None => dotenvy::dotenv().map(|_| ()),
            };
            match loaded {
                Ok(()) => {}
                Err(err) if err.not_found() && self.dotenv_path.is_none() => {}
                Err(err) => return Err(ConfigError::ParseError(format!(".env: {err}"))),
            }
        }

        if let Some(prefix) = &self.env_prefix {
            loader::merge(&mut merged, EnvLoader::new(prefix.clone()).load());
        }

        for value in self.overrides {
            loader::merge(&mut merged, value);
        }

        KeelConfig::from_value(merged)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
