//! # Configuration Management
//!
//! Loads the gateway configuration from several layers, lowest priority first:
//! 1. Default values (the `Default` impl below)
//! 2. Configuration file (`config.toml`, optional)
//! 3. Environment variables with the `APP_` prefix (`APP_SERVER__PORT=9100`)
//! 4. Operator variables: `HOST`, `PORT`, `CAPTURE_AUDIO`, `LOG_DIR`,
//!    `CAPTURE_DIR`, `MODEL_PATH`, `LOG_LEVEL`, `WORKER_THREADS`
//!
//! ## Legacy Names:
//! Deployments of the previous gateway set `SAVE_AUDIO`, `LOG_FOLDER`,
//! `RECORDING_FOLDER` and `VOSK_MODEL_PATH`. Each is honoured when its new name
//! is absent.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub recognition: RecognitionConfig,
    pub capture: CaptureConfig,
    pub logging: LoggingConfig,
    pub workers: WorkersConfig,
    /// Fallbacks applied while loading. Loading runs before logging is set up,
    /// so `main` logs these once the subscriber is installed.
    #[serde(skip)]
    pub startup_warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionConfig {
    /// Directory of the acoustic model.
    pub model_path: PathBuf,
    /// Rate of the incoming PCM; must match the model.
    pub sample_rate: u32,
}

/// Diagnostic WAV capture of every session's audio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub enabled: bool,
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub dir: PathBuf,
    pub level: LogLevel,
    /// Log file name without extension; the file is `<dir>/<file_name>.log`.
    pub file_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    /// Recognition worker threads; 0 picks `max(4, available parallelism)`.
    pub threads: usize,
}

/// Operator-facing log verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        })
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 9000,
            },
            recognition: RecognitionConfig {
                model_path: PathBuf::from("model"),
                sample_rate: 16_000,
            },
            capture: CaptureConfig {
                enabled: false,
                dir: PathBuf::from("."),
            },
            logging: LoggingConfig {
                dir: PathBuf::from("."),
                level: LogLevel::Info,
                file_name: "asr".to_string(),
            },
            workers: WorkersConfig { threads: 0 },
            startup_warnings: Vec::new(),
        }
    }
}

/// Highest accepted PCM rate.
pub const MAX_SAMPLE_RATE: u32 = 192_000;

/// Operator variable → config key, with the legacy name it replaces.
const OVERRIDES: [(&str, Option<&str>, &str); 6] = [
    ("HOST", None, "server.host"),
    ("PORT", None, "server.port"),
    ("LOG_DIR", Some("LOG_FOLDER"), "logging.dir"),
    ("CAPTURE_DIR", Some("RECORDING_FOLDER"), "capture.dir"),
    ("MODEL_PATH", Some("VOSK_MODEL_PATH"), "recognition.model_path"),
    ("WORKER_THREADS", None, "workers.threads"),
];

impl AppConfig {
    /// Load configuration from defaults, `config.toml`, and the environment.
    pub fn load() -> Result<Self> {
        Self::load_with(|name| env::var(name).ok())
    }

    /// Same as [`AppConfig::load`] with an injectable variable lookup.
    pub fn load_with<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let lookup_nonempty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        for (name, legacy, key) in OVERRIDES {
            let value = lookup_nonempty(name).or_else(|| legacy.and_then(lookup_nonempty));
            if let Some(value) = value {
                settings = settings
                    .set_override(key, value)
                    .with_context(|| format!("Invalid value for {name}"))?;
            }
        }

        if let Some(flag) = lookup_nonempty("CAPTURE_AUDIO").or_else(|| lookup_nonempty("SAVE_AUDIO")) {
            settings = settings.set_override("capture.enabled", parse_flag(&flag))?;
        }

        let mut startup_warnings = Vec::new();
        if let Some(level) = lookup_nonempty("LOG_LEVEL") {
            let level = level.parse::<LogLevel>().unwrap_or_else(|err| {
                startup_warnings.push(format!("Invalid LOG_LEVEL ({err}), falling back to info"));
                LogLevel::Info
            });
            settings = settings.set_override("logging.level", level.to_string())?;
        }

        let mut config: AppConfig = settings
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;
        config.startup_warnings = startup_warnings;
        Ok(config)
    }

    /// Reject values the gateway cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            bail!("Server port cannot be 0");
        }
        if self.recognition.sample_rate == 0 {
            bail!("Sample rate must be greater than 0");
        }
        if self.recognition.sample_rate > MAX_SAMPLE_RATE {
            bail!(
                "Sample rate {} exceeds the supported maximum of {} Hz",
                self.recognition.sample_rate,
                MAX_SAMPLE_RATE
            );
        }
        if self.recognition.model_path.as_os_str().is_empty() {
            bail!("Model path cannot be empty");
        }
        if self.logging.file_name.trim().is_empty() {
            bail!("Log file name cannot be empty");
        }
        Ok(())
    }

    /// Worker count with the automatic default resolved.
    pub fn worker_threads(&self) -> usize {
        match self.workers.threads {
            0 => crate::pool::default_size(),
            n => n,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn log_file(&self) -> PathBuf {
        self.logging.dir.join(format!("{}.log", self.logging.file_name))
    }
}

/// `true`, `1`, `yes` and `on` (any case) enable a flag; anything else disables it.
pub fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}
