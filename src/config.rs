//! Service configuration.
//!
//! All options can be supplied through environment variables (optionally via a
//! `.env` file), prefixed by subsystem: `APP_*`, `WORKER_*`, `TRANSCRIPTION_*`,
//! `DOWNLOAD_*`, `RATE_LIMIT_*`, `STORE_*`. Lookups are case-insensitive.
//! `Config::from_env` applies defaults, then overrides, then validates ranges.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Runtime environment tag surfaced by the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Test,
    Staging,
    Prod,
}

impl Environment {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Test => "test",
            Self::Staging => "staging",
            Self::Prod => "prod",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "dev" => Ok(Self::Dev),
            "test" => Ok(Self::Test),
            "staging" => Ok(Self::Staging),
            "prod" => Ok(Self::Prod),
            other => Err(Error::Validation(format!(
                "unknown environment '{other}' (expected dev, test, staging or prod)"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: Environment,
    pub debug: bool,
    pub host: String,
    pub port: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Dev,
            debug: false,
            host: "0.0.0.0".to_owned(),
            port: 8000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of persistent pipeline workers. Must be > 0.
    pub max_workers: usize,
    /// Capacity of the bounded task queue. Must be > 0.
    pub max_queue_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            max_queue_size: 10,
        }
    }
}

/// Sample rate and channel layout used when cutting chunks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AudioSettings {
    /// Hz, within [8000, 48000].
    pub sample_rate: u32,
    /// 1 (mono) or 2 (stereo).
    pub channels: u16,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TranscriptionConfig {
    /// Transcription endpoint, e.g. `https://api.example.com/v1/audio/transcriptions`.
    pub api_url: String,
    /// Bearer token. Required outside of tests.
    pub api_key: String,
    pub model: String,
    /// Optional language hint forwarded to the API. When `None`, the API detects it.
    pub language: Option<String>,
    pub api_timeout: Duration,
    /// Ceiling on a normalized chunk's size; larger uploads are rejected locally.
    pub chunk_max_size_bytes: u64,
    /// Target duration of a single chunk, seconds.
    pub chunk_duration_sec: f64,
    /// Container format chunks are cut to (`wav` unless configured otherwise).
    pub audio_format: String,
    pub audio_settings: AudioSettings,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_key: String::new(),
            model: "whisper-large-v3".to_owned(),
            language: None,
            api_timeout: Duration::from_secs(60),
            chunk_max_size_bytes: 25 * 1024 * 1024,
            chunk_duration_sec: 300.0,
            audio_format: "wav".to_owned(),
            audio_settings: AudioSettings::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Wall-clock bound on a single audio-extraction attempt.
    pub timeout: Duration,
    pub verify_timeout: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            timeout: Duration::from_secs(600),
            verify_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window_seconds: u64,
    pub max_requests: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_seconds: 50,
            max_requests: 60,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Host:port of the S3-compatible endpoint. Empty selects the in-memory store.
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub secure: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            access_key: "minioadmin".to_owned(),
            secret_key: "minioadmin".to_owned(),
            bucket: "transom".to_owned(),
            secure: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub app: AppConfig,
    pub worker: WorkerConfig,
    pub transcription: TranscriptionConfig,
    pub download: DownloadConfig,
    pub rate_limit: RateLimitConfig,
    pub store: StoreConfig,
}

impl Config {
    /// Load configuration from the process environment, honoring a `.env` file
    /// when present. Values missing from the environment keep their defaults.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut cfg = Self::default();

        if let Some(raw) = env_var("APP_ENVIRONMENT") {
            cfg.app.environment = Environment::parse(&raw)?;
        }
        if let Some(raw) = env_var("APP_DEBUG") {
            cfg.app.debug = parse_bool("APP_DEBUG", &raw)?;
        }
        if let Some(raw) = env_var("APP_HOST") {
            cfg.app.host = raw;
        }
        if let Some(raw) = env_var("APP_PORT") {
            cfg.app.port = parse_num("APP_PORT", &raw)?;
        }

        if let Some(raw) = env_var("WORKER_MAX_WORKERS") {
            cfg.worker.max_workers = parse_num("WORKER_MAX_WORKERS", &raw)?;
        }
        if let Some(raw) = env_var("WORKER_MAX_QUEUE_SIZE") {
            cfg.worker.max_queue_size = parse_num("WORKER_MAX_QUEUE_SIZE", &raw)?;
        }

        if let Some(raw) = env_var("TRANSCRIPTION_API_URL") {
            cfg.transcription.api_url = raw;
        }
        if let Some(raw) = env_var("TRANSCRIPTION_API_KEY") {
            cfg.transcription.api_key = raw;
        }
        if let Some(raw) = env_var("TRANSCRIPTION_MODEL") {
            cfg.transcription.model = raw;
        }
        if let Some(raw) = env_var("TRANSCRIPTION_LANGUAGE") {
            cfg.transcription.language = Some(raw).filter(|s| !s.trim().is_empty());
        }
        if let Some(raw) = env_var("TRANSCRIPTION_API_TIMEOUT_SEC") {
            cfg.transcription.api_timeout =
                Duration::from_secs(parse_num("TRANSCRIPTION_API_TIMEOUT_SEC", &raw)?);
        }
        if let Some(raw) = env_var("TRANSCRIPTION_CHUNK_MAX_SIZE_BYTES") {
            cfg.transcription.chunk_max_size_bytes =
                parse_num("TRANSCRIPTION_CHUNK_MAX_SIZE_BYTES", &raw)?;
        }
        if let Some(raw) = env_var("TRANSCRIPTION_CHUNK_DURATION_SEC") {
            cfg.transcription.chunk_duration_sec =
                parse_num("TRANSCRIPTION_CHUNK_DURATION_SEC", &raw)?;
        }
        if let Some(raw) = env_var("TRANSCRIPTION_AUDIO_FORMAT") {
            cfg.transcription.audio_format = raw.trim().to_ascii_lowercase();
        }
        if let Some(raw) = env_var("TRANSCRIPTION_SAMPLE_RATE") {
            cfg.transcription.audio_settings.sample_rate =
                parse_num("TRANSCRIPTION_SAMPLE_RATE", &raw)?;
        }
        if let Some(raw) = env_var("TRANSCRIPTION_CHANNELS") {
            cfg.transcription.audio_settings.channels = parse_num("TRANSCRIPTION_CHANNELS", &raw)?;
        }

        if let Some(raw) = env_var("DOWNLOAD_MAX_RETRIES") {
            cfg.download.max_retries = parse_num("DOWNLOAD_MAX_RETRIES", &raw)?;
        }
        if let Some(raw) = env_var("DOWNLOAD_RETRY_DELAY_SEC") {
            cfg.download.retry_delay =
                Duration::from_secs(parse_num("DOWNLOAD_RETRY_DELAY_SEC", &raw)?);
        }
        if let Some(raw) = env_var("DOWNLOAD_TIMEOUT_SEC") {
            cfg.download.timeout = Duration::from_secs(parse_num("DOWNLOAD_TIMEOUT_SEC", &raw)?);
        }
        if let Some(raw) = env_var("DOWNLOAD_VERIFY_TIMEOUT_SEC") {
            cfg.download.verify_timeout =
                Duration::from_secs(parse_num("DOWNLOAD_VERIFY_TIMEOUT_SEC", &raw)?);
        }

        if let Some(raw) = env_var("RATE_LIMIT_WINDOW_SECONDS") {
            cfg.rate_limit.window_seconds = parse_num("RATE_LIMIT_WINDOW_SECONDS", &raw)?;
        }
        if let Some(raw) = env_var("RATE_LIMIT_MAX_REQUESTS") {
            cfg.rate_limit.max_requests = parse_num("RATE_LIMIT_MAX_REQUESTS", &raw)?;
        }

        if let Some(raw) = env_var("STORE_ENDPOINT") {
            cfg.store.endpoint = raw;
        }
        if let Some(raw) = env_var("STORE_ACCESS_KEY") {
            cfg.store.access_key = raw;
        }
        if let Some(raw) = env_var("STORE_SECRET_KEY") {
            cfg.store.secret_key = raw;
        }
        if let Some(raw) = env_var("STORE_BUCKET") {
            cfg.store.bucket = raw;
        }
        if let Some(raw) = env_var("STORE_SECURE") {
            cfg.store.secure = parse_bool("STORE_SECURE", &raw)?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Range-check every option that has documented bounds.
    pub fn validate(&self) -> Result<()> {
        if self.worker.max_workers == 0 {
            return Err(Error::Validation("WORKER_MAX_WORKERS must be > 0".into()));
        }
        if self.worker.max_queue_size == 0 {
            return Err(Error::Validation("WORKER_MAX_QUEUE_SIZE must be > 0".into()));
        }
        if self.transcription.chunk_duration_sec <= 0.0 {
            return Err(Error::Validation(
                "TRANSCRIPTION_CHUNK_DURATION_SEC must be > 0".into(),
            ));
        }
        let rate = self.transcription.audio_settings.sample_rate;
        if !(8_000..=48_000).contains(&rate) {
            return Err(Error::Validation(format!(
                "TRANSCRIPTION_SAMPLE_RATE {rate} outside [8000, 48000]"
            )));
        }
        let channels = self.transcription.audio_settings.channels;
        if !(1..=2).contains(&channels) {
            return Err(Error::Validation(format!(
                "TRANSCRIPTION_CHANNELS {channels} outside [1, 2]"
            )));
        }
        if self.rate_limit.max_requests == 0 {
            return Err(Error::Validation("RATE_LIMIT_MAX_REQUESTS must be > 0".into()));
        }
        if self.rate_limit.window_seconds == 0 {
            return Err(Error::Validation(
                "RATE_LIMIT_WINDOW_SECONDS must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// The transcription API key is required for any run that reaches the
    /// transcribe stage; the server refuses to start without it.
    pub fn require_api_key(&self) -> Result<()> {
        if self.transcription.api_key.trim().is_empty() {
            return Err(Error::Validation("TRANSCRIPTION_API_KEY is required".into()));
        }
        Ok(())
    }
}

/// Case-insensitive environment lookup: exact name first, then lower-case.
fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .or_else(|_| std::env::var(name.to_ascii_lowercase()))
        .ok()
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::Validation(format!(
            "{name}: cannot parse '{other}' as bool"
        ))),
    }
}

fn parse_num<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Validation(format!("{name}: cannot parse '{raw}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() -> anyhow::Result<()> {
        let cfg = Config::default();
        cfg.validate()?;

        assert_eq!(cfg.transcription.chunk_duration_sec, 300.0);
        assert_eq!(cfg.transcription.chunk_max_size_bytes, 25 * 1024 * 1024);
        assert_eq!(cfg.rate_limit.window_seconds, 50);
        assert_eq!(cfg.rate_limit.max_requests, 60);
        assert_eq!(cfg.transcription.audio_settings.sample_rate, 16_000);
        Ok(())
    }

    #[test]
    fn rejects_out_of_range_audio_settings() {
        let mut cfg = Config::default();
        cfg.transcription.audio_settings.sample_rate = 4_000;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.transcription.audio_settings.channels = 3;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_workers_and_queue() {
        let mut cfg = Config::default();
        cfg.worker.max_workers = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.worker.max_queue_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parses_bools_loosely() -> anyhow::Result<()> {
        assert!(parse_bool("X", "TRUE")?);
        assert!(parse_bool("X", "on")?);
        assert!(!parse_bool("X", "0")?);
        assert!(parse_bool("X", "maybe").is_err());
        Ok(())
    }

    #[test]
    fn missing_api_key_is_flagged() {
        let cfg = Config::default();
        assert!(cfg.require_api_key().is_err());

        let mut cfg = Config::default();
        cfg.transcription.api_key = "sk-test".into();
        assert!(cfg.require_api_key().is_ok());
    }

    #[test]
    fn environment_parses_case_insensitively() -> anyhow::Result<()> {
        assert_eq!(Environment::parse("PROD")?, Environment::Prod);
        assert_eq!(Environment::parse(" dev ")?, Environment::Dev);
        assert!(Environment::parse("qa").is_err());
        Ok(())
    }
}
