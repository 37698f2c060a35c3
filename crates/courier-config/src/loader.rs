//! Configuration loader with file and environment variable support

use crate::{AppConfig, BrokerKind, ConfigError, LedgerBackend};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "courier.toml",
    "config.toml",
    "./config/courier.toml",
    "/etc/courier/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = match self.find_config_file() {
            Some(path) => {
                info!(?path, "Loading configuration from file");
                AppConfig::from_file(&path)?
            }
            None => AppConfig::default(),
        };

        self.apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!(?path, "Configured config file does not exist, searching defaults");
        }

        if let Ok(path) = env::var("COURIER_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }

    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // HTTP
        override_parsed("COURIER_HTTP_PORT", &mut config.http.port);
        override_string("COURIER_HTTP_HOST", &mut config.http.host);

        // Broker
        if let Ok(val) = env::var("COURIER_BROKER_KIND") {
            match val.to_ascii_lowercase().as_str() {
                "memory" => config.broker.kind = BrokerKind::Memory,
                "amqp" => config.broker.kind = BrokerKind::Amqp,
                other => warn!(value = %other, "Ignoring unknown COURIER_BROKER_KIND"),
            }
        }
        override_string("COURIER_BROKER_URI", &mut config.broker.uri);
        override_parsed("COURIER_BROKER_PREFETCH", &mut config.broker.prefetch_count);

        // Ledger
        if let Ok(val) = env::var("COURIER_LEDGER_BACKEND") {
            match val.to_ascii_lowercase().as_str() {
                "memory" => config.ledger.backend = LedgerBackend::Memory,
                "sqlite" => config.ledger.backend = LedgerBackend::Sqlite,
                other => warn!(value = %other, "Ignoring unknown COURIER_LEDGER_BACKEND"),
            }
        }
        override_string("COURIER_LEDGER_SQLITE_URL", &mut config.ledger.sqlite_url);

        // Scheduler
        override_parsed("COURIER_SCHEDULER_ENABLED", &mut config.scheduler.enabled);
        override_parsed("COURIER_SCHEDULER_SWEEP_INTERVAL_SECS", &mut config.scheduler.sweep_interval_secs);
        override_parsed("COURIER_SCHEDULER_EXPIRY_INTERVAL_SECS", &mut config.scheduler.expiry_interval_secs);
        override_parsed("COURIER_SCHEDULER_STALE_AFTER_SECS", &mut config.scheduler.stale_after_secs);
        override_parsed("COURIER_SCHEDULER_MAX_ATTEMPTS", &mut config.scheduler.max_promotion_attempts);
        override_parsed("COURIER_SCHEDULER_BROKER_HORIZON_SECS", &mut config.scheduler.broker_horizon_secs);

        // Dispatch
        override_parsed("COURIER_DISPATCH_WORKERS", &mut config.dispatch.workers);
        override_parsed("COURIER_DISPATCH_QUEUE_CAPACITY", &mut config.dispatch.queue_capacity);
        override_string("COURIER_DISPATCH_DEFAULT_OWNER", &mut config.dispatch.default_owner);
        override_string("COURIER_DISPATCH_SMS_SENDER", &mut config.dispatch.default_sms_sender);

        // Consumer
        override_parsed("COURIER_CONSUMER_WORKERS", &mut config.consumer.workers_per_queue);
        override_parsed("COURIER_CONSUMER_BATCH_SIZE", &mut config.consumer.batch_size);
        override_parsed("COURIER_CONSUMER_POLL_INTERVAL_MS", &mut config.consumer.poll_interval_ms);
        override_parsed("COURIER_CONSUMER_DEAD_LETTER", &mut config.consumer.dead_letter_failures);

        // General
        override_parsed("COURIER_DEV_MODE", &mut config.dev_mode);
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn override_string(var: &str, target: &mut String) {
    if let Ok(val) = env::var(var) {
        *target = val;
    }
}

fn override_parsed<T: FromStr>(var: &str, target: &mut T) {
    if let Ok(val) = env::var(var) {
        match val.trim().parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(var = %var, value = %val, "Ignoring unparseable environment override"),
        }
    }
}
