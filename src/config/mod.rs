//! Configuration loading, validation, and environment-based overrides.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, OrkestraError, OrkestraResult};

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> OrkestraResult<AppConfig> {
        let content = std::fs::read_to_string(path)?;
        Self::load_from_str(&content)
    }

    pub fn load_from_str(content: &str) -> OrkestraResult<AppConfig> {
        let config: AppConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Starts from defaults and applies `ORKESTRA_*` overrides on top.
    pub fn load_from_env() -> OrkestraResult<AppConfig> {
        let mut config = AppConfig::default();

        if let Ok(val) = std::env::var("ORKESTRA_SCALING_MIN_WORKERS") {
            config.scaling.min_workers = parse_env("ORKESTRA_SCALING_MIN_WORKERS", &val)?;
        }
        if let Ok(val) = std::env::var("ORKESTRA_SCALING_MAX_WORKERS") {
            config.scaling.max_workers = parse_env("ORKESTRA_SCALING_MAX_WORKERS", &val)?;
        }
        if let Ok(val) = std::env::var("ORKESTRA_SCALING_TARGET_UTILIZATION") {
            config.scaling.target_utilization = parse_env("ORKESTRA_SCALING_TARGET_UTILIZATION", &val)?;
        }
        if let Ok(val) = std::env::var("ORKESTRA_FAULT_TOLERANCE_MAX_RETRIES") {
            config.fault_tolerance.max_retries = parse_env("ORKESTRA_FAULT_TOLERANCE_MAX_RETRIES", &val)?;
        }
        if let Ok(val) = std::env::var("ORKESTRA_QUEUE_MAX_SIZE") {
            config.queue.max_size = parse_env("ORKESTRA_QUEUE_MAX_SIZE", &val)?;
        }
        if let Ok(val) = std::env::var("ORKESTRA_DEFAULT_TIMEOUT_SECS") {
            let secs: u64 = parse_env("ORKESTRA_DEFAULT_TIMEOUT_SECS", &val)?;
            config.default_timeout = Duration::from_secs(secs);
        }
        if let Ok(val) = std::env::var("ORKESTRA_LOG_LEVEL") {
            config.logging.level = val;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> OrkestraResult<T> {
    value.parse().map_err(|_| {
        OrkestraError::validation_failed(format!("invalid value for {name}: {value}"))
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub scaling: ScalingConfig,
    pub fault_tolerance: FaultToleranceConfig,
    pub storage: StorageConfig,
    pub metrics: MetricsConfig,
    pub queue: QueueConfig,
    #[serde(with = "duration_secs")]
    pub default_timeout: Duration,
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            scaling: ScalingConfig::default(),
            fault_tolerance: FaultToleranceConfig::default(),
            storage: StorageConfig::default(),
            metrics: MetricsConfig::default(),
            queue: QueueConfig::default(),
            default_timeout: Duration::from_secs(30),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> OrkestraResult<()> {
        self.scaling.validate()?;
        self.fault_tolerance.validate()?;
        self.queue.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingConfig {
    pub min_workers: u32,
    pub max_workers: u32,
    pub target_utilization: f64,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    #[serde(with = "duration_secs")]
    pub scale_up_cooldown: Duration,
    #[serde(with = "duration_secs")]
    pub scale_down_cooldown: Duration,
    #[serde(with = "duration_secs")]
    pub worker_startup_time: Duration,
    /// If the oldest queued entry has waited longer than this, scale up even
    /// if utilization hasn't crossed `scale_up_threshold`.
    #[serde(with = "duration_secs")]
    pub scale_up_latency_budget: Duration,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 10,
            target_utilization: 0.7,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            scale_up_cooldown: Duration::from_secs(60),
            scale_down_cooldown: Duration::from_secs(120),
            worker_startup_time: Duration::from_secs(2),
            scale_up_latency_budget: Duration::from_secs(10),
        }
    }
}

impl ScalingConfig {
    pub fn validate(&self) -> OrkestraResult<()> {
        if self.min_workers > self.max_workers {
            return Err(OrkestraError::validation_failed(
                "scaling.minWorkers must be <= scaling.maxWorkers",
            ));
        }
        for (name, value) in [
            ("scaling.targetUtilization", self.target_utilization),
            ("scaling.scaleUpThreshold", self.scale_up_threshold),
            ("scaling.scaleDownThreshold", self.scale_down_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(OrkestraError::validation_failed(format!(
                    "{name} must be within [0,1], got {value}"
                )));
            }
        }
        if self.scale_down_threshold >= self.scale_up_threshold {
            return Err(OrkestraError::validation_failed(
                "scaling.scaleDownThreshold must be less than scaling.scaleUpThreshold",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerOptions {
    pub failure_threshold: u32,
    #[serde(with = "duration_secs")]
    pub reset_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub monitoring_period: Duration,
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            monitoring_period: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultToleranceConfig {
    pub max_retries: u32,
    #[serde(with = "duration_secs")]
    pub retry_delay: Duration,
    pub backoff_factor: f64,
    pub circuit_breaker_config: CircuitBreakerOptions,
}

impl Default for FaultToleranceConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            circuit_breaker_config: CircuitBreakerOptions::default(),
        }
    }
}

impl FaultToleranceConfig {
    pub fn validate(&self) -> OrkestraResult<()> {
        if self.backoff_factor < 1.0 {
            return Err(OrkestraError::validation_failed(
                "faultTolerance.backoffFactor must be >= 1.0",
            ));
        }
        if self.circuit_breaker_config.failure_threshold == 0 {
            return Err(OrkestraError::validation_failed(
                "faultTolerance.circuitBreakerConfig.failureThreshold must be > 0",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub result_retention_days: u32,
    pub compression_enabled: bool,
    pub encryption_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            result_retention_days: 7,
            compression_enabled: false,
            encryption_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(with = "duration_secs")]
    pub collection_interval: Duration,
    #[serde(with = "duration_secs")]
    pub aggregation_window: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            collection_interval: Duration::from_secs(15),
            aggregation_window: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub max_size: usize,
    #[serde(with = "duration_secs")]
    pub processing_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            processing_interval: Duration::from_millis(50),
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> OrkestraResult<()> {
        if self.max_size == 0 {
            return Err(OrkestraError::validation_failed("queue.maxSize must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> OrkestraResult<()> {
        let valid = ["trace", "debug", "info", "warn", "error"];
        if !valid.contains(&self.level.as_str()) {
            return Err(OrkestraError::new(
                ErrorKind::ValidationFailed,
                format!("invalid log level: {}", self.level),
            ));
        }
        Ok(())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_min_greater_than_max_workers() {
        let mut config = AppConfig::default();
        config.scaling.min_workers = 5;
        config.scaling.max_workers = 2;
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidationFailed);
    }

    #[test]
    fn rejects_threshold_outside_unit_interval() {
        let mut config = AppConfig::default();
        config.scaling.target_utilization = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_override_parses_and_validates() {
        std::env::set_var("ORKESTRA_SCALING_MIN_WORKERS", "2");
        let config = ConfigLoader::load_from_env().unwrap();
        assert_eq!(config.scaling.min_workers, 2);
        std::env::remove_var("ORKESTRA_SCALING_MIN_WORKERS");
    }
}
