use crate::error::{OverlayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

/// Default bound on bytes held by the source cache
pub const DEFAULT_CACHE_SIZE: u64 = 64 * 1024 * 1024;

/// Configuration source for tracking where values come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Default value
    Default,
    /// Loaded from config file
    File,
    /// Loaded from environment variable
    Environment,
    /// Provided via CLI argument
    Cli,
}

impl ConfigSource {
    /// Returns the precedence level (higher = higher priority)
    pub fn precedence(&self) -> u8 {
        match self {
            ConfigSource::Default => 0,
            ConfigSource::File => 1,
            ConfigSource::Environment => 2,
            ConfigSource::Cli => 3,
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }

    /// Update the value if the new source has higher precedence
    pub fn update(&mut self, value: T, source: ConfigSource) {
        if source.precedence() > self.source.precedence() {
            self.value = value;
            self.source = source;
        }
    }
}

/// Layered configuration for the overlay engine
#[derive(Debug, Clone)]
pub struct LayeredConfig {
    /// Total bytes the source cache may hold (ranges + open source indexes)
    pub cache_size: ConfigValue<u64>,
    pub worker_threads: ConfigValue<usize>,
    /// Capacity of the bounded channel feeding candidates into a clip job
    pub candidate_channel_capacity: ConfigValue<usize>,
    /// Number of fully-inside rectangles a cover aims for
    pub cover_target: ConfigValue<usize>,
    pub queued_timeout_secs: ConfigValue<u64>,
    pub processing_timeout_secs: ConfigValue<u64>,
    /// Reproject sketches to an equal-area CRS before clipping
    pub equal_area: ConfigValue<bool>,
}

impl LayeredConfig {
    /// Create a new configuration with default values
    pub fn with_defaults() -> Self {
        let threads = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        Self {
            cache_size: ConfigValue::new(DEFAULT_CACHE_SIZE, ConfigSource::Default),
            worker_threads: ConfigValue::new(threads, ConfigSource::Default),
            candidate_channel_capacity: ConfigValue::new(256, ConfigSource::Default),
            cover_target: ConfigValue::new(64, ConfigSource::Default),
            queued_timeout_secs: ConfigValue::new(10 * 60, ConfigSource::Default),
            processing_timeout_secs: ConfigValue::new(5 * 60, ConfigSource::Default),
            equal_area: ConfigValue::new(false, ConfigSource::Default),
        }
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        let content =
            fs::read_to_string(path.as_ref()).map_err(|e| OverlayError::ConfigInvalid {
                key: "file".to_string(),
                reason: format!("Failed to read config file: {}", e),
            })?;

        let file_config: FileConfig =
            toml::from_str(&content).map_err(|e| OverlayError::ConfigInvalid {
                key: "file".to_string(),
                reason: format!("Failed to parse TOML: {}", e),
            })?;

        if let Some(size) = file_config.cache_size {
            let bytes = match size {
                ByteSizeValue::Bytes(b) => b,
                ByteSizeValue::Text(s) => parse_byte_size(&s)?,
            };
            self.cache_size.update(bytes, ConfigSource::File);
        }

        if let Some(n) = file_config.worker_threads {
            self.worker_threads.update(validate_positive("worker_threads", n)?, ConfigSource::File);
        }

        if let Some(n) = file_config.candidate_channel_capacity {
            self.candidate_channel_capacity
                .update(validate_positive("candidate_channel_capacity", n)?, ConfigSource::File);
        }

        if let Some(n) = file_config.cover_target {
            self.cover_target.update(n, ConfigSource::File);
        }

        if let Some(secs) = file_config.queued_timeout_secs {
            self.queued_timeout_secs.update(secs, ConfigSource::File);
        }

        if let Some(secs) = file_config.processing_timeout_secs {
            self.processing_timeout_secs.update(secs, ConfigSource::File);
        }

        if let Some(equal_area) = file_config.equal_area {
            self.equal_area.update(equal_area, ConfigSource::File);
        }

        Ok(self)
    }

    /// Load configuration from environment variables
    pub fn load_from_env(mut self) -> Self {
        // OVERLAY_CACHE_SIZE
        if let Ok(raw) = env::var("OVERLAY_CACHE_SIZE") {
            match parse_byte_size(&raw) {
                Ok(bytes) => self.cache_size.update(bytes, ConfigSource::Environment),
                Err(_) => tracing::warn!(
                    "Invalid OVERLAY_CACHE_SIZE value '{}': expected bytes such as 67108864 or 64MB",
                    raw
                ),
            }
        }

        if let Some(n) = env_usize("OVERLAY_WORKER_THREADS") {
            self.worker_threads.update(n, ConfigSource::Environment);
        }

        if let Some(n) = env_usize("OVERLAY_CANDIDATE_CHANNEL_CAPACITY") {
            self.candidate_channel_capacity.update(n, ConfigSource::Environment);
        }

        if let Some(n) = env_usize("OVERLAY_COVER_TARGET") {
            self.cover_target.update(n, ConfigSource::Environment);
        }

        if let Some(secs) = env_usize("OVERLAY_QUEUED_TIMEOUT_SECS") {
            self.queued_timeout_secs.update(secs as u64, ConfigSource::Environment);
        }

        if let Some(secs) = env_usize("OVERLAY_PROCESSING_TIMEOUT_SECS") {
            self.processing_timeout_secs.update(secs as u64, ConfigSource::Environment);
        }

        // OVERLAY_EQUAL_AREA
        if let Ok(raw) = env::var("OVERLAY_EQUAL_AREA") {
            match parse_bool(&raw) {
                Ok(flag) => self.equal_area.update(flag, ConfigSource::Environment),
                Err(_) => tracing::warn!(
                    "Invalid OVERLAY_EQUAL_AREA value '{}': expected true or false",
                    raw
                ),
            }
        }

        self
    }

    /// Update configuration from CLI arguments
    pub fn update_from_cli(&mut self, overrides: CliConfigOverrides) {
        if let Some(bytes) = overrides.cache_size {
            self.cache_size.update(bytes, ConfigSource::Cli);
        }

        if let Some(n) = overrides.worker_threads {
            self.worker_threads.update(n, ConfigSource::Cli);
        }

        if let Some(n) = overrides.cover_target {
            self.cover_target.update(n, ConfigSource::Cli);
        }

        if let Some(flag) = overrides.equal_area {
            self.equal_area.update(flag, ConfigSource::Cli);
        }
    }

    /// Get all configuration values as a map for inspection
    pub fn to_inspection_map(&self) -> HashMap<String, (String, ConfigSource)> {
        let mut map = HashMap::new();

        map.insert(
            "cache_size".to_string(),
            (format_byte_size(self.cache_size.value), self.cache_size.source),
        );
        map.insert(
            "worker_threads".to_string(),
            (self.worker_threads.value.to_string(), self.worker_threads.source),
        );
        map.insert(
            "candidate_channel_capacity".to_string(),
            (
                self.candidate_channel_capacity.value.to_string(),
                self.candidate_channel_capacity.source,
            ),
        );
        map.insert(
            "cover_target".to_string(),
            (self.cover_target.value.to_string(), self.cover_target.source),
        );
        map.insert(
            "queued_timeout_secs".to_string(),
            (format!("{}s", self.queued_timeout_secs.value), self.queued_timeout_secs.source),
        );
        map.insert(
            "processing_timeout_secs".to_string(),
            (
                format!("{}s", self.processing_timeout_secs.value),
                self.processing_timeout_secs.source,
            ),
        );
        map.insert(
            "equal_area".to_string(),
            (self.equal_area.value.to_string(), self.equal_area.source),
        );

        map
    }
}

/// Configuration loaded from TOML file
#[derive(Debug, Deserialize, Serialize)]
struct FileConfig {
    cache_size: Option<ByteSizeValue>,
    worker_threads: Option<usize>,
    candidate_channel_capacity: Option<usize>,
    cover_target: Option<usize>,
    queued_timeout_secs: Option<u64>,
    processing_timeout_secs: Option<u64>,
    equal_area: Option<bool>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
enum ByteSizeValue {
    Bytes(u64),
    Text(String),
}

/// CLI configuration overrides
#[derive(Debug, Default)]
pub struct CliConfigOverrides {
    pub cache_size: Option<u64>,
    pub worker_threads: Option<usize>,
    pub cover_target: Option<usize>,
    pub equal_area: Option<bool>,
}

fn env_usize(name: &str) -> Option<usize> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse::<usize>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            tracing::warn!("Invalid {} value '{}': expected a positive integer", name, raw);
            None
        }
    }
}

fn validate_positive(key: &str, n: usize) -> Result<usize> {
    if n == 0 {
        return Err(OverlayError::ConfigInvalid {
            key: key.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(n)
}

/// Parse a byte size such as `1048576`, `512KB`, `64MB` or `2 GiB`.
///
/// Suffixes are binary multiples (1KB = 1024 bytes).
pub fn parse_byte_size(s: &str) -> Result<u64> {
    let trimmed = s.trim();
    let split = trimmed.find(|c: char| !c.is_ascii_digit()).unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(split);

    let invalid = || OverlayError::ConfigInvalid {
        key: "cache_size".to_string(),
        reason: format!("Invalid byte size: {}. Use e.g. 1048576, 512KB, 64MB or 1GB", s),
    };

    let n: u64 = digits.parse().map_err(|_| invalid())?;
    let multiplier: u64 = match suffix.trim().to_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1024,
        "m" | "mb" | "mib" => 1024 * 1024,
        "g" | "gb" | "gib" => 1024 * 1024 * 1024,
        _ => return Err(invalid()),
    };

    n.checked_mul(multiplier).ok_or_else(invalid)
}

/// Format a byte count the way `parse_byte_size` reads it back
pub fn format_byte_size(bytes: u64) -> String {
    const MB: u64 = 1024 * 1024;
    const KB: u64 = 1024;
    if bytes >= MB && bytes % MB == 0 {
        format!("{}MB", bytes / MB)
    } else if bytes >= KB && bytes % KB == 0 {
        format!("{}KB", bytes / KB)
    } else {
        format!("{}B", bytes)
    }
}

/// Parse a boolean flag from string
pub fn parse_bool(s: &str) -> Result<bool> {
    match s.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(OverlayError::ConfigInvalid {
            key: "equal_area".to_string(),
            reason: format!("Invalid boolean: {}. Use true or false", s),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = LayeredConfig::with_defaults();
        assert_eq!(config.cache_size.value, 64 * 1024 * 1024);
        assert_eq!(config.cache_size.source, ConfigSource::Default);
        assert!(config.worker_threads.value >= 1);
        assert!(!config.equal_area.value);
    }

    #[test]
    fn test_config_precedence() {
        let mut value = ConfigValue::new(100, ConfigSource::Default);

        value.update(200, ConfigSource::File);
        assert_eq!(value.value, 200);
        assert_eq!(value.source, ConfigSource::File);

        value.update(300, ConfigSource::Environment);
        assert_eq!(value.value, 300);

        value.update(400, ConfigSource::Cli);
        assert_eq!(value.value, 400);
        assert_eq!(value.source, ConfigSource::Cli);

        // Lower precedence should not override
        value.update(500, ConfigSource::File);
        assert_eq!(value.value, 400);
        assert_eq!(value.source, ConfigSource::Cli);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
cache_size = "16MB"
worker_threads = 3
cover_target = 32
processing_timeout_secs = 90
equal_area = true
"#
        )
        .unwrap();

        let config = LayeredConfig::with_defaults().load_from_file(file.path()).unwrap();

        assert_eq!(config.cache_size.value, 16 * 1024 * 1024);
        assert_eq!(config.cache_size.source, ConfigSource::File);
        assert_eq!(config.worker_threads.value, 3);
        assert_eq!(config.cover_target.value, 32);
        assert_eq!(config.processing_timeout_secs.value, 90);
        assert!(config.equal_area.value);
        assert_eq!(config.queued_timeout_secs.source, ConfigSource::Default);
    }

    #[test]
    fn test_load_from_file_accepts_integer_cache_size() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "cache_size = 4096").unwrap();

        let config = LayeredConfig::with_defaults().load_from_file(file.path()).unwrap();
        assert_eq!(config.cache_size.value, 4096);
    }

    #[test]
    fn test_load_from_file_rejects_zero_workers() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "worker_threads = 0").unwrap();

        let err = LayeredConfig::with_defaults().load_from_file(file.path()).unwrap_err();
        assert!(matches!(err, OverlayError::ConfigInvalid { ref key, .. } if key == "worker_threads"));
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = LayeredConfig::with_defaults();

        config.update_from_cli(CliConfigOverrides {
            cache_size: Some(1024),
            worker_threads: Some(2),
            ..Default::default()
        });

        assert_eq!(config.cache_size.value, 1024);
        assert_eq!(config.cache_size.source, ConfigSource::Cli);
        assert_eq!(config.worker_threads.value, 2);
        assert_eq!(config.cover_target.source, ConfigSource::Default);
    }

    #[test]
    fn test_parse_byte_size() {
        assert_eq!(parse_byte_size("1048576").unwrap(), 1048576);
        assert_eq!(parse_byte_size("64MB").unwrap(), 64 * 1024 * 1024);
        assert_eq!(parse_byte_size("512kb").unwrap(), 512 * 1024);
        assert_eq!(parse_byte_size("2 GiB").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_byte_size("lots").is_err());
        assert!(parse_byte_size("12TB").is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("TRUE").unwrap());
        assert!(!parse_bool("0").unwrap());
        assert!(parse_bool("maybe").is_err());
    }

    #[test]
    fn test_inspection_map() {
        let config = LayeredConfig::with_defaults();
        let map = config.to_inspection_map();

        assert!(map.contains_key("worker_threads"));
        assert!(map.contains_key("equal_area"));

        let (size, source) = &map["cache_size"];
        assert_eq!(size, "64MB");
        assert_eq!(*source, ConfigSource::Default);
    }

    proptest::proptest! {
        #[test]
        fn prop_megabytes_scale_by_1024(n in 0u64..1_000_000) {
            proptest::prop_assert_eq!(parse_byte_size(&format!("{}MB", n)).unwrap(), n * 1024 * 1024);
            proptest::prop_assert_eq!(parse_byte_size(&format!("{} kb", n)).unwrap(), n * 1024);
        }
    }
}
