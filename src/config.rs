use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default garbage-collection period in seconds.
pub const DEFAULT_GC_PERIOD_SECONDS: u64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path of the lease journal.
    pub lease_file: String,
    /// Lease duration as a human-readable string, e.g. `"60s"` or `"12h"`.
    pub lease_time: String,
    /// First address of the allocatable window (inclusive).
    pub range_start: Ipv4Addr,
    /// Last address of the allocatable window (inclusive).
    pub range_end: Ipv4Addr,
    /// How often the expiry sweep runs.
    #[serde(default = "default_gc_period")]
    pub gc_period_seconds: u64,
}

fn default_gc_period() -> u64 {
    DEFAULT_GC_PERIOD_SECONDS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lease_file: "leases.txt".to_string(),
            lease_time: "24h".to_string(),
            range_start: Ipv4Addr::new(192, 168, 1, 100),
            range_end: Ipv4Addr::new(192, 168, 1, 200),
            gc_period_seconds: DEFAULT_GC_PERIOD_SECONDS,
        }
    }
}

impl Config {
    pub async fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path).await?;
            Ok(config)
        }
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.lease_file.is_empty() {
            return Err(Error::InvalidConfig(
                "lease_file cannot be empty".to_string(),
            ));
        }

        let start = u32::from(self.range_start);
        let end = u32::from(self.range_end);
        if start >= end {
            return Err(Error::InvalidConfig(
                "range_start must be lower than range_end".to_string(),
            ));
        }

        let lease_time = parse_duration(&self.lease_time)?;
        if lease_time.is_zero() {
            return Err(Error::InvalidConfig(
                "lease_time must be greater than 0".to_string(),
            ));
        }

        if self.gc_period_seconds == 0 {
            return Err(Error::InvalidConfig(
                "gc_period_seconds must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// The configured lease duration.
    ///
    /// An unparseable string fails with the same error
    /// [`Config::validate`] reports.
    pub fn lease_time(&self) -> Result<Duration> {
        parse_duration(&self.lease_time)
    }

    pub fn gc_period(&self) -> Duration {
        Duration::from_secs(self.gc_period_seconds)
    }

    pub fn range_size(&self) -> u32 {
        u32::from(self.range_end) - u32::from(self.range_start) + 1
    }
}

/// Parses a duration string: raw seconds (`"1800"`) or a number with an
/// `s`, `m`, or `h` suffix (`"30s"`, `"15m"`, `"12h"`).
pub fn parse_duration(text: &str) -> Result<Duration> {
    let text = text.trim();

    let (number, multiplier) = match text.strip_suffix(['s', 'm', 'h']) {
        Some(number) => {
            let multiplier = match text.as_bytes()[text.len() - 1] {
                b's' => 1,
                b'm' => 60,
                _ => 3600,
            };
            (number, multiplier)
        }
        None => (text, 1),
    };

    let value: u64 = number
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("invalid duration: {text}")))?;

    Ok(Duration::from_secs(value * multiplier))
}
