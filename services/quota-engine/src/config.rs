use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Weekday;

use crate::audit::AuditSinkKind;

#[derive(Debug, Clone)]
pub struct QuotaEngineConfig {
    pub data_dir: PathBuf,
    pub lock_timeout_ms: u64,
    pub busy_timeout_ms: u64,
    pub plan_cache_ttl_secs: u64,
    pub rollover_interval_secs: u64,
    pub enable_carry_over_job: bool,
    pub week_start: Weekday,
    pub audit_sink: AuditSinkKind,
    pub log_level: String,
}

impl Default for QuotaEngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/quota"),
            lock_timeout_ms: 5_000,
            busy_timeout_ms: 5_000,
            plan_cache_ttl_secs: 30,
            rollover_interval_secs: 3_600,
            enable_carry_over_job: true,
            week_start: Weekday::Sun,
            audit_sink: AuditSinkKind::Database,
            log_level: "info".to_string(),
        }
    }
}

impl QuotaEngineConfig {
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Ok(dir) = env::var("QUOTA_DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        if let Ok(timeout) = env::var("QUOTA_LOCK_TIMEOUT_MS") {
            cfg.lock_timeout_ms = timeout
                .parse()
                .context("QUOTA_LOCK_TIMEOUT_MS must be a positive integer")?;
        }
        if let Ok(timeout) = env::var("QUOTA_BUSY_TIMEOUT_MS") {
            cfg.busy_timeout_ms = timeout
                .parse()
                .context("QUOTA_BUSY_TIMEOUT_MS must be a non-negative integer")?;
        }
        if let Ok(ttl) = env::var("PLAN_CACHE_TTL_SECS") {
            cfg.plan_cache_ttl_secs = ttl
                .parse()
                .context("PLAN_CACHE_TTL_SECS must be a non-negative integer")?;
        }
        if let Ok(interval) = env::var("ROLLOVER_INTERVAL_SECS") {
            cfg.rollover_interval_secs = interval
                .parse()
                .context("ROLLOVER_INTERVAL_SECS must be a positive integer")?;
        }
        if let Ok(flag) = env::var("ENABLE_CARRY_OVER_JOB") {
            cfg.enable_carry_over_job = parse_bool(&flag)
                .with_context(|| format!("ENABLE_CARRY_OVER_JOB is invalid: {flag}"))?;
        }
        if let Ok(day) = env::var("WEEK_START") {
            cfg.week_start = parse_weekday(&day)
                .with_context(|| format!("WEEK_START is invalid: {day}"))?;
        }
        if let Ok(sink) = env::var("AUDIT_SINK") {
            cfg.audit_sink = sink
                .parse()
                .map_err(anyhow::Error::msg)
                .context("AUDIT_SINK must be `database` or `log`")?;
        }
        if let Ok(level) = env::var("LOG_LEVEL") {
            cfg.log_level = level;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        ensure_directory(&self.data_dir)?;

        if self.lock_timeout_ms == 0 {
            anyhow::bail!("QUOTA_LOCK_TIMEOUT_MS must be greater than zero");
        }
        if self.rollover_interval_secs == 0 {
            anyhow::bail!("ROLLOVER_INTERVAL_SECS must be greater than zero");
        }

        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn plan_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.plan_cache_ttl_secs)
    }

    pub fn rollover_interval(&self) -> Duration {
        Duration::from_secs(self.rollover_interval_secs)
    }
}

fn ensure_directory(path: &Path) -> Result<()> {
    if path.exists() {
        if !path.is_dir() {
            anyhow::bail!("{} exists but is not a directory", path.display());
        }
    } else {
        fs::create_dir_all(path)
            .with_context(|| format!("unable to create data directory {}", path.display()))?;
    }
    Ok(())
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => anyhow::bail!("invalid boolean value {value}"),
    }
}

fn parse_weekday(value: &str) -> Result<Weekday> {
    value
        .trim()
        .parse::<Weekday>()
        .map_err(|_| anyhow::anyhow!("invalid weekday {value}"))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_parse_bool_variants() {
        assert!(parse_bool("YES").unwrap());
        assert!(!parse_bool("0").unwrap());
        assert!(parse_bool("maybe").is_err());
    }

    #[test]
    fn test_parse_weekday() {
        assert_eq!(parse_weekday("monday").unwrap(), Weekday::Mon);
        assert_eq!(parse_weekday("Sun").unwrap(), Weekday::Sun);
        assert!(parse_weekday("someday").is_err());
    }

    #[test]
    fn test_validate_creates_data_dir() {
        let dir = tempdir().unwrap();
        let cfg = QuotaEngineConfig {
            data_dir: dir.path().join("nested/quota"),
            ..QuotaEngineConfig::default()
        };
        cfg.validate().unwrap();
        assert!(cfg.data_dir.is_dir());
    }

    #[test]
    fn test_validate_rejects_zero_lock_timeout() {
        let dir = tempdir().unwrap();
        let cfg = QuotaEngineConfig {
            data_dir: dir.path().to_path_buf(),
            lock_timeout_ms: 0,
            ..QuotaEngineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_durations() {
        let cfg = QuotaEngineConfig::default();
        assert_eq!(cfg.lock_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.plan_cache_ttl(), Duration::from_secs(30));
        assert_eq!(cfg.rollover_interval(), Duration::from_secs(3_600));
    }
}
