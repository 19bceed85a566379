pub mod time_calibrator;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::bail;


/// A source of wall clock time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync + 'static {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock {}

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0) // system clock before 1970
    }
}


#[derive(Debug, Clone)]
pub struct CalibrationConfig {
    pub sync_interval: Duration,
    /// a calibration sample older than this is not trusted, and raw local time is used instead
    pub staleness_window: Duration,
}

impl CalibrationConfig {
    pub fn new() -> CalibrationConfig {
        CalibrationConfig {
            sync_interval: Duration::from_secs(60),
            staleness_window: Duration::from_secs(120),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sync_interval.is_zero() {
            bail!("sync interval must be positive");
        }
        if self.staleness_window < self.sync_interval {
            bail!("staleness window {:?} is shorter than the sync interval {:?}: calibration would expire between syncs", self.staleness_window, self.sync_interval);
        }
        Ok(())
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        CalibrationConfig::new()
    }
}
