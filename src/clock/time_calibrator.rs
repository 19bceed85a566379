use std::sync::{Arc, Mutex, RwLock, Weak};

use anyhow::anyhow;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use serde::Deserialize;
use tokio::task::AbortHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::clock::{CalibrationConfig, Clock};


/// The server's side of a time probe: when it received the request (`t2`) and when it sent
///  the response (`t3`), both in server clock millis.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Deserialize)]
pub struct ServerTimestamps {
    pub t2: i64,
    pub t3: i64,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait TimeSyncSource: Send + Sync + 'static {
    async fn fetch_server_time(&self) -> anyhow::Result<ServerTimestamps>;
}


#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ClockOffset {
    /// server time - local time
    pub offset_millis: i64,
    /// local time of the sample
    pub last_sync_millis: i64,
}

impl ClockOffset {
    /// `t1` and `t4` are local send and receive times of the probe. Fails if the timestamps are
    ///  so far apart that the offset, or calibrated time at the moment of the sample, does not
    ///  fit into an `i64`.
    pub fn from_probe(t1: i64, server: ServerTimestamps, t4: i64) -> anyhow::Result<ClockOffset> {
        let out_of_range = || anyhow!("time probe out of range: t1={}, {:?}, t4={}", t1, server, t4);

        let rtt = t4.checked_sub(t1).ok_or_else(out_of_range)?;
        let processing_time = server.t3.checked_sub(server.t2).ok_or_else(out_of_range)?;
        let one_way_delay = (rtt.checked_sub(processing_time).ok_or_else(out_of_range)? / 2).max(0);

        let offset_millis = server.t2.checked_sub(t1)
            .and_then(|d| d.checked_add(one_way_delay))
            .ok_or_else(out_of_range)?;
        t4.checked_add(offset_millis).ok_or_else(out_of_range)?;

        Ok(ClockOffset {
            offset_millis,
            last_sync_millis: t4,
        })
    }
}


/// Estimates the offset between local and server clock by round trip probing, and provides
///  calibrated timestamps for outgoing messages.
///
/// Calibration is best effort: a failed probe leaves the previous sample in place, and a sample
///  that is older than the staleness window is ignored in favor of raw local time.
pub struct TimeCalibrator {
    config: CalibrationConfig,
    local: Arc<dyn Clock>,
    source: Arc<dyn TimeSyncSource>,
    offset: RwLock<Option<ClockOffset>>,
    auto_sync: Mutex<Option<AbortHandle>>,
}

impl TimeCalibrator {
    pub fn new(config: CalibrationConfig, local: Arc<dyn Clock>, source: Arc<dyn TimeSyncSource>) -> TimeCalibrator {
        TimeCalibrator {
            config,
            local,
            source,
            offset: RwLock::new(None),
            auto_sync: Mutex::new(None),
        }
    }

    /// creates a calibrator with periodic synchronization running
    pub fn spawn(config: CalibrationConfig, local: Arc<dyn Clock>, source: Arc<dyn TimeSyncSource>) -> Arc<TimeCalibrator> {
        let calibrator = Arc::new(TimeCalibrator::new(config, local, source));
        calibrator.start_auto_sync();
        calibrator
    }

    pub async fn sync_time(&self) -> anyhow::Result<ClockOffset> {
        let t1 = self.local.now_millis();
        let server = self.source.fetch_server_time().await?;
        let t4 = self.local.now_millis();

        let offset = ClockOffset::from_probe(t1, server, t4)?;
        debug!("time sync: rtt {} ms, server {:?} -> offset {} ms", t4.saturating_sub(t1), server, offset.offset_millis);

        *self.offset.write().unwrap_or_else(|e| e.into_inner()) = Some(offset);
        Ok(offset)
    }

    pub fn offset(&self) -> Option<ClockOffset> {
        *self.offset.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Starts periodic synchronization. The first probe happens one interval after the start,
    ///  callers that need calibrated time right away call [TimeCalibrator::sync_time] themselves.
    pub fn start_auto_sync(self: &Arc<Self>) {
        let mut auto_sync = self.auto_sync.lock().unwrap_or_else(|e| e.into_inner());
        if auto_sync.is_some() {
            return;
        }

        let interval = self.config.sync_interval;
        let calibrator: Weak<TimeCalibrator> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + interval, interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                let Some(calibrator) = calibrator.upgrade() else {
                    return;
                };
                if let Err(e) = calibrator.sync_time().await {
                    warn!("time sync failed, keeping previous calibration: {}", e);
                }
            }
        });
        *auto_sync = Some(handle.abort_handle());
        info!("started time calibration every {:?}", interval);
    }

    pub fn stop_auto_sync(&self) {
        if let Some(handle) = self.auto_sync.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
            debug!("stopped time calibration");
        }
    }
}

impl Clock for TimeCalibrator {
    fn now_millis(&self) -> i64 {
        let local_now = self.local.now_millis();
        match self.offset() {
            Some(offset) if local_now.saturating_sub(offset.last_sync_millis) <= self.config.staleness_window.as_millis() as i64 =>
                local_now.saturating_add(offset.offset_millis),
            _ => local_now,
        }
    }
}

impl Drop for TimeCalibrator {
    fn drop(&mut self) {
        self.stop_auto_sync();
    }
}
