//! CPU guard - Force-stops every container when the host runs hot

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use super::lifecycle::VpsManager;
use super::monitor::CpuSampler;
use super::settings::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Active,
    Disabled,
}

impl GuardState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::Disabled => "Disabled",
        }
    }
}

/// Shared switch and parameters of a running guard. The state lives only in
/// memory and resets to the configured value on restart.
#[derive(Debug, Clone)]
pub struct GuardHandle {
    enabled: Arc<AtomicBool>,
    threshold_percent: f32,
    check_interval: Duration,
}

impl GuardHandle {
    pub fn new(enabled: bool, threshold_percent: f32, check_interval: Duration) -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(enabled)),
            threshold_percent,
            check_interval,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.cpu_guard_enabled,
            settings.cpu_threshold_percent,
            Duration::from_secs(settings.cpu_check_interval_secs),
        )
    }

    pub fn state(&self) -> GuardState {
        if self.enabled.load(Ordering::SeqCst) {
            GuardState::Active
        } else {
            GuardState::Disabled
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
        info!("CPU guard enabled");
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        info!("CPU guard disabled");
    }

    pub fn threshold_percent(&self) -> f32 {
        self.threshold_percent
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }
}

/// What one guard iteration did
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Guard disabled, nothing sampled
    Skipped,
    Normal(f32),
    Tripped { usage: f32, stopped: usize },
    SampleFailed,
    StopFailed { usage: f32 },
}

/// Periodic overload check. Failures are logged and the next iteration runs
/// after the usual interval; nothing here changes the guard's state.
pub struct CpuGuard {
    manager: Arc<VpsManager>,
    sampler: Box<dyn CpuSampler>,
    handle: GuardHandle,
}

impl CpuGuard {
    pub fn new(manager: Arc<VpsManager>, sampler: Box<dyn CpuSampler>, handle: GuardHandle) -> Self {
        Self {
            manager,
            sampler,
            handle,
        }
    }

    pub fn handle(&self) -> &GuardHandle {
        &self.handle
    }

    pub async fn tick(&mut self) -> TickOutcome {
        if self.handle.state() == GuardState::Disabled {
            return TickOutcome::Skipped;
        }

        let usage = match self.sampler.sample_cpu_percent() {
            Ok(usage) => usage,
            Err(e) => {
                error!("Error sampling CPU usage: {:#}", e);
                return TickOutcome::SampleFailed;
            }
        };
        info!("Current CPU usage: {:.1}%", usage);

        if usage <= self.handle.threshold_percent {
            return TickOutcome::Normal(usage);
        }

        warn!(
            "CPU usage ({:.1}%) exceeded threshold ({:.1}%), stopping all containers",
            usage, self.handle.threshold_percent
        );
        match self.manager.emergency_stop_all().await {
            Ok(stopped) => TickOutcome::Tripped { usage, stopped },
            Err(e) => {
                error!("Emergency stop failed: {}", e);
                TickOutcome::StopFailed { usage }
            }
        }
    }

    /// Run until `shutdown` fires
    pub async fn run(mut self, mut shutdown: watch::Receiver<()>) {
        info!(
            "CPU guard started ({}, threshold {:.0}%, every {}s)",
            self.handle.state().label(),
            self.handle.threshold_percent,
            self.handle.check_interval.as_secs()
        );
        let mut ticker = interval(self.handle.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    info!("CPU guard shutting down");
                    break;
                }
            }
        }
    }
}
