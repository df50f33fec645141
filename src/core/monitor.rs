//! Host CPU sampling for the overload guard

use anyhow::{anyhow, Result};
use sysinfo::{CpuRefreshKind, System};
use tracing::trace;

/// Source of host-wide CPU usage readings
pub trait CpuSampler: Send {
    /// Current host CPU usage in percent (0-100)
    fn sample_cpu_percent(&mut self) -> Result<f32>;
}

/// Sampler backed by `sysinfo`.
///
/// Usage is computed between two refreshes, so the first reading after
/// construction can be 0.
pub struct SystemCpuSampler {
    system: System,
}

impl SystemCpuSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_specifics(CpuRefreshKind::everything());
        Self { system }
    }
}

impl Default for SystemCpuSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuSampler for SystemCpuSampler {
    fn sample_cpu_percent(&mut self) -> Result<f32> {
        self.system
            .refresh_cpu_specifics(CpuRefreshKind::everything());
        if self.system.cpus().is_empty() {
            return Err(anyhow!("no CPUs reported by the host"));
        }
        let usage = self.system.global_cpu_usage();
        if !usage.is_finite() {
            return Err(anyhow!("CPU usage reading is not a number"));
        }
        trace!("Host CPU usage: {:.1}%", usage);
        Ok(usage.clamp(0.0, 100.0))
    }
}

#[cfg(test)]
pub mod testing {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Replays scripted readings; `None` entries fail the sample.
    /// Once the script runs out every sample reads 0%.
    #[derive(Clone, Default)]
    pub struct ScriptedSampler {
        readings: Arc<Mutex<VecDeque<Option<f32>>>>,
        samples_taken: Arc<Mutex<usize>>,
    }

    impl ScriptedSampler {
        pub fn new(readings: impl IntoIterator<Item = Option<f32>>) -> Self {
            Self {
                readings: Arc::new(Mutex::new(readings.into_iter().collect())),
                samples_taken: Arc::new(Mutex::new(0)),
            }
        }

        pub fn samples_taken(&self) -> usize {
            *self.samples_taken.lock().unwrap()
        }
    }

    impl CpuSampler for ScriptedSampler {
        fn sample_cpu_percent(&mut self) -> Result<f32> {
            *self.samples_taken.lock().unwrap() += 1;
            match self.readings.lock().unwrap().pop_front() {
                Some(Some(usage)) => Ok(usage),
                Some(None) => Err(anyhow!("scripted sampling failure")),
                None => Ok(0.0),
            }
        }
    }
}
