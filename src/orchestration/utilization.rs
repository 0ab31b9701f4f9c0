//! Host utilization sampling for the worker pool's admission monitor.

use std::collections::VecDeque;

/// Something that reports load as a percentage in `0.0..=100.0`.
pub trait UtilizationSource: Send {
    fn sample(&mut self) -> f32;
}

/// Average CPU usage across all cores, via sysinfo.
///
/// The first sample after construction reads as 0 on most platforms, since
/// usage is measured between two refreshes.
pub struct SystemCpu {
    system: sysinfo::System,
}

impl SystemCpu {
    pub fn new() -> Self {
        let mut system = sysinfo::System::new();
        system.refresh_cpu();
        Self { system }
    }
}

impl Default for SystemCpu {
    fn default() -> Self {
        Self::new()
    }
}

impl UtilizationSource for SystemCpu {
    fn sample(&mut self) -> f32 {
        self.system.refresh_cpu();
        let cpus = self.system.cpus();
        if cpus.is_empty() {
            return 0.0;
        }
        let total: f32 = cpus.iter().map(|c| c.cpu_usage()).sum();
        (total / cpus.len() as f32).clamp(0.0, 100.0)
    }
}

/// Always reports the same value.
#[derive(Debug, Clone, Copy)]
pub struct FixedUtilization(pub f32);

impl UtilizationSource for FixedUtilization {
    fn sample(&mut self) -> f32 {
        self.0
    }
}

/// Replays a list of samples, then repeats the last one.
#[derive(Debug, Clone)]
pub struct ScriptedUtilization {
    samples: VecDeque<f32>,
    last: f32,
}

impl ScriptedUtilization {
    pub fn new(samples: impl IntoIterator<Item = f32>) -> Self {
        Self {
            samples: samples.into_iter().collect(),
            last: 0.0,
        }
    }
}

impl UtilizationSource for ScriptedUtilization {
    fn sample(&mut self) -> f32 {
        if let Some(next) = self.samples.pop_front() {
            self.last = next;
        }
        self.last
    }
}
