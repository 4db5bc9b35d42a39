//! Process resource sampling for the system pseudo-tenant.

use std::sync::Mutex;

use sysinfo::{Pid, System};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("resource sampling is not supported on this platform")]
    Unsupported,

    #[error("process {0} not visible to the system sampler")]
    ProcessNotFound(Pid),
}

/// One reading. Fields that could not be determined are `None` and must be
/// left out of the usage counters rather than reported as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceSample {
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub memory_rss_bytes: Option<u64>,
}

pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> Result<ResourceSample, ResourceError>;
}

struct SamplerState {
    system: System,
    /// CPU usage is a rate; the first refresh only sets the baseline.
    primed: bool,
}

/// Samples this process through `sysinfo`.
///
/// CPU is reported as a share of the whole machine, so the first sample after
/// start has no CPU value.
pub struct SysinfoSampler {
    state: Mutex<SamplerState>,
    pid: Option<Pid>,
    cpus: f64,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::warn!(error = %e, "Current pid unavailable, resource sampling disabled");
                None
            }
        };
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get() as f64)
            .unwrap_or(1.0);

        Self {
            state: Mutex::new(SamplerState {
                system: System::new(),
                primed: false,
            }),
            pid,
            cpus,
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SysinfoSampler {
    fn sample(&self) -> Result<ResourceSample, ResourceError> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(ResourceError::Unsupported);
        }
        let pid = self.pid.ok_or(ResourceError::Unsupported)?;

        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        state.system.refresh_memory();
        if !state.system.refresh_process(pid) {
            return Err(ResourceError::ProcessNotFound(pid));
        }

        let (rss, raw_cpu) = {
            let process = state
                .system
                .process(pid)
                .ok_or(ResourceError::ProcessNotFound(pid))?;
            (process.memory(), process.cpu_usage())
        };
        let total_memory = state.system.total_memory();

        let cpu_percent = state.primed.then(|| machine_cpu_percent(raw_cpu, self.cpus));
        state.primed = true;

        Ok(ResourceSample {
            cpu_percent,
            memory_percent: percent_of(rss, total_memory),
            memory_rss_bytes: (rss > 0).then_some(rss),
        })
    }
}

/// `sysinfo` reports 100% per core; scale to the whole machine.
fn machine_cpu_percent(raw: f32, cpus: f64) -> f64 {
    (raw as f64 / cpus.max(1.0)).clamp(0.0, 100.0)
}

fn percent_of(part: u64, whole: u64) -> Option<f64> {
    if whole == 0 {
        return None;
    }
    Some((part as f64 / whole as f64 * 100.0).clamp(0.0, 100.0))
}
