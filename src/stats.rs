use std::collections::HashMap;
use std::time::Instant;

use procfs::process::Process;

/// Resident memory in bytes of `pid`, or of the calling process when `None`.
pub fn resident_memory(pid: Option<u32>) -> Option<u64> {
    let process = match pid {
        Some(pid) => Process::new(pid as i32).ok()?,
        None => Process::myself().ok()?,
    };
    let stat = process.stat().ok()?;
    Some(stat.rss * procfs::page_size())
}

/// CPU usage source consulted by the supervisor on every ping.
pub trait UsageSampler: Send {
    /// CPU usage of `pid` in percent of one core since the previous sample.
    fn cpu_percent(&mut self, pid: u32) -> Option<f64>;

    /// Drop any state kept for `pid`.
    fn forget(&mut self, _pid: u32) {}
}

#[derive(Debug, Clone, Copy)]
struct CpuSample {
    ticks: u64,
    at: Instant,
}

/// Samples `/proc/<pid>/stat` and reports the delta between consecutive calls.
#[derive(Debug)]
pub struct ProcfsSampler {
    ticks_per_second: u64,
    samples: HashMap<u32, CpuSample>,
}

impl Default for ProcfsSampler {
    fn default() -> Self {
        Self {
            ticks_per_second: procfs::ticks_per_second(),
            samples: HashMap::new(),
        }
    }
}

impl ProcfsSampler {
    fn cpu_ticks(pid: u32) -> Option<u64> {
        let stat = Process::new(pid as i32).ok()?.stat().ok()?;
        Some(stat.utime + stat.stime)
    }
}

/// Percent of one core used between two samples.
fn percent_between(previous: CpuSample, current: CpuSample, ticks_per_second: u64) -> Option<f64> {
    let elapsed = current.at.checked_duration_since(previous.at)?.as_secs_f64();
    if elapsed <= 0.0 || ticks_per_second == 0 {
        return None;
    }
    let used = current.ticks.saturating_sub(previous.ticks) as f64 / ticks_per_second as f64;
    Some((used / elapsed * 1000.0).round() / 10.0)
}

impl UsageSampler for ProcfsSampler {
    fn cpu_percent(&mut self, pid: u32) -> Option<f64> {
        let current = CpuSample {
            ticks: Self::cpu_ticks(pid)?,
            at: Instant::now(),
        };
        let previous = self.samples.insert(pid, current)?;
        percent_between(previous, current, self.ticks_per_second)
    }

    fn forget(&mut self, pid: u32) {
        self.samples.remove(&pid);
    }
}
