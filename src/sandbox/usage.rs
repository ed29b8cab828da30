use std::fs;
use std::time::Duration;

use serde::Serialize;

/// CPU time and peak memory consumed by one process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceUsage {
    #[serde(rename = "cpu_time_ms", serialize_with = "serialize_millis")]
    pub cpu_time: Duration,
    pub peak_memory_bytes: u64,
}

impl ResourceUsage {
    pub fn cpu_time_ms(&self) -> u64 {
        self.cpu_time.as_millis() as u64
    }

    /// Keeps the larger of each measurement
    pub fn merge(self, other: ResourceUsage) -> ResourceUsage {
        ResourceUsage {
            cpu_time: self.cpu_time.max(other.cpu_time),
            peak_memory_bytes: self.peak_memory_bytes.max(other.peak_memory_bytes),
        }
    }
}

pub(crate) fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl From<libc::rusage> for ResourceUsage {
    fn from(rusage: libc::rusage) -> Self {
        let user = Duration::new(
            rusage.ru_utime.tv_sec as u64,
            rusage.ru_utime.tv_usec as u32 * 1000,
        );
        let system = Duration::new(
            rusage.ru_stime.tv_sec as u64,
            rusage.ru_stime.tv_usec as u32 * 1000,
        );
        Self {
            cpu_time: user + system,
            // ru_maxrss is reported in KB on Linux
            peak_memory_bytes: (rusage.ru_maxrss.max(0) as u64) * 1024,
        }
    }
}

/// Samples a live process through procfs
///
/// Returns `None` once the process is gone or procfs is unavailable.
pub fn sample(pid: u32) -> Option<ResourceUsage> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let cpu_time = parse_stat_cpu_time(&stat, clock_ticks_per_second())?;
    let peak_memory_bytes = fs::read_to_string(format!("/proc/{pid}/status"))
        .ok()
        .and_then(|status| parse_status_memory(&status))
        .unwrap_or(0);

    Some(ResourceUsage {
        cpu_time,
        peak_memory_bytes,
    })
}

fn clock_ticks_per_second() -> u64 {
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 { ticks as u64 } else { 100 }
}

/// Extracts `utime + stime` from the content of `/proc/<pid>/stat`
fn parse_stat_cpu_time(stat: &str, ticks_per_second: u64) -> Option<Duration> {
    // comm may contain spaces and parentheses, fields restart after the last ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is the state (field 3), utime and stime are fields 14 and 15
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let ticks = utime + stime;
    Some(Duration::from_micros(ticks * 1_000_000 / ticks_per_second))
}

/// Reads the peak resident set size from `/proc/<pid>/status`, in bytes
fn parse_status_memory(status: &str) -> Option<u64> {
    let field = |name: &str| {
        status
            .lines()
            .find(|line| line.starts_with(name))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|kb| kb.parse::<u64>().ok())
    };
    field("VmHWM:").or_else(|| field("VmRSS:")).map(|kb| kb * 1024)
}
