//! Metric sampling for the agent
//!
//! A [`Collector`] owns a list of [`MetricSource`]s and turns one poll into one
//! batch. Sources read Linux procfs: the agent's own process from
//! `/proc/self/{status,stat}`, host memory from `/proc/meminfo` and per-core
//! CPU time from `/proc/stat`. A failing source is reported next to the batch
//! instead of failing the poll.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;
use vigil_common::{Batch, Metric, POLL_COUNT_METRIC, RANDOM_VALUE_METRIC};

use crate::error::CollectError;

const KIB: f64 = 1024.0;

/// One producer of gauges
pub trait MetricSource: Send {
    fn name(&self) -> &'static str;

    /// Append this source's records to `batch`
    fn collect(&mut self, batch: &mut Batch) -> Result<(), CollectError>;
}

/// Outcome of one poll: the batch plus every source that failed
#[derive(Debug)]
pub struct PollResult {
    pub batch: Batch,
    pub errors: Vec<CollectError>,
}

/// Running poll total, readable while the collector keeps polling
#[derive(Debug, Clone, Default)]
pub struct PollCounter(Arc<AtomicU64>);

impl PollCounter {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    fn increment(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct Collector {
    sources: Vec<Box<dyn MetricSource>>,
    poll_count: PollCounter,
}

impl Collector {
    /// Collector over the procfs sources mounted at `/proc`
    pub fn new() -> Self {
        Self::with_sources(procfs_sources("/proc"))
    }

    pub fn with_sources(sources: Vec<Box<dyn MetricSource>>) -> Self {
        Self {
            sources,
            poll_count: PollCounter::default(),
        }
    }

    /// Number of completed polls
    pub fn poll_count(&self) -> u64 {
        self.poll_count.get()
    }

    pub fn poll_counter(&self) -> PollCounter {
        self.poll_count.clone()
    }

    /// Sample every source once.
    ///
    /// `RandomValue` and `PollCount` are always present; `PollCount` carries
    /// the increment for this poll so the server-side sum equals the total.
    pub fn poll(&mut self) -> PollResult {
        let mut batch = Batch::new();
        let mut errors = Vec::new();

        for source in &mut self.sources {
            if let Err(e) = source.collect(&mut batch) {
                debug!("Source {} failed: {}", source.name(), e);
                errors.push(e);
            }
        }

        batch.push(Metric::gauge(RANDOM_VALUE_METRIC, rand::random::<f64>()));
        batch.push(Metric::counter(POLL_COUNT_METRIC, 1));
        self.poll_count.increment();

        PollResult { batch, errors }
    }
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

/// Every procfs source rooted at `root`
pub fn procfs_sources(root: impl AsRef<Path>) -> Vec<Box<dyn MetricSource>> {
    let root = root.as_ref();
    vec![
        Box::new(ProcessStatusSource::new(root)),
        Box::new(ProcessStatSource::new(root)),
        Box::new(MemInfoSource::new(root)),
        Box::new(CpuUtilizationSource::new(root)),
    ]
}

fn read(path: &Path) -> Result<String, CollectError> {
    fs::read_to_string(path).map_err(|source| CollectError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// `Key:   value [kB]` lines, as in `/proc/self/status` and `/proc/meminfo`
fn parse_key_values(contents: &str) -> HashMap<&str, f64> {
    contents
        .lines()
        .filter_map(|line| {
            let (key, rest) = line.split_once(':')?;
            let mut parts = rest.split_whitespace();
            let value: f64 = parts.next()?.parse().ok()?;
            let scale = if parts.next() == Some("kB") { KIB } else { 1.0 };
            Some((key.trim(), value * scale))
        })
        .collect()
}

fn push_known(
    batch: &mut Batch,
    values: &HashMap<&str, f64>,
    fields: &[(&str, &str)],
    file: &'static str,
) -> Result<(), CollectError> {
    let before = batch.len();
    for (key, metric) in fields {
        if let Some(value) = values.get(key) {
            batch.push(Metric::gauge(*metric, *value));
        }
    }
    if batch.len() == before {
        return Err(CollectError::parse(file, "no known fields"));
    }
    Ok(())
}

/// Memory, thread and context-switch gauges of this process
pub struct ProcessStatusSource {
    path: PathBuf,
}

impl ProcessStatusSource {
    const FIELDS: &'static [(&'static str, &'static str)] = &[
        ("VmRSS", "ResidentMemory"),
        ("VmHWM", "PeakResidentMemory"),
        ("VmSize", "VirtualMemory"),
        ("VmPeak", "PeakVirtualMemory"),
        ("VmData", "DataMemory"),
        ("VmStk", "StackMemory"),
        ("Threads", "Threads"),
        ("voluntary_ctxt_switches", "VoluntaryContextSwitches"),
        ("nonvoluntary_ctxt_switches", "InvoluntaryContextSwitches"),
    ];

    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join("self").join("status"),
        }
    }
}

impl MetricSource for ProcessStatusSource {
    fn name(&self) -> &'static str {
        "process_status"
    }

    fn collect(&mut self, batch: &mut Batch) -> Result<(), CollectError> {
        let contents = read(&self.path)?;
        push_known(batch, &parse_key_values(&contents), Self::FIELDS, "status")
    }
}

/// Fault counts and CPU ticks of this process
pub struct ProcessStatSource {
    path: PathBuf,
}

impl ProcessStatSource {
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join("self").join("stat"),
        }
    }

    /// Fields after the parenthesised command name start at field 3 (state)
    fn parse(contents: &str) -> Result<Vec<Metric>, CollectError> {
        let (_, rest) = contents
            .rsplit_once(')')
            .ok_or_else(|| CollectError::parse("stat", "missing command name"))?;
        let fields: Vec<&str> = rest.split_whitespace().collect();

        let field = |n: usize| -> Result<f64, CollectError> {
            fields
                .get(n - 3)
                .and_then(|v| v.parse::<f64>().ok())
                .ok_or_else(|| CollectError::parse("stat", format!("field {} missing", n)))
        };

        Ok(vec![
            Metric::gauge("MinorFaults", field(10)?),
            Metric::gauge("MajorFaults", field(12)?),
            Metric::gauge("UserCPUTicks", field(14)?),
            Metric::gauge("SystemCPUTicks", field(15)?),
        ])
    }
}

impl MetricSource for ProcessStatSource {
    fn name(&self) -> &'static str {
        "process_stat"
    }

    fn collect(&mut self, batch: &mut Batch) -> Result<(), CollectError> {
        let contents = read(&self.path)?;
        batch.extend(Self::parse(&contents)?);
        Ok(())
    }
}

/// Host memory totals
pub struct MemInfoSource {
    path: PathBuf,
}

impl MemInfoSource {
    const FIELDS: &'static [(&'static str, &'static str)] = &[
        ("MemTotal", "TotalMemory"),
        ("MemFree", "FreeMemory"),
        ("MemAvailable", "AvailableMemory"),
    ];

    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join("meminfo"),
        }
    }
}

impl MetricSource for MemInfoSource {
    fn name(&self) -> &'static str {
        "meminfo"
    }

    fn collect(&mut self, batch: &mut Batch) -> Result<(), CollectError> {
        let contents = read(&self.path)?;
        push_known(batch, &parse_key_values(&contents), Self::FIELDS, "meminfo")
    }
}

/// Busy and total jiffies of one core
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

/// Per-core utilisation since the previous poll
pub struct CpuUtilizationSource {
    path: PathBuf,
    previous: Vec<CpuTimes>,
}

impl CpuUtilizationSource {
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join("stat"),
            previous: Vec::new(),
        }
    }

    /// `cpuN` lines in order; the aggregate `cpu` line is skipped
    fn parse(contents: &str) -> Vec<CpuTimes> {
        contents
            .lines()
            .filter(|line| {
                line.strip_prefix("cpu")
                    .is_some_and(|rest| rest.starts_with(|c: char| c.is_ascii_digit()))
            })
            .map(|line| {
                let values: Vec<u64> = line
                    .split_whitespace()
                    .skip(1)
                    .filter_map(|v| v.parse().ok())
                    .collect();
                let total: u64 = values.iter().sum();
                // idle + iowait
                let idle = values.get(3).copied().unwrap_or(0) + values.get(4).copied().unwrap_or(0);
                CpuTimes {
                    busy: total.saturating_sub(idle),
                    total,
                }
            })
            .collect()
    }
}

impl MetricSource for CpuUtilizationSource {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn collect(&mut self, batch: &mut Batch) -> Result<(), CollectError> {
        let contents = read(&self.path)?;
        let current = Self::parse(&contents);
        if current.is_empty() {
            return Err(CollectError::parse("stat", "no per-core cpu lines"));
        }

        for (index, now) in current.iter().enumerate() {
            let before = self.previous.get(index).copied().unwrap_or_default();
            let total = now.total.saturating_sub(before.total);
            let busy = now.busy.saturating_sub(before.busy);
            let utilization = if total == 0 {
                0.0
            } else {
                busy as f64 / total as f64 * 100.0
            };
            batch.push(Metric::gauge(format!("CPUutilization{}", index + 1), utilization));
        }
        self.previous = current;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use vigil_common::MetricKind;

    const STATUS: &str = "Name:\tvigil-agent\nVmPeak:\t  2000 kB\nVmSize:\t  1000 kB\nVmRSS:\t   512 kB\nThreads:\t4\nvoluntary_ctxt_switches:\t10\n";
    const STAT: &str = "1234 (vigil agent) S 1 1234 1234 0 -1 4194560 150 0 3 0 25 7 0 0 20 0 4 0 100 1024000 128\n";
    const MEMINFO: &str = "MemTotal:       16000 kB\nMemFree:         4000 kB\nMemAvailable:    8000 kB\nBuffers:          100 kB\n";

    fn value(batch: &Batch, id: &str) -> Option<f64> {
        batch.iter().find(|m| m.id == id).and_then(|m| m.value)
    }

    fn fake_proc(stat: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("self")).unwrap();
        fs::write(dir.path().join("self/status"), STATUS).unwrap();
        fs::write(dir.path().join("self/stat"), STAT).unwrap();
        fs::write(dir.path().join("meminfo"), MEMINFO).unwrap();
        fs::write(dir.path().join("stat"), stat).unwrap();
        dir
    }

    #[test]
    fn test_poll_always_has_random_value_and_poll_count() {
        let mut collector = Collector::with_sources(Vec::new());
        let first = collector.poll();
        let second = collector.poll();

        for result in [&first, &second] {
            assert!(result.errors.is_empty());
            assert!(value(&result.batch, RANDOM_VALUE_METRIC).is_some());
            let poll_count = result.batch.iter().find(|m| m.id == POLL_COUNT_METRIC).unwrap();
            assert_eq!(poll_count.kind, MetricKind::Counter);
            assert_eq!(poll_count.delta, Some(1));
        }
        assert_eq!(collector.poll_count(), 2);
    }

    #[test]
    fn test_procfs_sources() {
        let dir = fake_proc("cpu  10 0 10 80 0 0 0 0\ncpu0 5 0 5 40 0 0 0 0\ncpu1 5 0 5 40 0 0 0 0\n");
        let mut collector = Collector::with_sources(procfs_sources(dir.path()));

        let result = collector.poll();
        assert!(result.errors.is_empty(), "{:?}", result.errors);
        let batch = &result.batch;

        assert_eq!(value(batch, "ResidentMemory"), Some(512.0 * 1024.0));
        assert_eq!(value(batch, "PeakVirtualMemory"), Some(2000.0 * 1024.0));
        assert_eq!(value(batch, "Threads"), Some(4.0));
        assert_eq!(value(batch, "MinorFaults"), Some(150.0));
        assert_eq!(value(batch, "MajorFaults"), Some(3.0));
        assert_eq!(value(batch, "UserCPUTicks"), Some(25.0));
        assert_eq!(value(batch, "SystemCPUTicks"), Some(7.0));
        assert_eq!(value(batch, "TotalMemory"), Some(16000.0 * 1024.0));
        assert_eq!(value(batch, "AvailableMemory"), Some(8000.0 * 1024.0));
        // Since boot on the first poll
        assert_eq!(value(batch, "CPUutilization1"), Some(20.0));
        assert_eq!(value(batch, "CPUutilization2"), Some(20.0));
        assert!(batch.iter().all(|m| m.validate().is_ok()));
    }

    #[test]
    fn test_cpu_utilization_since_previous_poll() {
        let dir = fake_proc("cpu0 10 0 10 80 0 0 0 0\n");
        let mut source = CpuUtilizationSource::new(dir.path());
        let mut batch = Batch::new();
        source.collect(&mut batch).unwrap();

        fs::write(dir.path().join("stat"), "cpu0 40 0 40 100 0 0 0 0\n").unwrap();
        let mut batch = Batch::new();
        source.collect(&mut batch).unwrap();

        // 60 busy out of 80 elapsed
        assert_eq!(value(&batch, "CPUutilization1"), Some(75.0));
    }

    #[test]
    fn test_failing_source_keeps_rest_of_batch() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("meminfo"), MEMINFO).unwrap();
        let mut collector = Collector::with_sources(procfs_sources(dir.path()));

        let result = collector.poll();
        // status, stat and cpu are missing
        assert_eq!(result.errors.len(), 3);
        assert!(value(&result.batch, "TotalMemory").is_some());
        assert!(value(&result.batch, RANDOM_VALUE_METRIC).is_some());
        assert_eq!(collector.poll_count(), 1);
    }

    #[test]
    fn test_malformed_stat() {
        assert!(ProcessStatSource::parse("garbage").is_err());
        assert!(ProcessStatSource::parse("1 (x) S 1 2").is_err());
    }

    #[test]
    fn test_poll_counter_shared() {
        let mut collector = Collector::with_sources(Vec::new());
        let counter = collector.poll_counter();
        collector.poll();
        assert_eq!(counter.get(), 1);
    }
}
