//! In-sandbox process-tree benchmarker.
//!
//! Grounded on `original_source/benchmarker/benchmarker.py` and
//! `benchmarker/process_monitor.py`: walk the target's descendant tree each
//! tick and sum CPU/memory/IO across the live set, caching a handle per pid
//! so cumulative I/O counters survive a child disappearing and reappearing.
//!
//! The target runs *inside the sandbox container*, not on the host, so the
//! process tree lives in a pid namespace the host's own
//! `/proc` can't see. `psutil`'s local introspection has no cross-namespace
//! analogue; the closest Rust equivalent without leaving the container
//! boundary is reading the same `/proc` files `psutil` itself reads, but
//! through `sandbox_runtime::exec_in_sandbox` rather than direct syscalls —
//! `POSIX_PROC_TREE_SCRIPT` below is a small shell program that walks the
//! pid tree by `/proc/*/stat`'s ppid field and prints the counters this
//! module needs, resolved with one exec per tick.
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::clock::{moving_average, now_ms};
use crate::error::Result;
use crate::sandbox_runtime::{self, ContainerHandle};
use crate::timeout_supervisor::TimeoutOutcome;

pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemorySample {
    pub rss: u64,
    pub uss: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IoSample {
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_chars: u64,
    pub write_chars: u64,
}

/// One in-sandbox benchmarker run: parallel, same-length time series plus
/// spawn/exit bookkeeping (spec.md §3 SampleTrace).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SampleTrace {
    pub target_pid: Option<u32>,
    pub execution_start_ms: u64,
    pub execution_end_ms: Option<u64>,
    pub sample_ms: Vec<u64>,
    pub cpu_percent: Vec<f64>,
    pub memory: Vec<MemorySample>,
    pub io: Vec<IoSample>,
    pub exit_status: Option<i32>,
    pub terminated: bool,
    pub std_out: String,
    pub std_err: String,
    pub skip_benchmarking: bool,
}

impl SampleTrace {
    fn push_point(&mut self, ms: u64, cpu: f64, mem: MemorySample, io: IoSample) {
        self.sample_ms.push(ms);
        self.cpu_percent.push(cpu);
        self.memory.push(mem);
        self.io.push(io);
    }

    fn len_consistent(&self) -> bool {
        let n = self.sample_ms.len();
        self.cpu_percent.len() == n && self.memory.len() == n && self.io.len() == n
    }
}

/// Derived summary at the default resolution (mean CPU, max memory, final IO).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicStatistics {
    pub execution_time_s: f64,
    pub mean_cpu_percent_norm: f64,
    pub max_rss_mib: f64,
    pub max_uss_mib: f64,
    pub final_read_bytes_mib: f64,
    pub final_write_bytes_mib: f64,
    pub final_read_chars_mib: f64,
    pub final_write_chars_mib: f64,
}

/// Full statistics: the basic summary plus the full smoothed series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullStatistics {
    pub basic: BasicStatistics,
    pub timestamps_s: Vec<f64>,
    pub cpu_percent_norm: Vec<f64>,
    pub cpu_percent_norm_smoothed: Vec<f64>,
    pub rss_mib: Vec<f64>,
    pub uss_mib: Vec<f64>,
}

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

fn mib(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MIB
}

/// Centered-window width per spec.md §4.2: `ceil(N/20)`, at least 1.
fn statistics_window(n: usize) -> usize {
    if n == 0 {
        1
    } else {
        (n + 19) / 20
    }
}

pub fn get_statistics_basic(trace: &SampleTrace, online_cpu_count: usize) -> BasicStatistics {
    let full = get_statistics_full(trace, online_cpu_count);
    full.basic
}

pub fn get_statistics_full(trace: &SampleTrace, online_cpu_count: usize) -> FullStatistics {
    let n = trace.sample_ms.len();
    let cpus = online_cpu_count.max(1) as f64;

    let timestamps_s: Vec<f64> = trace.sample_ms.iter().map(|ms| *ms as f64 / 1000.0).collect();
    let cpu_percent_norm: Vec<f64> = trace.cpu_percent.iter().map(|c| c / cpus).collect();
    let rss_mib: Vec<f64> = trace.memory.iter().map(|m| mib(m.rss)).collect();
    let uss_mib: Vec<f64> = trace.memory.iter().map(|m| mib(m.uss)).collect();

    let window = statistics_window(n);
    let cpu_percent_norm_smoothed = moving_average(&cpu_percent_norm, window);

    let execution_time_s = match (trace.execution_start_ms, trace.execution_end_ms) {
        (start, Some(end)) => (end.saturating_sub(start)) as f64 / 1000.0,
        _ => timestamps_s.last().copied().unwrap_or(0.0),
    };

    let mean_cpu_percent_norm = if cpu_percent_norm.is_empty() {
        0.0
    } else {
        cpu_percent_norm.iter().sum::<f64>() / cpu_percent_norm.len() as f64
    };
    let max_rss_mib = rss_mib.iter().cloned().fold(0.0_f64, f64::max);
    let max_uss_mib = uss_mib.iter().cloned().fold(0.0_f64, f64::max);

    let (final_read_bytes_mib, final_write_bytes_mib, final_read_chars_mib, final_write_chars_mib) =
        match trace.io.last() {
            Some(last) => (
                mib(last.read_bytes),
                mib(last.write_bytes),
                mib(last.read_chars),
                mib(last.write_chars),
            ),
            None => (0.0, 0.0, 0.0, 0.0),
        };

    let basic = BasicStatistics {
        execution_time_s,
        mean_cpu_percent_norm,
        max_rss_mib,
        max_uss_mib,
        final_read_bytes_mib,
        final_write_bytes_mib,
        final_read_chars_mib,
        final_write_chars_mib,
    };

    FullStatistics {
        basic,
        timestamps_s,
        cpu_percent_norm,
        cpu_percent_norm_smoothed,
        rss_mib,
        uss_mib,
    }
}

/// Jiffies per second assumed for `/proc/<pid>/stat`'s utime/stime fields.
/// Almost universally 100 on Linux; querying `getconf CLK_TCK` per session
/// would cost another exec round-trip for a value that never changes on a
/// given kernel, so it's hardcoded the way `psutil` bakes in the same
/// assumption internally when `os.sysconf` is unavailable.
const CLK_TCK: u64 = 100;

/// One process's counters for a single tick, parsed out of
/// `POSIX_PROC_TREE_SCRIPT`'s output.
#[derive(Debug, Clone, Default, PartialEq)]
struct ProcSample {
    pid: u32,
    utime_stime_ticks: u64,
    rss_kb: u64,
    /// Private (unshared) resident memory from `/proc/<pid>/smaps_rollup`'s
    /// `Private_Clean + Private_Dirty`, the real USS psutil reports — not a
    /// duplicate of RSS. Zero when the kernel doesn't expose smaps_rollup
    /// (e.g. `CONFIG_PROC_PAGE_MONITOR` disabled) or the exec lacks
    /// permission to read it.
    uss_kb: u64,
    io: IoSample,
}

/// A small POSIX shell walk of `target_pid`'s descendant tree, executed once
/// per tick inside the sandbox container. Descendants are found transitively via each
/// `/proc/<pid>/stat`'s 4th field (ppid), matching `psutil`'s
/// `children(recursive=True)`.
const POSIX_PROC_TREE_SCRIPT: &str = r#"
walk() {
  pid="$1"
  echo "PID $pid"
  [ -r "/proc/$pid/stat" ] && awk '{print "STAT", $14+$15}' "/proc/$pid/stat" 2>/dev/null
  [ -r "/proc/$pid/status" ] && awk '/^VmRSS:/{print "RSS", $2}' "/proc/$pid/status" 2>/dev/null
  if [ -r "/proc/$pid/smaps_rollup" ]; then
    awk '/^Private_Clean:/{pc=$2} /^Private_Dirty:/{pd=$2} END{if (pc!="" || pd!="") print "USS", pc+pd}' "/proc/$pid/smaps_rollup" 2>/dev/null
  fi
  [ -r "/proc/$pid/io" ] && awk '/^rchar:/{r=$2} /^wchar:/{w=$2} /^read_bytes:/{rb=$2} /^write_bytes:/{wb=$2} END{print "IO", rb+0, wb+0, r+0, w+0}' "/proc/$pid/io" 2>/dev/null
  for p in /proc/[0-9]*; do
    cpid=${p#/proc/}
    [ "$cpid" = "$pid" ] && continue
    ppid=$(awk '{print $4}' "$p/stat" 2>/dev/null)
    [ "$ppid" = "$pid" ] && walk "$cpid"
  done
}
walk "$1"
"#;

/// Parse `POSIX_PROC_TREE_SCRIPT`'s output into one `ProcSample` per `PID`
/// block.
fn parse_proc_tree(output: &str) -> Vec<ProcSample> {
    let mut samples = Vec::new();
    let mut current: Option<ProcSample> = None;

    for line in output.lines() {
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("PID") => {
                if let Some(sample) = current.take() {
                    samples.push(sample);
                }
                if let Some(pid) = fields.next().and_then(|p| p.parse().ok()) {
                    current = Some(ProcSample { pid, ..Default::default() });
                }
            }
            Some("STAT") => {
                if let Some(sample) = current.as_mut() {
                    sample.utime_stime_ticks = fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
                }
            }
            Some("RSS") => {
                if let Some(sample) = current.as_mut() {
                    sample.rss_kb = fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
                }
            }
            Some("USS") => {
                if let Some(sample) = current.as_mut() {
                    sample.uss_kb = fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
                }
            }
            Some("IO") => {
                if let Some(sample) = current.as_mut() {
                    let mut next_u64 = || fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
                    sample.io = IoSample {
                        read_bytes: next_u64(),
                        write_bytes: next_u64(),
                        read_chars: next_u64(),
                        write_chars: next_u64(),
                    };
                }
            }
            _ => {}
        }
    }
    if let Some(sample) = current.take() {
        samples.push(sample);
    }
    samples
}

async fn sample_proc_tree(handle: &ContainerHandle, target_pid: u32) -> Result<Vec<ProcSample>> {
    let argv = vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        POSIX_PROC_TREE_SCRIPT.to_string(),
        "sh".to_string(),
        target_pid.to_string(),
    ];
    let output = sandbox_runtime::exec_in_sandbox(handle, &argv, &HashMap::new()).await?;
    Ok(parse_proc_tree(&output))
}

/// Per-process cached counters, keyed by pid, so a child missing for one
/// tick doesn't reset its contribution to cumulative I/O the next time it's
/// seen, and so CPU% is a delta over wall time rather than a cumulative
/// total.
#[derive(Default, Clone)]
struct CachedProcess {
    last_cpu_ticks: u64,
    last_io: IoSample,
}

struct TreeCache {
    known: BTreeMap<u32, CachedProcess>,
    last_tick_at: Option<Instant>,
}

impl TreeCache {
    fn new() -> Self {
        Self {
            known: BTreeMap::new(),
            last_tick_at: None,
        }
    }

    /// One sampling tick: sum CPU-ticks delta / memory / IO across `samples`,
    /// plus the last known IO of any cached pid that dropped out this tick.
    fn tick(&mut self, samples: &[ProcSample]) -> (f64, MemorySample, IoSample) {
        let now = Instant::now();
        let elapsed_s = self
            .last_tick_at
            .map(|prev| now.saturating_duration_since(prev).as_secs_f64())
            .unwrap_or(0.0);
        self.last_tick_at = Some(now);

        let mut cpu_total = 0.0;
        let mut mem = MemorySample::default();
        let mut io = IoSample::default();
        let mut live = BTreeSet::new();

        for sample in samples {
            live.insert(sample.pid);
            let cached = self.known.entry(sample.pid).or_insert_with(|| CachedProcess {
                last_cpu_ticks: sample.utime_stime_ticks,
                last_io: sample.io.clone(),
            });

            let delta_ticks = sample.utime_stime_ticks.saturating_sub(cached.last_cpu_ticks);
            if elapsed_s > 0.0 {
                cpu_total += (delta_ticks as f64 / CLK_TCK as f64 / elapsed_s) * 100.0;
            }
            cached.last_cpu_ticks = sample.utime_stime_ticks;
            cached.last_io = sample.io.clone();

            mem.rss += sample.rss_kb * 1024;
            mem.uss += sample.uss_kb * 1024;
            io.read_bytes += sample.io.read_bytes;
            io.write_bytes += sample.io.write_bytes;
            io.read_chars += sample.io.read_chars;
            io.write_chars += sample.io.write_chars;
        }

        for (pid, cached) in self.known.iter() {
            if !live.contains(pid) {
                io.read_bytes += cached.last_io.read_bytes;
                io.write_bytes += cached.last_io.write_bytes;
                io.read_chars += cached.last_io.read_chars;
                io.write_chars += cached.last_io.write_chars;
            }
        }

        (cpu_total, mem, io)
    }
}

/// Shared handle to a trace being actively written; the Report Emitter reads
/// snapshots through this while the sampling loop owns the only writer.
#[derive(Clone)]
pub struct SharedTrace(Arc<Mutex<SampleTrace>>);

impl SharedTrace {
    pub fn new(trace: SampleTrace) -> Self {
        Self(Arc::new(Mutex::new(trace)))
    }

    /// A coherent copy: every series has the length it had at capture time.
    pub fn snapshot(&self) -> SampleTrace {
        let guard = self.0.lock().unwrap_or_else(|e| e.into_inner());
        debug_assert!(guard.len_consistent());
        guard.clone()
    }
}

pub struct ProcessBenchmarker {
    interval: Duration,
}

impl Default for ProcessBenchmarker {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_SAMPLE_INTERVAL_MS),
        }
    }
}

impl ProcessBenchmarker {
    pub fn with_interval(interval: Duration) -> Self {
        Self { interval }
    }

    /// Start `argv` inside `handle`'s container and return immediately with
    /// a `SharedTrace` handle callers can hand to a periodic publisher
    /// before the run finishes. Drive the returned future to completion with
    /// `drive_to_completion` to get the final trace.
    pub async fn start_in_sandbox(
        &self,
        handle: &ContainerHandle,
        argv: &[String],
        env: &HashMap<String, String>,
        skip_benchmarking: bool,
    ) -> Result<(SharedTrace, Option<String>)> {
        let execution_start_ms = now_ms();

        if skip_benchmarking || argv.is_empty() {
            let trace = SampleTrace {
                execution_start_ms,
                execution_end_ms: Some(now_ms()),
                exit_status: Some(-1),
                skip_benchmarking: true,
                ..Default::default()
            };
            return Ok((SharedTrace::new(trace), None));
        }

        let exec_id = sandbox_runtime::start_detached_exec(handle, argv, env).await?;
        let trace = SampleTrace {
            execution_start_ms,
            ..Default::default()
        };
        Ok((SharedTrace::new(trace), Some(exec_id)))
    }

    /// Sample `shared`'s target (started via `start_in_sandbox`) until it
    /// exits, the hard deadline elapses, or the run is cancelled. On
    /// `TimeoutOutcome::Elapsed` the target is sent `SIGKILL`
    /// inside the container and the trace is marked `terminated`. A `None`
    /// `exec_id` (the `skip_benchmarking` case) returns the trace unchanged.
    pub async fn drive_to_completion(
        &self,
        handle: &ContainerHandle,
        shared: &SharedTrace,
        exec_id: Option<String>,
        mut timeout_rx: watch::Receiver<TimeoutOutcome>,
    ) -> Result<SampleTrace> {
        let Some(exec_id) = exec_id else {
            return Ok(shared.snapshot());
        };

        let mut cache = TreeCache::new();
        let tick_every = self.interval;
        let mut deadline = Instant::now() + tick_every;
        let mut target_pid: Option<u32> = None;

        loop {
            tokio::select! {
                biased;
                _ = timeout_rx.changed() => {
                    if matches!(*timeout_rx.borrow(), TimeoutOutcome::Elapsed) {
                        if let Some(pid) = target_pid {
                            let _ = sandbox_runtime::kill_pid_in_sandbox(handle, pid as i64).await;
                        }
                        let mut guard = shared.0.lock().unwrap_or_else(|e| e.into_inner());
                        guard.execution_end_ms = Some(now_ms());
                        guard.terminated = true;
                        break;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let status = sandbox_runtime::exec_status(handle, &exec_id).await?;
                    if let Some(pid) = status.pid {
                        target_pid = Some(pid as u32);
                    }
                    if !status.running {
                        let mut guard = shared.0.lock().unwrap_or_else(|e| e.into_inner());
                        guard.execution_end_ms = Some(now_ms());
                        guard.exit_status = status.exit_code.map(|c| c as i32);
                        break;
                    }

                    if let Some(pid) = target_pid {
                        let samples = sample_proc_tree(handle, pid).await?;
                        let (cpu, mem, io) = cache.tick(&samples);
                        let mut guard = shared.0.lock().unwrap_or_else(|e| e.into_inner());
                        guard.target_pid = Some(pid);
                        let ms = now_ms().saturating_sub(guard.execution_start_ms);
                        guard.push_point(ms, cpu, mem, io);
                    }

                    deadline += tick_every;
                }
            }
        }

        Ok(shared.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace_with(n: usize) -> SampleTrace {
        let mut t = SampleTrace::default();
        for i in 0..n {
            t.push_point(
                (i as u64) * 100,
                10.0,
                MemorySample { rss: 1024 * 1024, uss: 512 * 1024 },
                IoSample {
                    read_bytes: i as u64 * 10,
                    write_bytes: i as u64 * 5,
                    read_chars: i as u64 * 10,
                    write_chars: i as u64 * 5,
                },
            );
        }
        t
    }

    #[test]
    fn series_stay_equal_length() {
        let t = trace_with(7);
        assert!(t.len_consistent());
    }

    #[test]
    fn statistics_window_grows_with_n() {
        assert_eq!(statistics_window(0), 1);
        assert_eq!(statistics_window(1), 1);
        assert_eq!(statistics_window(20), 1);
        assert_eq!(statistics_window(21), 2);
        assert_eq!(statistics_window(40), 2);
    }

    #[test]
    fn basic_statistics_uses_final_io_values() {
        let t = trace_with(5);
        let stats = get_statistics_basic(&t, 2);
        assert_eq!(stats.final_read_bytes_mib, mib(40));
        assert_eq!(stats.max_rss_mib, mib(1024 * 1024));
    }

    #[test]
    fn full_statistics_series_share_length_with_input() {
        let t = trace_with(9);
        let full = get_statistics_full(&t, 4);
        assert_eq!(full.timestamps_s.len(), 9);
        assert_eq!(full.cpu_percent_norm_smoothed.len(), 9);
    }

    #[tokio::test]
    async fn skip_benchmarking_returns_immediately() {
        let bench = ProcessBenchmarker::default();
        let handle = ContainerHandle {
            container_id: "unused".to_string(),
            image_ref: "unused".to_string(),
        };
        let (_tx, rx) = watch::channel(TimeoutOutcome::Armed);
        let (shared, exec_id) = bench
            .start_in_sandbox(&handle, &[], &HashMap::new(), true)
            .await
            .unwrap();
        assert!(exec_id.is_none());
        let trace = bench.drive_to_completion(&handle, &shared, exec_id, rx).await.unwrap();
        assert!(trace.skip_benchmarking);
        assert_eq!(trace.exit_status, Some(-1));
        assert!(trace.sample_ms.is_empty());
    }

    #[test]
    fn parse_proc_tree_reads_one_block_per_pid() {
        let output = "PID 10\nSTAT 250\nRSS 4096\nUSS 2048\nIO 100 200 300 400\nPID 11\nSTAT 5\n";
        let samples = parse_proc_tree(output);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].pid, 10);
        assert_eq!(samples[0].utime_stime_ticks, 250);
        assert_eq!(samples[0].rss_kb, 4096);
        assert_eq!(samples[0].uss_kb, 2048);
        assert_eq!(samples[0].io.read_bytes, 100);
        assert_eq!(samples[0].io.write_bytes, 200);
        assert_eq!(samples[0].io.read_chars, 300);
        assert_eq!(samples[0].io.write_chars, 400);
        assert_eq!(samples[1].pid, 11);
        assert_eq!(samples[1].utime_stime_ticks, 5);
    }

    #[test]
    fn parse_proc_tree_ignores_malformed_lines() {
        let output = "garbage\nPID 1\nSTAT notanumber\nRSS 10\n";
        let samples = parse_proc_tree(output);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].utime_stime_ticks, 0);
        assert_eq!(samples[0].rss_kb, 10);
    }

    #[test]
    fn tree_cache_carries_last_io_for_a_pid_that_drops_out() {
        let mut cache = TreeCache::new();
        let present = ProcSample {
            pid: 1,
            utime_stime_ticks: 100,
            rss_kb: 10,
            uss_kb: 5,
            io: IoSample {
                read_bytes: 50,
                write_bytes: 20,
                read_chars: 50,
                write_chars: 20,
            },
        };
        let (_, _, io_first) = cache.tick(&[present.clone()]);
        assert_eq!(io_first.read_bytes, 50);

        // Same pid reappears with higher counters, then vanishes: the next
        // tick should still carry its last known cumulative IO forward.
        let mut grown = present.clone();
        grown.io.read_bytes = 80;
        let (_, _, io_second) = cache.tick(&[grown]);
        assert_eq!(io_second.read_bytes, 80);

        let (_, _, io_third) = cache.tick(&[]);
        assert_eq!(io_third.read_bytes, 80);
    }
}
