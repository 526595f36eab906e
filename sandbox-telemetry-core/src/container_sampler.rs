//! Host-side container sampler.
//!
//! Grounded on `original_source/monitors/docker_stats.py`: poll the daemon's
//! per-container stats endpoint at a fixed interval, derive CPU% from the
//! delta-over-delta formula, carry memory/block-IO/network counters through
//! largely unchanged, and pad any device-keyed IO series so every series
//! under one trace keeps the same length.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use docktopus::bollard::container::StatsOptions;
use docktopus::bollard::Docker;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tracing::warn;

use crate::clock::now_s;
use crate::error::{Result, SandboxError};
use crate::metrics::metrics;

pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuSample {
    pub cpu_percent: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemorySample {
    pub usage: u64,
    pub max_usage: u64,
    pub limit: u64,
    pub cache: u64,
    pub rss: u64,
    pub swap: u64,
    pub active_anon: u64,
    pub inactive_anon: u64,
    pub active_file: u64,
    pub inactive_file: u64,
    pub pgfault: u64,
    pub pgmajfault: u64,
    pub memory_percent: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSample {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerMetadata {
    pub start_time_s: u64,
    pub end_time_s: Option<u64>,
    pub session_id: String,
}

/// Mirror of `SampleTrace` sourced from the container daemon rather than a
/// process tree (spec.md §3 ContainerTrace): separate CPU/memory/network
/// series sharing one `timestamps_s`, plus block I/O keyed by device major.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerTrace {
    pub metadata: ContainerMetadata,
    pub timestamps_s: Vec<u64>,
    pub cpu: Vec<CpuSample>,
    pub memory: Vec<MemorySample>,
    pub block_io: BTreeMap<String, Vec<u64>>,
    pub network: BTreeMap<String, Vec<NetworkSample>>,
}

impl ContainerTrace {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            metadata: ContainerMetadata {
                start_time_s: now_s(),
                end_time_s: None,
                session_id: session_id.into(),
            },
            timestamps_s: Vec::new(),
            cpu: Vec::new(),
            memory: Vec::new(),
            block_io: BTreeMap::new(),
            network: BTreeMap::new(),
        }
    }

    /// Pad every block-IO series shorter than `timestamps_s` with zeros so
    /// the length invariant holds across devices that only appear partway
    /// through the run.
    fn pad_block_io(&mut self) {
        let target_len = self.timestamps_s.len();
        for series in self.block_io.values_mut() {
            while series.len() < target_len {
                series.push(0);
            }
        }
    }

    /// Same as `pad_block_io` for per-interface network series: an interface
    /// absent from one daemon response (e.g. momentarily during a network
    /// reconfiguration) must not leave its series permanently shorter than
    /// `timestamps_s`.
    fn pad_network(&mut self) {
        let target_len = self.timestamps_s.len();
        for series in self.network.values_mut() {
            while series.len() < target_len {
                series.push(NetworkSample::default());
            }
        }
    }
}

/// `cpu_percent = (Δcontainer / Δsystem) × total_system_cpus / online_cpus × 100`,
/// with Δsystem ≤ 0 guarded to zero (spec.md §4.3).
fn compute_cpu_percent(
    cpu_delta: i64,
    system_delta: i64,
    total_system_cpus: f64,
    online_cpus: f64,
) -> f64 {
    if system_delta <= 0 || online_cpus <= 0.0 {
        return 0.0;
    }
    (cpu_delta as f64 / system_delta as f64) * total_system_cpus / online_cpus * 100.0
}

pub struct ContainerSampler {
    docker: Arc<Docker>,
    container_id: String,
    interval: Duration,
}

impl ContainerSampler {
    pub fn new(docker: Arc<Docker>, container_id: impl Into<String>) -> Self {
        Self {
            docker,
            container_id: container_id.into(),
            interval: Duration::from_millis(DEFAULT_SAMPLE_INTERVAL_MS),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run until the container stops, disappears, or `stop` fires. Appends
    /// one point per tick to `trace`; returns when sampling ends (spec.md
    /// §4.3 failure policy: not-found ends cleanly, other daemon errors
    /// propagate).
    pub async fn run(
        &self,
        trace: &mut ContainerTrace,
        mut stop: tokio_stream::wrappers::WatchStream<bool>,
    ) -> Result<()> {
        let mut deadline = Instant::now() + self.interval;

        loop {
            tokio::select! {
                biased;
                Some(true) = stop.next() => {
                    break;
                }
                _ = tokio::time::sleep_until(deadline) => {}
            }

            let options = Some(StatsOptions {
                stream: false,
                one_shot: true,
            });
            let mut stream = self.docker.stats(&self.container_id, options);
            let stats = match stream.next().await {
                Some(Ok(stats)) => stats,
                Some(Err(docktopus::bollard::errors::Error::DockerResponseServerError {
                    status_code: 404,
                    ..
                })) => {
                    break;
                }
                Some(Err(err)) => {
                    warn!(container = %self.container_id, error = %err, "container stats failed");
                    metrics().record_sampler_failure();
                    return Err(SandboxError::Docker(format!("stats failed: {err}")));
                }
                None => break,
            };
            metrics().record_sampler_tick();

            let cpu_delta = stats.cpu_stats.cpu_usage.total_usage as i64
                - stats.precpu_stats.cpu_usage.total_usage as i64;
            let system_delta = stats.cpu_stats.system_cpu_usage.unwrap_or(0) as i64
                - stats.precpu_stats.system_cpu_usage.unwrap_or(0) as i64;
            let online_cpus = stats.cpu_stats.online_cpus.unwrap_or(1) as f64;
            let total_system_cpus = stats
                .cpu_stats
                .cpu_usage
                .percpu_usage
                .as_ref()
                .map(|v| v.len() as f64)
                .unwrap_or(online_cpus);

            let cpu_percent = compute_cpu_percent(cpu_delta, system_delta, total_system_cpus, online_cpus);

            let mem = &stats.memory_stats;
            let usage = mem.usage.unwrap_or(0);
            let limit = mem.limit.unwrap_or(0);
            let memory_percent = if limit > 0 {
                usage as f64 / limit as f64 * 100.0
            } else {
                0.0
            };
            let stats_detail = mem.stats.clone().unwrap_or_default();
            let memory = MemorySample {
                usage,
                max_usage: mem.max_usage.unwrap_or(0),
                limit,
                cache: stats_detail.get("cache").copied().unwrap_or(0),
                rss: stats_detail.get("rss").copied().unwrap_or(0),
                swap: stats_detail.get("swap").copied().unwrap_or(0),
                active_anon: stats_detail.get("active_anon").copied().unwrap_or(0),
                inactive_anon: stats_detail.get("inactive_anon").copied().unwrap_or(0),
                active_file: stats_detail.get("active_file").copied().unwrap_or(0),
                inactive_file: stats_detail.get("inactive_file").copied().unwrap_or(0),
                pgfault: stats_detail.get("pgfault").copied().unwrap_or(0),
                pgmajfault: stats_detail.get("pgmajfault").copied().unwrap_or(0),
                memory_percent,
            };

            let mut by_device: BTreeMap<String, u64> = BTreeMap::new();
            if let Some(blkio) = stats.blkio_stats.io_service_bytes_recursive.as_ref() {
                for entry in blkio {
                    let key = format!("{}-{}", entry.major, entry.op.to_lowercase());
                    *by_device.entry(key).or_insert(0) += entry.value;
                }
            }

            let mut network = BTreeMap::new();
            if let Some(nets) = stats.networks.as_ref() {
                for (iface, n) in nets {
                    network.insert(
                        iface.clone(),
                        NetworkSample {
                            rx_bytes: n.rx_bytes,
                            tx_bytes: n.tx_bytes,
                            rx_packets: n.rx_packets,
                            tx_packets: n.tx_packets,
                            rx_dropped: n.rx_dropped,
                            tx_dropped: n.tx_dropped,
                            rx_errors: n.rx_errors,
                            tx_errors: n.tx_errors,
                        },
                    );
                }
            }

            trace.timestamps_s.push(now_s());
            trace.cpu.push(CpuSample { cpu_percent });
            trace.memory.push(memory);
            for (device, value) in by_device {
                trace.block_io.entry(device).or_default().push(value);
            }
            for (iface, sample) in network {
                trace.network.entry(iface).or_default().push(sample);
            }
            trace.pad_block_io();
            trace.pad_network();

            deadline += self.interval;
        }

        trace.metadata.end_time_s = Some(now_s());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_percent_guards_nonpositive_system_delta() {
        assert_eq!(compute_cpu_percent(500, 0, 4.0, 2.0), 0.0);
        assert_eq!(compute_cpu_percent(500, -10, 4.0, 2.0), 0.0);
    }

    #[test]
    fn cpu_percent_matches_formula() {
        let pct = compute_cpu_percent(100, 1000, 4.0, 2.0);
        assert!((pct - 20.0).abs() < 1e-9);
    }

    #[test]
    fn pad_block_io_fills_shorter_series_with_zeros() {
        let mut trace = ContainerTrace::new("abc123");
        trace.timestamps_s = vec![0, 1, 2];
        trace.block_io.insert("8-read".into(), vec![10]);
        trace.pad_block_io();
        assert_eq!(trace.block_io.get("8-read").unwrap(), &vec![10, 0, 0]);
    }
}
