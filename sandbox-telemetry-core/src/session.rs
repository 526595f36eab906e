//! Session entity, persistence, and execution orchestration.
//!
//! Grounded on `original_source/session.py` for the data shape and
//! `sandbox_handler.py::create_sandbox_from_session` for the orchestration
//! sequence, restructured around `sandbox_runtime`/`benchmarker`/
//! `container_sampler`/`report_emitter` instead of inline docker-py calls.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info};
use uuid::Uuid;

use crate::benchmarker::{ProcessBenchmarker, SampleTrace};
use crate::clock::now_ms;
use crate::container_sampler::{ContainerSampler, ContainerTrace};
use crate::error::{Result, SandboxError};
use crate::metrics::metrics;
use crate::report_emitter::{self, ReportEnvelope};
use crate::sandbox_runtime::{self, ContainerHandle};
use crate::scraper_adapter::ScraperAdapter;
use crate::timeout_supervisor::{TimeoutOutcome, TimeoutSupervisor};

/// Recognized session options (spec.md §3 Session.configuration).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfiguration {
    pub provide_raw_series: bool,
    pub user_emul: bool,
    pub base_image_tag: String,
    pub scrape_interval_s: u64,
    pub persist_to_store: bool,
    pub network_disabled: bool,
    pub soft_timeout_s: u64,
    pub hard_timeout_s: u64,
}

impl Default for SessionConfiguration {
    fn default() -> Self {
        Self {
            provide_raw_series: false,
            user_emul: false,
            base_image_tag: "ubuntu:latest".to_string(),
            scrape_interval_s: 5,
            persist_to_store: false,
            network_disabled: false,
            soft_timeout_s: 10,
            hard_timeout_s: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Created,
    Persisted,
    Executing,
    Executed,
    Cancelled,
}

/// The unit of work (spec.md §3 Session). Field names on disk follow the
/// documented persistence contract (spec.md:193) rather than the Rust-side
/// names: `buildargs`, `timestamp`, `executed`, `reports_list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub sha256: String,
    #[serde(rename = "buildargs")]
    pub build_args: serde_json::Map<String, serde_json::Value>,
    pub configuration: SessionConfiguration,
    pub process_monitor_flag: bool,
    #[serde(rename = "timestamp")]
    pub created_at: u64,
    #[serde(rename = "executed")]
    pub executed_at: Option<u64>,
    #[serde(rename = "reports_list")]
    pub reports: Vec<String>,
    pub state: SessionState,
}

impl Session {
    pub fn new(
        name: impl Into<String>,
        sha256: impl Into<String>,
        build_args: serde_json::Map<String, serde_json::Value>,
        process_monitor_flag: bool,
        configuration: SessionConfiguration,
    ) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            name: name.into(),
            sha256: sha256.into(),
            build_args,
            configuration,
            process_monitor_flag,
            created_at: now_ms(),
            executed_at: None,
            reports: Vec::new(),
            state: SessionState::Created,
        }
    }

    /// Environment variables consumed by the in-sandbox benchmarker
    /// (spec.md §6).
    pub fn benchmarker_env(&self, queue_url: &str, queue_name: &str) -> HashMap<String, String> {
        let binary_file = self
            .build_args
            .get("binary_file")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let mut env = HashMap::new();
        env.insert("ANALYSIS_ID".to_string(), self.id.clone());
        env.insert(
            "EXPERIMENT_FILE".to_string(),
            format!("/opt/sandbox/{binary_file}"),
        );
        env.insert("REQUIREMENTS_FILE".to_string(), "requirements.txt".to_string());
        env.insert("RESULTS_FOLDER".to_string(), "results".to_string());
        env.insert("QUEUE_URL".to_string(), queue_url.to_string());
        env.insert("QUEUE_NAME".to_string(), queue_name.to_string());
        env
    }
}

/// One session per file, `session-<id>.json`, id equal to the filename stem
/// (spec.md:193). Unlike `PersistentStore`'s one-file-for-everything model,
/// sessions are numerous and independently consumed (`analyze --dir` reads
/// one at a time), so each gets its own document.
fn session_path(id: &str) -> PathBuf {
    crate::config::state_dir().join(format!("session-{id}.json"))
}

/// Load a session by id, failing with `NotFound` if absent (spec.md §4.5 step 1).
pub fn load_session(id: &str) -> Result<Session> {
    let path = session_path(id);
    if !path.exists() {
        return Err(SandboxError::NotFound(format!("session '{id}' not found")));
    }
    let raw = std::fs::read_to_string(&path)
        .map_err(|err| SandboxError::Storage(format!("reading {}: {err}", path.display())))?;
    serde_json::from_str(&raw).map_err(|err| SandboxError::Storage(format!("parsing {}: {err}", path.display())))
}

/// Scan `state_dir()` for every `session-<id>.json` file (spec.md:193).
pub fn list_sessions() -> Result<Vec<Session>> {
    let dir = crate::config::state_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let entries = std::fs::read_dir(dir)
        .map_err(|err| SandboxError::Storage(format!("reading {}: {err}", dir.display())))?;

    let mut sessions = Vec::new();
    for entry in entries.flatten() {
        if let Some(name) = entry.file_name().to_str() {
            if let Some(id) = name.strip_prefix("session-").and_then(|n| n.strip_suffix(".json")) {
                sessions.push(load_session(id)?);
            }
        }
    }
    Ok(sessions)
}

pub fn persist_session(session: &Session) -> Result<()> {
    let path = session_path(&session.id);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|err| SandboxError::Storage(format!("creating {}: {err}", parent.display())))?;
    }
    let raw = serde_json::to_string_pretty(session)
        .map_err(|err| SandboxError::Storage(format!("serializing session {}: {err}", session.id)))?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, raw).map_err(|err| SandboxError::Storage(format!("writing {}: {err}", tmp.display())))?;
    std::fs::rename(&tmp, &path)
        .map_err(|err| SandboxError::Storage(format!("renaming into {}: {err}", path.display())))?;
    Ok(())
}

/// Collaborators the session manager needs to actually run a session; kept
/// as one struct so `execute_session` reads like the teacher's
/// single-`SidecarRuntimeConfig`-plus-store style of threading dependencies.
pub struct SessionRuntime {
    pub queue_url: String,
    pub queue_name: String,
    pub scraper_base_url: Option<String>,
    pub results_dir: String,
}

/// Run the full orchestration sequence for `session` (spec.md §4.5 steps 2-9).
///
/// Any failure in steps 4-8 triggers teardown and leaves the session
/// `Cancelled`; step 9's store write is skipped in that case.
pub async fn execute_session(mut session: Session, runtime: &SessionRuntime) -> Result<Session> {
    if session.configuration.provide_raw_series && runtime.scraper_base_url.is_none() {
        return Err(SandboxError::EnvironmentUnavailable(
            "provide_raw_series requires a configured metrics scraper".into(),
        ));
    }

    session.state = SessionState::Persisted;
    persist_session(&session)?;

    session.state = SessionState::Executing;
    persist_session(&session)?;

    let outcome = run_session_inner(&mut session, runtime).await;

    match outcome {
        Ok(()) => {
            session.executed_at = Some(now_ms());
            session.state = SessionState::Executed;
            persist_session(&session)?;
            metrics().record_session_executed();
            if session.configuration.persist_to_store {
                if let Err(err) = crate::document_store::publish_session(&session).await {
                    error!(session_id = %session.id, error = %err, "failed persisting session to document store");
                }
            }
            Ok(session)
        }
        Err(err) => {
            session.state = SessionState::Cancelled;
            let _ = persist_session(&session);
            metrics().record_session_cancelled();
            Err(err)
        }
    }
}

async fn run_session_inner(session: &mut Session, runtime: &SessionRuntime) -> Result<()> {
    let image_ref = sandbox_runtime::build_image(session).await?;
    let env = session.benchmarker_env(&runtime.queue_url, &runtime.queue_name);
    let handle = sandbox_runtime::run_sandbox(session, &image_ref, &env).await?;

    let teardown_guard = TeardownGuard { handle: handle.clone() };

    let (stop_tx, stop_rx) = watch::channel(false);

    let sampler_handle = {
        let docker = sandbox_runtime::docker_builder().await?.client().clone();
        let container_id = handle.container_id.clone();
        let stop_stream = tokio_stream::wrappers::WatchStream::new(stop_rx.clone());
        tokio::spawn(async move {
            let sampler = ContainerSampler::new(docker, container_id);
            let mut trace = ContainerTrace::new(String::new());
            let _ = sampler.run(&mut trace, stop_stream).await;
            trace
        })
    };

    let benchmark_result = if session.process_monitor_flag {
        let argv = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!(
                "EXPERIMENT_FILE={} sandbox-benchmarker",
                env.get("EXPERIMENT_FILE").cloned().unwrap_or_default()
            ),
        ];

        let (supervisor, timeout_rx) = TimeoutSupervisor::arm(
            Duration::from_secs(session.configuration.soft_timeout_s),
            Duration::from_secs(session.configuration.hard_timeout_s),
        );
        let metrics_watch_handle = tokio::spawn(watch_timeout_metrics(timeout_rx.clone()));

        let bench = ProcessBenchmarker::default();
        let (shared, exec_id) = bench.start_in_sandbox(&handle, &argv, &env, false).await?;

        let periodic_handle = tokio::spawn(report_emitter::start_periodic(
            shared.clone(),
            session.id.clone(),
            runtime.queue_url.clone(),
            runtime.queue_name.clone(),
            report_emitter::DEFAULT_PUBLISH_INTERVAL_S,
            stop_rx.clone(),
        ));

        let final_trace = bench.drive_to_completion(&handle, &shared, exec_id, timeout_rx).await;

        supervisor.cancel();
        let _ = stop_tx.send(true);
        let _ = periodic_handle.await;
        let _ = metrics_watch_handle.await;

        let trace = final_trace?;
        Some((trace, shared))
    } else {
        None
    };

    let _ = stop_tx.send(true);
    let mut container_trace = sampler_handle
        .await
        .map_err(|err| SandboxError::SandboxFailure(format!("sampler task panicked: {err}")))?;
    container_trace.metadata.session_id = session.id.clone();

    if let Some((sample_trace, _shared)) = &benchmark_result {
        publish_final_report(session, sample_trace, runtime).await?;
    }
    publish_container_report(session, &container_trace, runtime).await?;

    drop(teardown_guard);
    sandbox_runtime::teardown(&handle).await?;

    if session.configuration.provide_raw_series {
        if let Some(base_url) = &runtime.scraper_base_url {
            let adapter = ScraperAdapter::new(base_url.clone());
            match adapter.fetch_session_window(&session.id, session.configuration.scrape_interval_s).await {
                Ok(series) => {
                    for item in &series {
                        let path = PathBuf::from(&runtime.results_dir)
                            .join(format!("{}-{}.json", session.id, item.metric));
                        if let Some(parent) = path.parent() {
                            std::fs::create_dir_all(parent)
                                .map_err(|err| SandboxError::Storage(format!("creating {}: {err}", parent.display())))?;
                        }
                        let raw = serde_json::to_vec_pretty(item)
                            .map_err(|err| SandboxError::Storage(format!("serializing {}: {err}", item.metric)))?;
                        std::fs::write(&path, raw)
                            .map_err(|err| SandboxError::Storage(format!("writing {}: {err}", path.display())))?;
                    }

                    let envelope = ReportEnvelope {
                        session_id: session.id.clone(),
                        report_type: "scraper".to_string(),
                        metadata: serde_json::json!({ "base_url": base_url }),
                        result: serde_json::to_value(&series).unwrap_or_default(),
                        statistics: serde_json::Value::Null,
                    };
                    report_emitter::publish_final(&envelope, &runtime.queue_url, &runtime.queue_name).await?;
                    crate::document_store::publish_document(
                        "scraper-reports",
                        serde_json::to_value(&envelope).unwrap_or_default(),
                    )
                    .await?;
                    session.reports.push(format!("{}-scraper", session.id));
                }
                Err(err) => {
                    error!(session_id = %session.id, error = %err, "scraper adapter failed");
                }
            }
        }
    }

    Ok(())
}

/// Mirrors `timeout_rx` into the process-wide counters so a soft/hard
/// timeout is observable outside the run it happened in, independent of
/// whatever the benchmark loop itself does with the outcome.
async fn watch_timeout_metrics(mut timeout_rx: watch::Receiver<TimeoutOutcome>) {
    let mut warned_recorded = false;
    loop {
        if timeout_rx.changed().await.is_err() {
            return;
        }
        match *timeout_rx.borrow() {
            TimeoutOutcome::Warned if !warned_recorded => {
                metrics().record_timeout_warned();
                warned_recorded = true;
            }
            TimeoutOutcome::Elapsed => {
                metrics().record_timeout_elapsed();
                return;
            }
            TimeoutOutcome::Cancelled => return,
            _ => {}
        }
    }
}

/// Ensures teardown still runs on the error paths inside `run_session_inner`
/// that return via `?` before reaching the explicit teardown call.
struct TeardownGuard {
    handle: ContainerHandle,
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        let handle = self.handle.clone();
        tokio::spawn(async move {
            if let Err(err) = sandbox_runtime::teardown(&handle).await {
                error!(container_id = %handle.container_id, error = %err, "teardown-on-drop failed");
            }
        });
    }
}

async fn publish_final_report(session: &mut Session, trace: &SampleTrace, runtime: &SessionRuntime) -> Result<()> {
    let online_cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    let statistics = crate::benchmarker::get_statistics_basic(trace, online_cpus);
    let envelope = ReportEnvelope {
        session_id: session.id.clone(),
        report_type: "benchmarker".to_string(),
        metadata: serde_json::json!({ "target_pid": trace.target_pid }),
        result: serde_json::to_value(trace).unwrap_or_default(),
        statistics: serde_json::to_value(&statistics).unwrap_or_default(),
    };
    report_emitter::publish_final(&envelope, &runtime.queue_url, &runtime.queue_name).await?;
    session.reports.push(format!("{}-benchmarker", session.id));
    info!(session_id = %session.id, "benchmarker report published");
    Ok(())
}

async fn publish_container_report(session: &mut Session, trace: &ContainerTrace, runtime: &SessionRuntime) -> Result<()> {
    let envelope = ReportEnvelope {
        session_id: session.id.clone(),
        report_type: "container-stats".to_string(),
        metadata: serde_json::to_value(&trace.metadata).unwrap_or_default(),
        result: serde_json::to_value(trace).unwrap_or_default(),
        statistics: serde_json::Value::Null,
    };
    report_emitter::publish_final(&envelope, &runtime.queue_url, &runtime.queue_name).await?;
    session.reports.push(format!("{}-container-stats", session.id));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_starts_in_created_state() {
        let mut args = serde_json::Map::new();
        args.insert("binary_file".into(), "payload.bin".into());
        let session = Session::new("test", "abc123", args, true, SessionConfiguration::default());
        assert_eq!(session.state, SessionState::Created);
        assert!(session.executed_at.is_none());
        assert!(session.reports.is_empty());
    }

    #[test]
    fn benchmarker_env_carries_required_keys() {
        let mut args = serde_json::Map::new();
        args.insert("binary_file".into(), "payload.bin".into());
        let session = Session::new("test", "abc123", args, true, SessionConfiguration::default());
        let env = session.benchmarker_env("amqp://localhost", "reports");
        assert_eq!(env.get("ANALYSIS_ID"), Some(&session.id));
        assert_eq!(env.get("QUEUE_NAME"), Some(&"reports".to_string()));
        assert!(env.get("EXPERIMENT_FILE").unwrap().contains("payload.bin"));
    }

    #[test]
    fn round_trips_through_json() {
        let mut args = serde_json::Map::new();
        args.insert("binary_file".into(), "payload.bin".into());
        let session = Session::new("test", "abc123", args, true, SessionConfiguration::default());
        let raw = serde_json::to_string(&session).unwrap();
        let back: Session = serde_json::from_str(&raw).unwrap();
        assert_eq!(session.id, back.id);
        assert_eq!(session.name, back.name);
        assert_eq!(session.sha256, back.sha256);
        assert_eq!(session.state, back.state);
    }
}
