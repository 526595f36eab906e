//! Per-session image build, container run, exec, and teardown.
//!
//! Keeps the teacher's shape — a process-wide lazily-initialized
//! `DockerBuilder`, a `Container` builder with `.with_name()` /
//! `.config_override()`, label-based discovery — but generalizes
//! `create_sidecar_docker` into `build_image` + `run_sandbox`, since a
//! session's image is templated and built fresh rather than pulled once at
//! startup. Grounded on `sandbox-runtime/src/runtime.rs` and
//! `original_source/docker_builder.py`/`sandbox_handler.py`.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use docktopus::bollard::container::{
    Config as BollardConfig, LogsOptions, RemoveContainerOptions,
};
use docktopus::bollard::image::{BuildImageOptions, RemoveImageOptions};
use docktopus::bollard::models::HostConfig;
use docktopus::container::Container;
use docktopus::DockerBuilder;
use futures::StreamExt;
use once_cell::sync::OnceCell;
use tokio::sync::OnceCell as AsyncOnceCell;
use tracing::{info, warn};

use crate::error::{Result, SandboxError};
use crate::metrics::metrics;
use crate::session::{Session, SessionConfiguration};
use crate::template::DockerfileTemplate;

pub const CONTAINER_LABEL_OWNER: &str = "created_by";
pub const CONTAINER_LABEL_OWNER_VALUE: &str = "SandboxRuntime";
pub const RESULTS_MOUNT_PATH: &str = "/opt/sandbox/results";

/// Runtime configuration loaded once from the environment, mirroring
/// `SidecarRuntimeConfig::load()`'s env-driven `OnceCell` pattern.
#[derive(Clone, Debug)]
pub struct SandboxRuntimeConfig {
    pub docker_host: Option<String>,
    pub hardened_runtime_class: Option<String>,
    pub default_cpu_cores: u64,
    pub default_memory_mb: u64,
    pub results_dir: String,
}

static RUNTIME_CONFIG: OnceCell<SandboxRuntimeConfig> = OnceCell::new();

impl SandboxRuntimeConfig {
    pub fn load() -> &'static SandboxRuntimeConfig {
        RUNTIME_CONFIG.get_or_init(|| {
            let docker_host = env::var("DOCKER_HOST").ok();
            let hardened_runtime_class = env::var("SANDBOX_RUNTIME_CLASS").ok().filter(|v| !v.is_empty());
            let default_cpu_cores = env::var("SANDBOX_DEFAULT_CPU_CORES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4);
            let default_memory_mb = env::var("SANDBOX_DEFAULT_MEMORY_MB")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8192);
            let results_dir = env::var("SANDBOX_RESULTS_DIR").unwrap_or_else(|_| "/var/lib/sandbox-telemetry/results".into());

            SandboxRuntimeConfig {
                docker_host,
                hardened_runtime_class,
                default_cpu_cores,
                default_memory_mb,
                results_dir,
            }
        })
    }
}

static DOCKER_BUILDER: AsyncOnceCell<DockerBuilder> = AsyncOnceCell::const_new();

/// The process-wide daemon client, created before any session runs (spec.md
/// §9 "global daemon handle").
pub async fn docker_builder() -> Result<&'static DockerBuilder> {
    DOCKER_BUILDER
        .get_or_try_init(|| async {
            let config = SandboxRuntimeConfig::load();
            match config.docker_host.as_deref() {
                Some(host) => DockerBuilder::with_address(host)
                    .await
                    .map_err(|err| SandboxError::Docker(format!("connecting to docker at {host}: {err}"))),
                None => DockerBuilder::new()
                    .await
                    .map_err(|err| SandboxError::Docker(format!("connecting to docker: {err}"))),
            }
        })
        .await
}

/// A running container under the runtime's management.
#[derive(Clone, Debug)]
pub struct ContainerHandle {
    pub container_id: String,
    pub image_ref: String,
}

fn tar_with_dockerfile(dockerfile: &str) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let bytes = dockerfile.as_bytes();
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "Dockerfile", bytes)
        .map_err(|err| SandboxError::SandboxFailure(format!("packaging build context: {err}")))?;
    builder
        .into_inner()
        .map_err(|err| SandboxError::SandboxFailure(format!("finalizing build context: {err}")))
}

/// Render the session's Dockerfile and ask the daemon to build it, honoring
/// `base_image_tag` and forwarding `build_args` (spec.md §4.4).
pub async fn build_image(session: &Session) -> Result<String> {
    let builder = docker_builder().await?;
    let template = DockerfileTemplate::default_template();
    let dockerfile = template.render(
        &session.configuration.base_image_tag,
        session.configuration.user_emul,
        &session.build_args,
    )?;

    let tar = tar_with_dockerfile(&dockerfile)?;
    let image_tag = format!("sandbox-session-{}:latest", session.id);

    let options = BuildImageOptions {
        dockerfile: "Dockerfile".to_string(),
        t: image_tag.clone(),
        rm: true,
        buildargs: session
            .build_args
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect(),
        ..Default::default()
    };

    let client = builder.client();
    let mut stream = client.build_image(options, None, Some(tar.into()));
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(info) => {
                if let Some(err) = info.error {
                    return Err(SandboxError::SandboxFailure(format!("image build failed: {err}")));
                }
            }
            Err(err) => return Err(SandboxError::SandboxFailure(format!("image build failed: {err}"))),
        }
    }

    Ok(image_tag)
}

fn build_host_config(configuration: &SessionConfiguration, runtime_class: Option<String>) -> HostConfig {
    let config = SandboxRuntimeConfig::load();
    let cpu_cores = config.default_cpu_cores;
    let memory_mb = config.default_memory_mb;

    HostConfig {
        nano_cpus: Some((cpu_cores as i64) * 1_000_000_000),
        memory: Some((memory_mb as i64) * 1024 * 1024),
        memory_swappiness: Some(0),
        network_mode: if configuration.network_disabled {
            Some("none".to_string())
        } else {
            None
        },
        runtime: runtime_class,
        binds: Some(vec![format!("{}:{}", config.results_dir, RESULTS_MOUNT_PATH)]),
        ..Default::default()
    }
}

/// Start a container for `session` from `image_ref`, with environment,
/// resource caps, the results bind-mount, and the owner label (spec.md §4.4).
pub async fn run_sandbox(
    session: &Session,
    image_ref: &str,
    environment: &HashMap<String, String>,
) -> Result<ContainerHandle> {
    let builder = docker_builder().await?;
    let config = SandboxRuntimeConfig::load();

    let runtime_class = config.hardened_runtime_class.clone();
    let host_config = build_host_config(&session.configuration, runtime_class);

    let mut labels = HashMap::new();
    labels.insert(CONTAINER_LABEL_OWNER.to_string(), CONTAINER_LABEL_OWNER_VALUE.to_string());
    labels.insert("session_id".to_string(), session.id.clone());

    let env_vars: Vec<String> = environment.iter().map(|(k, v)| format!("{k}={v}")).collect();

    let override_config = BollardConfig {
        host_config: Some(host_config),
        labels: Some(labels),
        ..Default::default()
    };

    let container_name = format!("sandbox-{}", session.id);
    let mut container = Container::new(builder.client(), image_ref.to_string())
        .with_name(container_name)
        .env(env_vars)
        .config_override(override_config);

    container
        .start(false)
        .await
        .map_err(|err| SandboxError::Docker(format!("starting sandbox container: {err}")))?;

    let container_id = container
        .id()
        .ok_or_else(|| SandboxError::Docker("missing container id after start".into()))?
        .to_string();

    info!(session_id = %session.id, container_id = %container_id, "sandbox container started");
    metrics().record_sandbox_created();

    Ok(ContainerHandle {
        container_id,
        image_ref: image_ref.to_string(),
    })
}

/// Run `argv` inside `handle`'s container to completion and return its
/// combined stdout/stderr. Used for short, blocking reads (proc-table
/// sampling, a one-shot `kill`) — not for the long-running target itself,
/// which goes through `start_detached_exec` so the benchmarker can poll it
/// while it runs.
pub async fn exec_in_sandbox(
    handle: &ContainerHandle,
    argv: &[String],
    env: &HashMap<String, String>,
) -> Result<String> {
    let builder = docker_builder().await?;
    let client = builder.client();

    let env_vars: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();

    let exec = client
        .create_exec(
            &handle.container_id,
            docktopus::bollard::exec::CreateExecOptions {
                cmd: Some(argv.to_vec()),
                env: Some(env_vars),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                ..Default::default()
            },
        )
        .await
        .map_err(|err| SandboxError::Docker(format!("creating exec: {err}")))?;

    let start = client
        .start_exec(&exec.id, None)
        .await
        .map_err(|err| SandboxError::Docker(format!("starting exec: {err}")))?;

    let mut output = String::new();
    if let docktopus::bollard::exec::StartExecResults::Attached { output: mut stream, .. } = start {
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(log) => output.push_str(&log.to_string()),
                Err(err) => warn!(error = %err, "exec output stream error"),
            }
        }
    }

    Ok(output)
}

/// Liveness/exit state of a detached exec, read via `inspect_exec` — the
/// benchmarker polls the target rather than blocking on it.
pub struct ExecStatus {
    pub running: bool,
    pub exit_code: Option<i64>,
    pub pid: Option<i64>,
}

/// Start `argv` inside `handle`'s container without waiting for it to exit.
/// The in-sandbox benchmarker spawns the actual target this way, then polls
/// its resource usage through `/proc` (via `exec_in_sandbox`) and its
/// liveness through `exec_status` on the returned exec id.
pub async fn start_detached_exec(
    handle: &ContainerHandle,
    argv: &[String],
    env: &HashMap<String, String>,
) -> Result<String> {
    let builder = docker_builder().await?;
    let client = builder.client();

    let env_vars: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();

    let exec = client
        .create_exec(
            &handle.container_id,
            docktopus::bollard::exec::CreateExecOptions {
                cmd: Some(argv.to_vec()),
                env: Some(env_vars),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                ..Default::default()
            },
        )
        .await
        .map_err(|err| SandboxError::Docker(format!("creating exec: {err}")))?;

    client
        .start_exec(
            &exec.id,
            Some(docktopus::bollard::exec::StartExecOptions {
                detach: true,
                ..Default::default()
            }),
        )
        .await
        .map_err(|err| SandboxError::Docker(format!("starting detached exec: {err}")))?;

    Ok(exec.id)
}

/// Poll a detached exec's liveness, exit code, and in-container pid.
pub async fn exec_status(handle: &ContainerHandle, exec_id: &str) -> Result<ExecStatus> {
    let builder = docker_builder().await?;
    let inspect = builder
        .client()
        .inspect_exec(exec_id)
        .await
        .map_err(|err| SandboxError::Docker(format!("inspecting exec {exec_id} in {}: {err}", handle.container_id)))?;
    Ok(ExecStatus {
        running: inspect.running.unwrap_or(false),
        exit_code: inspect.exit_code,
        pid: inspect.pid,
    })
}

/// Send `SIGKILL` to `pid` inside `handle`'s container, used by the hard
/// timeout path to terminate a still-running target.
pub async fn kill_pid_in_sandbox(handle: &ContainerHandle, pid: i64) -> Result<()> {
    let argv = vec!["kill".to_string(), "-9".to_string(), pid.to_string()];
    exec_in_sandbox(handle, &argv, &HashMap::new()).await?;
    Ok(())
}

/// Fetch the container's stdout/stderr log tail, used when the in-sandbox
/// benchmarker's own stdout capture is unavailable (e.g. `user_emul=true`).
pub async fn container_logs(handle: &ContainerHandle) -> Result<String> {
    let builder = docker_builder().await?;
    let options = LogsOptions::<String> {
        stdout: true,
        stderr: true,
        tail: "200".to_string(),
        ..Default::default()
    };
    let mut stream = builder.client().logs(&handle.container_id, Some(options));
    let mut logs = String::new();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(log) => logs.push_str(&log.to_string()),
            Err(err) => {
                warn!(error = %err, "log stream error");
                break;
            }
        }
    }
    Ok(logs)
}

/// Stop and remove every container carrying the owner label, then forcibly
/// remove the session's image. Idempotent: safe to call with nothing left to
/// tear down (spec.md §4.4, §8 invariant 6).
pub async fn teardown(handle: &ContainerHandle) -> Result<()> {
    let builder = docker_builder().await?;
    let client = builder.client();

    match Container::from_id(client.clone(), &handle.container_id).await {
        Ok(mut container) => {
            if let Err(err) = container.stop().await {
                warn!(container_id = %handle.container_id, error = %err, "stop failed during teardown");
            }
            let remove_options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(err) = client
                .remove_container(&handle.container_id, Some(remove_options))
                .await
            {
                warn!(container_id = %handle.container_id, error = %err, "remove failed during teardown");
            }
        }
        Err(err) => {
            // Already gone: idempotent no-op.
            warn!(container_id = %handle.container_id, error = %err, "container missing during teardown");
        }
    }

    let remove_image_options = RemoveImageOptions {
        force: true,
        ..Default::default()
    };
    if let Err(err) = client.remove_image(&handle.image_ref, Some(remove_image_options), None).await {
        warn!(image = %handle.image_ref, error = %err, "image removal failed during teardown");
    }

    metrics().record_sandbox_removed();
    Ok(())
}

/// Default sampling interval shared by both on-host samplers, kept here so
/// callers configuring `run_sandbox`'s wait timeout can reason about it
/// alongside the hard timeout.
pub const DEFAULT_EXEC_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tar_with_dockerfile_produces_nonempty_archive() {
        let tar = tar_with_dockerfile("FROM scratch\n").unwrap();
        assert!(!tar.is_empty());
    }

    #[test]
    fn host_config_disables_network_when_requested() {
        let configuration = SessionConfiguration {
            network_disabled: true,
            ..Default::default()
        };
        let host_config = build_host_config(&configuration, None);
        assert_eq!(host_config.network_mode.as_deref(), Some("none"));
        assert_eq!(host_config.memory_swappiness, Some(0));
    }

    #[test]
    fn host_config_leaves_network_default_when_enabled() {
        let configuration = SessionConfiguration::default();
        let host_config = build_host_config(&configuration, None);
        assert_eq!(host_config.network_mode, None);
    }
}
