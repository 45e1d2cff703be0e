//! Per-conversation sandbox containers over the Docker API.
//!
//! One container per conversation id, addressed by the deterministic name
//! `sandbox-{conversation}`. Resource caps: 1 GiB memory without swap, 2
//! CPUs, 100 PIDs, read-only rootfs with tmpfs on /tmp and /var/tmp,
//! dropped capabilities, no-new-privileges, a dedicated bridge network, and
//! a single writable bind `{data-root}/{user}/{conv}/volume → /workspace`.
//!
//! Containers idle for five minutes are reaped; orphans left by a previous
//! process are force-removed on acquisition. Exec output streams through
//! the turn's event sink as it arrives; exits are classified as normal,
//! non-zero, OOM-killed, or timed out (137 without the OOM flag).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::HostConfig;
use bollard::network::CreateNetworkOptions;
use bollard::Docker;
use futures_util::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use stream_event::ChatEvent;

use crate::error::GatewayError;
use crate::provider::EventSink;

/// Idle time before a container is reaped.
pub const IDLE_TTL: Duration = Duration::from_secs(300);
/// Hard kill applied to every exec.
pub const EXEC_TIMEOUT_SECS: u64 = 300;

const MEMORY_LIMIT_BYTES: i64 = 1024 * 1024 * 1024;
const NANO_CPUS: i64 = 2_000_000_000;
const PIDS_LIMIT: i64 = 100;

/// Outcome of one sandbox exec.
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub oom_killed: bool,
    pub timed_out: bool,
}

struct Entry {
    container_name: String,
    user_id: String,
    volume: PathBuf,
    /// Bumped on every touch; a reap task fires only when its generation is
    /// still current.
    generation: u64,
}

/// Keeps characters safe for container names and host paths.
pub fn sanitize(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    out.truncate(48);
    let trimmed = out.trim_matches('-').to_string();
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed
    }
}

/// Deterministic host-side volume path for a conversation.
pub fn volume_path(data_root: &Path, user_id: &str, conversation_id: &str) -> PathBuf {
    data_root
        .join(sanitize(user_id))
        .join(sanitize(conversation_id))
        .join("volume")
}

/// Process-wide container manager; entries are owned exclusively here.
pub struct ContainerManager {
    docker: Docker,
    data_root: PathBuf,
    image: String,
    network: String,
    entries: Mutex<HashMap<String, Entry>>,
}

impl ContainerManager {
    /// Connects to the local Docker daemon.
    pub fn connect(
        data_root: impl Into<PathBuf>,
        image: impl Into<String>,
        network: impl Into<String>,
    ) -> Result<std::sync::Arc<Self>, GatewayError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| GatewayError::Sandbox(format!("docker connect: {e}")))?;
        Ok(std::sync::Arc::new(Self {
            docker,
            data_root: data_root.into(),
            image: image.into(),
            network: network.into(),
            entries: Mutex::new(HashMap::new()),
        }))
    }

    fn container_name(conversation_id: &str) -> String {
        format!("sandbox-{}", sanitize(conversation_id))
    }

    async fn is_running(&self, name: &str) -> bool {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => info
                .state
                .as_ref()
                .and_then(|s| s.running)
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn force_remove(&self, name: &str) {
        let _ = self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
    }

    async fn ensure_network(&self) {
        let result = self
            .docker
            .create_network(CreateNetworkOptions {
                name: self.network.clone(),
                driver: "bridge".to_string(),
                ..Default::default()
            })
            .await;
        if let Err(e) = result {
            // Already-exists conflicts are the normal case after the first run.
            debug!(network = %self.network, error = %e, "create_network");
        }
    }

    fn schedule_reap(self: &std::sync::Arc<Self>, conversation_id: String, generation: u64) {
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(IDLE_TTL).await;
            let name = {
                let mut entries = manager.entries.lock().await;
                match entries.get(&conversation_id) {
                    Some(entry) if entry.generation == generation => {
                        let name = entry.container_name.clone();
                        entries.remove(&conversation_id);
                        Some(name)
                    }
                    _ => None,
                }
            };
            if let Some(name) = name {
                info!(container = %name, "reaping idle sandbox");
                manager.force_remove(&name).await;
            }
        });
    }

    /// Touches the entry's idle timer; true when an entry exists.
    async fn refresh(self: &std::sync::Arc<Self>, conversation_id: &str) -> bool {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(conversation_id) {
            entry.generation += 1;
            let generation = entry.generation;
            drop(entries);
            self.schedule_reap(conversation_id.to_string(), generation);
            true
        } else {
            false
        }
    }

    /// Returns the conversation's container, creating it on first use.
    pub async fn get_or_create(
        self: &std::sync::Arc<Self>,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<String, GatewayError> {
        {
            let entries = self.entries.lock().await;
            if let Some(entry) = entries.get(conversation_id) {
                let name = entry.container_name.clone();
                drop(entries);
                if self.is_running(&name).await {
                    self.refresh(conversation_id).await;
                    return Ok(name);
                }
                // Dead container: drop the entry and rebuild below.
                self.entries.lock().await.remove(conversation_id);
            } else {
                drop(entries);
            }
        }

        let name = Self::container_name(conversation_id);
        // Remove any orphan left by a previous process run.
        self.force_remove(&name).await;
        self.ensure_network().await;

        let volume = volume_path(&self.data_root, user_id, conversation_id);
        std::fs::create_dir_all(&volume)
            .map_err(|e| GatewayError::Sandbox(format!("create volume dir: {e}")))?;
        let volume_abs = volume
            .canonicalize()
            .map_err(|e| GatewayError::Sandbox(format!("resolve volume dir: {e}")))?;

        let mut tmpfs = HashMap::new();
        tmpfs.insert("/tmp".to_string(), "rw,size=256m".to_string());
        tmpfs.insert("/var/tmp".to_string(), "rw,size=64m".to_string());

        let host_config = HostConfig {
            memory: Some(MEMORY_LIMIT_BYTES),
            memory_swap: Some(MEMORY_LIMIT_BYTES),
            nano_cpus: Some(NANO_CPUS),
            pids_limit: Some(PIDS_LIMIT),
            readonly_rootfs: Some(true),
            tmpfs: Some(tmpfs),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            network_mode: Some(self.network.clone()),
            binds: Some(vec![format!("{}:/workspace", volume_abs.display())]),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                Config {
                    image: Some(self.image.clone()),
                    cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
                    working_dir: Some("/workspace".to_string()),
                    host_config: Some(host_config),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| GatewayError::Sandbox(format!("create container: {e}")))?;
        self.docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| GatewayError::Sandbox(format!("start container: {e}")))?;
        info!(container = %name, image = %self.image, "sandbox created");

        let mut entries = self.entries.lock().await;
        entries.insert(
            conversation_id.to_string(),
            Entry {
                container_name: name.clone(),
                user_id: user_id.to_string(),
                volume,
                generation: 0,
            },
        );
        drop(entries);
        self.schedule_reap(conversation_id.to_string(), 0);
        Ok(name)
    }

    /// Runs a command in the conversation's container, streaming output
    /// through the sink as it arrives.
    pub async fn exec(
        self: &std::sync::Arc<Self>,
        conversation_id: &str,
        user_id: &str,
        command: &str,
        workdir: Option<&str>,
        sink: &EventSink,
    ) -> Result<ExecOutcome, GatewayError> {
        let name = self.get_or_create(conversation_id, user_id).await?;
        self.refresh(conversation_id).await;

        // Array form needs no shell quoting; timeout delivers the 137 guard.
        let cmd = vec![
            "timeout".to_string(),
            "-s".to_string(),
            "KILL".to_string(),
            EXEC_TIMEOUT_SECS.to_string(),
            "/bin/sh".to_string(),
            "-c".to_string(),
            command.to_string(),
        ];
        let exec = self
            .docker
            .create_exec(
                &name,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: Some(workdir.unwrap_or("/workspace").to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| GatewayError::Sandbox(format!("create exec: {e}")))?;

        let mut outcome = ExecOutcome::default();
        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| GatewayError::Sandbox(format!("start exec: {e}")))?;
        if let StartExecResults::Attached { mut output, .. } = started {
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => {
                        let text = String::from_utf8_lossy(&message).to_string();
                        outcome.stdout.push_str(&text);
                        sink.emit(ChatEvent::ToolOutput { content: text }).await;
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        let text = String::from_utf8_lossy(&message).to_string();
                        outcome.stderr.push_str(&text);
                        sink.emit(ChatEvent::ToolOutput { content: text }).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "exec stream error");
                        break;
                    }
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| GatewayError::Sandbox(format!("inspect exec: {e}")))?;
        outcome.exit_code = inspect.exit_code.unwrap_or(-1);

        // OOM shows on the container state, not the exec.
        if let Ok(info) = self
            .docker
            .inspect_container(&name, None::<InspectContainerOptions>)
            .await
        {
            outcome.oom_killed = info
                .state
                .as_ref()
                .and_then(|s| s.oom_killed)
                .unwrap_or(false);
        }
        outcome.timed_out = outcome.exit_code == 137 && !outcome.oom_killed;
        debug!(
            container = %name,
            exit_code = outcome.exit_code,
            oom = outcome.oom_killed,
            timed_out = outcome.timed_out,
            "sandbox exec finished"
        );
        Ok(outcome)
    }

    /// Host-side volume root for a conversation's sandbox, when one is
    /// tracked; falls back to the deterministic path otherwise.
    pub async fn volume_for(&self, conversation_id: &str, user_id: &str) -> PathBuf {
        let entries = self.entries.lock().await;
        entries
            .get(conversation_id)
            .map(|e| e.volume.clone())
            .unwrap_or_else(|| volume_path(&self.data_root, user_id, conversation_id))
    }

    /// Whether a live container is tracked for this conversation.
    pub async fn is_alive(&self, conversation_id: &str) -> bool {
        let name = {
            let entries = self.entries.lock().await;
            entries
                .get(conversation_id)
                .map(|e| e.container_name.clone())
        };
        match name {
            Some(name) => self.is_running(&name).await,
            None => false,
        }
    }

    /// Stops and removes every managed container (process shutdown).
    pub async fn shutdown_all(&self) {
        let drained: Vec<(String, Entry)> = {
            let mut entries = self.entries.lock().await;
            entries.drain().collect()
        };
        for (conversation, entry) in drained {
            info!(
                container = %entry.container_name,
                conversation = %conversation,
                user = %entry.user_id,
                "removing sandbox on shutdown"
            );
            self.force_remove(&entry.container_name).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: sanitization lowercases, strips separators, and bounds
    /// length; container names are deterministic per conversation.
    #[test]
    fn sanitize_and_name() {
        assert_eq!(sanitize("Conv_42!x"), "conv-42-x");
        assert_eq!(sanitize("user@example.com"), "user-example-com");
        assert_eq!(sanitize("---"), "unnamed");
        assert!(sanitize(&"a".repeat(100)).len() <= 48);
        assert_eq!(
            ContainerManager::container_name("Conv 1"),
            "sandbox-conv-1"
        );
    }

    /// **Scenario**: the volume path is deterministic under the data root.
    #[test]
    fn volume_path_is_deterministic() {
        let p = volume_path(Path::new("/data"), "User@Example.com", "Conv 1");
        assert_eq!(p, PathBuf::from("/data/user-example-com/conv-1/volume"));
    }
}
