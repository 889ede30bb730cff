use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;

use foundry_common::TaskKind;

/// What a workload container is started from.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub task_id: String,
    pub user_id: String,
    pub kind: TaskKind,
    pub image: String,
    /// Host directory mounted at /workspace inside the container.
    pub work_dir: String,
    pub gpu_indices: Vec<u32>,
    pub config: Option<serde_json::Value>,
}

/// Container name for a task, e.g. "foundry-training-t42".
pub fn container_name(kind: TaskKind, task_id: &str) -> String {
    format!("foundry-{kind}-{task_id}")
}

/// Seam to the container engine, so the pipeline runs against docker in
/// production and an in-memory fake everywhere else.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start a detached workload container and return its instance id.
    async fn spawn(&self, spec: &SpawnSpec) -> Result<String>;

    /// Force-stop and remove a container.
    async fn kill(&self, instance: &str) -> Result<()>;

    /// Whether `instance` names a currently running container.
    async fn is_running(&self, instance: &str) -> bool;
}

/// Drives the docker CLI on the local host.
#[derive(Debug, Default)]
pub struct DockerRuntime;

impl DockerRuntime {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn spawn(&self, spec: &SpawnSpec) -> Result<String> {
        let name = container_name(spec.kind, &spec.task_id);
        let mut cmd = Command::new("docker");
        cmd.args(["run", "-d", "--name", &name]);

        if !spec.gpu_indices.is_empty() {
            let devices = spec
                .gpu_indices
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(",");
            cmd.args(["--gpus", &format!("\"device={devices}\"")]);
        }

        cmd.args(["-v", &format!("{}:/workspace", spec.work_dir)]);
        cmd.args(["-e", &format!("FOUNDRY_TASK_ID={}", spec.task_id)]);
        cmd.args(["-e", &format!("FOUNDRY_USER_ID={}", spec.user_id)]);
        cmd.args(["-e", &format!("FOUNDRY_TASK_KIND={}", spec.kind)]);
        if let Some(config) = &spec.config {
            cmd.args(["-e", &format!("FOUNDRY_TASK_CONFIG={config}")]);
        }
        cmd.arg(&spec.image);

        let output = cmd.output().await.context("failed to run docker")?;
        if !output.status.success() {
            bail!(
                "docker run failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let instance = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if instance.is_empty() {
            bail!("docker run printed no container id");
        }
        tracing::info!(container = %name, instance = %instance, "container started");
        Ok(instance)
    }

    async fn kill(&self, instance: &str) -> Result<()> {
        let output = Command::new("docker")
            .args(["stop", "-t", "10", instance])
            .output()
            .await
            .context("failed to run docker stop")?;
        if !output.status.success() {
            bail!(
                "docker stop failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        // removal is cleanup; the stop above is what kill answers for
        let _ = Command::new("docker")
            .args(["rm", "-f", instance])
            .output()
            .await;
        Ok(())
    }

    async fn is_running(&self, instance: &str) -> bool {
        let output = Command::new("docker")
            .args(["inspect", "-f", "{{.State.Running}}", instance])
            .output()
            .await;
        match output {
            Ok(out) if out.status.success() => {
                String::from_utf8_lossy(&out.stdout).trim() == "true"
            }
            _ => false,
        }
    }
}

/// In-memory runtime for tests and hosts without a container engine.
#[derive(Debug, Default)]
pub struct MockRuntime {
    running: Mutex<BTreeSet<String>>,
    fail_spawn: AtomicBool,
    spawn_calls: AtomicU64,
    kill_calls: AtomicU64,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent spawn fail, as if the engine were down.
    pub fn fail_spawns(&self) {
        self.fail_spawn.store(true, Ordering::SeqCst);
    }

    pub fn spawn_calls(&self) -> u64 {
        self.spawn_calls.load(Ordering::SeqCst)
    }

    pub fn kill_calls(&self) -> u64 {
        self.kill_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn spawn(&self, spec: &SpawnSpec) -> Result<String> {
        self.spawn_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_spawn.load(Ordering::SeqCst) {
            bail!("container engine is offline");
        }
        let instance = container_name(spec.kind, &spec.task_id);
        self.running.lock().await.insert(instance.clone());
        Ok(instance)
    }

    async fn kill(&self, instance: &str) -> Result<()> {
        self.kill_calls.fetch_add(1, Ordering::SeqCst);
        if !self.running.lock().await.remove(instance) {
            bail!("no such instance: {instance}");
        }
        Ok(())
    }

    async fn is_running(&self, instance: &str) -> bool {
        self.running.lock().await.contains(instance)
    }
}
