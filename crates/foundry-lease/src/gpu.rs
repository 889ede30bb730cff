use async_trait::async_trait;
use tokio::process::Command;

use foundry_common::GpuStatus;

/// Source of GPU memory readings.
#[async_trait]
pub trait GpuTelemetry: Send + Sync {
    /// Sample all GPUs on this host. Empty when nothing could be read;
    /// a host that cannot report its GPUs has none to lease out.
    async fn sample(&self) -> Vec<GpuStatus>;
}

/// Reads GPU memory through `nvidia-smi`.
pub struct NvidiaSmi;

#[async_trait]
impl GpuTelemetry for NvidiaSmi {
    async fn sample(&self) -> Vec<GpuStatus> {
        let output = Command::new("nvidia-smi")
            .arg("--query-gpu=memory.total,memory.used")
            .arg("--format=csv,noheader,nounits")
            .output()
            .await;

        let Ok(output) = output else {
            return Vec::new();
        };
        if !output.status.success() {
            return Vec::new();
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut out = Vec::new();
        for (idx, line) in stdout.lines().enumerate() {
            let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
            if parts.len() < 2 {
                continue;
            }
            out.push(GpuStatus {
                index: idx as u32,
                memory_total_mb: parts[0].parse::<u64>().unwrap_or(0),
                memory_used_mb: parts[1].parse::<u64>().unwrap_or(0),
            });
        }
        out
    }
}

/// Fixed readings for tests and hosts without GPUs.
pub struct FixedTelemetry {
    gpus: Vec<GpuStatus>,
}

impl FixedTelemetry {
    pub fn new(gpus: Vec<GpuStatus>) -> Self {
        Self { gpus }
    }

    /// `count` idle GPUs with `memory_total_mb` of memory each.
    pub fn idle(count: u32, memory_total_mb: u64) -> Self {
        let gpus = (0..count)
            .map(|index| GpuStatus {
                index,
                memory_total_mb,
                memory_used_mb: 0,
            })
            .collect();
        Self { gpus }
    }
}

#[async_trait]
impl GpuTelemetry for FixedTelemetry {
    async fn sample(&self) -> Vec<GpuStatus> {
        self.gpus.clone()
    }
}
