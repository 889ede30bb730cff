use serde::{Deserialize, Serialize};

/// Point-in-time memory status of one GPU, as sampled from the driver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GpuStatus {
    pub index: u32,
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
}

impl GpuStatus {
    /// Fraction of memory currently free, in [0.0, 1.0].
    pub fn memory_free_ratio(&self) -> f64 {
        if self.memory_total_mb == 0 {
            return 0.0;
        }
        let free = self.memory_total_mb.saturating_sub(self.memory_used_mb);
        free as f64 / self.memory_total_mb as f64
    }
}
