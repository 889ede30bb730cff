use clap::Parser;

#[derive(Debug, Parser)]
pub struct Args {
    #[arg(long, env = "FOUNDRY_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// etcd endpoint backing the control plane. Without it, state lives in
    /// process memory and dies with the process (single-node dev mode).
    #[arg(long, env = "FOUNDRY_ETCD_ENDPOINT")]
    pub etcd_endpoint: Option<String>,

    /// Report this many idle GPUs instead of sampling nvidia-smi.
    #[arg(long)]
    pub mock_gpus: Option<u32>,

    /// Track executors in memory instead of driving docker.
    #[arg(long, default_value_t = false)]
    pub mock_runtime: bool,

    /// Free-memory fraction a GPU must exceed to count as leasable.
    #[arg(long, default_value_t = 0.8)]
    pub gpu_free_threshold: f64,

    #[arg(long, default_value_t = 180)]
    pub lease_ttl_secs: u64,

    #[arg(long, default_value_t = 30)]
    pub lease_sweep_interval_secs: u64,

    /// Retained event stream entries before the oldest are trimmed.
    #[arg(long, default_value_t = 1_728_000)]
    pub stream_cap: u64,

    #[arg(long, default_value_t = 60)]
    pub retry_interval_secs: u64,

    #[arg(long, default_value_t = 30)]
    pub rescan_interval_secs: u64,

    /// Directory holding the sandbox install, including its VERSION file.
    #[arg(long, env = "FOUNDRY_SANDBOX_ROOT", default_value = "/opt/foundry/sandbox")]
    pub sandbox_root: String,

    /// Webhook URL task events are POSTed to (e.g. "http://10.21.11.92:8742/notify").
    /// If not set, webhook delivery is disabled.
    #[arg(long, env = "FOUNDRY_NOTIFY_URL")]
    pub notify_url: Option<String>,

    /// Webhook bearer token for authentication.
    #[arg(long, env = "FOUNDRY_NOTIFY_TOKEN")]
    pub notify_token: Option<String>,

    /// OTLP collector base URL for span export. If not set, spans stay local.
    #[arg(long, env = "FOUNDRY_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    #[arg(long, env = "FOUNDRY_OTLP_TOKEN")]
    pub otlp_token: Option<String>,
}
