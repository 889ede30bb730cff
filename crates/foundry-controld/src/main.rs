mod args;
mod handlers;
mod metrics;
mod state;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use clap::Parser;

use foundry_common::telemetry::init_tracing;
use foundry_invoker::{
    sweep_loop, ContainerRuntime, DockerRuntime, InvokerContext, MockRuntime, Pipeline,
};
use foundry_lease::gpu::{FixedTelemetry, GpuTelemetry, NvidiaSmi};
use foundry_lease::{LeaseConfig, LeaseManager};
use foundry_meta::{EtcdMetaStore, MemoryMetaStore, MetaStore};
use foundry_relay::{
    dispatch_loop, retry_loop, ChannelSubscriber, EventRelay, LogSubscriber, RelayConfig,
    SubscriberRegistry, Topic, WebhookSubscriber,
};

use crate::args::Args;
use crate::handlers::{create_invocation, healthz, report_progress, task_events};
use crate::metrics::{metrics_handler, track_requests, Metrics};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let _otel = init_tracing(
        "foundry-controld",
        args.otlp_endpoint.as_deref(),
        args.otlp_token.as_deref(),
    );

    tracing::info!(listen_addr = %args.listen_addr, "foundry-controld starting...");

    let store: Arc<dyn MetaStore> = match &args.etcd_endpoint {
        Some(endpoint) => {
            let etcd = EtcdMetaStore::connect(std::slice::from_ref(endpoint)).await?;
            tracing::info!(endpoint = %endpoint, "connected to etcd");
            Arc::new(etcd)
        }
        None => {
            tracing::warn!("no etcd endpoint, state is in-memory and non-durable");
            Arc::new(MemoryMetaStore::new())
        }
    };

    let telemetry: Arc<dyn GpuTelemetry> = match args.mock_gpus {
        Some(count) => {
            tracing::warn!(count, "reporting fixed GPU telemetry");
            Arc::new(FixedTelemetry::idle(count, 80_000))
        }
        None => Arc::new(NvidiaSmi),
    };

    let lease = LeaseManager::new(
        store.clone(),
        telemetry,
        LeaseConfig {
            free_ratio_threshold: args.gpu_free_threshold,
            ttl: Duration::from_secs(args.lease_ttl_secs),
        },
    );

    let channels = ChannelSubscriber::new();
    let mut registry = SubscriberRegistry::new().register(Topic::Raw, channels.clone());
    if let Some(url) = &args.notify_url {
        let webhook = WebhookSubscriber::new(url, args.notify_token.as_deref())?;
        registry = registry.register(Topic::Raw, webhook);
        tracing::info!(url = %url, "webhook delivery enabled");
    }
    let registry = registry.register(Topic::Inner, LogSubscriber::new());

    let relay = EventRelay::new(
        store.clone(),
        registry,
        RelayConfig {
            stream_cap: args.stream_cap,
            retry_interval: Duration::from_secs(args.retry_interval_secs),
            rescan_interval: Duration::from_secs(args.rescan_interval_secs),
        },
    );

    let runtime: Arc<dyn ContainerRuntime> = if args.mock_runtime {
        tracing::warn!("using the mock container runtime, no executors will start");
        Arc::new(MockRuntime::new())
    } else {
        Arc::new(DockerRuntime::new())
    };

    let pipeline = Pipeline::new(InvokerContext {
        lease,
        relay: relay.clone(),
        runtime,
        sandbox_root: args.sandbox_root.clone(),
    });

    tokio::spawn(dispatch_loop(relay.clone()));
    tokio::spawn(retry_loop(relay.clone()));
    tokio::spawn(sweep_loop(
        pipeline.clone(),
        Duration::from_secs(args.lease_sweep_interval_secs),
    ));

    let st = AppState {
        pipeline,
        relay,
        channels,
        metrics: Arc::new(Metrics::default()),
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/v1/invocations", post(create_invocation))
        .route("/v1/progress", post(report_progress))
        .route("/v1/events/:user_id/:task_id", get(task_events))
        .layer(middleware::from_fn_with_state(st.clone(), track_requests))
        .with_state(st);

    let listener = tokio::net::TcpListener::bind(&args.listen_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
