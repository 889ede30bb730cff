use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::state::AppState;

#[derive(Debug, Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub requests_inflight: AtomicU64,
    pub status_2xx: AtomicU64,
    pub status_4xx: AtomicU64,
    pub status_5xx: AtomicU64,
}

pub fn render_metrics(st: &AppState) -> String {
    let mut body = String::new();

    body.push_str(&format!(
        "# HELP foundry_controld_requests_total Total HTTP requests handled.\n\
         # TYPE foundry_controld_requests_total counter\n\
         foundry_controld_requests_total {}\n",
        st.metrics.requests_total.load(Ordering::Relaxed),
    ));
    body.push_str(&format!(
        "# HELP foundry_controld_requests_inflight Currently in-flight requests.\n\
         # TYPE foundry_controld_requests_inflight gauge\n\
         foundry_controld_requests_inflight {}\n",
        st.metrics.requests_inflight.load(Ordering::Relaxed),
    ));
    body.push_str(&format!(
        "# HELP foundry_controld_responses_2xx Total 2xx responses.\n\
         # TYPE foundry_controld_responses_2xx counter\n\
         foundry_controld_responses_2xx {}\n",
        st.metrics.status_2xx.load(Ordering::Relaxed),
    ));
    body.push_str(&format!(
        "# HELP foundry_controld_responses_4xx Total 4xx responses.\n\
         # TYPE foundry_controld_responses_4xx counter\n\
         foundry_controld_responses_4xx {}\n",
        st.metrics.status_4xx.load(Ordering::Relaxed),
    ));
    body.push_str(&format!(
        "# HELP foundry_controld_responses_5xx Total 5xx responses.\n\
         # TYPE foundry_controld_responses_5xx counter\n\
         foundry_controld_responses_5xx {}\n",
        st.metrics.status_5xx.load(Ordering::Relaxed),
    ));

    let pipeline = st.pipeline.metrics();
    body.push_str(&format!(
        "# HELP foundry_controld_invocations_total Task invocations received.\n\
         # TYPE foundry_controld_invocations_total counter\n\
         foundry_controld_invocations_total {}\n",
        pipeline.invocations(),
    ));
    body.push_str(&format!(
        "# HELP foundry_controld_invocations_rejected Invocations failing the prerequisite check.\n\
         # TYPE foundry_controld_invocations_rejected counter\n\
         foundry_controld_invocations_rejected {}\n",
        pipeline.invocations_rejected(),
    ));
    body.push_str(&format!(
        "# HELP foundry_controld_invocations_failed Invocations failing during execution.\n\
         # TYPE foundry_controld_invocations_failed counter\n\
         foundry_controld_invocations_failed {}\n",
        pipeline.invocations_failed(),
    ));
    body.push_str(&format!(
        "# HELP foundry_controld_progress_reports Executor progress reports received.\n\
         # TYPE foundry_controld_progress_reports counter\n\
         foundry_controld_progress_reports {}\n",
        pipeline.progress_reports(),
    ));
    body.push_str(&format!(
        "# HELP foundry_controld_lease_sweeps Completed lease expiry sweeps.\n\
         # TYPE foundry_controld_lease_sweeps counter\n\
         foundry_controld_lease_sweeps {}\n",
        pipeline.sweeps(),
    ));
    body.push_str(&format!(
        "# HELP foundry_controld_tasks_expired Tasks failed by lease expiry.\n\
         # TYPE foundry_controld_tasks_expired counter\n\
         foundry_controld_tasks_expired {}\n",
        pipeline.tasks_expired(),
    ));

    let relay = st.relay.metrics();
    body.push_str(&format!(
        "# HELP foundry_relay_events_published Events appended to the stream.\n\
         # TYPE foundry_relay_events_published counter\n\
         foundry_relay_events_published {}\n",
        relay.events_published(),
    ));
    body.push_str(&format!(
        "# HELP foundry_relay_entries_trimmed Stream entries dropped by the capacity trim.\n\
         # TYPE foundry_relay_entries_trimmed counter\n\
         foundry_relay_entries_trimmed {}\n",
        relay.entries_trimmed(),
    ));
    body.push_str(&format!(
        "# HELP foundry_relay_deliveries_ok Deliveries accepted by every subscriber.\n\
         # TYPE foundry_relay_deliveries_ok counter\n\
         foundry_relay_deliveries_ok {}\n",
        relay.deliveries_ok(),
    ));
    body.push_str(&format!(
        "# HELP foundry_relay_deliveries_retried Deliveries scheduled for another attempt.\n\
         # TYPE foundry_relay_deliveries_retried counter\n\
         foundry_relay_deliveries_retried {}\n",
        relay.deliveries_retried(),
    ));
    body.push_str(&format!(
        "# HELP foundry_relay_deliveries_abandoned Deliveries given up after falling behind the stream.\n\
         # TYPE foundry_relay_deliveries_abandoned counter\n\
         foundry_relay_deliveries_abandoned {}\n",
        relay.deliveries_abandoned(),
    ));
    body.push_str(&format!(
        "# HELP foundry_relay_dedup_hits Duplicate events collapsed onto an existing delivery.\n\
         # TYPE foundry_relay_dedup_hits counter\n\
         foundry_relay_dedup_hits {}\n",
        relay.dedup_hits(),
    ));
    body.push_str(&format!(
        "# HELP foundry_relay_records_pruned Settled delivery records removed by the sweeper.\n\
         # TYPE foundry_relay_records_pruned counter\n\
         foundry_relay_records_pruned {}\n",
        relay.records_pruned(),
    ));

    body
}

pub async fn metrics_handler(State(st): State<AppState>) -> impl IntoResponse {
    let body = render_metrics(&st);
    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

pub async fn track_requests(
    State(st): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, std::convert::Infallible> {
    st.metrics.requests_inflight.fetch_add(1, Ordering::Relaxed);
    let resp = next.run(req).await;
    st.metrics.requests_inflight.fetch_sub(1, Ordering::Relaxed);
    st.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

    let status = resp.status().as_u16();
    if status >= 500 {
        st.metrics.status_5xx.fetch_add(1, Ordering::Relaxed);
    } else if status >= 400 {
        st.metrics.status_4xx.fetch_add(1, Ordering::Relaxed);
    } else if status >= 200 {
        st.metrics.status_2xx.fetch_add(1, Ordering::Relaxed);
    }

    Ok(resp)
}
