use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Sse,
    },
    Json,
};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use uuid::Uuid;

use foundry_common::{namespace, GeneralResponse, TaskRequest, TaskState};

use crate::state::AppState;

pub async fn create_invocation(
    State(st): State<AppState>,
    Json(req): Json<TaskRequest>,
) -> Json<GeneralResponse> {
    let request_id = format!("req_{}", Uuid::new_v4());
    tracing::info!(
        request_id = %request_id,
        kind = %req.kind,
        task_id = %req.task_id,
        user_id = %req.user_id,
        "invocation received"
    );
    Json(st.pipeline.handle(&req).await)
}

pub async fn report_progress(
    State(st): State<AppState>,
    Json(event): Json<TaskState>,
) -> Json<GeneralResponse> {
    Json(st.pipeline.report_progress(&event).await)
}

/// Live task events for one `(user, task)` pair as server-sent events.
/// Only events published after the client connects are streamed; history
/// lives in the event stream, not here.
pub async fn task_events(
    State(st): State<AppState>,
    Path((user_id, task_id)): Path<(String, String)>,
) -> impl IntoResponse {
    let rx = st.channels.subscribe(&namespace(&user_id, &task_id));

    let stream = BroadcastStream::new(rx).filter_map(|item| match item {
        Ok(event) => serde_json::to_string(&event)
            .ok()
            .map(|json| Ok::<_, Infallible>(Event::default().data(json))),
        // lagged receivers skip ahead instead of closing the stream
        Err(_) => None,
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
