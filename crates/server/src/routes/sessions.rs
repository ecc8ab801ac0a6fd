use std::{convert::Infallible, time::Duration};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::HeaderValue,
    response::{
        IntoResponse, Json as ResponseJson, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use db::models::artifact::Artifact;
use futures::StreamExt;
use generation::{GenerationEvent, TargetSpec, WireEvent};
use serde::{Deserialize, Serialize};
use services::services::navigator::{
    BatchPlan, CommitMode, EditSession, NavigatorError, SessionSnapshot, SharedSession,
};
use ts_rs::TS;
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{AppState, error::ApiError, middleware::BATCH_ID_HEADER};

#[derive(Debug, Default, Deserialize, TS)]
pub struct CreateSessionPayload {
    /// Leaf to open; omit to start a prompt-only session
    #[ts(optional)]
    pub artifact_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, TS)]
pub struct MoveCursorPayload {
    #[ts(optional)]
    pub index: Option<usize>,
    #[ts(optional)]
    pub artifact_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, TS)]
pub struct EditPayload {
    pub instruction: String,
    pub provider_ids: Vec<String>,
    #[serde(default)]
    pub target: TargetSpec,
}

#[derive(Debug, Deserialize, TS)]
pub struct RegeneratePayload {
    pub provider_ids: Vec<String>,
    #[serde(default)]
    pub target: TargetSpec,
}

#[derive(Debug, Deserialize, TS)]
pub struct CommitPayload {
    pub batch_id: Uuid,
    pub provider_id: String,
    #[serde(default)]
    pub mode: CommitMode,
}

#[derive(Debug, Serialize, Deserialize, TS)]
pub struct CommitResponse {
    pub artifact: Artifact,
    pub session: SessionSnapshot,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sessions", post(create_session))
        .route("/sessions/{id}", get(get_session).delete(close_session))
        .route("/sessions/{id}/cursor", post(move_cursor))
        .route("/sessions/{id}/edit", post(edit))
        .route("/sessions/{id}/regenerate", post(regenerate))
        .route("/sessions/{id}/commit", post(commit))
        .route("/sessions/{id}/discard", post(discard))
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(payload): Json<CreateSessionPayload>,
) -> Result<ResponseJson<ApiResponse<SessionSnapshot>>, ApiError> {
    let session = match payload.artifact_id {
        Some(leaf_id) => EditSession::open(state.pool(), leaf_id).await?,
        None => EditSession::new(),
    };
    let snapshot = session.snapshot();
    state.insert_session(session);
    tracing::info!(session_id = %snapshot.id, "Opened editing session");
    Ok(ResponseJson(ApiResponse::success(snapshot)))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<SessionSnapshot>>, ApiError> {
    let session = state.session(id)?;
    let snapshot = session.lock().await.snapshot();
    Ok(ResponseJson(ApiResponse::success(snapshot)))
}

pub async fn close_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    state
        .remove_session(id)
        .ok_or_else(|| ApiError::NotFound(format!("Session {id} not found")))?;
    Ok(ResponseJson(ApiResponse::success(())))
}

pub async fn move_cursor(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<MoveCursorPayload>,
) -> Result<ResponseJson<ApiResponse<SessionSnapshot>>, ApiError> {
    let session = state.session(id)?;
    let mut session = session.lock().await;
    match (payload.index, payload.artifact_id) {
        (Some(index), None) => session.move_cursor(index)?,
        (None, Some(artifact_id)) => session.select(artifact_id)?,
        _ => {
            return Err(ApiError::BadRequest(
                "Provide exactly one of index or artifact_id".into(),
            ));
        }
    };
    Ok(ResponseJson(ApiResponse::success(session.snapshot())))
}

pub async fn edit(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<EditPayload>,
) -> Result<Response, ApiError> {
    let session = state.session(id)?;
    let plan = session.lock().await.begin_edit(&payload.instruction);
    launch_batch(state, session, plan, payload.provider_ids, payload.target).await
}

pub async fn regenerate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<RegeneratePayload>,
) -> Result<Response, ApiError> {
    let session = state.session(id)?;
    let plan = session.lock().await.begin_regenerate()?;
    launch_batch(state, session, plan, payload.provider_ids, payload.target).await
}

/// Starts the batch and streams each provider result as an SSE event. Results
/// are recorded on the session as they arrive; a disconnected caller simply
/// stops receiving them.
async fn launch_batch(
    state: AppState,
    session: SharedSession,
    plan: BatchPlan,
    provider_ids: Vec<String>,
    target: TargetSpec,
) -> Result<Response, ApiError> {
    let batch_id = plan.batch_id;
    let launched = match plan.to_request(state.blobs(), provider_ids, target).await {
        Ok(request) => state.orchestrator().stream(request).map_err(ApiError::from),
        Err(err) => Err(ApiError::from(err)),
    };
    let events = match launched {
        Ok(events) => events,
        Err(err) => {
            if let Err(abort_err) = session.lock().await.abort_batch(batch_id) {
                tracing::debug!(batch_id = %batch_id, "Batch already superseded: {}", abort_err);
            }
            return Err(err);
        }
    };

    let stream = events.then(move |event| {
        let session = session.clone();
        async move {
            {
                let mut session = session.lock().await;
                let recorded = match &event {
                    GenerationEvent::Result(result) => session.record_result(batch_id, result.clone()),
                    GenerationEvent::Done(_) => session.finish_batch(batch_id),
                };
                match recorded {
                    Ok(()) => {}
                    Err(NavigatorError::StaleBatch(_)) => {
                        tracing::debug!(batch_id = %batch_id, "Ignoring event for superseded batch");
                    }
                    Err(err) => tracing::warn!(batch_id = %batch_id, "Could not record event: {}", err),
                }
            }
            Ok::<Event, Infallible>(sse_event(&WireEvent::from(&event)))
        }
    });

    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keepalive"))
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&batch_id.to_string()) {
        response.headers_mut().insert(BATCH_ID_HEADER, value);
    }
    Ok(response)
}

fn sse_event(wire: &WireEvent) -> Event {
    match serde_json::to_string(wire) {
        Ok(json) => Event::default().event(wire.name()).data(json),
        Err(err) => {
            tracing::error!("Failed to serialize generation event: {}", err);
            Event::default().comment("error")
        }
    }
}

pub async fn commit(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CommitPayload>,
) -> Result<ResponseJson<ApiResponse<CommitResponse>>, ApiError> {
    let session = state.session(id)?;
    let mut session = session.lock().await;
    let artifact = session
        .commit(
            state.pool(),
            state.blobs(),
            payload.batch_id,
            &payload.provider_id,
            payload.mode,
        )
        .await?;
    Ok(ResponseJson(ApiResponse::success(CommitResponse {
        artifact,
        session: session.snapshot(),
    })))
}

pub async fn discard(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<SessionSnapshot>>, ApiError> {
    let session = state.session(id)?;
    let mut session = session.lock().await;
    session.discard()?;
    Ok(ResponseJson(ApiResponse::success(session.snapshot())))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use generation::{FailureKind, testing::Script};
    use serde_json::{Value, json};
    use services::services::navigator::SessionState;

    use super::*;
    use crate::routes::test_support::*;

    async fn upload(app: &Router) -> Artifact {
        body_json::<Artifact>(send(app, multipart_upload(b"v1 pixels", "image/png")).await)
            .await
            .into_data()
            .unwrap()
    }

    async fn open(app: &Router, leaf_id: Uuid) -> SessionSnapshot {
        let response = send(app, post_json("/api/sessions", json!({ "artifact_id": leaf_id }))).await;
        assert_eq!(response.status(), StatusCode::OK);
        body_json::<SessionSnapshot>(response).await.into_data().unwrap()
    }

    /// Runs an SSE batch to completion and returns its id with the decoded events.
    async fn run_batch(app: &Router, uri: &str, body: Value) -> (Uuid, Vec<(String, Value)>) {
        let response = send(app, post_json(uri, body)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let batch_id = response.headers()[BATCH_ID_HEADER].to_str().unwrap().parse().unwrap();
        let text = String::from_utf8(body_bytes(response).await).unwrap();

        let events = text
            .split("\n\n")
            .filter_map(|frame| {
                let name = frame.lines().find_map(|l| l.strip_prefix("event: "))?;
                let data = frame.lines().find_map(|l| l.strip_prefix("data: "))?;
                Some((name.to_string(), serde_json::from_str(data).unwrap()))
            })
            .collect();
        (batch_id, events)
    }

    #[tokio::test]
    async fn edit_streams_results_and_commits_one() {
        let (app, _) = test_app(vec![
            ("sdxl", Script::Succeed),
            ("dalle", Script::Fail(FailureKind::PolicyRejected)),
        ])
        .await;
        let v1 = upload(&app).await;
        let session = open(&app, v1.id).await;

        let (batch_id, events) = run_batch(
            &app,
            &format!("/api/sessions/{}/edit", session.id),
            json!({ "instruction": "add hat", "provider_ids": ["sdxl", "dalle"] }),
        )
        .await;

        assert_eq!(events.len(), 3);
        assert!(events[..2].iter().all(|(name, data)| name == "result" && data["type"] == "result"));
        let (done_name, done) = &events[2];
        assert_eq!(done_name, "done");
        assert_eq!(done["successCount"], 1);
        assert_eq!(done["totalCount"], 2);
        let failed = events.iter().find(|(_, d)| d["providerId"] == "dalle").unwrap();
        assert_eq!(failed.1["error"]["kind"], "policy_rejected");

        let snapshot = send(&app, get_request(&format!("/api/sessions/{}", session.id))).await;
        let snapshot = body_json::<SessionSnapshot>(snapshot).await.into_data().unwrap();
        assert_eq!(snapshot.state, SessionState::ResultsReady);

        let commit_uri = format!("/api/sessions/{}/commit", session.id);
        let rejected = send(
            &app,
            post_json(&commit_uri, json!({ "batch_id": batch_id, "provider_id": "dalle" })),
        )
        .await;
        assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);

        let committed = send(
            &app,
            post_json(&commit_uri, json!({ "batch_id": batch_id, "provider_id": "sdxl" })),
        )
        .await;
        assert_eq!(committed.status(), StatusCode::OK);
        let committed = body_json::<CommitResponse>(committed).await.into_data().unwrap();
        assert_eq!(committed.artifact.version, 2);
        assert_eq!(committed.artifact.parent_artifact_id, Some(v1.id));
        assert_eq!(committed.session.state, SessionState::Committed);
        assert_eq!(committed.session.chain.len(), 2);

        let again = send(
            &app,
            post_json(&commit_uri, json!({ "batch_id": batch_id, "provider_id": "sdxl" })),
        )
        .await;
        assert_eq!(again.status(), StatusCode::BAD_REQUEST);

        let content = send(&app, get_request(&format!("/api/artifacts/{}/content", committed.artifact.id))).await;
        assert_eq!(body_bytes(content).await, b"image-from-sdxl");
    }

    #[tokio::test]
    async fn racing_sessions_on_one_tip_conflict() {
        let (app, _) = test_app(vec![("sdxl", Script::Succeed)]).await;
        let v1 = upload(&app).await;
        let first = open(&app, v1.id).await;
        let second = open(&app, v1.id).await;

        let mut batches = Vec::new();
        for session in [&first, &second] {
            let (batch_id, _) = run_batch(
                &app,
                &format!("/api/sessions/{}/edit", session.id),
                json!({ "instruction": "darker", "provider_ids": ["sdxl"] }),
            )
            .await;
            batches.push((session.id, batch_id));
        }

        let statuses = {
            let mut statuses = Vec::new();
            for (session_id, batch_id) in batches {
                let response = send(
                    &app,
                    post_json(
                        &format!("/api/sessions/{session_id}/commit"),
                        json!({ "batch_id": batch_id, "provider_id": "sdxl" }),
                    ),
                )
                .await;
                statuses.push(response.status());
            }
            statuses
        };
        assert_eq!(statuses, vec![StatusCode::OK, StatusCode::CONFLICT]);
    }

    #[tokio::test]
    async fn regenerate_appends_sibling_of_current_version() {
        let (app, _) = test_app(vec![("sdxl", Script::Succeed)]).await;
        let v1 = upload(&app).await;
        let session = open(&app, v1.id).await;
        let edit_uri = format!("/api/sessions/{}/edit", session.id);
        let commit_uri = format!("/api/sessions/{}/commit", session.id);

        let mut committed = Vec::new();
        for instruction in ["add hat", "darker"] {
            let (batch_id, _) = run_batch(
                &app,
                &edit_uri,
                json!({ "instruction": instruction, "provider_ids": ["sdxl"] }),
            )
            .await;
            let response = send(&app, post_json(&commit_uri, json!({ "batch_id": batch_id, "provider_id": "sdxl" }))).await;
            committed.push(body_json::<CommitResponse>(response).await.into_data().unwrap().artifact);
        }
        let (v2, v3) = (&committed[0], &committed[1]);

        let (batch_id, events) = run_batch(
            &app,
            &format!("/api/sessions/{}/regenerate", session.id),
            json!({ "provider_ids": ["sdxl"] }),
        )
        .await;
        assert_eq!(events.last().map(|(name, _)| name.as_str()), Some("done"));
        let response = send(&app, post_json(&commit_uri, json!({ "batch_id": batch_id, "provider_id": "sdxl" }))).await;
        let v4 = body_json::<CommitResponse>(response).await.into_data().unwrap().artifact;

        assert_eq!(v4.parent_artifact_id, Some(v2.id));
        let chain = send(&app, get_request(&format!("/api/artifacts/{}/chain", v3.id))).await;
        let chain: Vec<Uuid> = body_json::<Vec<Artifact>>(chain)
            .await
            .into_data()
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(chain, vec![v1.id, v2.id, v3.id]);

        let children = send(&app, get_request(&format!("/api/artifacts/{}/children", v2.id))).await;
        let children = body_json::<Vec<Artifact>>(children).await.into_data().unwrap();
        assert_eq!(children.len(), 2);
    }

    #[tokio::test]
    async fn invalid_requests_leave_session_idle() {
        let (app, _) = test_app(vec![("sdxl", Script::Succeed)]).await;
        let v1 = upload(&app).await;
        let session = open(&app, v1.id).await;

        let unknown = send(
            &app,
            post_json(
                &format!("/api/sessions/{}/edit", session.id),
                json!({ "instruction": "add hat", "provider_ids": ["nope"] }),
            ),
        )
        .await;
        assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);

        let root_regen = send(
            &app,
            post_json(
                &format!("/api/sessions/{}/regenerate", session.id),
                json!({ "provider_ids": ["sdxl"] }),
            ),
        )
        .await;
        assert_eq!(root_regen.status(), StatusCode::BAD_REQUEST);

        let snapshot = send(&app, get_request(&format!("/api/sessions/{}", session.id))).await;
        let snapshot = body_json::<SessionSnapshot>(snapshot).await.into_data().unwrap();
        assert_eq!(snapshot.state, SessionState::Idle);
        assert!(snapshot.batch.is_none());

        let missing = send(&app, get_request(&format!("/api/sessions/{}", Uuid::new_v4()))).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn prompt_session_generates_a_new_root() {
        let (app, _) = test_app(vec![("sdxl", Script::Succeed)]).await;
        let response = send(&app, post_json("/api/sessions", json!({}))).await;
        let session = body_json::<SessionSnapshot>(response).await.into_data().unwrap();
        assert!(session.chain.is_empty());

        let (batch_id, _) = run_batch(
            &app,
            &format!("/api/sessions/{}/edit", session.id),
            json!({ "instruction": "a lighthouse at dusk", "provider_ids": ["sdxl"], "target": { "aspect_ratio": "16:9" } }),
        )
        .await;
        let response = send(
            &app,
            post_json(
                &format!("/api/sessions/{}/commit", session.id),
                json!({ "batch_id": batch_id, "provider_id": "sdxl", "mode": "save" }),
            ),
        )
        .await;
        let root = body_json::<CommitResponse>(response).await.into_data().unwrap().artifact;
        assert_eq!(root.version, 1);
        assert!(root.is_root());

        let cursor = send(
            &app,
            post_json(&format!("/api/sessions/{}/cursor", session.id), json!({ "index": 0 })),
        )
        .await;
        assert_eq!(cursor.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn abandoned_sessions_are_evicted_after_their_batches() {
        let (app, state) = test_app(vec![("sdxl", Script::Succeed)]).await;
        let v1 = upload(&app).await;

        let mut abandoned = Vec::new();
        for _ in 0..5 {
            let session = open(&app, v1.id).await;
            run_batch(
                &app,
                &format!("/api/sessions/{}/edit", session.id),
                json!({ "instruction": "darker", "provider_ids": ["sdxl"] }),
            )
            .await;
            abandoned.push(session.id);
        }
        assert_eq!(state.sessions().len(), 5);

        assert_eq!(state.sessions().evict_idle(Duration::ZERO), 5);
        assert!(state.sessions().is_empty());
        for id in abandoned {
            let response = send(&app, get_request(&format!("/api/sessions/{id}"))).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }
    }
}
