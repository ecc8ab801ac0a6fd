use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{HeaderValue, header},
    response::{Json as ResponseJson, Response},
    routing::{get, post},
};
use db::models::artifact::{Artifact, ArtifactType, CreateRootArtifact, ForkArtifact};
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{AppState, error::ApiError};

const DEFAULT_ROOT_LIMIT: i64 = 50;
const MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Deserialize)]
pub struct ListRootsQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, TS)]
pub struct LineageView {
    pub root_id: Uuid,
    pub versions: Vec<Artifact>,
    pub leaves: Vec<Uuid>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/artifacts",
            post(upload_artifact)
                .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
                .get(list_roots),
        )
        .route("/artifacts/{id}", get(get_artifact))
        .route("/artifacts/{id}/content", get(get_content))
        .route("/artifacts/{id}/chain", get(get_chain))
        .route("/artifacts/{id}/children", get(get_children))
        .route("/artifacts/{id}/lineage", get(get_lineage))
        .route("/artifacts/{id}/fork", post(fork_artifact))
}

/// Stores an uploaded file and records it as a new version 1.
pub async fn upload_artifact(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<ResponseJson<ApiResponse<Artifact>>, ApiError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }
        let mime_type = field
            .content_type()
            .map(str::to_string)
            .ok_or_else(|| ApiError::BadRequest("Upload is missing a content type".into()))?;
        let artifact_type = ArtifactType::from_mime_type(&mime_type).ok_or_else(|| {
            ApiError::BadRequest(format!("Unsupported media type {mime_type}"))
        })?;
        let bytes = field.bytes().await?;
        if bytes.is_empty() {
            return Err(ApiError::BadRequest("Uploaded file is empty".into()));
        }

        let content = state.blobs().put(&bytes).await?.into_content_ref(mime_type);
        let artifact = Artifact::create_root(
            state.pool(),
            &CreateRootArtifact {
                artifact_type,
                content,
            },
        )
        .await?;
        return Ok(ResponseJson(ApiResponse::success(artifact)));
    }
    Err(ApiError::BadRequest("Multipart body has no 'file' field".into()))
}

pub async fn list_roots(
    State(state): State<AppState>,
    Query(query): Query<ListRootsQuery>,
) -> Result<ResponseJson<ApiResponse<Vec<Artifact>>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_ROOT_LIMIT).clamp(1, 500);
    let roots = Artifact::list_roots(state.pool(), limit).await?;
    Ok(ResponseJson(ApiResponse::success(roots)))
}

pub async fn get_artifact(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Artifact>>, ApiError> {
    let artifact = Artifact::get(state.pool(), id).await?;
    Ok(ResponseJson(ApiResponse::success(artifact)))
}

pub async fn get_content(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let artifact = Artifact::get(state.pool(), id).await?;
    let bytes = state.blobs().get(&artifact.content.content_locator).await?;

    let mut response = Response::new(Body::from(bytes));
    let headers = response.headers_mut();
    if let Ok(mime) = HeaderValue::from_str(&artifact.content.mime_type) {
        headers.insert(header::CONTENT_TYPE, mime);
    }
    if let Ok(etag) = HeaderValue::from_str(&format!("\"{}\"", artifact.content.checksum)) {
        headers.insert(header::ETAG, etag);
    }
    // Content is addressed by digest and never rewritten
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=31536000, immutable"),
    );
    Ok(response)
}

pub async fn get_chain(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Vec<Artifact>>>, ApiError> {
    let chain = Artifact::get_chain(state.pool(), id).await?;
    Ok(ResponseJson(ApiResponse::success(chain)))
}

pub async fn get_children(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Vec<Artifact>>>, ApiError> {
    Artifact::get(state.pool(), id).await?;
    let children = Artifact::children(state.pool(), id).await?;
    Ok(ResponseJson(ApiResponse::success(children)))
}

/// Every version sharing `id`'s root, with the ids of its current leaves.
pub async fn get_lineage(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<LineageView>>, ApiError> {
    let root_id = Artifact::get(state.pool(), id).await?.root_artifact_id;
    let versions = Artifact::lineage(state.pool(), root_id).await?;
    let leaves = Artifact::leaves(state.pool(), root_id)
        .await?
        .into_iter()
        .map(|a| a.id)
        .collect();
    Ok(ResponseJson(ApiResponse::success(LineageView {
        root_id,
        versions,
        leaves,
    })))
}

pub async fn fork_artifact(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(data): Json<ForkArtifact>,
) -> Result<ResponseJson<ApiResponse<Artifact>>, ApiError> {
    if let Some(content) = &data.content {
        state.blobs().get(&content.content_locator).await?;
    }
    let forked = Artifact::fork(state.pool(), id, &data).await?;
    Ok(ResponseJson(ApiResponse::success(forked)))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use db::models::artifact::LineageKind;
    use serde_json::{Value, json};

    use super::*;
    use crate::routes::test_support::*;

    #[tokio::test]
    async fn upload_creates_root_and_serves_bytes() {
        let (app, _) = test_app(vec![]).await;

        let response = send(&app, multipart_upload(b"\x89PNG frame", "image/png")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let root = body_json::<Artifact>(response).await.into_data().unwrap();
        assert_eq!(root.version, 1);
        assert_eq!(root.lineage_kind, LineageKind::Root);
        assert_eq!(root.content.byte_size, 10);

        let content = send(&app, get_request(&format!("/api/artifacts/{}/content", root.id))).await;
        assert_eq!(content.headers()[header::CONTENT_TYPE], "image/png");
        assert_eq!(body_bytes(content).await, b"\x89PNG frame");

        let chain = send(&app, get_request(&format!("/api/artifacts/{}/chain", root.id))).await;
        let chain = body_json::<Vec<Artifact>>(chain).await.into_data().unwrap();
        assert_eq!(chain, vec![root.clone()]);

        let roots = send(&app, get_request("/api/artifacts?limit=10")).await;
        let roots = body_json::<Vec<Artifact>>(roots).await.into_data().unwrap();
        assert_eq!(roots.len(), 1);
    }

    #[tokio::test]
    async fn rejects_non_media_uploads() {
        let (app, _) = test_app(vec![]).await;
        let response = send(&app, multipart_upload(b"%PDF-1.7", "application/pdf")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json::<Value>(response).await;
        assert!(!body.is_success());
    }

    #[tokio::test]
    async fn missing_artifact_is_not_found() {
        let (app, _) = test_app(vec![]).await;
        let id = Uuid::new_v4();
        for path in ["", "/chain", "/children", "/content", "/lineage"] {
            let response = send(&app, get_request(&format!("/api/artifacts/{id}{path}"))).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "path {path}");
        }
        let response = send(&app, post_json(&format!("/api/artifacts/{id}/fork"), json!({}))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn fork_starts_an_independent_lineage() {
        let (app, _) = test_app(vec![]).await;
        let root = body_json::<Artifact>(send(&app, multipart_upload(b"frame", "image/png")).await)
            .await
            .into_data()
            .unwrap();

        let response = send(&app, post_json(&format!("/api/artifacts/{}/fork", root.id), json!({}))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let forked = body_json::<Artifact>(response).await.into_data().unwrap();
        assert_eq!(forked.version, 1);
        assert!(forked.parent_artifact_id.is_none());
        assert_eq!(forked.forked_from_id, Some(root.id));
        assert_eq!(forked.content, root.content);

        let lineage = send(&app, get_request(&format!("/api/artifacts/{}/lineage", forked.id))).await;
        let lineage = body_json::<LineageView>(lineage).await.into_data().unwrap();
        assert_eq!(lineage.root_id, forked.id);
        assert_eq!(lineage.leaves, vec![forked.id]);
    }
}
