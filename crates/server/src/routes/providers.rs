use axum::{Router, extract::State, response::Json as ResponseJson, routing::get};
use generation::ProviderDescriptor;
use utils::response::ApiResponse;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/providers", get(list_providers))
}

pub async fn list_providers(
    State(state): State<AppState>,
) -> ResponseJson<ApiResponse<Vec<ProviderDescriptor>>> {
    ResponseJson(ApiResponse::success(state.orchestrator().registry().descriptors()))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use generation::testing::Script;

    use crate::routes::test_support::*;
    use super::*;

    #[tokio::test]
    async fn lists_registered_providers() {
        let (app, _) = test_app(vec![("sdxl", Script::Succeed), ("dalle", Script::Succeed)]).await;

        let response = send(&app, get_request("/api/providers")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: ApiResponse<Vec<ProviderDescriptor>> = body_json(response).await;
        let ids: Vec<_> = body.into_data().unwrap().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["dalle", "sdxl"]);
    }
}
