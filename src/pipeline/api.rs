use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::Deserialize;

use super::orchestrator::{AgentUpsert, Orchestrator};
use crate::errors::PipelineError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: Orchestrator,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePlanRequest {
    pub original_request: String,
}

#[derive(Deserialize, Default)]
pub struct ListQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Optional body for the stage endpoints; omitting it runs the stage with
/// the configured model.
#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StageRequest {
    pub model: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectRefinementRequest {
    pub refinement_id: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectSessionRequest {
    pub session_id: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectGenerationRequest {
    pub generation_id: i64,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    Unauthenticated,
    Forbidden(String),
    NotFound(String),
    BadRequest(String),
    Upstream(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                "missing x-user-id header".to_string(),
            ),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Validation(_) => ApiError::BadRequest(err.to_string()),
            PipelineError::Unauthenticated => ApiError::Unauthenticated,
            PipelineError::Forbidden { .. } => ApiError::Forbidden(err.to_string()),
            PipelineError::PlanNotFound { .. }
            | PipelineError::RefinementNotFound { .. }
            | PipelineError::SessionNotFound { .. }
            | PipelineError::GenerationNotFound { .. }
            | PipelineError::AgentNotFound { .. } => ApiError::NotFound(err.to_string()),
            PipelineError::StageExecution { .. } => ApiError::Upstream(err.to_string()),
            PipelineError::Database(_) | PipelineError::Other(_) => {
                ApiError::Internal(err.to_string())
            }
        }
    }
}

/// Caller identity comes from the `x-user-id` header; routing is the edge
/// proxy's job, authentication resolution is not ours.
fn user_id(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(ApiError::Unauthenticated)
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/feature-planner", get(list_plans).post(create_plan))
        .route("/api/feature-planner/reap", post(reap))
        .route(
            "/api/feature-planner/{plan_id}",
            get(get_plan).delete(delete_plan),
        )
        .route("/api/feature-planner/{plan_id}/refine", post(refine_plan))
        .route(
            "/api/feature-planner/{plan_id}/refinements",
            get(list_refinements),
        )
        .route(
            "/api/feature-planner/{plan_id}/refinements/select",
            post(select_refinement),
        )
        .route("/api/feature-planner/{plan_id}/discover", post(discover))
        .route(
            "/api/feature-planner/{plan_id}/discovery",
            get(list_discovery_sessions),
        )
        .route(
            "/api/feature-planner/{plan_id}/discovery/select",
            post(select_discovery),
        )
        .route("/api/feature-planner/{plan_id}/generate", post(generate))
        .route(
            "/api/feature-planner/{plan_id}/generations",
            get(list_generations),
        )
        .route(
            "/api/feature-planner/{plan_id}/generations/select",
            post(select_generation),
        )
        .route(
            "/api/feature-planner/agents",
            get(list_agents).put(upsert_agent),
        )
        .route(
            "/api/feature-planner/agents/{agent_id}",
            delete(delete_agent),
        )
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn create_plan(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(payload): Json<CreatePlanRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = user_id(&headers)?;
    let plan = state
        .orchestrator
        .create_plan(&user, &payload.original_request)
        .await?;
    Ok((StatusCode::CREATED, Json(plan)))
}

async fn list_plans(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let user = user_id(&headers)?;
    let plans = state
        .orchestrator
        .list_plans(&user, query.limit, query.offset)
        .await?;
    Ok(Json(plans))
}

async fn get_plan(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(plan_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let user = user_id(&headers)?;
    let detail = state.orchestrator.plan_detail(&user, plan_id).await?;
    Ok(Json(detail))
}

async fn delete_plan(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(plan_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let user = user_id(&headers)?;
    state.orchestrator.delete_plan(&user, plan_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn refine_plan(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(plan_id): Path<i64>,
    payload: Option<Json<StageRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let user = user_id(&headers)?;
    let model = payload.and_then(|Json(p)| p.model);
    let attempts = state.orchestrator.refine(&user, plan_id, model).await?;
    Ok(Json(attempts))
}

async fn list_refinements(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(plan_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let user = user_id(&headers)?;
    let attempts = state.orchestrator.list_refinements(&user, plan_id).await?;
    Ok(Json(attempts))
}

async fn select_refinement(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(plan_id): Path<i64>,
    Json(payload): Json<SelectRefinementRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = user_id(&headers)?;
    let plan = state
        .orchestrator
        .select_refinement(&user, plan_id, payload.refinement_id)
        .await?;
    Ok(Json(plan))
}

async fn discover(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(plan_id): Path<i64>,
    payload: Option<Json<StageRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let user = user_id(&headers)?;
    let model = payload.and_then(|Json(p)| p.model);
    let session = state.orchestrator.discover(&user, plan_id, model).await?;
    Ok(Json(session))
}

async fn list_discovery_sessions(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(plan_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let user = user_id(&headers)?;
    let sessions = state
        .orchestrator
        .list_discovery_sessions(&user, plan_id)
        .await?;
    Ok(Json(sessions))
}

async fn select_discovery(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(plan_id): Path<i64>,
    Json(payload): Json<SelectSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = user_id(&headers)?;
    let plan = state
        .orchestrator
        .select_discovery(&user, plan_id, payload.session_id)
        .await?;
    Ok(Json(plan))
}

async fn generate(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(plan_id): Path<i64>,
    payload: Option<Json<StageRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let user = user_id(&headers)?;
    let model = payload.and_then(|Json(p)| p.model);
    let generation = state.orchestrator.generate(&user, plan_id, model).await?;
    Ok(Json(generation))
}

async fn list_generations(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(plan_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let user = user_id(&headers)?;
    let generations = state.orchestrator.list_generations(&user, plan_id).await?;
    Ok(Json(generations))
}

async fn select_generation(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(plan_id): Path<i64>,
    Json(payload): Json<SelectGenerationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = user_id(&headers)?;
    let plan = state
        .orchestrator
        .select_generation(&user, plan_id, payload.generation_id)
        .await?;
    Ok(Json(plan))
}

async fn reap(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let summary = state.orchestrator.reap_now().await?;
    Ok(Json(summary))
}

async fn list_agents(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user = user_id(&headers)?;
    let agents = state.orchestrator.list_agents(&user).await?;
    Ok(Json(agents))
}

async fn upsert_agent(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(payload): Json<AgentUpsert>,
) -> Result<impl IntoResponse, ApiError> {
    let user = user_id(&headers)?;
    let agent = state.orchestrator.upsert_agent(&user, payload).await?;
    Ok(Json(agent))
}

async fn delete_agent(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(agent_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let user = user_id(&headers)?;
    state.orchestrator.delete_agent(&user, &agent_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PipelineConfig, ReaperConfig};
    use crate::pipeline::agent::mock::MockAgent;
    use crate::pipeline::db::{DbHandle, PlannerDb};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const DISCOVERY_JSON: &str =
        r#"{"files": [{"filePath": "src/a.rs", "relevanceScore": 80, "priority": "high"}]}"#;
    const GENERATION_JSON: &str =
        r###"{"implementationPlan": "## Plan", "complexity": "low", "riskLevel": "low"}"###;

    fn app(agent: MockAgent) -> Router {
        let orchestrator = Orchestrator::new(
            DbHandle::new(PlannerDb::new_in_memory().unwrap()),
            Arc::new(agent),
            PipelineConfig::default(),
            ReaperConfig::default(),
        );
        api_router().with_state(Arc::new(AppState { orchestrator }))
    }

    fn req(method: &str, uri: &str, user: Option<&str>, body: Option<serde_json::Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header("x-user-id", user);
        }
        match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(resp: axum::response::Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = app(MockAgent::new());
        let resp = app.oneshot(req("GET", "/health", None, None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_user_header_is_401() {
        let app = app(MockAgent::new());
        let resp = app
            .oneshot(req("GET", "/api/feature-planner", None, None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body = json_body(resp).await;
        assert!(body["error"].as_str().unwrap().contains("x-user-id"));
    }

    #[tokio::test]
    async fn test_create_plan_returns_201() {
        let app = app(MockAgent::new());
        let resp = app
            .oneshot(req(
                "POST",
                "/api/feature-planner",
                Some("user-1"),
                Some(serde_json::json!({"originalRequest": "add CSV export"})),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body = json_body(resp).await;
        assert_eq!(body["originalRequest"], "add CSV export");
        assert_eq!(body["userId"], "user-1");
        assert!(body["refinedRequest"].is_null());
    }

    #[tokio::test]
    async fn test_create_plan_rejects_empty_request() {
        let app = app(MockAgent::new());
        let resp = app
            .oneshot(req(
                "POST",
                "/api/feature-planner",
                Some("user-1"),
                Some(serde_json::json!({"originalRequest": "  "})),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_foreign_plan_is_403_and_missing_is_404() {
        let app = app(MockAgent::new());
        let resp = app
            .clone()
            .oneshot(req(
                "POST",
                "/api/feature-planner",
                Some("user-1"),
                Some(serde_json::json!({"originalRequest": "add CSV export"})),
            ))
            .await
            .unwrap();
        let id = json_body(resp).await["id"].as_i64().unwrap();

        let resp = app
            .clone()
            .oneshot(req(
                "GET",
                &format!("/api/feature-planner/{}", id),
                Some("user-2"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = app
            .oneshot(req("GET", "/api/feature-planner/9999", Some("user-1"), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_full_pipeline_over_http() {
        // One refinement text per default persona, then discovery, then
        // generation.
        let agent = MockAgent::new()
            .push_text("Refined request text")
            .push_text("Refined request text")
            .push_text("Refined request text")
            .push_text(DISCOVERY_JSON)
            .push_text(GENERATION_JSON);
        let app = app(agent);

        let resp = app
            .clone()
            .oneshot(req(
                "POST",
                "/api/feature-planner",
                Some("user-1"),
                Some(serde_json::json!({"originalRequest": "add CSV export"})),
            ))
            .await
            .unwrap();
        let id = json_body(resp).await["id"].as_i64().unwrap();

        // Stage bodies are optional; this one carries a model override.
        let resp = app
            .clone()
            .oneshot(req(
                "POST",
                &format!("/api/feature-planner/{}/refine", id),
                Some("user-1"),
                Some(serde_json::json!({"model": "fast-model"})),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let attempts = json_body(resp).await;
        assert_eq!(attempts.as_array().unwrap().len(), 3);
        assert_eq!(attempts[0]["status"], "completed");
        assert_eq!(attempts[0]["refinedRequest"], "Refined request text");
        let refinement_id = attempts[0]["id"].as_i64().unwrap();

        let resp = app
            .clone()
            .oneshot(req(
                "POST",
                &format!("/api/feature-planner/{}/refinements/select", id),
                Some("user-1"),
                Some(serde_json::json!({"refinementId": refinement_id})),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let plan = json_body(resp).await;
        assert_eq!(plan["refinedRequest"], "Refined request text");
        assert_eq!(plan["selectedRefinementId"], refinement_id);

        let resp = app
            .clone()
            .oneshot(req(
                "POST",
                &format!("/api/feature-planner/{}/discover", id),
                Some("user-1"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let session = json_body(resp).await;
        assert_eq!(session["status"], "completed");
        assert_eq!(session["totalFilesFound"], 1);
        let session_id = session["id"].as_i64().unwrap();

        let resp = app
            .clone()
            .oneshot(req(
                "POST",
                &format!("/api/feature-planner/{}/discovery/select", id),
                Some("user-1"),
                Some(serde_json::json!({"sessionId": session_id})),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .clone()
            .oneshot(req(
                "POST",
                &format!("/api/feature-planner/{}/generate", id),
                Some("user-1"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let generation = json_body(resp).await;
        assert_eq!(generation["implementationPlan"], "## Plan");
        let generation_id = generation["id"].as_i64().unwrap();

        let resp = app
            .clone()
            .oneshot(req(
                "POST",
                &format!("/api/feature-planner/{}/generations/select", id),
                Some("user-1"),
                Some(serde_json::json!({"generationId": generation_id})),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(req(
                "GET",
                &format!("/api/feature-planner/{}", id),
                Some("user-1"),
                None,
            ))
            .await
            .unwrap();
        let detail = json_body(resp).await;
        assert_eq!(detail["plan"]["implementationPlan"], "## Plan");
        assert_eq!(detail["refinements"].as_array().unwrap().len(), 3);
        assert_eq!(detail["discoverySessions"].as_array().unwrap().len(), 1);
        assert_eq!(detail["generations"].as_array().unwrap().len(), 1);
        assert!(detail["effectiveGeneration"].is_object());
    }

    #[tokio::test]
    async fn test_selecting_missing_candidates_is_404() {
        let app = app(MockAgent::new());
        let resp = app
            .clone()
            .oneshot(req(
                "POST",
                "/api/feature-planner",
                Some("user-1"),
                Some(serde_json::json!({"originalRequest": "add CSV export"})),
            ))
            .await
            .unwrap();
        let id = json_body(resp).await["id"].as_i64().unwrap();

        for (path, body) in [
            ("refinements/select", serde_json::json!({"refinementId": 42})),
            ("discovery/select", serde_json::json!({"sessionId": 42})),
            ("generations/select", serde_json::json!({"generationId": 42})),
        ] {
            let resp = app
                .clone()
                .oneshot(req(
                    "POST",
                    &format!("/api/feature-planner/{}/{}", id, path),
                    Some("user-1"),
                    Some(body),
                ))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::NOT_FOUND, "path: {}", path);
        }
    }

    #[tokio::test]
    async fn test_list_plans_respects_limit_and_offset() {
        let app = app(MockAgent::new());
        for request in ["add CSV export", "add PDF export"] {
            let resp = app
                .clone()
                .oneshot(req(
                    "POST",
                    "/api/feature-planner",
                    Some("user-1"),
                    Some(serde_json::json!({"originalRequest": request})),
                ))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::CREATED);
        }

        let resp = app
            .clone()
            .oneshot(req(
                "GET",
                "/api/feature-planner?limit=1",
                Some("user-1"),
                None,
            ))
            .await
            .unwrap();
        let page = json_body(resp).await;
        assert_eq!(page.as_array().unwrap().len(), 1);
        assert_eq!(page[0]["originalRequest"], "add PDF export");

        let resp = app
            .oneshot(req(
                "GET",
                "/api/feature-planner?limit=1&offset=1",
                Some("user-1"),
                None,
            ))
            .await
            .unwrap();
        let page = json_body(resp).await;
        assert_eq!(page[0]["originalRequest"], "add CSV export");
    }

    #[tokio::test]
    async fn test_history_endpoints_list_sessions_and_generations() {
        let agent = MockAgent::new()
            .push_text(DISCOVERY_JSON)
            .push_text(GENERATION_JSON);
        let app = app(agent);
        let resp = app
            .clone()
            .oneshot(req(
                "POST",
                "/api/feature-planner",
                Some("user-1"),
                Some(serde_json::json!({"originalRequest": "add CSV export"})),
            ))
            .await
            .unwrap();
        let id = json_body(resp).await["id"].as_i64().unwrap();
        let resp = app
            .clone()
            .oneshot(req(
                "POST",
                &format!("/api/feature-planner/{}/discover", id),
                Some("user-1"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let session_id = json_body(resp).await["id"].as_i64().unwrap();
        let resp = app
            .clone()
            .oneshot(req(
                "POST",
                &format!("/api/feature-planner/{}/discovery/select", id),
                Some("user-1"),
                Some(serde_json::json!({"sessionId": session_id})),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = app
            .clone()
            .oneshot(req(
                "POST",
                &format!("/api/feature-planner/{}/generate", id),
                Some("user-1"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .clone()
            .oneshot(req(
                "GET",
                &format!("/api/feature-planner/{}/discovery", id),
                Some("user-1"),
                None,
            ))
            .await
            .unwrap();
        let sessions = json_body(resp).await;
        assert_eq!(sessions.as_array().unwrap().len(), 1);
        assert_eq!(sessions[0]["status"], "completed");

        let resp = app
            .clone()
            .oneshot(req(
                "GET",
                &format!("/api/feature-planner/{}/generations", id),
                Some("user-1"),
                None,
            ))
            .await
            .unwrap();
        let generations = json_body(resp).await;
        assert_eq!(generations.as_array().unwrap().len(), 1);

        // No refinement was run, so that history is empty.
        let resp = app
            .clone()
            .oneshot(req(
                "GET",
                &format!("/api/feature-planner/{}/refinements", id),
                Some("user-1"),
                None,
            ))
            .await
            .unwrap();
        assert!(json_body(resp).await.as_array().unwrap().is_empty());

        // History is owner-only like everything else under the plan.
        let resp = app
            .oneshot(req(
                "GET",
                &format!("/api/feature-planner/{}/generations", id),
                Some("user-2"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_generate_without_discovery_is_400() {
        let app = app(MockAgent::new());
        let resp = app
            .clone()
            .oneshot(req(
                "POST",
                "/api/feature-planner",
                Some("user-1"),
                Some(serde_json::json!({"originalRequest": "add CSV export"})),
            ))
            .await
            .unwrap();
        let id = json_body(resp).await["id"].as_i64().unwrap();

        let resp = app
            .oneshot(req(
                "POST",
                &format!("/api/feature-planner/{}/generate", id),
                Some("user-1"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stage_failure_maps_to_502() {
        let agent = MockAgent::new().push_error("model overloaded");
        let app = app(agent);
        let resp = app
            .clone()
            .oneshot(req(
                "POST",
                "/api/feature-planner",
                Some("user-1"),
                Some(serde_json::json!({"originalRequest": "add CSV export"})),
            ))
            .await
            .unwrap();
        let id = json_body(resp).await["id"].as_i64().unwrap();

        let resp = app
            .oneshot(req(
                "POST",
                &format!("/api/feature-planner/{}/discover", id),
                Some("user-1"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let body = json_body(resp).await;
        assert!(body["error"].as_str().unwrap().contains("model overloaded"));
    }

    #[tokio::test]
    async fn test_agents_crud_over_http() {
        let app = app(MockAgent::new());

        // Defaults come back before anything is stored.
        let resp = app
            .clone()
            .oneshot(req("GET", "/api/feature-planner/agents", Some("user-1"), None))
            .await
            .unwrap();
        assert_eq!(json_body(resp).await.as_array().unwrap().len(), 3);

        let resp = app
            .clone()
            .oneshot(req(
                "PUT",
                "/api/feature-planner/agents",
                Some("user-1"),
                Some(serde_json::json!({
                    "agentId": "security-reviewer",
                    "name": "Security Agent",
                    "role": "Security Engineer",
                    "focus": "Threat modelling",
                    "systemPrompt": "You review features for security impact.",
                    "temperature": 0.4,
                    "tools": ["Read", "Grep"]
                })),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let agent = json_body(resp).await;
        assert_eq!(agent["agentId"], "security-reviewer");
        assert_eq!(agent["isActive"], true);

        let resp = app
            .clone()
            .oneshot(req("GET", "/api/feature-planner/agents", Some("user-1"), None))
            .await
            .unwrap();
        assert_eq!(json_body(resp).await.as_array().unwrap().len(), 1);

        let resp = app
            .clone()
            .oneshot(req(
                "DELETE",
                "/api/feature-planner/agents/security-reviewer",
                Some("user-1"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = app
            .oneshot(req("DELETE", "/api/feature-planner/agents/missing", Some("user-1"), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_agent_temperature_out_of_range_is_400() {
        let app = app(MockAgent::new());
        let resp = app
            .oneshot(req(
                "PUT",
                "/api/feature-planner/agents",
                Some("user-1"),
                Some(serde_json::json!({
                    "agentId": "hot-agent",
                    "name": "Hot",
                    "role": "r",
                    "focus": "f",
                    "systemPrompt": "p",
                    "temperature": 1.7
                })),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_reap_endpoint_reports_summary() {
        let app = app(MockAgent::new());
        let resp = app
            .oneshot(req("POST", "/api/feature-planner/reap", Some("user-1"), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["total"], 0);
    }

    #[tokio::test]
    async fn test_delete_plan_removes_it() {
        let app = app(MockAgent::new());
        let resp = app
            .clone()
            .oneshot(req(
                "POST",
                "/api/feature-planner",
                Some("user-1"),
                Some(serde_json::json!({"originalRequest": "add CSV export"})),
            ))
            .await
            .unwrap();
        let id = json_body(resp).await["id"].as_i64().unwrap();

        let resp = app
            .clone()
            .oneshot(req(
                "DELETE",
                &format!("/api/feature-planner/{}", id),
                Some("user-1"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = app
            .oneshot(req(
                "GET",
                &format!("/api/feature-planner/{}", id),
                Some("user-1"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
