use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{FromRequestParts, Path, State},
    http::{StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, patch},
};
use chrono::Utc;
use futures::StreamExt;
use serde::de::DeserializeOwned;

use super::events;
use super::lifecycle::IssueLifecycle;
use super::models::{DismissalFeedback, Issue, ModifiedFields};
use super::orchestrator::ReviewOrchestrator;
use crate::errors::ReviewError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: ReviewOrchestrator,
    pub lifecycle: IssueLifecycle,
}

impl AppState {
    pub fn new(orchestrator: ReviewOrchestrator) -> Self {
        let lifecycle = IssueLifecycle::new(Arc::clone(orchestrator.store()));
        Self {
            orchestrator,
            lifecycle,
        }
    }
}

pub type SharedState = Arc<AppState>;

pub const USER_HEADER: &str = "x-user-id";

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unavailable(String),
    BadGateway(String),
    Internal(String),
}

impl From<ReviewError> for ApiError {
    fn from(err: ReviewError) -> Self {
        let msg = err.to_string();
        match err {
            ReviewError::NotFound { .. } | ReviewError::DocumentNotFound { .. } => {
                ApiError::NotFound(msg)
            }
            ReviewError::Validation(_) => ApiError::BadRequest(msg),
            ReviewError::BackendUnavailable(_) => ApiError::Unavailable(msg),
            ReviewError::BackendError(_) => ApiError::BadGateway(msg),
            ReviewError::Internal(e) => {
                tracing::error!(error = ?e, "Internal error");
                ApiError::Internal("Internal server error".to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

// ── Extractors ────────────────────────────────────────────────────────

/// Acting user from the `X-User-Id` header. Authentication happens upstream.
pub struct ActingUser(pub String);

impl<S: Send + Sync> FromRequestParts<S> for ActingUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user = parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::BadRequest("Missing X-User-Id header".into()))?;
        Ok(ActingUser(user.to_string()))
    }
}

/// An empty body is `None`; anything else must be valid JSON for `T`.
fn optional_json<T: DeserializeOwned>(body: &Bytes) -> Result<Option<T>, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|e| ApiError::BadRequest(format!("Invalid request body: {}", e)))
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/v1/review/{doc_id}/issues", get(review_issues))
        .route(
            "/api/v1/review/{doc_id}/issues/{issue_id}/accept",
            patch(accept_issue),
        )
        .route(
            "/api/v1/review/{doc_id}/issues/{issue_id}/dismiss",
            patch(dismiss_issue),
        )
        .route(
            "/api/v1/review/{doc_id}/issues/{issue_id}/feedback",
            patch(issue_feedback),
        )
        .route("/api/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn review_issues(
    State(state): State<SharedState>,
    Path(doc_id): Path<String>,
    ActingUser(user): ActingUser,
) -> Result<Response, ApiError> {
    tracing::info!(doc_id = %doc_id, user = %user, "Review requested");
    let stream = state
        .orchestrator
        .get_or_review(&doc_id, &user, Utc::now())
        .await?;
    let frames = events::encode_stream(stream.into_stream()).map(Ok::<_, Infallible>);
    Ok((
        [
            (header::CONTENT_TYPE, events::CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(frames),
    )
        .into_response())
}

async fn accept_issue(
    State(state): State<SharedState>,
    Path((doc_id, issue_id)): Path<(String, String)>,
    ActingUser(user): ActingUser,
    body: Bytes,
) -> Result<Json<Issue>, ApiError> {
    let modified: Option<ModifiedFields> = optional_json(&body)?;
    let issue = state
        .lifecycle
        .accept(&doc_id, &issue_id, &user, modified.as_ref())
        .await?;
    Ok(Json(issue))
}

async fn dismiss_issue(
    State(state): State<SharedState>,
    Path((doc_id, issue_id)): Path<(String, String)>,
    ActingUser(user): ActingUser,
    body: Bytes,
) -> Result<Json<Issue>, ApiError> {
    let feedback: Option<DismissalFeedback> = optional_json(&body)?;
    let issue = state
        .lifecycle
        .dismiss(&doc_id, &issue_id, &user, feedback.as_ref())
        .await?;
    Ok(Json(issue))
}

async fn issue_feedback(
    State(state): State<SharedState>,
    Path((doc_id, issue_id)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<Issue>, ApiError> {
    let feedback: DismissalFeedback = optional_json(&body)?
        .ok_or_else(|| ApiError::BadRequest("Feedback body is required".into()))?;
    let issue = state
        .lifecycle
        .add_feedback(&doc_id, &issue_id, &feedback)
        .await?;
    Ok(Json(issue))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issues::inference::{ScriptStep, ScriptedAdapter};
    use crate::issues::models::{IssueType, RawIssue, ReviewStamp};
    use crate::issues::store::{InMemoryIssueStore, IssueStore};
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn raw(text: &str) -> RawIssue {
        RawIssue {
            issue_type: IssueType::GrammarSpelling,
            location: None,
            text: text.to_string(),
            explanation: "typo".to_string(),
            suggested_fix: "fixed".to_string(),
        }
    }

    fn test_app(adapter: ScriptedAdapter) -> (Router, Arc<InMemoryIssueStore>) {
        let store = Arc::new(InMemoryIssueStore::new());
        let orchestrator = ReviewOrchestrator::new(store.clone(), Arc::new(adapter));
        let state = Arc::new(AppState::new(orchestrator));
        (api_router().with_state(state), store)
    }

    async fn seed(store: &InMemoryIssueStore, doc_id: &str) -> Issue {
        let issue = raw("teh").tag(&ReviewStamp {
            doc_id: doc_id.into(),
            initiated_by: "seed".into(),
            initiated_at: Utc::now(),
        });
        store.upsert_many(std::slice::from_ref(&issue)).await.unwrap();
        issue
    }

    async fn body_string(body: Body) -> String {
        let bytes = body.collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn patch_request(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("PATCH")
            .uri(uri)
            .header(USER_HEADER, "alice")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _) = test_app(ScriptedAdapter::default());
        let request = Request::builder()
            .uri("/api/health")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_review_streams_frames() {
        let (app, store) = test_app(ScriptedAdapter::batches(vec![vec![raw("a"), raw("b")]]));
        let request = Request::builder()
            .uri("/api/v1/review/d1/issues")
            .header(USER_HEADER, "alice")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );

        let body = body_string(response.into_body()).await;
        assert!(body.starts_with("event: issues\ndata: ["));
        assert!(body.ends_with("event: complete\n\n"));
        assert_eq!(body.matches("event: ").count(), 2);
        assert_eq!(store.get_all("d1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_review_backend_failure_is_error_frame() {
        let (app, _) = test_app(ScriptedAdapter::new(vec![ScriptStep::Unavailable(
            "model is loading".into(),
        )]));
        let request = Request::builder()
            .uri("/api/v1/review/d1/issues")
            .header(USER_HEADER, "alice")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_string(response.into_body()).await,
            "event: error\ndata: Inference backend unavailable: model is loading. Try again later.\n\n"
        );
    }

    #[tokio::test]
    async fn test_review_requires_user_header() {
        let (app, _) = test_app(ScriptedAdapter::default());
        let request = Request::builder()
            .uri("/api/v1/review/d1/issues")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains("X-User-Id"));
    }

    #[tokio::test]
    async fn test_review_rejects_invalid_doc_id() {
        let (app, _) = test_app(ScriptedAdapter::default());
        let request = Request::builder()
            .uri("/api/v1/review/..%2Fetc/issues")
            .header(USER_HEADER, "alice")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_accept_with_modified_fields() {
        let (app, store) = test_app(ScriptedAdapter::default());
        let issue = seed(&store, "d1").await;
        let uri = format!("/api/v1/review/d1/issues/{}/accept", issue.id);

        let response = app
            .oneshot(patch_request(&uri, r#"{"suggested_fix": "the"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["status"], "accepted");
        assert_eq!(body["resolved_by"], "alice");
        assert_eq!(body["modified_fields"]["suggested_fix"], "the");
        assert!(body["modified_fields"]["explanation"].is_null());
    }

    #[tokio::test]
    async fn test_accept_without_body() {
        let (app, store) = test_app(ScriptedAdapter::default());
        let issue = seed(&store, "d1").await;
        let uri = format!("/api/v1/review/d1/issues/{}/accept", issue.id);
        let response = app.oneshot(patch_request(&uri, "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["status"], "accepted");
    }

    #[tokio::test]
    async fn test_accept_invalid_json_is_bad_request() {
        let (app, store) = test_app(ScriptedAdapter::default());
        let issue = seed(&store, "d1").await;
        let uri = format!("/api/v1/review/d1/issues/{}/accept", issue.id);
        let response = app.oneshot(patch_request(&uri, "{not json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_dismiss_then_feedback() {
        let (app, store) = test_app(ScriptedAdapter::default());
        let issue = seed(&store, "d1").await;

        let uri = format!("/api/v1/review/d1/issues/{}/dismiss", issue.id);
        let response = app
            .clone()
            .oneshot(patch_request(&uri, r#"{"reason": "unclear"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let dismissed: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(dismissed["status"], "dismissed");
        assert_eq!(dismissed["dismissal_feedback"]["reason"], "unclear");

        let uri = format!("/api/v1/review/d1/issues/{}/feedback", issue.id);
        let response = app
            .oneshot(patch_request(&uri, r#"{"reason": "duplicate"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let updated: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(updated["status"], "dismissed");
        assert_eq!(updated["dismissal_feedback"]["reason"], "duplicate");
        assert_eq!(updated["resolved_at"], dismissed["resolved_at"]);
    }

    #[tokio::test]
    async fn test_feedback_requires_body() {
        let (app, store) = test_app(ScriptedAdapter::default());
        let issue = seed(&store, "d1").await;
        let uri = format!("/api/v1/review/d1/issues/{}/feedback", issue.id);
        let response = app.oneshot(patch_request(&uri, "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_lifecycle_on_missing_issue_is_not_found() {
        let (app, _) = test_app(ScriptedAdapter::default());
        for action in ["accept", "dismiss"] {
            let uri = format!("/api/v1/review/d1/issues/nope/{}", action);
            let response = app.clone().oneshot(patch_request(&uri, "")).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }
        let response = app
            .oneshot(patch_request(
                "/api/v1/review/d1/issues/nope/feedback",
                r#"{"reason": "x"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains("nope"));
    }

    #[test]
    fn test_review_error_status_mapping() {
        let cases = [
            (ReviewError::not_found("d", "i"), StatusCode::NOT_FOUND),
            (ReviewError::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (ReviewError::BackendUnavailable("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (ReviewError::BackendError("x".into()), StatusCode::BAD_GATEWAY),
            (anyhow::anyhow!("disk").into(), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
    }
}
