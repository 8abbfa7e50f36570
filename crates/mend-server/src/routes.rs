use axum::{
    extract::{Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        Json, Response,
    },
    routing::{get, post},
    Router,
};
use mend_core::{
    orchestrator::{format_status, HISTORY_CAP},
    verifier::is_valid_unit_name,
    ProblemReport, RepairEvent,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};
use tokio_stream::StreamExt;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::AppState;

const DEFAULT_REPAIRS_LIMIT: usize = 20;

// ── Error helper ──────────────────────────────────────────────────────────

pub(crate) fn internal(e: impl std::fmt::Display) -> StatusCode {
    tracing::error!("internal error: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

// ── Request body types ────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub(crate) struct DecisionBody {
    /// "approve" or "reject"
    pub decision: String,
}

#[derive(Deserialize)]
pub(crate) struct RollbackBody {
    /// "service" or "container"
    pub kind: String,
    pub name: String,
}

#[derive(Deserialize)]
pub(crate) struct FollowupBody {
    pub message: String,
}

// ── Router ────────────────────────────────────────────────────────────────

/// Read-only routes are always served. Routes that queue work, decide
/// approvals, stop units or talk to the code-fix service need the API token
/// and are not mounted at all without one.
pub(crate) fn router(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .route("/api/health", get(health))
        // Repairs
        .route("/api/status", get(get_status))
        .route("/api/repairs", get(list_repairs))
        // SSE
        .route("/api/events", get(sse_events))
        .route("/api/logs", get(sse_logs));

    if state.config.api_token.is_empty() {
        warn!("API_TOKEN is not set: control routes are disabled, decide approvals via Telegram");
    } else {
        let control = Router::new()
            .route("/api/problems", post(post_problem))
            .route("/api/rollback", post(post_rollback))
            // Approvals
            .route("/api/approvals", get(list_approvals))
            .route("/api/approvals/:id", post(post_decision))
            // Code fix
            .route("/api/codefix/:agent_id/followup", post(post_followup))
            .route_layer(middleware::from_fn_with_state(Arc::clone(&state), require_token));
        app = app.merge(control);
    }

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

// ── Auth ──────────────────────────────────────────────────────────────────

pub(crate) async fn require_token(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| tokens_match(token.trim(), &state.config.api_token));
    if !authorized {
        warn!(path = %request.uri().path(), "rejected request without a valid API token");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(request).await)
}

/// Compares every byte so timing does not reveal the matching prefix.
fn tokens_match(presented: &str, expected: &str) -> bool {
    let (a, b) = (presented.as_bytes(), expected.as_bytes());
    if expected.is_empty() || a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// ── Handlers ──────────────────────────────────────────────────────────────

pub(crate) async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_s": state.start_time.elapsed().as_secs(),
    }))
}

pub(crate) async fn get_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, StatusCode> {
    let records = state.db.recent_repair_records(HISTORY_CAP).map_err(internal)?;
    let used = state.budget.used();
    let limit = state.budget.limit();
    Ok(Json(json!({
        "queue_depth": state.db.queue_depth().map_err(internal)?,
        "pending_approvals": state.db.list_pending_approvals().map_err(internal)?.len(),
        "actions_in_window": used,
        "max_actions_per_hour": limit,
        "logged_repairs": state.db.repair_log_len().map_err(internal)?,
        "codefix_configured": state.codefix.is_configured(),
        "text": format_status(&records, used, limit),
    })))
}

pub(crate) async fn list_repairs(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Value>, StatusCode> {
    let limit = q
        .limit
        .unwrap_or(DEFAULT_REPAIRS_LIMIT)
        .clamp(1, state.config.repair_log_cap.max(1));
    let mut records = state.db.recent_repair_records(limit).map_err(internal)?;
    records.reverse();
    Ok(Json(json!(records)))
}

pub(crate) async fn post_problem(
    State(state): State<Arc<AppState>>,
    Json(report): Json<ProblemReport>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let id = state.db.enqueue_problem(&report).map_err(internal)?;
    info!(check = %report.name, status = %report.status, "problem report queued");
    Ok((StatusCode::ACCEPTED, Json(json!({ "id": id }))))
}

pub(crate) async fn list_approvals(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, StatusCode> {
    let pending = state.db.list_pending_approvals().map_err(internal)?;
    Ok(Json(json!(pending)))
}

pub(crate) async fn post_decision(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<DecisionBody>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let approved = match body.decision.as_str() {
        "approve" | "approved" => true,
        "reject" | "rejected" => false,
        _ => return Err(StatusCode::BAD_REQUEST),
    };
    let resolved = state.db.resolve_approval(&id, approved).map_err(internal)?;
    if !resolved {
        return Ok((
            StatusCode::CONFLICT,
            Json(json!({ "resolved": false, "error": "request unknown, expired or already decided" })),
        ));
    }
    info!(request_id = %id, approved, "decision recorded via API");
    Ok((StatusCode::OK, Json(json!({ "resolved": true }))))
}

pub(crate) async fn post_rollback(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RollbackBody>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let result = match body.kind.as_str() {
        "service" => state.verifier.rollback_service(&body.name).await,
        "container" => state.verifier.rollback_container(&body.name).await,
        _ => return Err(StatusCode::BAD_REQUEST),
    };
    let status = if result.refusal.is_some() {
        StatusCode::FORBIDDEN
    } else if result.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    Ok((status, Json(json!(result))))
}

pub(crate) async fn post_followup(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Json(body): Json<FollowupBody>,
) -> Result<StatusCode, StatusCode> {
    if !is_valid_unit_name(&agent_id, false) {
        return Err(StatusCode::BAD_REQUEST);
    }
    if !state.codefix.is_configured() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    if body.message.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    state
        .codefix
        .followup(&agent_id, &body.message)
        .await
        .map_err(|e| {
            tracing::warn!(agent_id = %agent_id, "follow-up failed: {e:#}");
            StatusCode::BAD_GATEWAY
        })?;
    Ok(StatusCode::OK)
}

// Repair events, live only

pub(crate) async fn sse_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let rx = state.events.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| match msg {
        Ok(evt) => Some(Ok(sse_event(&evt))),
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("ping"),
    )
}

fn sse_event(evt: &RepairEvent) -> Event {
    let data = serde_json::to_string(evt).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(evt.kind()).data(data)
}

// Logs: ring buffer history first, then live lines

pub(crate) async fn sse_logs(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    // Subscribe before snapshotting the ring so nothing falls in between
    let live_rx = state.log_tx.subscribe();
    let history: Vec<String> = state
        .log_ring
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .cloned()
        .collect();
    tokio::spawn(async move {
        for line in history {
            if tx.send(line).is_err() {
                return;
            }
        }
        let mut live_rx = live_rx;
        loop {
            match live_rx.recv().await {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    });
    let stream = UnboundedReceiverStream::new(rx)
        .map(|data| Ok::<_, std::convert::Infallible>(Event::default().data(data)));
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("ping"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use axum::{
        body::{to_bytes, Body},
        http::Request,
    };
    use mend_core::{
        codefix::{CodeFixBackend, CodeFixBridge},
        command::{CommandOutput, CommandRunner},
        config::Config,
        db::Db,
        executor::Executor,
        health::HealthSource,
        verifier::Verifier,
        CheckResult, RepairAction, RepairLevel,
    };
    use std::{
        collections::VecDeque,
        sync::Mutex,
        time::{Duration, Instant},
    };
    use tower::ServiceExt;

    struct OkRunner;

    #[async_trait]
    impl CommandRunner for OkRunner {
        async fn run(&self, _: &str, _: &[&str], _: Duration) -> Result<CommandOutput> {
            Ok(CommandOutput::default())
        }
    }

    struct NoHealth;

    #[async_trait]
    impl HealthSource for NoHealth {
        async fn run_all(&self) -> Result<Vec<CheckResult>> {
            Ok(vec![])
        }
    }

    struct Unconfigured;

    #[async_trait]
    impl CodeFixBackend for Unconfigured {
        fn is_configured(&self) -> bool {
            false
        }
        async fn launch(&self, _: &str) -> Result<String> {
            anyhow::bail!("not configured")
        }
        async fn status(&self, _: &str) -> Result<String> {
            anyhow::bail!("not configured")
        }
        async fn followup(&self, _: &str, _: &str) -> Result<()> {
            anyhow::bail!("not configured")
        }
    }

    const TOKEN: &str = "s3cret-token";

    fn state_with_token(api_token: &str) -> Arc<AppState> {
        let mut db = Db::open_in_memory().unwrap();
        db.migrate().unwrap();
        let runner: Arc<dyn CommandRunner> = Arc::new(OkRunner);
        let (events, _) = broadcast::channel(16);
        let (log_tx, _) = broadcast::channel(16);
        Arc::new(AppState {
            db: Arc::new(db),
            config: Arc::new(Config {
                api_token: api_token.to_string(),
                ..Config::default()
            }),
            budget: Executor::new(Arc::clone(&runner), 3).budget(),
            verifier: Arc::new(Verifier::new(Arc::new(NoHealth), runner, Duration::ZERO)),
            codefix: Arc::new(CodeFixBridge::new(Arc::new(Unconfigured), Duration::from_secs(1))),
            events,
            log_tx,
            log_ring: Arc::new(Mutex::new(VecDeque::new())),
            start_time: Instant::now(),
        })
    }

    fn state() -> Arc<AppState> {
        state_with_token(TOKEN)
    }

    fn post_json_with(uri: &str, body: Value, auth: Option<&str>) -> Request<Body> {
        let mut req = Request::post(uri).header("content-type", "application/json");
        if let Some(auth) = auth {
            req = req.header("authorization", auth);
        }
        req.body(Body::from(body.to_string())).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        post_json_with(uri, body, Some(&format!("Bearer {TOKEN}")))
    }

    fn pending_request(state: &AppState, id: &str) {
        state
            .db
            .create_approval_request(
                id,
                RepairLevel::Cursor,
                "desc",
                RepairAction::CodeFixDiagnose,
                Duration::from_secs(60),
                Duration::from_secs(60),
            )
            .unwrap();
    }

    async fn body_json(resp: axum::response::Response) -> Value {
        let bytes = to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn problem_reports_are_queued() {
        let state = state();
        let app = router(Arc::clone(&state));
        let resp = app
            .oneshot(post_json(
                "/api/problems",
                json!({ "name": "Redis", "status": "critical", "value": "down" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(state.db.queue_depth().unwrap(), 1);
    }

    #[tokio::test]
    async fn malformed_problem_is_rejected() {
        let app = router(state());
        let resp = app
            .oneshot(post_json("/api/problems", json!({ "name": "Redis", "status": "on fire" })))
            .await
            .unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn decisions_resolve_once() {
        let state = state();
        pending_request(&state, "cafe0001");

        let resp = router(Arc::clone(&state))
            .oneshot(post_json("/api/approvals/cafe0001", json!({ "decision": "approve" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = router(Arc::clone(&state))
            .oneshot(post_json("/api/approvals/cafe0001", json!({ "decision": "reject" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = router(state)
            .oneshot(post_json("/api/approvals/cafe0001", json!({ "decision": "maybe" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn decisions_without_a_valid_token_change_nothing() {
        let state = state();
        pending_request(&state, "cafe0002");

        for auth in [None, Some("Bearer wrong-token"), Some(TOKEN), Some("Bearer ")] {
            let req = post_json_with("/api/approvals/cafe0002", json!({ "decision": "approve" }), auth);
            let resp = router(Arc::clone(&state)).oneshot(req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "{auth:?}");
        }
        assert_eq!(
            state.db.get_approval_status("cafe0002").unwrap(),
            Some(mend_core::ApprovalStatus::Pending)
        );
    }

    #[tokio::test]
    async fn cross_origin_requests_get_no_cors_grant() {
        let state = state();
        pending_request(&state, "cafe0003");
        let req = Request::post("/api/approvals/cafe0003")
            .header("content-type", "application/json")
            .header("origin", "https://evil.example")
            .body(Body::from(json!({ "decision": "approve" }).to_string()))
            .unwrap();
        let resp = router(Arc::clone(&state)).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(resp.headers().get("access-control-allow-origin").is_none());
        assert_eq!(
            state.db.get_approval_status("cafe0003").unwrap(),
            Some(mend_core::ApprovalStatus::Pending)
        );
    }

    #[tokio::test]
    async fn pending_ids_need_the_token() {
        let state = state();
        pending_request(&state, "cafe0004");
        let resp = router(Arc::clone(&state))
            .oneshot(Request::get("/api/approvals").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = router(state)
            .oneshot(
                Request::get("/api/approvals")
                    .header("authorization", format!("Bearer {TOKEN}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await[0]["request_id"], "cafe0004");
    }

    #[tokio::test]
    async fn control_routes_are_absent_without_a_configured_token() {
        let state = state_with_token("");
        pending_request(&state, "cafe0005");
        for (uri, body) in [
            ("/api/approvals/cafe0005", json!({ "decision": "approve" })),
            ("/api/rollback", json!({ "kind": "container", "name": "app-redis" })),
            ("/api/problems", json!({ "name": "Redis", "status": "critical" })),
        ] {
            let req = post_json_with(uri, body, Some("Bearer "));
            let resp = router(Arc::clone(&state)).oneshot(req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{uri}");
        }
        assert_eq!(
            state.db.get_approval_status("cafe0005").unwrap(),
            Some(mend_core::ApprovalStatus::Pending)
        );
        assert_eq!(state.db.queue_depth().unwrap(), 0);

        let resp = router(state)
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn token_comparison_needs_exact_match() {
        assert!(tokens_match("abc", "abc"));
        assert!(!tokens_match("abd", "abc"));
        assert!(!tokens_match("ab", "abc"));
        assert!(!tokens_match("", ""));
    }

    #[tokio::test]
    async fn rollback_refuses_unlisted_names() {
        let app = router(state());
        let resp = app
            .oneshot(post_json("/api/rollback", json!({ "kind": "service", "name": "sshd" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(resp).await["refusal"], "not_allowed");
    }

    #[tokio::test]
    async fn rollback_stops_listed_container() {
        let app = router(state());
        let resp = app
            .oneshot(post_json("/api/rollback", json!({ "kind": "container", "name": "app-redis" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["success"], true);
    }

    #[tokio::test]
    async fn followup_needs_configured_service() {
        let app = router(state());
        let resp = app
            .oneshot(post_json("/api/codefix/bc-1/followup", json!({ "message": "retry" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn followup_rejects_path_like_agent_ids() {
        let app = router(state());
        let resp = app
            .oneshot(post_json("/api/codefix/..%2Fadmin/followup", json!({ "message": "retry" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn status_reports_budget_and_text() {
        let app = router(state());
        let resp = app
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["max_actions_per_hour"], 3);
        assert_eq!(body["actions_in_window"], 0);
        assert!(body["text"].as_str().unwrap().contains("No repairs performed yet."));
    }
}
