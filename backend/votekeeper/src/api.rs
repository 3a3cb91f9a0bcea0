//! Axum REST API handlers.
//!
//! Two surfaces share one router: the ledger endpoints (`/votes`,
//! `/events/:id/votes`) that other clients record votes through, and the
//! voter endpoints that drive this daemon's [`VoteSession`]s.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::warn;

use crate::db;
use crate::errors::{ErrorClass, GatewayError, ReconciliationError, SessionError};
use crate::events::{ChainEventRecord, NewVote};
use crate::ledger::{summarize, EventVotesResponse, VoteCastRequest, VoteCastResponse, VOTER_ID_HEADER};
use crate::reconcile::Reconciler;
use crate::session::{connect_wallet, Sessions};
use crate::types::{tx_hash_hex, Candidate, EventDraft};

pub struct ApiState {
    pub pool: SqlitePool,
    pub sessions: Sessions,
    pub reconciler: Arc<Reconciler>,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/votes", post(cast_vote))
        .route("/events/:id/votes", get(get_event_votes))
        .route("/events/:id/chain-events", get(get_event_chain_events))
        .route("/chain-events", get(get_all_chain_events))
        .route("/events/:id/panel", get(get_panel))
        .route("/events/:id/commit", post(commit_vote))
        .route("/events/:id/reveal", post(reveal_vote))
        .route("/events/:id/secret", axum::routing::delete(wipe_secret))
        .route("/events/:id/reset", post(reset_session))
        .route("/events/:id/tally", get(get_tally))
        .route("/events/:id/winner", get(get_winner))
        .route("/events/:id/sync", get(get_sync_report))
        .route("/chain/events", post(create_chain_event))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize)]
pub struct SessionErrorResponse {
    pub error: String,
    pub class: ErrorClass,
    pub remediation: &'static str,
}

#[derive(Serialize)]
pub struct ChainEventsResponse {
    pub count: usize,
    pub events: Vec<ChainEventRecord>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRequest {
    pub candidate_id: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevealRequest {
    pub candidate_id: u64,
    #[serde(default)]
    pub secret: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateEventRequest {
    #[serde(flatten)]
    pub draft: EventDraft,
    #[serde(default)]
    pub candidates: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEventResponse {
    pub event_id: u64,
    pub tx_hash: String,
    pub candidates: Vec<Candidate>,
}

// ─────────────────────────────────────────────────────────
// Error mapping
// ─────────────────────────────────────────────────────────

pub fn status_for(err: &SessionError) -> StatusCode {
    match err {
        SessionError::AuthenticationRequired(_) => StatusCode::UNAUTHORIZED,
        SessionError::ActionPending
        | SessionError::CommitPhaseClosed { .. }
        | SessionError::RevealPhaseNotOpen { .. } => StatusCode::CONFLICT,
        SessionError::SecretMissing => StatusCode::BAD_REQUEST,
        SessionError::Gateway(e) => match e {
            GatewayError::SignerRequired(_) => StatusCode::UNAUTHORIZED,
            GatewayError::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
            GatewayError::AllowanceRequired { .. } => StatusCode::FORBIDDEN,
            GatewayError::AlreadyCommitted
            | GatewayError::AlreadyRevealed
            | GatewayError::PhaseViolation { .. }
            | GatewayError::EventInactive(_) => StatusCode::CONFLICT,
            GatewayError::EventNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::NoCommitment
            | GatewayError::HashMismatch
            | GatewayError::UnknownCandidate { .. }
            | GatewayError::InvalidSchedule { .. }
            | GatewayError::InvalidCandidates(_) => StatusCode::BAD_REQUEST,
            GatewayError::ConfirmationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::EventIdUnresolvable { .. }
            | GatewayError::TransactionFailed(_)
            | GatewayError::Malformed(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Unreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
        },
    }
}

fn session_error(err: SessionError) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        warn!("request failed: {err}");
    }
    (
        status,
        Json(serde_json::json!(SessionErrorResponse {
            error: err.to_string(),
            class: err.class(),
            remediation: err.remediation(),
        })),
    )
        .into_response()
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(serde_json::json!(ErrorResponse {
            error: error.to_string()
        })),
    )
        .into_response()
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `POST /votes`
///
/// Records one vote in the ledger. The voter id comes from the
/// `x-voter-id` header; one vote per voter per event.
pub async fn cast_vote(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(req): Json<VoteCastRequest>,
) -> Response {
    let voter_id = match headers
        .get(VOTER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        Some(voter_id) => voter_id.to_string(),
        None => return error_response(StatusCode::BAD_REQUEST, "missing x-voter-id header"),
    };

    let vote = NewVote {
        voter_id,
        event_id: req.event_id,
        candidate_id: req.candidate_id,
        block_address: req.block_address,
    };
    match db::insert_vote(&state.pool, &vote).await {
        Ok(record) => (
            StatusCode::CREATED,
            Json(serde_json::json!(VoteCastResponse { data: record })),
        )
            .into_response(),
        Err(e @ ReconciliationError::Duplicate { .. }) => {
            error_response(StatusCode::CONFLICT, e)
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// `GET /events/:id/votes`
pub async fn get_event_votes(
    State(state): State<Arc<ApiState>>,
    Path(event_id): Path<u64>,
) -> Response {
    let votes = match db::get_votes_for_event(&state.pool, event_id).await {
        Ok(votes) => votes,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    };
    let counts = match db::vote_counts(&state.pool, event_id).await {
        Ok(counts) => counts,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    };
    (
        StatusCode::OK,
        Json(serde_json::json!(EventVotesResponse {
            event_id,
            count: votes.len(),
            summary: summarize(&counts),
            votes,
        })),
    )
        .into_response()
}

/// `GET /events/:id/chain-events`
///
/// Indexed contract logs for one voting event.
pub async fn get_event_chain_events(
    State(state): State<Arc<ApiState>>,
    Path(event_id): Path<u64>,
) -> Response {
    match db::get_chain_events_for_event(&state.pool, event_id).await {
        Ok(events) => {
            let count = events.len();
            (
                StatusCode::OK,
                Json(serde_json::json!(ChainEventsResponse { count, events })),
            )
                .into_response()
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// `GET /chain-events`
pub async fn get_all_chain_events(State(state): State<Arc<ApiState>>) -> Response {
    match db::get_all_chain_events(&state.pool).await {
        Ok(events) => {
            let count = events.len();
            (
                StatusCode::OK,
                Json(serde_json::json!(ChainEventsResponse { count, events })),
            )
                .into_response()
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// `GET /events/:id/panel`
pub async fn get_panel(
    State(state): State<Arc<ApiState>>,
    Path(event_id): Path<u64>,
) -> Response {
    let session = match state.sessions.open(event_id).await {
        Ok(session) => session,
        Err(e) => return session_error(e),
    };
    Json(session.panel().await).into_response()
}

/// `POST /events/:id/commit`
pub async fn commit_vote(
    State(state): State<Arc<ApiState>>,
    Path(event_id): Path<u64>,
    Json(req): Json<CommitRequest>,
) -> Response {
    let session = match state.sessions.open(event_id).await {
        Ok(session) => session,
        Err(e) => return session_error(e),
    };
    match session.commit(req.candidate_id).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => session_error(e),
    }
}

/// `POST /events/:id/reveal`
pub async fn reveal_vote(
    State(state): State<Arc<ApiState>>,
    Path(event_id): Path<u64>,
    Json(req): Json<RevealRequest>,
) -> Response {
    let session = match state.sessions.open(event_id).await {
        Ok(session) => session,
        Err(e) => return session_error(e),
    };
    match session.reveal(req.candidate_id, req.secret.as_deref()).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => session_error(e),
    }
}

/// `DELETE /events/:id/secret`
pub async fn wipe_secret(
    State(state): State<Arc<ApiState>>,
    Path(event_id): Path<u64>,
) -> Response {
    match state.sessions.open(event_id).await {
        Ok(session) => {
            session.wipe_secret().await;
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => session_error(e),
    }
}

/// `POST /events/:id/reset`
pub async fn reset_session(
    State(state): State<Arc<ApiState>>,
    Path(event_id): Path<u64>,
) -> Response {
    match state.sessions.open(event_id).await {
        Ok(session) => {
            session.reset();
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => session_error(e),
    }
}

/// `GET /events/:id/tally`
pub async fn get_tally(
    State(state): State<Arc<ApiState>>,
    Path(event_id): Path<u64>,
) -> Response {
    let session = match state.sessions.open(event_id).await {
        Ok(session) => session,
        Err(e) => return session_error(e),
    };
    Json(session.refresh_tally().await).into_response()
}

/// `GET /events/:id/winner`
pub async fn get_winner(
    State(state): State<Arc<ApiState>>,
    Path(event_id): Path<u64>,
) -> Response {
    match state.sessions.deps().gateway.fetch_winner(event_id).await {
        Some(winner) => Json(winner).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            format!("no winner available for event {event_id}"),
        ),
    }
}

/// `GET /events/:id/sync`
pub async fn get_sync_report(
    State(state): State<Arc<ApiState>>,
    Path(event_id): Path<u64>,
) -> Response {
    Json(state.reconciler.sync_report(event_id).await).into_response()
}

/// `POST /chain/events`
///
/// Creates an event on chain with the daemon's wallet, then registers the
/// given candidates.
pub async fn create_chain_event(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CreateEventRequest>,
) -> Response {
    let deps = state.sessions.deps();
    let timeout = deps.settings.confirmation_timeout;

    let creator = match connect_wallet(deps.wallet.as_ref()).await {
        Ok(creator) => creator,
        Err(e) => return session_error(e),
    };
    let created = match deps.gateway.create_event(creator, &req.draft, timeout).await {
        Ok(created) => created,
        Err(e) => return session_error(e.into()),
    };
    if !req.candidates.is_empty() {
        if let Err(e) = deps
            .gateway
            .add_candidates(creator, created.event_id, &req.candidates, timeout)
            .await
        {
            return session_error(e.into());
        }
    }

    (
        StatusCode::CREATED,
        Json(serde_json::json!(CreateEventResponse {
            event_id: created.event_id,
            tx_hash: tx_hash_hex(&created.tx_hash),
            candidates: deps.gateway.fetch_candidates(created.event_id).await,
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::dev::{DevChain, ONE_TOKEN};
    use crate::chain::ChainGateway;
    use crate::clock::ManualClock;
    use crate::ledger::{HttpLedger, Ledger, SqliteLedger};
    use crate::reconcile::RefreshPolicy;
    use crate::session::{SessionDeps, SessionSettings};
    use crate::vault::MemoryVault;
    use crate::wallet::KeyWallet;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    const T: u64 = 1_700_000_000;
    const DEV_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    async fn app() -> (Router, Arc<ManualClock>, Arc<DevChain>) {
        let clock = Arc::new(ManualClock::new(T - 100));
        let chain = Arc::new(DevChain::new(clock.clone(), ONE_TOKEN));
        let gateway = Arc::new(ChainGateway::new(chain.clone(), clock.clone()));
        let wallet = Arc::new(KeyWallet::from_key(Some(DEV_KEY)).unwrap());
        if let Some(address) = wallet.configured_address() {
            chain.credit(address, ONE_TOKEN);
        }

        let pool = db::memory_pool().await;
        let reconciler = Arc::new(Reconciler::new(
            gateway.clone(),
            Arc::new(SqliteLedger::new(pool.clone())),
        ));
        let deps = SessionDeps {
            gateway,
            vault: Arc::new(MemoryVault::new("api")),
            reconciler: reconciler.clone(),
            wallet,
            settings: SessionSettings {
                confirmation_timeout: Some(Duration::from_secs(2)),
                refresh: RefreshPolicy {
                    max_attempts: 3,
                    initial_delay: Duration::from_millis(5),
                },
                phase_poll: Duration::from_secs(15),
            },
        };
        let state = Arc::new(ApiState {
            pool,
            sessions: Sessions::new(deps),
            reconciler,
        });
        (router(state), clock, chain)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_reports_version() {
        let (app, _, _) = app().await;
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn ledger_records_one_vote_per_voter() {
        let (app, _, _) = app().await;
        let vote = json!({ "eventId": 1, "candidateId": 2, "blockAddress": "0xfeed" });

        let (status, _) = send(&app, "POST", "/votes", Some(vote.clone())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let post = |voter: &'static str| {
            Request::builder()
                .method("POST")
                .uri("/votes")
                .header("content-type", "application/json")
                .header(VOTER_ID_HEADER, voter)
                .body(Body::from(vote.to_string()))
                .unwrap()
        };
        let first = app.clone().oneshot(post("alice")).await.unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);
        let again = app.clone().oneshot(post("alice")).await.unwrap();
        assert_eq!(again.status(), StatusCode::CONFLICT);

        let (status, body) = send(&app, "GET", "/events/1/votes", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["summary"], json!([{ "candidateId": 2, "voteCount": 1 }]));
    }

    #[tokio::test]
    async fn full_vote_over_http() {
        let (app, clock, _) = app().await;
        let (status, created) = send(
            &app,
            "POST",
            "/chain/events",
            Some(json!({
                "name": "Council",
                "description": "Seat election",
                "startTime": T,
                "endTime": T + 3600,
                "revealDurationSecs": 3600,
                "candidates": ["Ada", "Grace"]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["eventId"], 1);
        assert_eq!(created["candidates"].as_array().map(Vec::len), Some(2));

        clock.set(T + 1800);
        let (status, commit) =
            send(&app, "POST", "/events/1/commit", Some(json!({ "candidateId": 2 }))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(commit["secret"].as_str().is_some());

        let (status, err) =
            send(&app, "POST", "/events/1/commit", Some(json!({ "candidateId": 1 }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(err["class"], "validation");

        let (status, _) =
            send(&app, "POST", "/events/1/reveal", Some(json!({ "candidateId": 2 }))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        clock.set(T + 5000);
        let (status, reveal) =
            send(&app, "POST", "/events/1/reveal", Some(json!({ "candidateId": 2 }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reveal["candidateId"], 2);

        let (status, winner) = send(&app, "GET", "/events/1/winner", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(winner["winnerName"], "Grace");
        assert_eq!(winner["percentage"], 100.0);

        let (_, panel) = send(&app, "GET", "/events/1/panel", None).await;
        assert_eq!(panel["action"], "Revealed");
        assert_eq!(panel["hasStoredSecret"], false);

        let (_, sync) = send(&app, "GET", "/events/1/sync", None).await;
        assert_eq!(sync["synced"], true);
    }

    #[tokio::test]
    async fn inverted_schedule_is_bad_request() {
        let (app, _, _) = app().await;
        let (status, body) = send(
            &app,
            "POST",
            "/chain/events",
            Some(json!({
                "name": "Bad",
                "description": "",
                "startTime": T + 10,
                "endTime": T
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["class"], "validation");
    }

    #[tokio::test]
    async fn unknown_event_has_no_winner() {
        let (app, _, _) = app().await;
        let (status, _) = send(&app, "GET", "/events/42/winner", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        for (method, uri) in [
            ("GET", "/events/42/panel"),
            ("GET", "/events/42/tally"),
            ("POST", "/events/42/reset"),
            ("DELETE", "/events/42/secret"),
        ] {
            let (status, body) = send(&app, method, uri, None).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{method} {uri}");
            assert_eq!(body["class"], "validation");
        }
    }

    #[tokio::test]
    async fn unreachable_chain_fails_commit_as_transaction() {
        let (app, clock, chain) = app().await;
        let (status, _) = send(
            &app,
            "POST",
            "/chain/events",
            Some(json!({
                "name": "Council",
                "description": "",
                "startTime": T,
                "endTime": T + 3600,
                "candidates": ["Ada"]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        clock.set(T + 1800);
        chain.set_offline(true);
        let (status, body) =
            send(&app, "POST", "/events/1/commit", Some(json!({ "candidateId": 1 }))).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["class"], "transaction");
    }

    #[tokio::test]
    async fn http_ledger_talks_to_the_votes_api() {
        let (app, _, _) = app().await;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let ledger = HttpLedger::new(reqwest::Client::new(), &format!("http://{addr}/"));
        let vote = NewVote {
            voter_id: "0xabc".into(),
            event_id: 7,
            candidate_id: 3,
            block_address: "0xfeed".into(),
        };
        let record = ledger.record_vote(&vote).await.unwrap();
        assert_eq!(record.voter_id, "0xabc");
        assert_eq!(record.candidate_id, 3);

        let err = ledger.record_vote(&vote).await.unwrap_err();
        assert!(matches!(err, ReconciliationError::Duplicate { event_id: 7, .. }));

        let counts = ledger.tally(7).await.unwrap();
        assert_eq!(counts, std::collections::HashMap::from([(3, 1)]));
        assert!(ledger.tally(8).await.unwrap().is_empty());
    }

    #[test]
    fn error_classes_map_to_statuses() {
        assert_eq!(status_for(&SessionError::ActionPending), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&GatewayError::InsufficientBalance { balance: 0, required: 1 }.into()),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            status_for(
                &GatewayError::ConfirmationTimeout {
                    tx_hash: "0x1".into(),
                    waited_secs: 5
                }
                .into()
            ),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_for(&GatewayError::Unreachable("down".into()).into()),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
