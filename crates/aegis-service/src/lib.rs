#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **aegis-service** – HTTP surface for the Aegis kernel.
//!
//! Thin JSON-over-HTTP wiring around [`aegis_kernel::Kernel`]: rooms,
//! threads and messages, policy evaluation, approvals, runs with their
//! claim/lease operations, the events query, and the SSE live tail.
//! Requests and responses carry a `schema_version`; failures use the stable
//! error envelope of [`error::ApiError`].

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use aegis_kernel::{
    ApprovalRequest, CreateRun, DecideOutcome, HeartbeatOutcome, Kernel, ReleaseState,
};
use aegis_projection::reads;
use aegis_store_core::{EventFilter, EventStore};
use aegis_types::StreamType;

pub mod api;
pub mod error;

use api::*;
use error::ApiError;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// The assembled kernel.
    pub kernel: Arc<Kernel>,
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/rooms", post(create_room).get(list_rooms))
        .route("/v1/rooms/:room_id/threads", post(create_thread))
        .route(
            "/v1/threads/:thread_id/messages",
            post(post_message).get(list_messages),
        )
        .route("/v1/streams/rooms/:room_id", get(tail_room))
        .route("/v1/policy/evaluate", post(evaluate_policy))
        .route("/v1/approvals", post(create_approval).get(list_approvals))
        .route("/v1/approvals/:id", get(get_approval))
        .route("/v1/approvals/:id/decide", post(decide_approval))
        .route("/v1/runs", post(create_run).get(list_runs))
        .route("/v1/runs/claim", post(claim_runs))
        .route("/v1/runs/:id", get(get_run))
        .route("/v1/runs/:id/start", post(start_run))
        .route("/v1/runs/:id/steps", post(add_step).get(list_steps))
        .route("/v1/runs/:id/complete", post(complete_run))
        .route("/v1/runs/:id/fail", post(fail_run))
        .route("/v1/runs/:id/lease/heartbeat", post(heartbeat))
        .route("/v1/runs/:id/lease/release", post(release))
        .route("/v1/events", get(query_events))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "schema_version": CURRENT_SCHEMA_VERSION,
    }))
}

//─────────────────────────────
//  Conversations
//─────────────────────────────

async fn create_room(
    State(state): State<AppState>,
    Json(body): Json<CreateRoomBody>,
) -> Result<Json<Versioned<CreatedId>>, ApiError> {
    check_schema_version(&body.schema_version)?;
    check_actor(&body.actor)?;
    let room_id = state
        .kernel
        .create_room(body.workspace_id, body.name, body.actor)
        .await?;
    Ok(Json(Versioned::new(CreatedId { id: room_id })))
}

async fn list_rooms(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let rooms = reads::list_rooms(state.kernel.pool()).await?;
    Ok(Json(serde_json::json!({
        "schema_version": CURRENT_SCHEMA_VERSION,
        "rooms": rooms,
    })))
}

async fn create_thread(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Json(body): Json<CreateThreadBody>,
) -> Result<Json<Versioned<CreatedId>>, ApiError> {
    check_schema_version(&body.schema_version)?;
    check_actor(&body.actor)?;
    let thread_id = state.kernel.create_thread(room_id, body.title, body.actor).await?;
    Ok(Json(Versioned::new(CreatedId { id: thread_id })))
}

async fn post_message(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Json(body): Json<PostMessageBody>,
) -> Result<Json<Versioned<CreatedId>>, ApiError> {
    check_schema_version(&body.schema_version)?;
    check_actor(&body.actor)?;
    let message_id = state
        .kernel
        .post_message(body.room_id, thread_id, body.body, body.actor, body.idempotency_key)
        .await?;
    Ok(Json(Versioned::new(CreatedId { id: message_id })))
}

async fn list_messages(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let messages = reads::messages_for_thread(state.kernel.pool(), thread_id).await?;
    Ok(Json(serde_json::json!({
        "schema_version": CURRENT_SCHEMA_VERSION,
        "messages": messages,
    })))
}

//─────────────────────────────
//  Live tail
//─────────────────────────────

async fn tail_room(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Query(params): Query<TailParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let rx = state.kernel.tail_room(room_id, params.from_seq).await?;
    let stream = ReceiverStream::new(rx).map(|envelope| {
        let event = Event::default()
            .id(envelope.stream_seq.to_string())
            .event(envelope.event_type.clone());
        Ok(match event.json_data(&envelope) {
            Ok(event) => event,
            Err(_) => Event::default().comment("serialization failure"),
        })
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

//─────────────────────────────
//  Policy
//─────────────────────────────

async fn evaluate_policy(
    State(state): State<AppState>,
    Json(body): Json<EvaluateBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_schema_version(&body.schema_version)?;
    check_actor(&body.request.actor)?;
    let decision = state.kernel.evaluate_policy(body.request).await?;
    Ok(Json(serde_json::json!({
        "schema_version": CURRENT_SCHEMA_VERSION,
        "decision": decision.decision,
        "reason_code": decision.reason_code,
        "reason": decision.reason,
        "blocked": decision.blocked,
    })))
}

//─────────────────────────────
//  Approvals
//─────────────────────────────

async fn create_approval(
    State(state): State<AppState>,
    Json(body): Json<CreateApprovalBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_schema_version(&body.schema_version)?;
    check_actor(&body.requester)?;
    let approval = state
        .kernel
        .request_approval(ApprovalRequest {
            workspace_id: body.workspace_id,
            room_id: body.room_id,
            action: body.action,
            scope: body.scope,
            requester: body.requester,
            context: body.context,
        })
        .await?;
    Ok(Json(serde_json::json!({
        "schema_version": CURRENT_SCHEMA_VERSION,
        "approval": approval,
    })))
}

async fn list_approvals(
    State(state): State<AppState>,
    Query(filters): Query<ApprovalFilters>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let approvals =
        reads::list_approvals(state.kernel.pool(), filters.workspace_id, filters.status).await?;
    Ok(Json(serde_json::json!({
        "schema_version": CURRENT_SCHEMA_VERSION,
        "approvals": approvals,
    })))
}

async fn get_approval(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let approval = reads::approval_by_id(state.kernel.pool(), id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("approval {id}")))?;
    Ok(Json(serde_json::json!({
        "schema_version": CURRENT_SCHEMA_VERSION,
        "approval": approval,
    })))
}

async fn decide_approval(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<DecideApprovalBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_schema_version(&body.schema_version)?;
    check_actor(&body.decider)?;
    let approval = state
        .kernel
        .decide_approval(
            id,
            DecideOutcome {
                outcome: body.outcome,
                decider: body.decider,
                comment: body.comment,
                expires_at: body.expires_at,
            },
        )
        .await?;
    Ok(Json(serde_json::json!({
        "schema_version": CURRENT_SCHEMA_VERSION,
        "approval": approval,
    })))
}

//─────────────────────────────
//  Runs
//─────────────────────────────

async fn create_run(
    State(state): State<AppState>,
    Json(body): Json<CreateRunBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_schema_version(&body.schema_version)?;
    check_actor(&body.actor)?;
    let run = state
        .kernel
        .create_run(CreateRun {
            workspace_id: body.workspace_id,
            room_id: body.room_id,
            goal: body.goal,
            creator: body.actor,
            correlation_id: body.correlation_id,
        })
        .await?;
    Ok(Json(serde_json::json!({
        "schema_version": CURRENT_SCHEMA_VERSION,
        "run": run,
    })))
}

async fn list_runs(
    State(state): State<AppState>,
    Query(filters): Query<RunFilters>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let runs = reads::list_runs(
        state.kernel.pool(),
        filters.workspace_id,
        filters.status,
        filters.limit,
    )
    .await?;
    Ok(Json(serde_json::json!({
        "schema_version": CURRENT_SCHEMA_VERSION,
        "runs": runs,
    })))
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let run = reads::run_by_id(state.kernel.pool(), id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("run {id}")))?;
    Ok(Json(serde_json::json!({
        "schema_version": CURRENT_SCHEMA_VERSION,
        "run": run,
    })))
}

async fn claim_runs(
    State(state): State<AppState>,
    Json(body): Json<ClaimBody>,
) -> Result<Json<Versioned<ClaimResponse>>, ApiError> {
    check_schema_version(&body.schema_version)?;
    if body.actor_id.trim().is_empty() {
        return Err(ApiError::malformed("actor_id cannot be empty"));
    }
    let claimed = state
        .kernel
        .claim_runs(body.workspace_id, &body.actor_id, body.batch_limit)
        .await?;
    Ok(Json(Versioned::new(ClaimResponse {
        claimed: claimed
            .into_iter()
            .map(|claim| ClaimedRunBody {
                run_id: claim.run_id,
                claim_token: claim.claim_token,
                lease_expires_at: claim.lease_expires_at,
            })
            .collect(),
    })))
}

async fn start_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<StartRunBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_schema_version(&body.schema_version)?;
    check_actor(&body.actor)?;
    let run = state.kernel.start_run(id, body.actor, &body.claim_token).await?;
    Ok(Json(serde_json::json!({
        "schema_version": CURRENT_SCHEMA_VERSION,
        "run": run,
    })))
}

async fn add_step(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<AddStepBody>,
) -> Result<Json<Versioned<CreatedId>>, ApiError> {
    check_schema_version(&body.schema_version)?;
    check_actor(&body.actor)?;
    let step_id = state.kernel.add_step(id, body.title, body.actor).await?;
    Ok(Json(Versioned::new(CreatedId { id: step_id })))
}

async fn list_steps(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let steps = reads::steps_for_run(state.kernel.pool(), id).await?;
    Ok(Json(serde_json::json!({
        "schema_version": CURRENT_SCHEMA_VERSION,
        "steps": steps,
    })))
}

async fn complete_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<CompleteRunBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_schema_version(&body.schema_version)?;
    check_actor(&body.actor)?;
    let run = state
        .kernel
        .complete_run(id, &body.evidence_ref, body.actor, &body.claim_token)
        .await?;
    Ok(Json(serde_json::json!({
        "schema_version": CURRENT_SCHEMA_VERSION,
        "run": run,
    })))
}

async fn fail_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<FailRunBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_schema_version(&body.schema_version)?;
    check_actor(&body.actor)?;
    let run = state
        .kernel
        .fail_run(id, body.error, &body.evidence_ref, body.actor, &body.claim_token)
        .await?;
    Ok(Json(serde_json::json!({
        "schema_version": CURRENT_SCHEMA_VERSION,
        "run": run,
    })))
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<HeartbeatBody>,
) -> Result<Json<Versioned<HeartbeatResponse>>, ApiError> {
    check_schema_version(&body.schema_version)?;
    let outcome = state.kernel.heartbeat(id, &body.claim_token).await?;
    let response = match outcome {
        HeartbeatOutcome::Renewed { lease_expires_at } => {
            HeartbeatResponse { outcome: "renewed", lease_expires_at }
        }
        HeartbeatOutcome::Throttled { lease_expires_at } => {
            HeartbeatResponse { outcome: "throttled", lease_expires_at }
        }
    };
    Ok(Json(Versioned::new(response)))
}

async fn release(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ReleaseBody>,
) -> Result<StatusCode, ApiError> {
    check_schema_version(&body.schema_version)?;
    check_actor(&body.actor)?;
    let final_state = match body.final_state {
        ReleaseStateBody::Released => ReleaseState::Released,
        ReleaseStateBody::Completed => ReleaseState::Completed,
        ReleaseStateBody::Failed => ReleaseState::Failed,
    };
    state
        .kernel
        .release_run(id, &body.claim_token, final_state, body.actor)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

//─────────────────────────────
//  Events
//─────────────────────────────

async fn query_events(
    State(state): State<AppState>,
    Query(params): Query<EventQueryParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let stream_type = params
        .stream_type
        .as_deref()
        .map(|raw| {
            StreamType::parse(raw)
                .ok_or_else(|| ApiError::malformed(format!("unknown stream_type {raw}")))
        })
        .transpose()?;
    let events = state
        .kernel
        .store()
        .query(EventFilter {
            stream_type,
            stream_id: params.stream_id,
            from_seq: params.from_seq,
            run_id: params.run_id,
            correlation_id: params.correlation_id,
            limit: params.limit,
        })
        .await
        .map_err(aegis_kernel::KernelError::Store)?;
    Ok(Json(serde_json::json!({
        "schema_version": CURRENT_SCHEMA_VERSION,
        "events": events,
    })))
}
