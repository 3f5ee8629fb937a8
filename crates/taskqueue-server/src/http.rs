//! HTTP push/pop/ack/nack surface. Response shapes and the bad-request
//! field-descriptor body mirror the original transport package exactly;
//! internal error text never reaches the client.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use taskqueue_core::domain::Task;
use taskqueue_core::queue::{PushRequest, QueueService};
use taskqueue_core::task::TaskService;

const MAX_PAYLOAD_SIZE: usize = 4096;
const IDEMPOTENCY_KEY_HEADER: &str = "X-IdempotencyKey";

#[derive(Clone)]
pub struct AppState {
    pub queue_service: Arc<QueueService>,
    pub task_service: Arc<TaskService>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/queues/:queueName/push", post(push))
        .route("/v1/queues/:queueName/pop", post(pop))
        .route("/v1/tasks/:taskId/ack", post(ack))
        .route("/v1/tasks/:taskId/nack", post(nack))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct CommonResponseBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<FieldError>,
}

#[derive(Debug, Serialize)]
struct FieldError {
    name: &'static str,
    reason: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

fn bad_request_fields(fields: Vec<FieldError>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(CommonResponseBody {
            message: None,
            fields,
        }),
    )
        .into_response()
}

fn invalid_body() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(CommonResponseBody {
            message: Some("Invalid request body".to_string()),
            fields: Vec::new(),
        }),
    )
        .into_response()
}

fn internal_error(context: &str, err: impl std::fmt::Display) -> Response {
    tracing::error!(error = %err, "{context}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(CommonResponseBody {
            message: Some("Internal error".to_string()),
            fields: Vec::new(),
        }),
    )
        .into_response()
}

fn empty(status: StatusCode) -> Response {
    (status, Json(serde_json::json!({}))).into_response()
}

fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

#[derive(Debug, Serialize)]
struct TaskBody {
    id: String,
    payload: String,
    created_at: String,
}

impl From<&Task> for TaskBody {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.expect("stored task has an id").to_string(),
            payload: task.payload.clone(),
            created_at: task
                .created_at
                .expect("stored task has created_at")
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct PushResponseBody {
    task: TaskBody,
}

#[derive(Debug, Deserialize)]
struct PushRequestBody {
    payload: String,
}

async fn push(
    State(state): State<AppState>,
    Path(queue_name): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    if queue_name.is_empty() {
        return bad_request_fields(vec![FieldError {
            name: "queueName",
            reason: "EMPTY",
            message: None,
        }]);
    }

    let req: PushRequestBody = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(_) => return invalid_body(),
    };

    if req.payload.is_empty() {
        return bad_request_fields(vec![FieldError {
            name: "payload",
            reason: "EMPTY",
            message: None,
        }]);
    }

    if req.payload.len() > MAX_PAYLOAD_SIZE {
        return bad_request_fields(vec![FieldError {
            name: "payload",
            reason: "TOO_LARGE",
            message: None,
        }]);
    }

    let result = state
        .queue_service
        .push(PushRequest {
            queue_name,
            payload: req.payload,
            idempotency_key: idempotency_key(&headers),
        })
        .await;

    match result {
        Ok(task) => (StatusCode::CREATED, Json(PushResponseBody { task: TaskBody::from(&task) })).into_response(),
        Err(e) => internal_error("queue service error", e),
    }
}

#[derive(Debug, Serialize)]
struct PopResponseBody {
    task: TaskBody,
}

async fn pop(State(state): State<AppState>, Path(queue_name): Path<String>) -> Response {
    if queue_name.is_empty() {
        return bad_request_fields(vec![FieldError {
            name: "queueName",
            reason: "EMPTY",
            message: None,
        }]);
    }

    match state.queue_service.pop(&queue_name).await {
        Ok(Some(task)) => {
            (StatusCode::OK, Json(PopResponseBody { task: TaskBody::from(&task) })).into_response()
        }
        Ok(None) => empty(StatusCode::NO_CONTENT),
        Err(e) => internal_error("queue service error", e),
    }
}

fn parse_task_id(raw: &str) -> Result<Uuid, Response> {
    if raw.is_empty() {
        return Err(bad_request_fields(vec![FieldError {
            name: "taskId",
            reason: "EMPTY",
            message: None,
        }]));
    }

    Uuid::parse_str(raw).map_err(|e| {
        bad_request_fields(vec![FieldError {
            name: "taskId",
            reason: "INVALID",
            message: Some(e.to_string()),
        }])
    })
}

async fn ack(State(state): State<AppState>, Path(task_id): Path<String>, headers: HeaderMap) -> Response {
    let id = match parse_task_id(&task_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.task_service.ack(id, idempotency_key(&headers)).await {
        Ok(()) => empty(StatusCode::NO_CONTENT),
        Err(e) => internal_error("task service error", e),
    }
}

async fn nack(State(state): State<AppState>, Path(task_id): Path<String>, headers: HeaderMap) -> Response {
    let id = match parse_task_id(&task_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.task_service.nack(id, idempotency_key(&headers)).await {
        Ok(()) => empty(StatusCode::NO_CONTENT),
        Err(e) => internal_error("task service error", e),
    }
}
