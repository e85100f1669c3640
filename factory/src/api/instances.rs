use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, warn};

use super::i18n::{Locale, Message};
use super::{error_response, ApiError, ApiState};
use crate::instance::{BackupArchive, InstanceError};

const STREAM_CHUNK: usize = 64 * 1024;

pub fn routes() -> Router<Arc<ApiState>> {
    Router::new()
        .route("/instances", get(list_instances).post(create_instance))
        .route("/instances/{id}", delete(delete_instance))
        .route("/instances/{id}/stop", post(stop_instance))
        .route("/instances/{id}/reset-password", post(reset_password))
        .route("/instances/{id}/backup", get(backup_instance))
}

/// The failure reported when an operation breaks for reasons the caller
/// cannot fix (supervisor, filesystem, archive).
#[derive(Clone, Copy)]
struct Operation {
    name: &'static str,
    code: &'static str,
    message: Message,
}

const LIST: Operation = Operation {
    name: "list",
    code: "LIST_FAILED",
    message: Message::ListInstancesFailed,
};
const CREATE: Operation = Operation {
    name: "create",
    code: "CREATE_FAILED",
    message: Message::CreateInstanceFailed,
};
const STOP: Operation = Operation {
    name: "stop",
    code: "STOP_FAILED",
    message: Message::StopInstanceFailed,
};
const RESET: Operation = Operation {
    name: "reset-password",
    code: "RESET_PASSWORD_FAILED",
    message: Message::ResetPasswordFailed,
};
const DELETE: Operation = Operation {
    name: "delete",
    code: "DELETE_FAILED",
    message: Message::DeleteInstanceFailed,
};
const BACKUP: Operation = Operation {
    name: "backup",
    code: "BACKUP_FAILED",
    message: Message::CreateBackupFailed,
};

/// Map an orchestrator error to its HTTP form. Internal details are logged
/// here and never sent to the client.
fn instance_error(err: InstanceError, op: Operation, locale: Locale) -> Response {
    let (status, code, message) = match &err {
        InstanceError::MissingPort => (StatusCode::BAD_REQUEST, "MISSING_PARAMS", Message::MissingParams),
        InstanceError::InvalidPort(_) => (StatusCode::BAD_REQUEST, "INVALID_PORT", Message::InvalidPort),
        InstanceError::InvalidId(_) => (
            StatusCode::BAD_REQUEST,
            "INVALID_INSTANCE_ID",
            Message::InvalidInstanceId,
        ),
        InstanceError::PortInUse(_) => (StatusCode::BAD_REQUEST, "PORT_IN_USE", Message::PortInUse),
        InstanceError::NotFound(_) => (
            StatusCode::NOT_FOUND,
            "INSTANCE_NOT_FOUND",
            Message::InstanceNotFound,
        ),
        InstanceError::NotRunning(_) => (
            StatusCode::BAD_REQUEST,
            "INSTANCE_NOT_RUNNING",
            Message::InstanceNotRunning,
        ),
        InstanceError::DeleteIncomplete {
            process_removed,
            data_removed,
            ..
        } => {
            error!(operation = op.name, error = %err, "instance operation failed");
            let body = ApiError {
                process_removed: Some(*process_removed),
                data_removed: Some(*data_removed),
                ..ApiError::new("DELETE_INCOMPLETE", Message::DeleteIncomplete.text(locale))
            };
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response();
        }
        InstanceError::Supervisor(_) | InstanceError::Filesystem { .. } | InstanceError::Backup(_) => {
            error!(operation = op.name, error = %err, "instance operation failed");
            (StatusCode::INTERNAL_SERVER_ERROR, op.code, op.message)
        }
    };
    if status.is_client_error() {
        debug!(operation = op.name, error = %err, "instance request rejected");
    }
    error_response(status, code, message.text(locale))
}

#[derive(Debug, Deserialize)]
struct CreateRequest {
    port: Option<Value>,
}

/// Accept the port as a JSON number or a string of ASCII digits. `null`, a
/// missing field and an empty string all mean "no port given". Signs and
/// surrounding whitespace are rejected.
fn requested_port(raw: Option<&Value>) -> Result<Option<i64>, InstanceError> {
    match raw {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| InstanceError::InvalidPort(n.to_string())),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) if s.bytes().all(|b| b.is_ascii_digit()) => s
            .parse::<i64>()
            .map(Some)
            .map_err(|_| InstanceError::InvalidPort(s.clone())),
        Some(Value::String(s)) => Err(InstanceError::InvalidPort(s.clone())),
        Some(other) => Err(InstanceError::InvalidPort(other.to_string())),
    }
}

async fn list_instances(State(state): State<Arc<ApiState>>, locale: Locale) -> Response {
    match state.instances.list().await {
        Ok(instances) => Json(instances).into_response(),
        Err(e) => instance_error(e, LIST, locale),
    }
}

async fn create_instance(
    State(state): State<Arc<ApiState>>,
    locale: Locale,
    body: Result<Json<CreateRequest>, JsonRejection>,
) -> Response {
    let req = match body {
        Ok(Json(req)) => req,
        Err(rejection) => {
            debug!(error = %rejection, "unreadable create request body");
            return error_response(
                StatusCode::BAD_REQUEST,
                "MISSING_PARAMS",
                Message::MissingParams.text(locale),
            );
        }
    };

    let port = match requested_port(req.port.as_ref()) {
        Ok(port) => port,
        Err(e) => return instance_error(e, CREATE, locale),
    };

    match state.instances.create(port).await {
        Ok(created) => (StatusCode::CREATED, Json(created)).into_response(),
        Err(e) => instance_error(e, CREATE, locale),
    }
}

async fn stop_instance(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    locale: Locale,
) -> Response {
    match state.instances.stop(&id).await {
        Ok(stopped) => Json(stopped).into_response(),
        Err(e) => instance_error(e, STOP, locale),
    }
}

async fn reset_password(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    locale: Locale,
) -> Response {
    match state.instances.reset_credentials(&id).await {
        Ok(reset) => Json(reset).into_response(),
        Err(e) => instance_error(e, RESET, locale),
    }
}

async fn delete_instance(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    locale: Locale,
) -> Response {
    match state.instances.delete(&id).await {
        Ok(()) => Json(serde_json::json!({
            "message": Message::InstanceDeleted.text(locale),
        }))
        .into_response(),
        Err(e) => instance_error(e, DELETE, locale),
    }
}

/// Stream a freshly produced archive of the instance's data directory.
///
/// The staged file is owned by the body stream, so it is removed once the
/// download completes or the client goes away.
async fn backup_instance(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    locale: Locale,
) -> Response {
    let BackupArchive {
        id,
        file_name,
        size,
        archive,
    } = match state.instances.backup(&id).await {
        Ok(b) => b,
        Err(e) => return instance_error(e, BACKUP, locale),
    };

    let mut file = match archive.open().await {
        Ok(f) => f,
        Err(e) => return instance_error(e.into(), BACKUP, locale),
    };

    let disposition = match HeaderValue::from_str(&format!("attachment; filename={}", file_name)) {
        Ok(v) => v,
        Err(e) => {
            error!(instance_id = %id, error = %e, "backup file name is not a valid header");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                BACKUP.code,
                BACKUP.message.text(locale),
            );
        }
    };

    info!(instance_id = %id, bytes = size, file = %file_name, "streaming backup");

    let stream = async_stream::stream! {
        let _archive = archive;
        let mut buf = vec![0u8; STREAM_CHUNK];
        let mut sent: u64 = 0;
        loop {
            match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    sent += n as u64;
                    yield Ok::<_, std::io::Error>(Bytes::copy_from_slice(&buf[..n]));
                }
                Err(e) => {
                    warn!(instance_id = %id, error = %e, "reading staged backup failed");
                    yield Err(e);
                    break;
                }
            }
        }
        debug!(instance_id = %id, bytes = sent, "backup stream finished");
    };

    (
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/zip")),
            (header::CONTENT_DISPOSITION, disposition),
            (header::CONTENT_LENGTH, HeaderValue::from(size)),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}
