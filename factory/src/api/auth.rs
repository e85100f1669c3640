use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use tracing::warn;

use super::i18n::{Locale, Message};
use super::ApiState;

/// Header carrying the shared admin secret.
pub const ADMIN_KEY_HEADER: &str = "x-st-admin-key";

/// Why a request was refused at the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateError {
    /// The server has no admin key, so nothing can be authorized.
    NotConfigured,
    Missing,
    Invalid,
}

impl GateError {
    pub fn status(self) -> StatusCode {
        match self {
            Self::NotConfigured => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Missing | Self::Invalid => StatusCode::UNAUTHORIZED,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Self::NotConfigured => "ADMIN_KEY_NOT_CONFIGURED",
            Self::Missing => "ADMIN_KEY_MISSING",
            Self::Invalid => "ADMIN_KEY_INVALID",
        }
    }

    pub fn message(self) -> Message {
        match self {
            Self::NotConfigured => Message::AdminKeyNotConfigured,
            Self::Missing => Message::AdminKeyMissing,
            Self::Invalid => Message::AdminKeyInvalid,
        }
    }
}

/// Constant-time comparison. Only the length leaks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b)
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Decide whether `presented` matches the `configured` secret.
pub fn check_admin_key(configured: &str, presented: Option<&[u8]>) -> Result<(), GateError> {
    if configured.is_empty() {
        return Err(GateError::NotConfigured);
    }
    match presented {
        None | Some(b"") => Err(GateError::Missing),
        Some(key) if constant_time_eq(key, configured.as_bytes()) => Ok(()),
        Some(_) => Err(GateError::Invalid),
    }
}

/// Middleware guarding every `/api/instances` route.
pub async fn require_admin_key(
    State(state): State<Arc<ApiState>>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request.headers().get(ADMIN_KEY_HEADER).map(|v| v.as_bytes());

    match check_admin_key(&state.admin_key, presented) {
        Ok(()) => next.run(request).await,
        Err(gate) => {
            if gate == GateError::NotConfigured {
                warn!("rejecting request: no admin key configured");
            }
            let locale = Locale::detect(request.uri(), request.headers());
            super::error_response(gate.status(), gate.code(), gate.message().text(locale))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_equal_strings() {
        assert!(constant_time_eq(b"secret-token-123", b"secret-token-123"));
    }

    #[test]
    fn constant_time_eq_different_strings() {
        assert!(!constant_time_eq(b"secret-token-123", b"secret-token-124"));
        assert!(!constant_time_eq(b"short", b"longer-value"));
        assert!(!constant_time_eq(b"", b"x"));
    }

    fn check(configured: &str, presented: Option<&str>) -> Result<(), GateError> {
        check_admin_key(configured, presented.map(str::as_bytes))
    }

    #[test]
    fn unconfigured_key_rejects_everything() {
        assert_eq!(check("", None), Err(GateError::NotConfigured));
        assert_eq!(check("", Some("")), Err(GateError::NotConfigured));
        assert_eq!(check("", Some("anything")), Err(GateError::NotConfigured));
    }

    #[test]
    fn missing_and_invalid_keys() {
        assert_eq!(check("k", None), Err(GateError::Missing));
        assert_eq!(check("k", Some("")), Err(GateError::Missing));
        assert_eq!(check("k", Some("K")), Err(GateError::Invalid));
        assert_eq!(check("k", Some("k ")), Err(GateError::Invalid));
        assert_eq!(check("k", Some("k")), Ok(()));
    }

    #[test]
    fn non_utf8_key_is_invalid() {
        let raw: &[u8] = &[0xff, b'k'];
        assert_eq!(check_admin_key("k", Some(raw)), Err(GateError::Invalid));
    }

    #[test]
    fn gate_error_mapping() {
        assert_eq!(GateError::NotConfigured.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(GateError::Missing.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(GateError::Invalid.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(GateError::Invalid.code(), "ADMIN_KEY_INVALID");
        assert_eq!(
            GateError::NotConfigured.message().text(Locale::Zh),
            "服务器未配置管理员密钥"
        );
    }
}
