//! v0 REST surface: response envelopes, error mapping and route wiring.

pub mod sessions;
pub mod usage;

use actix_web::{http::StatusCode, web, HttpRequest, HttpResponse, ResponseError};
use labpool_agents::errors::SvcError;
use labpool_common::iso_now;
use serde::Serialize;
use serde_json::{Map, Value};

/// Success envelope wrapping every 200 response.
#[derive(Serialize, Debug)]
struct Envelope<T: Serialize> {
    success: bool,
    message: String,
    data: T,
    timestamp: String,
}

pub(crate) fn ok_response<T: Serialize>(data: T, message: &str) -> HttpResponse {
    HttpResponse::Ok().json(Envelope {
        success: true,
        message: message.to_string(),
        data,
        timestamp: iso_now(),
    })
}

/// Error body with a stable machine code plus error-specific fields.
#[derive(Serialize, Debug)]
pub struct RestJsonError {
    success: bool,
    error: String,
    message: String,
    #[serde(flatten)]
    extra: Map<String, Value>,
    timestamp: String,
}

/// Wire error returned by every handler.
#[derive(Debug)]
pub struct RestError {
    status: StatusCode,
    body: RestJsonError,
}

impl std::fmt::Display for RestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.status, self.body.message)
    }
}

impl ResponseError for RestError {
    fn status_code(&self) -> StatusCode {
        self.status
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status).json(&self.body)
    }
}

impl From<SvcError> for RestError {
    fn from(error: SvcError) -> Self {
        let mut extra = Map::new();
        if let SvcError::QuotaExceeded {
            plan,
            consumed,
            quota,
            resets_at,
        } = &error
        {
            extra.insert("plan".to_string(), Value::String(plan.to_string()));
            extra.insert("consumed_minutes".to_string(), Value::from(*consumed));
            extra.insert("quota_minutes".to_string(), Value::from(*quota));
            extra.insert(
                "remaining_minutes".to_string(),
                Value::from((*quota - *consumed).max(0)),
            );
            if let Some(resets_at) = resets_at {
                extra.insert("resets_at".to_string(), Value::String(resets_at.clone()));
            }
        }
        let status = StatusCode::from_u16(error.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self {
            status,
            body: RestJsonError {
                success: false,
                error: error.machine_code().to_string(),
                message: error.to_string(),
                extra,
                timestamp: iso_now(),
            },
        }
    }
}

/// Bearer token from `X-Moodle-Token` or `Authorization: Bearer`.
pub(crate) fn bearer_token(request: &HttpRequest) -> Option<String> {
    if let Some(token) = request
        .headers()
        .get("x-moodle-token")
        .and_then(|value| value.to_str().ok())
    {
        return Some(token.to_string());
    }
    request
        .headers()
        .get(actix_web::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.to_string())
}

pub fn configure<S: labpool_common::store::definitions::Store>(
    cfg: &mut web::ServiceConfig,
) {
    sessions::configure::<S>(cfg);
    usage::configure::<S>(cfg);
}

#[cfg(test)]
mod tests {
    use super::*;
    use labpool_common::types::plan::PlanTier;

    #[test]
    fn quota_errors_carry_remaining_and_reset() {
        let error = SvcError::QuotaExceeded {
            plan: PlanTier::Freemium,
            consumed: 300,
            quota: 300,
            resets_at: Some("2026-01-01T00:00:00+00:00".to_string()),
        };
        let rest: RestError = error.into();
        assert_eq!(rest.status, StatusCode::FORBIDDEN);
        let body = serde_json::to_value(&rest.body).unwrap();
        assert_eq!(body["error"], "quota_exceeded");
        assert_eq!(body["remaining_minutes"], 0);
        assert_eq!(body["resets_at"], "2026-01-01T00:00:00+00:00");
        assert_eq!(body["success"], false);
    }

    #[test]
    fn error_statuses_follow_the_taxonomy() {
        let not_found = SvcError::SessionNotFound {
            id: "sess-x".to_string(),
        };
        assert_eq!(RestError::from(not_found).status, StatusCode::NOT_FOUND);
        let capacity = SvcError::CapacityExhausted {
            plan: PlanTier::Pro,
        };
        assert_eq!(
            RestError::from(capacity).status,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            RestError::from(SvcError::TokenRequired).status,
            StatusCode::UNAUTHORIZED
        );
    }
}
