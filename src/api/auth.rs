// =============================================================================
// Control-surface authentication
// =============================================================================
//
// Two secrets guard the engine. Operator endpoints (engine start/stop,
// panic, reset, status) require `Authorization: Bearer <token>` matching
// the `MERIDIAN_ADMIN_TOKEN` environment variable; the signal webhook
// authenticates with the shared passphrase carried in its body. Both
// comparisons run in constant time so a probing client learns nothing from
// response latency.
// =============================================================================

use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts, StatusCode};
use axum::Json;
use tracing::warn;

/// Constant-time equality over secrets: every byte of both slices is
/// examined even after a mismatch. A length difference is the one
/// observable early exit, and the attacker does not control the expected
/// secret's length.
fn secrets_match(provided: &[u8], expected: &[u8]) -> bool {
    provided.len() == expected.len()
        && provided
            .iter()
            .zip(expected)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

/// Webhook passphrase check. An unset passphrase locks the webhook rather
/// than opening it.
pub fn verify_passphrase(provided: &str, expected: &str) -> bool {
    !expected.is_empty() && secrets_match(provided.as_bytes(), expected.as_bytes())
}

fn forbidden(message: &'static str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::FORBIDDEN,
        Json(serde_json::json!({ "error": message })),
    )
}

/// Extractor guarding the operator endpoints. A request only reaches the
/// handler body once its bearer token matches the configured admin token.
pub struct OperatorAuth;

#[axum::async_trait]
impl<S> FromRequestParts<S> for OperatorAuth
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<serde_json::Value>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        // Re-read per request so the operator can rotate the token without
        // restarting a live trading session.
        let expected = std::env::var("MERIDIAN_ADMIN_TOKEN").unwrap_or_default();
        if expected.is_empty() {
            warn!("MERIDIAN_ADMIN_TOKEN unset: control endpoints are locked");
            return Err(forbidden("engine control is not configured"));
        }

        let provided = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));

        match provided {
            Some(token) if secrets_match(token.as_bytes(), expected.as_bytes()) => Ok(Self),
            Some(_) => {
                warn!("control request rejected: bad operator token");
                Err(forbidden("invalid operator token"))
            }
            None => Err(forbidden("missing bearer token")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    #[test]
    fn passphrase_gates_webhook_signals() {
        assert!(verify_passphrase("open-sesame", "open-sesame"));
        assert!(!verify_passphrase("open-sesame", "different"));
        // An unconfigured passphrase must lock the webhook, not open it.
        assert!(!verify_passphrase("", ""));
        assert!(!verify_passphrase("anything", ""));
    }

    #[test]
    fn secret_comparison_checks_every_byte() {
        assert!(secrets_match(b"ops-token", b"ops-token"));
        assert!(!secrets_match(b"ops-token", b"ops-tokeX"));
        assert!(!secrets_match(b"ops-token", b"ops-token-longer"));
        assert!(!secrets_match(b"", b"x"));
        assert!(secrets_match(b"", b""));
    }

    fn control_request(auth_header: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/api/v1/engine/start");
        if let Some(value) = auth_header {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder.body(()).expect("test request").into_parts().0
    }

    // All the env-var-dependent cases live in one test so parallel test
    // threads never observe a half-configured token.
    #[tokio::test]
    async fn operator_endpoints_require_the_configured_token() {
        std::env::set_var("MERIDIAN_ADMIN_TOKEN", "ops-secret");

        let mut ok = control_request(Some("Bearer ops-secret"));
        assert!(OperatorAuth::from_request_parts(&mut ok, &()).await.is_ok());

        let mut wrong = control_request(Some("Bearer nope"));
        assert!(OperatorAuth::from_request_parts(&mut wrong, &())
            .await
            .is_err());

        let mut not_bearer = control_request(Some("Basic ops-secret"));
        assert!(OperatorAuth::from_request_parts(&mut not_bearer, &())
            .await
            .is_err());

        let mut missing = control_request(None);
        assert!(OperatorAuth::from_request_parts(&mut missing, &())
            .await
            .is_err());

        // With no token configured, even a "correct" guess is refused.
        std::env::remove_var("MERIDIAN_ADMIN_TOKEN");
        let mut unconfigured = control_request(Some("Bearer ops-secret"));
        assert!(OperatorAuth::from_request_parts(&mut unconfigured, &())
            .await
            .is_err());
    }
}
