//! Maps Scaleway failures onto backend error categories.

use reqwest::StatusCode;
use scaleway_rs::{ScalewayApiError, ScalewayError};

use crate::backend::{BackendError, BackendErrorKind};

/// Classifies an HTTP status returned by the Scaleway APIs.
pub(super) fn classify_status(status: StatusCode) -> BackendErrorKind {
    match status.as_u16() {
        400 | 401 | 403 | 422 => BackendErrorKind::Rejected,
        404 => BackendErrorKind::NotFound,
        409 => BackendErrorKind::Conflict,
        429 | 500..=599 => BackendErrorKind::Transient,
        _ => BackendErrorKind::Other,
    }
}

/// Builds an error from a non-success response body.
pub(super) fn response_error(operation: &str, status: StatusCode, body: &[u8]) -> BackendError {
    let detail = serde_json::from_slice::<ScalewayApiError>(body).map_or_else(
        |_| String::from_utf8_lossy(body).trim().to_owned(),
        |api| api.message,
    );
    BackendError::new(
        classify_status(status),
        format!("{operation} failed with HTTP {status}: {detail}"),
    )
}

/// Connection failures and timeouts are worth retrying.
pub(super) fn transport_error(operation: &str, err: &reqwest::Error) -> BackendError {
    let kind = err
        .status()
        .map_or(BackendErrorKind::Transient, classify_status);
    BackendError::new(kind, format!("{operation} request failed: {err}"))
}

/// Response bodies that do not match the expected shape.
pub(super) fn decode_error(operation: &str, err: &serde_json::Error) -> BackendError {
    BackendError::new(
        BackendErrorKind::Other,
        format!("{operation} returned an unexpected body: {err}"),
    )
}

/// Errors raised through the `scaleway-rs` client.
pub(super) fn sdk_error(operation: &str, err: ScalewayError) -> BackendError {
    match err {
        ScalewayError::Api(api) => {
            let kind = match api.etype.as_str() {
                "not_found" | "unknown_resource" => BackendErrorKind::NotFound,
                "denied_authentication" | "permissions_denied" | "invalid_arguments"
                | "quotas_exceeded" | "precondition_failed" => BackendErrorKind::Rejected,
                "resource_already_exists" | "conflict" => BackendErrorKind::Conflict,
                "out_of_stock" | "transient_state" => BackendErrorKind::Transient,
                _ => BackendErrorKind::Other,
            };
            BackendError::new(kind, format!("{operation}: {}", api.message))
        }
        other => BackendError::new(
            BackendErrorKind::Transient,
            format!("{operation} request failed: {other}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(400, BackendErrorKind::Rejected)]
    #[case(401, BackendErrorKind::Rejected)]
    #[case(403, BackendErrorKind::Rejected)]
    #[case(422, BackendErrorKind::Rejected)]
    #[case(404, BackendErrorKind::NotFound)]
    #[case(409, BackendErrorKind::Conflict)]
    #[case(429, BackendErrorKind::Transient)]
    #[case(503, BackendErrorKind::Transient)]
    #[case(418, BackendErrorKind::Other)]
    fn statuses_are_classified(#[case] code: u16, #[case] expected: BackendErrorKind) {
        let status = StatusCode::from_u16(code).unwrap_or_else(|err| panic!("status: {err}"));
        assert_eq!(classify_status(status), expected);
    }

    #[test]
    fn api_error_message_is_reported() {
        let body = br#"{"type": "invalid_arguments", "message": "commercial_type is unknown"}"#;

        let err = response_error("create server", StatusCode::BAD_REQUEST, body);

        assert_eq!(err.kind, BackendErrorKind::Rejected);
        assert!(err.message.contains("commercial_type is unknown"), "{}", err.message);
    }

    #[test]
    fn plain_body_is_kept_verbatim() {
        let err = response_error("delete key", StatusCode::CONFLICT, b" in use \n");

        assert_eq!(err.kind, BackendErrorKind::Conflict);
        assert!(err.message.ends_with(": in use"), "{}", err.message);
    }
}
