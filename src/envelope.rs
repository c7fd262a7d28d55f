//! Response envelope decoding and status classification.
//!
//! The API answers with `{ "data": T }` on success and
//! `{ "error": { "code", "message", "fields"? } }` on failure. Status codes
//! map onto [`ApiError`] as follows:
//!
//! | status | result |
//! |---|---|
//! | 2xx with `data` | `Ok(T)` |
//! | 2xx with `error` | [`ApiError::Validation`] |
//! | 401 | [`ApiError::Unauthenticated`] |
//! | other 4xx | [`ApiError::Validation`] |
//! | 5xx and anything else | [`ApiError::Server`] |

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::{ApiError, FieldErrors};
use crate::transport::HttpResponse;

/// Error object inside an error envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub fields: FieldErrors,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<ErrorBody>,
}

/// Decodes a response into its payload, or classifies it as an error.
///
/// # Errors
///
/// Returns an [`ApiError`] for non-2xx statuses, error envelopes, and bodies
/// that do not decode as `T`.
pub fn decode<T: DeserializeOwned>(response: &HttpResponse) -> Result<T, ApiError> {
    if response.status == 401 {
        return Err(ApiError::Unauthenticated);
    }

    let envelope = parse_envelope(&response.body);

    if !response.is_success() {
        let body = envelope
            .ok()
            .and_then(|envelope| envelope.error)
            .unwrap_or_else(|| ErrorBody {
                code: format!("HTTP_{}", response.status),
                message: String::from_utf8_lossy(&response.body).into_owned(),
                fields: FieldErrors::new(),
            });
        return Err(classify(response.status, body));
    }

    match envelope? {
        Envelope {
            error: Some(body),
            data: None,
        } => Err(validation(response.status, body)),
        Envelope { data: Some(data), .. } => Ok(serde_json::from_value(data)?),
        Envelope { data: None, .. } => {
            // 204 and `{ "data": null }` both land here.
            serde_json::from_value(serde_json::Value::Null)
                .map_err(|_| ApiError::Decode("response has no data".to_string()))
        }
    }
}

fn parse_envelope(body: &[u8]) -> Result<Envelope, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Envelope {
            data: None,
            error: None,
        });
    }
    Ok(serde_json::from_slice(body)?)
}

fn classify(status: u16, body: ErrorBody) -> ApiError {
    if (400..500).contains(&status) {
        validation(status, body)
    } else {
        ApiError::Server {
            status,
            code: body.code,
            message: body.message,
        }
    }
}

fn validation(status: u16, body: ErrorBody) -> ApiError {
    ApiError::Validation {
        status,
        code: body.code,
        message: body.message,
        fields: body.fields,
    }
}
