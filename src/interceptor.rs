//! Signature-checking middleware.
//!
//! Reads the four protocol headers, buffers the body once so it can be both
//! hashed and handed on intact, runs the verifier and short-circuits with a
//! generic 401 on failure. On success the request carries [`ApiKey`] and
//! [`SignatureVerified`] extensions for downstream authorization.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, Request, StatusCode},
    response::Response,
};
use chrono::Utc;
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::config::{HeaderNames, MissingHeaderPolicy, SignatureConfig};
use crate::error::SigvaultError;
use crate::verifier::{SignatureVerifier, SignedRequest};

/// Message sent with every 401. Never varies with the rejection reason.
pub const UNAUTHORIZED_MESSAGE: &str = "Request signature validation failed";

/// Request attribute `api.key`: the key id of a verified caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKey(pub String);

/// Request attribute `api.signature.verified`. Present only when the
/// signature was checked and accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureVerified;

/// Signature verification layer
#[derive(Clone)]
pub struct SignatureLayer {
    verifier: Arc<SignatureVerifier>,
    config: Arc<SignatureConfig>,
}

impl SignatureLayer {
    pub fn new(verifier: Arc<SignatureVerifier>, config: SignatureConfig) -> Self {
        Self {
            verifier,
            config: Arc::new(config),
        }
    }
}

impl<S> Layer<S> for SignatureLayer {
    type Service = SignatureService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SignatureService {
            inner,
            verifier: Arc::clone(&self.verifier),
            config: Arc::clone(&self.config),
        }
    }
}

/// Signature verification service
#[derive(Clone)]
pub struct SignatureService<S> {
    inner: S,
    verifier: Arc<SignatureVerifier>,
    config: Arc<SignatureConfig>,
}

impl<S> Service<Request<Body>> for SignatureService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let verifier = Arc::clone(&self.verifier);
        let config = Arc::clone(&self.config);
        let mut inner = self.inner.clone();

        Box::pin(async move {
            if !config.enabled || config.bypass.matches(req.uri().path()) {
                return inner.call(req).await;
            }

            let presented = match ProtocolHeaders::extract(req.headers(), &config.headers) {
                Ok(headers) => headers,
                Err(SigvaultError::MissingHeaders)
                    if config.missing_headers == MissingHeaderPolicy::PassThrough =>
                {
                    debug!(
                        path = req.uri().path(),
                        "unsigned request passed through"
                    );
                    return inner.call(req).await;
                }
                // A present but unreadable header is an attempt at signing,
                // never an unsigned request.
                Err(err) => {
                    warn!(
                        method = %req.method(),
                        path = req.uri().path(),
                        reason = err.reason_code(),
                        "request signature rejected"
                    );
                    return Ok(unauthorized_response());
                }
            };

            let (parts, body) = req.into_parts();
            let bytes = match axum::body::to_bytes(body, config.max_body_bytes).await {
                Ok(bytes) => bytes,
                Err(_) => {
                    warn!(
                        path = parts.uri.path(),
                        limit = config.max_body_bytes,
                        "request body unreadable or over limit"
                    );
                    return Ok(payload_too_large_response());
                }
            };

            let verified = match presented.timestamp.trim().parse::<i64>() {
                Ok(timestamp) => {
                    let headers = collect_headers(&parts.headers);
                    verifier.verify(&SignedRequest {
                        key_id: &presented.key_id,
                        signature: &presented.signature,
                        timestamp,
                        nonce: &presented.nonce,
                        method: parts.method.as_str(),
                        path: parts.uri.path(),
                        headers: &headers,
                        body: &bytes,
                    })
                }
                Err(_) => {
                    warn!(
                        key_id = %presented.key_id,
                        path = parts.uri.path(),
                        reason = SigvaultError::MalformedHeader("timestamp").reason_code(),
                        "request signature rejected"
                    );
                    false
                }
            };

            if !verified {
                return Ok(unauthorized_response());
            }

            let mut req = Request::from_parts(parts, Body::from(bytes));
            req.extensions_mut().insert(ApiKey(presented.key_id));
            req.extensions_mut().insert(SignatureVerified);
            inner.call(req).await
        })
    }
}

/// The four protocol header values, as presented.
struct ProtocolHeaders {
    key_id: String,
    signature: String,
    timestamp: String,
    nonce: String,
}

impl ProtocolHeaders {
    fn extract(headers: &HeaderMap, names: &HeaderNames) -> Result<Self, SigvaultError> {
        let get = |name: &str| -> Result<String, SigvaultError> {
            let value = headers.get(name).ok_or(SigvaultError::MissingHeaders)?;
            let value = value
                .to_str()
                .map_err(|_| SigvaultError::MalformedHeader("protocol header"))?
                .trim();
            if value.is_empty() {
                return Err(SigvaultError::MissingHeaders);
            }
            Ok(value.to_string())
        };
        Ok(Self {
            key_id: get(&names.key_id)?,
            signature: get(&names.signature)?,
            timestamp: get(&names.timestamp)?,
            nonce: get(&names.nonce)?,
        })
    }
}

/// Request headers as string pairs. A value that is not visible ASCII
/// becomes a placeholder no signer produces, so a signed header carrying
/// one fails verification instead of being dropped.
fn collect_headers(headers: &HeaderMap) -> Vec<(&str, &str)> {
    headers
        .iter()
        .map(|(name, value)| (name.as_str(), value.to_str().unwrap_or("\u{fffd}")))
        .collect()
}

fn error_response(status: StatusCode, error: &str, message: &str) -> Response {
    let body = serde_json::json!({
        "error": error,
        "message": message,
        "timestamp": Utc::now().timestamp_millis(),
    });

    let mut response = Response::new(Body::from(serde_json::to_vec(&body).unwrap_or_default()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

/// Generic 401. Carries no signature, secret or rejection reason.
pub fn unauthorized_response() -> Response {
    error_response(StatusCode::UNAUTHORIZED, "Unauthorized", UNAUTHORIZED_MESSAGE)
}

fn payload_too_large_response() -> Response {
    error_response(
        StatusCode::PAYLOAD_TOO_LARGE,
        "Payload Too Large",
        "Request body exceeds the allowed size",
    )
}
