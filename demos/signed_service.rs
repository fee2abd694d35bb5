//! Minimal example: one service calling another over a signed channel.
//!
//! Builds the receiving side as an axum router behind `SignatureLayer`,
//! signs a request the way the calling side would, and protects the
//! sensitive fields of the payload before "storing" it.
//! Run with: `cargo run --example signed_service`

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::Response,
    routing::post,
    Extension, Router,
};
use serde_json::Value;
use tower::ServiceExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sigvault::{
    ApiKey, FieldEncryptionService, InMemoryDekStore, KeyStore, RequestSigner, SensitiveFieldWalker,
    SignatureLayer, SignatureVerifier, SigvaultConfig,
};

const CONFIG: &str = r#"{
    "signature": {
        "missing_headers": "reject",
        "validity_window_secs": 300
    },
    "encryption": {
        "master_key": "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8="
    }
}"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // 1. Setup
    let config = SigvaultConfig::from_json(CONFIG)?;
    let keys = Arc::new(KeyStore::new());
    keys.register("notification-service", "secret-key-001-change-in-production")?;

    let fields = Arc::new(FieldEncryptionService::from_config(
        &config.encryption,
        Arc::new(InMemoryDekStore::new()),
    )?);
    let walker = Arc::new(SensitiveFieldWalker::new(fields));

    // 2. Receiving service
    let verifier = Arc::new(SignatureVerifier::new(keys.clone(), &config.signature)?);
    let app = Router::new()
        .route(
            "/api/notifications",
            post(move |Extension(caller): Extension<ApiKey>, body: String| {
                let walker = Arc::clone(&walker);
                async move { store_notification(&walker, &caller.0, &body) }
            }),
        )
        .layer(SignatureLayer::new(verifier, config.signature.clone()));

    // 3. Calling service signs its request
    let signer = RequestSigner::new(keys, &config.signature);
    let body = r#"{"recipient":{"email":"alice@example.com"},"message":"Your playlist is ready"}"#;
    let envelope = signer.sign(
        "notification-service",
        "POST",
        "/api/notifications",
        &[],
        body.as_bytes(),
    )?;

    let mut request = Request::builder()
        .method("POST")
        .uri("/api/notifications")
        .header("content-type", "application/json");
    for (name, value) in envelope.to_headers(&config.signature.headers) {
        request = request.header(name, value);
    }

    let response = app
        .clone()
        .oneshot(request.body(Body::from(body))?)
        .await?;
    println!("signed request   -> {}", response.status());

    // 4. The same request again is a replay
    let mut replay = Request::builder()
        .method("POST")
        .uri("/api/notifications");
    for (name, value) in envelope.to_headers(&config.signature.headers) {
        replay = replay.header(name, value);
    }
    let response = app.oneshot(replay.body(Body::from(body))?).await?;
    println!("replayed request -> {}", response.status());

    Ok(())
}

fn store_notification(walker: &SensitiveFieldWalker, caller: &str, body: &str) -> Response {
    let mut payload: Value = match serde_json::from_str(body) {
        Ok(payload) => payload,
        Err(_) => return status(StatusCode::BAD_REQUEST),
    };
    match walker.encrypt_fields(&mut payload) {
        Ok(count) => {
            info!(caller, protected = count, "notification stored");
            println!("stored payload   : {payload}");
            status(StatusCode::CREATED)
        }
        Err(err) => {
            info!(caller, reason = err.reason_code(), "could not protect payload");
            status(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn status(code: StatusCode) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = code;
    response
}
