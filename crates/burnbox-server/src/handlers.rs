use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use crate::{error::SecretError, AppState};

/// Largest accepted plaintext.
pub const MAX_SECRET_BYTES: usize = 1_048_576;
/// Largest accepted passphrase.
pub const MAX_PASSPHRASE_BYTES: usize = 1024;

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Generate ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub secret: String,
    pub passphrase: String,
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub secret_key: String,
}

pub async fn generate_secret(
    State(state): State<AppState>,
    Json(body): Json<GenerateRequest>,
) -> Response {
    if body.secret.len() > MAX_SECRET_BYTES {
        return bad_request("secret exceeds 1 MiB limit");
    }
    if let Err(resp) = check_passphrase(&body.passphrase) {
        return resp;
    }

    match state
        .manager
        .generate_secret(&body.secret, &body.passphrase)
        .await
    {
        Ok(secret_key) => {
            info!(ttl_seconds = state.manager.ttl().as_secs(), "secret.generate");
            Json(GenerateResponse { secret_key }).into_response()
        }
        Err(e) => error_response(e),
    }
}

// ── Get ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PassphraseRequest {
    pub passphrase: String,
}

#[derive(Debug, Serialize)]
pub struct SecretResponse {
    pub secret: String,
}

pub async fn get_secret(
    State(state): State<AppState>,
    Path(secret_key): Path<String>,
    Json(body): Json<PassphraseRequest>,
) -> Response {
    if let Err(resp) = check_passphrase(&body.passphrase) {
        return resp;
    }

    match state
        .manager
        .get_secret(&secret_key, &body.passphrase)
        .await
    {
        Ok(secret) => {
            info!("secret.burned");
            Json(SecretResponse { secret }).into_response()
        }
        Err(e) => error_response(e),
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn check_passphrase(passphrase: &str) -> Result<(), Response> {
    if passphrase.is_empty() || passphrase.len() > MAX_PASSPHRASE_BYTES {
        return Err(bad_request("passphrase must be between 1 and 1024 bytes"));
    }
    Ok(())
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message}))).into_response()
}

/// Map the lifecycle taxonomy onto HTTP. Infrastructure failures are logged
/// and answered with a fixed body.
fn error_response(e: SecretError) -> Response {
    match e {
        SecretError::NotFound => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "secret not found"})),
        )
            .into_response(),
        SecretError::InvalidPassphrase => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid passphrase"})),
        )
            .into_response(),
        other => {
            error!(error = %other, "internal error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal server error"})),
            )
                .into_response()
        }
    }
}
