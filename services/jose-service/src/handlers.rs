//! Key issuance handlers
//!
//! All handlers run behind the template's session middleware; the
//! authenticated tenant arrives as a [`SessionContext`] extension and every
//! store call is scoped to it.

use axum::extract::Path;
use chrono::Utc;
use keystone_service::crypto::{jwk::Jwk, jws, registry, KeyMaterial, KeyUse};
use keystone_service::prelude::*;

use crate::store::{self, JoseKeyRow};

/// Key creation request
#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    /// Registry algorithm name (for example `ES256` or `A256GCM`)
    pub algorithm: String,
    /// `sig` or `enc`; derived from the algorithm when absent
    #[serde(default)]
    pub key_use: Option<String>,
}

/// Public view of an issued key
#[derive(Debug, Serialize)]
pub struct KeyResponse {
    pub kid: String,
    pub algorithm: String,
    pub key_use: String,
    pub created_at: String,
    pub public_jwk: serde_json::Value,
}

fn key_response(row: &JoseKeyRow) -> Result<KeyResponse> {
    let public_jwk = serde_json::from_str(&row.public_jwk)
        .map_err(|e| Error::Internal(format!("stored public JWK unreadable: {e}")))?;
    Ok(KeyResponse {
        kid: row.kid.clone(),
        algorithm: row.algorithm.clone(),
        key_use: row.key_use.clone(),
        created_at: row.created_at.clone(),
        public_jwk,
    })
}

/// POST /service/api/v1/keys — mint a key for the tenant.
pub async fn create_key(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Json(request): Json<CreateKeyRequest>,
) -> Result<(StatusCode, Json<KeyResponse>)> {
    let entry = registry::lookup(&request.algorithm)?;
    let key_use = match request.key_use.as_deref() {
        Some("sig") => KeyUse::Signature,
        Some("enc") => KeyUse::Encryption,
        Some(other) => {
            return Err(Error::BadRequest(format!(
                "key_use must be sig or enc, got {other}"
            )))
        }
        None if entry.is_signing() => KeyUse::Signature,
        None => KeyUse::Encryption,
    };
    if entry.is_signing() != (key_use == KeyUse::Signature) {
        return Err(Error::BadRequest(format!(
            "algorithm {} does not support that use",
            entry.name
        )));
    }

    let material = KeyMaterial::generate(entry)?;
    let jwk = material.to_jwk(entry, key_use)?;
    let wrapped = state.barrier().encrypt(jwk.to_json()?.as_bytes()).await?;
    let public = jwk.public_jwk();

    let row = JoseKeyRow {
        kid: jwk.kid.clone(),
        tenant_id: session.tenant_id.clone(),
        algorithm: entry.name.to_string(),
        key_use: match key_use {
            KeyUse::Signature => "sig".to_string(),
            KeyUse::Encryption => "enc".to_string(),
        },
        public_jwk: public.to_json()?,
        wrapped_private_jwk: wrapped,
        created_at: Utc::now().to_rfc3339(),
    };
    store::insert_key(state.repo(), &row).await?;

    info!(
        tenant_id = %session.tenant_id,
        kid = %row.kid,
        algorithm = %row.algorithm,
        "issued key"
    );
    Ok((StatusCode::CREATED, Json(key_response(&row)?)))
}

/// GET /service/api/v1/keys/{kid} — public JWK of an issued key.
pub async fn get_key(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Path(kid): Path<String>,
) -> Result<Json<KeyResponse>> {
    let row = store::find_key(state.repo(), &session.tenant_id, &kid)
        .await?
        .ok_or_else(|| Error::NotFound(format!("no key {kid}")))?;
    Ok(Json(key_response(&row)?))
}

/// GET /browser/api/v1/keys — the tenant's keys.
pub async fn list_keys(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
) -> Result<Json<Vec<KeyResponse>>> {
    let rows = store::list_keys(state.repo(), &session.tenant_id).await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        out.push(key_response(row)?);
    }
    Ok(Json(out))
}

/// Signing request
#[derive(Debug, Deserialize)]
pub struct SignRequest {
    /// Claims object to sign
    pub claims: serde_json::Value,
}

/// Signing response
#[derive(Debug, Serialize)]
pub struct SignResponse {
    pub kid: String,
    pub jws: String,
}

/// POST /service/api/v1/keys/{kid}/sign — compact JWS over the submitted
/// claims with a key the tenant owns.
pub async fn sign_payload(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Path(kid): Path<String>,
    Json(request): Json<SignRequest>,
) -> Result<Json<SignResponse>> {
    let row = store::find_key(state.repo(), &session.tenant_id, &kid)
        .await?
        .ok_or_else(|| Error::NotFound(format!("no key {kid}")))?;
    if row.key_use != "sig" {
        return Err(Error::BadRequest(format!("key {kid} is not a signing key")));
    }

    let json = state.barrier().decrypt(&row.wrapped_private_jwk).await?;
    let jwk = Jwk::from_json(&json)?;
    let token = jws::sign_claims(&jwk, &request.claims)?;

    Ok(Json(SignResponse { kid, jws: token }))
}
