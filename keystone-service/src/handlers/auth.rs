//! Tenant registration and login
//!
//! `/auth/register` creates a tenant on demand, ensures its default realm,
//! and creates the initial user; it is idempotent on `(tenant_id,
//! username)`. `/auth/login` verifies the password and issues a session in
//! the realm's configured form.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::post, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SessionForm;
use crate::error::{Error, Result};
use crate::repository::{RealmRow, TenantRow, UserRow};
use crate::state::AppState;

/// Default realm created for a fresh tenant.
const DEFAULT_REALM: &str = "default";

/// Registration request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Existing tenant to join; absent means create a new tenant
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Tenant display name, required when creating a tenant
    #[serde(default)]
    pub tenant_name: Option<String>,
    /// Realm to place the user in (default realm when absent)
    #[serde(default)]
    pub realm_id: Option<String>,
    pub username: String,
    pub password: String,
}

/// Registration response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub tenant_id: String,
    pub user_id: String,
    pub realm_id: String,
    pub username: String,
    /// False when the `(tenant, username)` pair already existed
    pub created: bool,
}

/// Login request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub tenant_id: String,
    pub username: String,
    pub password: String,
}

/// Login response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub csrf_token: String,
    pub token_type: String,
    pub expires_at: i64,
}

/// The auth router mounted at the public listener root.
pub fn auth_router() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
}

async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<impl IntoResponse> {
    if request.username.is_empty() {
        return Err(Error::BadRequest("username must not be empty".into()));
    }
    if request.password.len() < 8 {
        return Err(Error::BadRequest(
            "password must be at least 8 characters".into(),
        ));
    }

    let repo = state.repo();
    let now = Utc::now().to_rfc3339();

    // Resolve or create the tenant.
    let tenant_id = match &request.tenant_id {
        Some(id) => match repo.find_tenant(id).await? {
            Some(tenant) => tenant.tenant_id,
            None => {
                let name = request
                    .tenant_name
                    .clone()
                    .ok_or_else(|| {
                        Error::BadRequest(
                            "tenant_name is required when creating a tenant".into(),
                        )
                    })?;
                repo.insert_tenant(&TenantRow {
                    tenant_id: id.clone(),
                    name,
                    created_at: now.clone(),
                })
                .await?;
                id.clone()
            }
        },
        None => {
            let id = Uuid::new_v4().to_string();
            let name = request
                .tenant_name
                .clone()
                .ok_or_else(|| {
                    Error::BadRequest("tenant_name is required when creating a tenant".into())
                })?;
            repo.insert_tenant(&TenantRow {
                tenant_id: id.clone(),
                name,
                created_at: now.clone(),
            })
            .await?;
            id
        }
    };

    // Ensure the realm.
    let realm_id = request
        .realm_id
        .clone()
        .unwrap_or_else(|| DEFAULT_REALM.to_string());
    if repo.find_realm(&tenant_id, &realm_id).await?.is_none() {
        let form = match state.config().session.form {
            SessionForm::Jws => "jws",
            SessionForm::Jwe => "jwe",
        };
        repo.insert_realm(&RealmRow {
            realm_id: realm_id.clone(),
            tenant_id: tenant_id.clone(),
            name: realm_id.clone(),
            session_form: form.to_string(),
            session_ttl_secs: state.config().session.ttl_secs as i64,
            created_at: now.clone(),
        })
        .await?;
    }

    // Idempotency: an existing (tenant, username) pair is returned as-is.
    if let Some(existing) = repo
        .find_user_by_username(&tenant_id, &request.username)
        .await?
    {
        return Ok((
            StatusCode::OK,
            Json(RegisterResponse {
                tenant_id,
                user_id: existing.user_id,
                realm_id: existing.realm_id,
                username: existing.username,
                created: false,
            }),
        ));
    }

    let password_hash = state.passwords().hash(&request.password)?;
    let user = UserRow {
        user_id: Uuid::new_v4().to_string(),
        tenant_id: tenant_id.clone(),
        realm_id: realm_id.clone(),
        username: request.username.clone(),
        password_hash,
        created_at: now,
    };
    repo.insert_user(&user).await?;

    tracing::info!(
        tenant_id = %tenant_id,
        user_id = %user.user_id,
        "registered user"
    );
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            tenant_id,
            user_id: user.user_id,
            realm_id,
            username: user.username,
            created: true,
        }),
    ))
}

async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<impl IntoResponse> {
    let repo = state.repo();

    let user = repo
        .find_user_by_username(&request.tenant_id, &request.username)
        .await?
        .ok_or_else(|| Error::Unauthorized("unknown user or wrong password".into()))?;

    let ok = state
        .passwords()
        .verify(&request.password, &user.password_hash)?;
    if !ok {
        return Err(Error::Unauthorized("unknown user or wrong password".into()));
    }

    // The realm's policy picks the token form and lifetime.
    let realm = repo.find_realm(&user.tenant_id, &user.realm_id).await?;
    let (form, ttl) = match &realm {
        Some(realm) => {
            let form = match realm.session_form.as_str() {
                "jwe" => SessionForm::Jwe,
                _ => SessionForm::Jws,
            };
            (
                Some(form),
                Some(std::time::Duration::from_secs(
                    realm.session_ttl_secs.max(0) as u64
                )),
            )
        }
        None => (None, None),
    };

    let issued = state
        .sessions()
        .issue_session(&user.tenant_id, &user.user_id, &user.realm_id, form, ttl)
        .await?;

    Ok(Json(LoginResponse {
        token: issued.token,
        csrf_token: issued.csrf_token,
        token_type: "Bearer".to_string(),
        expires_at: issued.claims.exp,
    }))
}
