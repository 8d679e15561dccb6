//! JWT + opaque-API-key authentication middleware for Axum.

use super::models::{hash_api_key, AuthContext, Claims, API_KEY_PREFIX};
use crate::state::AppState;
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::CookieJar;
use core_jobstate::Role;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use std::env;

pub fn get_jwt_secret() -> String {
    env::var("JWT_SECRET").unwrap_or_else(|_| {
        tracing::warn!("JWT_SECRET not set, using insecure default!");
        "INSECURE_DEFAULT_CHANGE_ME_IN_PRODUCTION".to_string()
    })
}

pub fn generate_token(claims: &Claims) -> Result<String, jsonwebtoken::errors::Error> {
    let secret = get_jwt_secret();
    encode(&Header::default(), claims, &EncodingKey::from_secret(secret.as_bytes()))
}

pub fn validate_token(token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let secret = get_jwt_secret();
    decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &Validation::default())
        .map(|data| data.claims)
}

pub fn extract_jwt_from_cookies(jar: &CookieJar) -> Option<String> {
    jar.get("dp_session").map(|cookie| cookie.value().to_string())
}

fn extract_bearer(request: &Request) -> Option<String> {
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

async fn resolve_api_key(state: &AppState, raw: &str) -> Option<AuthContext> {
    let hash = hash_api_key(raw);
    let row: Option<(String, String, String)> = sqlx::query_as(
        "SELECT api_keys.user_id, users.username, users.role \
         FROM api_keys JOIN users ON users.id = api_keys.user_id \
         WHERE api_keys.key_hash = ?",
    )
    .bind(&hash)
    .fetch_optional(&state.user_pool)
    .await
    .ok()
    .flatten();

    let (user_id, username, role) = row?;
    let _ = sqlx::query("UPDATE api_keys SET last_used_at = ? WHERE key_hash = ?")
        .bind(chrono::Utc::now().timestamp())
        .bind(&hash)
        .execute(&state.user_pool)
        .await;

    Some(AuthContext {
        user_id,
        username,
        role: role.parse().unwrap_or(Role::Viewer),
    })
}

/// Resolves a cookie-session JWT, a bearer JWT, or an opaque `dp_` API key
/// into an [`AuthContext`] inserted into the request's extensions.
pub async fn require_auth(
    State(state): State<AppState>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if let Some(bearer) = extract_bearer(&request) {
        if let Some(key) = bearer.strip_prefix(API_KEY_PREFIX) {
            let raw = format!("{API_KEY_PREFIX}{key}");
            if let Some(ctx) = resolve_api_key(&state, &raw).await {
                request.extensions_mut().insert(ctx);
                return Ok(next.run(request).await);
            }
            return Err(StatusCode::UNAUTHORIZED);
        }
        if let Ok(claims) = validate_token(&bearer) {
            if claims.is_expired() {
                return Err(StatusCode::UNAUTHORIZED);
            }
            request.extensions_mut().insert(claims.to_context());
            return Ok(next.run(request).await);
        }
        return Err(StatusCode::UNAUTHORIZED);
    }

    let token = extract_jwt_from_cookies(&jar).ok_or(StatusCode::UNAUTHORIZED)?;
    let claims = validate_token(&token).map_err(|_| StatusCode::UNAUTHORIZED)?;
    if claims.is_expired() {
        return Err(StatusCode::UNAUTHORIZED);
    }
    request.extensions_mut().insert(claims.to_context());
    Ok(next.run(request).await)
}

/// Role gate: admin outranks operator outranks viewer (`Role`'s derived
/// `Ord` matches declaration order), so `caller >= required` is sufficient.
pub fn require_role(
    required: Role,
) -> impl Fn(Request, Next) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Response, StatusCode>> + Send>> + Clone
{
    move |request: Request, next: Next| {
        Box::pin(async move {
            let ctx = request
                .extensions()
                .get::<AuthContext>()
                .ok_or(StatusCode::UNAUTHORIZED)?
                .clone();

            if ctx.role < required {
                return Err(StatusCode::FORBIDDEN);
            }

            Ok(next.run(request).await)
        })
    }
}

#[derive(Debug)]
pub struct AuthError {
    pub message: String,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }
}

impl From<&str> for AuthError {
    fn from(msg: &str) -> Self {
        AuthError { message: msg.to_string() }
    }
}

impl From<String> for AuthError {
    fn from(message: String) -> Self {
        AuthError { message }
    }
}
