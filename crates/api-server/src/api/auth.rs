//! Authentication endpoints: login, logout, and "who am I".

use crate::{
    auth::{authenticate_user, LoginForm, UserInfo},
    error::{ApiError, ApiResult},
    state::AppState,
};
use axum::{extract::State, http::StatusCode, Json};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use serde::Serialize;
use sqlx::Row;

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user: UserInfo,
    pub message: String,
}

pub async fn login_handler(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(login): Json<LoginForm>,
) -> ApiResult<(CookieJar, Json<LoginResponse>)> {
    let (user, token) = authenticate_user(&state.user_pool, &login)
        .await
        .map_err(|e| ApiError::Auth(e.to_string()))?;

    let cookie = Cookie::build(("dp_session", token))
        .path("/")
        .http_only(true)
        .secure(true)
        .max_age(time::Duration::hours(24))
        .build();

    let response = LoginResponse {
        user: UserInfo::from(user),
        message: "login successful".to_string(),
    };

    tracing::info!(user = %response.user.username, "user logged in");
    state.audit.record(
        orbit_core_audit::AuditEvent::new("auth.login").with_user(response.user.id.clone()),
    );

    Ok((jar.add(cookie), Json(response)))
}

pub async fn logout_handler(jar: CookieJar) -> (CookieJar, StatusCode) {
    let cookie = Cookie::build(("dp_session", "")).path("/").max_age(time::Duration::seconds(0)).build();
    (jar.add(cookie), StatusCode::OK)
}

pub async fn me_handler(State(state): State<AppState>, jar: CookieJar) -> ApiResult<Json<UserInfo>> {
    let token = crate::auth::extract_jwt_from_cookies(&jar).ok_or_else(|| ApiError::Auth("not authenticated".into()))?;
    let claims = crate::auth::validate_token(&token).map_err(|_| ApiError::Auth("invalid token".into()))?;

    let row = sqlx::query(
        r#"
        SELECT id, username, password_hash, role, created_at
        FROM users
        WHERE id = ?
        "#,
    )
    .bind(&claims.sub)
    .fetch_one(&state.user_pool)
    .await
    .map_err(|_| ApiError::Auth("user not found".into()))?;

    let user = crate::auth::User {
        id: row.get(0),
        username: row.get(1),
        password_hash: row.get(2),
        role: row.get(3),
        created_at: row.get(4),
    };

    Ok(Json(UserInfo::from(user)))
}
