//! Authentication and authorization: JWT session cookies, opaque `dp_` API
//! keys, and Argon2 password hashing, resolved into an [`AuthContext`] that
//! the rest of the crate consumes. See [`models`] for the narrow-collaborator
//! framing (SPEC_FULL §1 excludes credential-verification mechanics as a
//! feature, not the ambient need for *some* concrete implementation).

pub mod middleware;
pub mod models;

pub use middleware::{extract_jwt_from_cookies, generate_token, get_jwt_secret, require_auth, require_role, validate_token, AuthError};
pub use models::{ApiKey, AuthContext, Claims, LoginForm, User, UserInfo};

use sqlx::{Row, SqlitePool};

pub fn hash_password(password: &str) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    use argon2::{
        password_hash::{rand_core::OsRng, PasswordHasher, SaltString},
        Argon2,
    };

    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let password_hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| format!("password hash error: {e}"))?
        .to_string();

    Ok(password_hash)
}

/// Initializes the user and API-key tables.
pub async fn init_user_db(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY NOT NULL,
            username TEXT UNIQUE NOT NULL,
            password_hash TEXT NOT NULL,
            role TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS api_keys (
            id TEXT PRIMARY KEY NOT NULL,
            user_id TEXT NOT NULL REFERENCES users(id),
            key_hash TEXT UNIQUE NOT NULL,
            created_at INTEGER NOT NULL,
            last_used_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::info!("user database schema initialized");
    Ok(())
}

/// Creates a default admin user if no users exist yet.
pub async fn ensure_default_admin(pool: &SqlitePool) -> Result<(), Box<dyn std::error::Error>> {
    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users").fetch_one(pool).await?;

    if count.0 == 0 {
        let admin = User::new("admin".to_string(), "changeme", core_jobstate::Role::Admin)?;

        sqlx::query(
            r#"
            INSERT INTO users (id, username, password_hash, role, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&admin.id)
        .bind(&admin.username)
        .bind(&admin.password_hash)
        .bind(&admin.role)
        .bind(admin.created_at)
        .execute(pool)
        .await?;

        tracing::warn!("created default admin user (username: admin, password: changeme) - change this password!");
    }

    Ok(())
}

pub async fn authenticate_user(pool: &SqlitePool, login: &LoginForm) -> Result<(User, String), Box<dyn std::error::Error>> {
    let row = sqlx::query(
        r#"
        SELECT id, username, password_hash, role, created_at
        FROM users
        WHERE username = ?
        "#,
    )
    .bind(&login.username)
    .fetch_one(pool)
    .await
    .map_err(|_| "invalid username or password")?;

    let user = User {
        id: row.get(0),
        username: row.get(1),
        password_hash: row.get(2),
        role: row.get(3),
        created_at: row.get(4),
    };

    if !user.verify_password(&login.password) {
        return Err("invalid username or password".into());
    }

    let claims = Claims::new(&user);
    let token = generate_token(&claims)?;

    Ok((user, token))
}
