//! Authentication data model: JWT + Argon2 password hashing, resolved into
//! an [`AuthContext`] that the rest of the crate consumes. Credential
//! *verification* mechanics (password/API-key issuance, TOTP, refresh-token
//! rotation) are treated as a narrow external collaborator per SPEC_FULL
//! §1 — this module implements the minimal concrete version the teacher
//! already carried, not a full identity provider.

use core_jobstate::Role;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Resolved caller identity, consumed by handlers and passed down into
/// `core-jobstate`/`core-queue` calls that take a `Role`.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub username: String,
    pub role: Role,
}

/// A user account in the auth database.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: String,
    pub created_at: i64,
}

impl User {
    pub fn role(&self) -> Role {
        self.role.parse().unwrap_or(Role::Viewer)
    }

    pub fn new(username: String, password: &str, role: Role) -> Result<Self, Box<dyn std::error::Error>> {
        use argon2::{
            password_hash::{rand_core::OsRng, PasswordHasher, SaltString},
            Argon2,
        };

        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::default();
        let password_hash = argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| format!("password hashing failed: {e}"))?
            .to_string();

        Ok(User {
            id: Uuid::new_v4().to_string(),
            username,
            password_hash,
            role: role.to_string(),
            created_at: chrono::Utc::now().timestamp(),
        })
    }

    pub fn verify_password(&self, password: &str) -> bool {
        use argon2::{
            password_hash::{PasswordHash, PasswordVerifier},
            Argon2,
        };

        let parsed_hash = match PasswordHash::new(&self.password_hash) {
            Ok(h) => h,
            Err(_) => return false,
        };

        Argon2::default().verify_password(password.as_bytes(), &parsed_hash).is_ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

/// JWT claims for bearer/cookie-based sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    pub role: String,
    pub exp: usize,
}

impl Claims {
    pub fn new(user: &User) -> Self {
        let exp = (chrono::Utc::now() + chrono::Duration::hours(24)).timestamp() as usize;
        Claims {
            sub: user.id.clone(),
            username: user.username.clone(),
            role: user.role.clone(),
            exp,
        }
    }

    pub fn role(&self) -> Role {
        self.role.parse().unwrap_or(Role::Viewer)
    }

    pub fn is_expired(&self) -> bool {
        let now = chrono::Utc::now().timestamp() as usize;
        now >= self.exp
    }

    pub fn to_context(&self) -> AuthContext {
        AuthContext {
            user_id: self.sub.clone(),
            username: self.username.clone(),
            role: self.role(),
        }
    }
}

/// An opaque API key (`dp_<random>`). Only the sha256 hash is stored;
/// issuance is out of scope (SPEC_FULL §1) — this crate only consumes
/// already-issued keys. Seed one manually or via `ensure_default_admin`'s
/// sibling if a deployment needs machine-to-machine access.
#[derive(Debug, Clone, FromRow)]
pub struct ApiKey {
    pub id: String,
    pub user_id: String,
    pub key_hash: String,
    pub created_at: i64,
    pub last_used_at: Option<i64>,
}

pub const API_KEY_PREFIX: &str = "dp_";

pub fn hash_api_key(raw: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub username: String,
    pub role: String,
    pub created_at: i64,
}

impl From<User> for UserInfo {
    fn from(user: User) -> Self {
        UserInfo {
            id: user.id,
            username: user.username,
            role: user.role,
            created_at: user.created_at,
        }
    }
}
