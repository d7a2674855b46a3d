//! Password hashing and bearer-token sessions.

use anyhow::{Context, Result};
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use uuid::Uuid;

use crate::models::User;
use crate::server::{ApiError, AppState};

const HASH_SCHEME: &str = "pbkdf2_sha256";
const DIGEST_BYTES: usize = 32;

#[cfg(not(test))]
const HASH_ITERATIONS: u32 = 600_000;
#[cfg(test)]
const HASH_ITERATIONS: u32 = 1_000;

/// Stored as `pbkdf2_sha256$<iterations>$<salt>$<hex digest>`.
///
/// Derivation is CPU bound and runs on the blocking pool.
pub async fn hash_password(password: &str) -> Result<String> {
    let password = password.to_string();
    tokio::task::spawn_blocking(move || {
        let salt = Uuid::new_v4().simple().to_string();
        let digest = derive(&password, &salt, HASH_ITERATIONS);
        format!("{HASH_SCHEME}${HASH_ITERATIONS}${salt}${digest}")
    })
    .await
    .context("password hashing task failed")
}

/// False for a wrong password or an unparseable stored hash.
pub async fn verify_password(password: &str, stored: &str) -> Result<bool> {
    let password = password.to_string();
    let stored = stored.to_string();
    tokio::task::spawn_blocking(move || verify_blocking(&password, &stored))
        .await
        .context("password verification task failed")
}

fn verify_blocking(password: &str, stored: &str) -> bool {
    let mut parts = stored.splitn(4, '$');
    let (Some(scheme), Some(iterations), Some(salt), Some(expected)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };

    if scheme != HASH_SCHEME {
        return false;
    }
    let Ok(iterations) = iterations.parse::<u32>() else {
        return false;
    };
    if iterations == 0 {
        return false;
    }

    let actual = derive(password, salt, iterations);
    constant_time_eq(actual.as_bytes(), expected.as_bytes())
}

fn derive(password: &str, salt: &str, iterations: u32) -> String {
    let mut key = [0u8; DIGEST_BYTES];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt.as_bytes(), iterations, &mut key);
    key.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// The user behind the request's bearer token.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub user: User,
    pub token: String,
}

#[axum::async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| ApiError::unauthorized("Authentication required"))?
            .to_string();

        let user = state
            .db
            .user_for_token(&token)
            .await?
            .ok_or_else(|| ApiError::unauthorized("Invalid or expired session"))?;

        Ok(Self { user, token })
    }
}
