use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chat_core::ChatError;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::Path;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

pub const MIN_NICKNAME_CHARS: usize = 2;
pub const MAX_NICKNAME_CHARS: usize = 50;

/// Claims stored within issued JWTs.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct Claims {
    pub sub: String,
    pub nickname: String,
    pub exp: usize,
    /// Random per issue.
    pub jti: String,
}

impl Claims {
    pub fn user_id(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.sub).ok()
    }
}

/// Issue a JWT for a user valid for the provided duration.
pub fn issue_jwt(secret: &[u8], user_id: Uuid, nickname: &str, valid_for: Duration) -> Result<String> {
    let exp = (OffsetDateTime::now_utc() + valid_for).unix_timestamp() as usize;
    let claims = Claims {
        sub: user_id.to_string(),
        nickname: nickname.into(),
        exp,
        jti: Uuid::new_v4().to_string(),
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret),
    )?;
    Ok(token)
}

/// Verify a JWT and return its claims if valid.
pub fn verify_jwt(secret: &[u8], token: &str) -> Result<Claims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)?;
    if data.claims.exp < OffsetDateTime::now_utc().unix_timestamp() as usize {
        anyhow::bail!("expired");
    }
    Ok(data.claims)
}

/// Trim a login nickname and check its length.
pub fn validate_nickname(nickname: &str) -> Result<&str, ChatError> {
    let trimmed = nickname.trim();
    let len = trimmed.chars().count();
    if !(MIN_NICKNAME_CHARS..=MAX_NICKNAME_CHARS).contains(&len) {
        return Err(ChatError::validation(format!(
            "nickname must be {MIN_NICKNAME_CHARS}-{MAX_NICKNAME_CHARS} characters"
        )));
    }
    Ok(trimmed)
}

/// Resolve the token signing secret.
///
/// An explicit base64 secret wins; otherwise `<data_dir>/secret.key` is read,
/// or created with 32 random bytes on first start.
pub fn load_or_create_secret(data_dir: &Path, explicit: Option<&str>) -> Result<Vec<u8>> {
    if let Some(encoded) = explicit {
        return STANDARD.decode(encoded.trim()).context("CHAT_JWT_SECRET is not base64");
    }
    let path = data_dir.join("secret.key");
    if let Ok(existing) = std::fs::read_to_string(&path) {
        return STANDARD
            .decode(existing.trim())
            .with_context(|| format!("corrupt secret in {}", path.display()));
    }
    let mut secret = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    std::fs::create_dir_all(data_dir)?;
    std::fs::write(&path, STANDARD.encode(&secret))
        .with_context(|| format!("persist {}", path.display()))?;
    tracing::info!(path = %path.display(), "generated token signing secret");
    Ok(secret)
}
