//! Access tokens (signed, stateless) and refresh tokens (stored, rotating).
//!
//! Access tokens are HS256 JWTs valid for 12 hours. Each user has at most one
//! live refresh token: issuing replaces it, and every rotation swaps the
//! value, pushes the expiry 12 hours past now and spends one of 10 uses.

use chrono::{DateTime, TimeDelta, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::db::models::NewRefreshToken;
use crate::error::{ServiceError, ServiceResult};
use crate::models::api::{Identity, RefreshRotation, TokenPair};
use crate::services::accounts::{identity_for, validate_credentials};
use crate::store::Store;
use crate::utils::random_alphanumeric;

pub const TOKEN_TTL_HOURS: i64 = 12;
pub const REFRESH_TOKEN_USES: i32 = 10;
const REFRESH_TOKEN_LEN: usize = 64;
const BEARER_SCHEME: &str = "Bearer ";

fn token_ttl() -> TimeDelta {
    TimeDelta::hours(TOKEN_TTL_HOURS)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: i64,
    pub first_name: String,
    pub last_name: String,
    pub roles: Vec<String>,
    pub iat: i64,
    pub exp: i64,
}

/// Signs and verifies access tokens with the process-wide secret.
#[derive(Clone)]
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenService {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        TokenService {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn issue_access_token(&self, identity: &Identity) -> ServiceResult<String> {
        self.issue_access_token_at(identity, Utc::now())
    }

    fn issue_access_token_at(&self, identity: &Identity, now: DateTime<Utc>) -> ServiceResult<String> {
        let claims = Claims {
            sub: identity.user_id,
            first_name: identity.first_name.clone(),
            last_name: identity.last_name.clone(),
            roles: identity.role_names(),
            iat: now.timestamp(),
            exp: (now + token_ttl()).timestamp(),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }

    /// Check an `Authorization` header value (scheme tag optional).
    pub fn validate_access_token(&self, header: Option<&str>) -> ServiceResult<Claims> {
        let raw = header
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ServiceError::unauthorized("missing access token"))?;
        let token = raw.strip_prefix(BEARER_SCHEME).unwrap_or(raw).trim();
        if token.is_empty() {
            return Err(ServiceError::unauthorized("missing access token"));
        }

        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|err| {
                let reason = match err.kind() {
                    ErrorKind::ExpiredSignature => "access token expired",
                    ErrorKind::InvalidSignature => "access token signature invalid",
                    _ => "access token malformed",
                };
                ServiceError::unauthorized(reason)
            })
    }
}

/// Replace the user's refresh token with a fresh one.
pub fn issue_refresh_token<S: Store>(store: &mut S, user_id: i64, now: DateTime<Utc>) -> ServiceResult<String> {
    let token = random_alphanumeric(REFRESH_TOKEN_LEN);
    store.atomic(|s| {
        s.delete_refresh_tokens(user_id)?;
        s.insert_refresh_token(&NewRefreshToken {
            user_id,
            token: token.clone(),
            remaining_uses: REFRESH_TOKEN_USES,
            expire_time: now + token_ttl(),
        })
    })?;
    Ok(token)
}

pub fn rotate_refresh_token<S: Store>(store: &mut S, token: &str, now: DateTime<Utc>) -> ServiceResult<RefreshRotation> {
    let current = store
        .find_refresh_token(token)?
        .ok_or_else(|| ServiceError::forbidden("unknown refresh token"))?;
    if current.expire_time <= now {
        return Err(ServiceError::forbidden("refresh token expired"));
    }
    if current.remaining_uses <= 0 {
        return Err(ServiceError::forbidden("refresh token used up"));
    }

    let next = random_alphanumeric(REFRESH_TOKEN_LEN);
    if !store.rotate_refresh_token(token, &next, now + token_ttl(), now)? {
        return Err(ServiceError::forbidden("refresh token was already rotated"));
    }
    debug!(
        "Rotated refresh token for user {} ({} use(s) left)",
        current.user_id,
        current.remaining_uses - 1
    );
    Ok(RefreshRotation {
        user_id: current.user_id,
        refresh_token: next,
    })
}

pub fn login<S: Store>(store: &mut S, tokens: &TokenService, username: &str, password: &str) -> ServiceResult<TokenPair> {
    let identity = validate_credentials(store, username, password)?;
    let access_token = tokens.issue_access_token(&identity)?;
    let refresh_token = issue_refresh_token(store, identity.user_id, Utc::now())?;
    info!("User {} logged in", identity.user_id);
    Ok(TokenPair {
        access_token,
        refresh_token,
    })
}

pub fn refresh<S: Store>(store: &mut S, tokens: &TokenService, refresh_token: &str) -> ServiceResult<TokenPair> {
    let rotation = rotate_refresh_token(store, refresh_token, Utc::now())?;
    let identity = identity_for(store, rotation.user_id)?;
    Ok(TokenPair {
        access_token: tokens.issue_access_token(&identity)?,
        refresh_token: rotation.refresh_token,
    })
}

pub fn logout<S: Store>(store: &mut S, user_id: i64) -> ServiceResult<()> {
    let removed = store.delete_refresh_tokens(user_id)?;
    debug!("Logout for user {} removed {} refresh token(s)", user_id, removed);
    Ok(())
}
