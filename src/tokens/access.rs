//! HS256 access tokens.
//!
//! Signature and issuer are checked by `jsonwebtoken`; expiry is checked
//! against the injected clock. Blacklist lookups fail closed.

use chrono::Duration;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use super::TokenManager;
use crate::clock::{bounded_seconds, Clock};
use crate::users::User;

pub const DEFAULT_ISSUER: &str = "bulwark";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: Uuid,
    pub tid: Uuid,
    pub role: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
}

impl AccessClaims {
    #[must_use]
    pub fn expires_at(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp(self.exp, 0).unwrap_or_default()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AccessTokenError {
    #[error("invalid access token")]
    Invalid,
    #[error("access token expired")]
    Expired,
    #[error("access token revoked")]
    Revoked,
    #[error("revocation check unavailable")]
    Unavailable,
    #[error("failed to sign access token: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
}

pub struct AccessTokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    issuer: String,
    ttl_seconds: i64,
    clock: Arc<dyn Clock>,
}

impl AccessTokenIssuer {
    #[must_use]
    pub fn new(
        secret: &SecretString,
        issuer: &str,
        ttl_seconds: i64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let key = secret.expose_secret().as_bytes();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[issuer]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        // Expiry is evaluated against the injected clock in `verify`.
        validation.validate_exp = false;
        Self {
            encoding: EncodingKey::from_secret(key),
            decoding: DecodingKey::from_secret(key),
            validation,
            issuer: issuer.to_string(),
            ttl_seconds: bounded_seconds(ttl_seconds),
            clock,
        }
    }

    #[must_use]
    pub fn ttl_seconds(&self) -> i64 {
        self.ttl_seconds
    }

    /// Sign a token for the user with a fresh `jti`.
    ///
    /// # Errors
    /// Returns `AccessTokenError::Signing` if encoding fails.
    pub fn issue(&self, user: &User) -> Result<(String, AccessClaims), AccessTokenError> {
        let now = self.clock.now();
        let claims = AccessClaims {
            sub: user.id,
            tid: user.tenant_id,
            role: user.role.clone(),
            jti: Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            exp: (now + Duration::seconds(self.ttl_seconds)).timestamp(),
            iss: self.issuer.clone(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;
        Ok((token, claims))
    }

    /// Check signature, issuer and expiry.
    ///
    /// # Errors
    /// Returns `Invalid` or `Expired`.
    pub fn verify(&self, token: &str) -> Result<AccessClaims, AccessTokenError> {
        let data = decode::<AccessClaims>(token, &self.decoding, &self.validation)
            .map_err(|_| AccessTokenError::Invalid)?;
        if data.claims.exp <= self.clock.now().timestamp() {
            return Err(AccessTokenError::Expired);
        }
        Ok(data.claims)
    }

    /// Full request authentication: [`Self::verify`] plus the blacklist.
    ///
    /// # Errors
    /// Returns `Revoked` for blacklisted tokens and `Unavailable` when the
    /// blacklist cannot be consulted.
    pub async fn authenticate(
        &self,
        token: &str,
        tokens: &TokenManager,
    ) -> Result<AccessClaims, AccessTokenError> {
        let claims = self.verify(token)?;
        match tokens.is_blacklisted(&claims.jti).await {
            Ok(false) => Ok(claims),
            Ok(true) => Err(AccessTokenError::Revoked),
            Err(err) => {
                error!("Blacklist lookup failed, rejecting token: {err}");
                Err(AccessTokenError::Unavailable)
            }
        }
    }
}
