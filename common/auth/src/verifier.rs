use std::sync::Arc;

use jsonwebtoken::{decode, decode_header, Validation};
use serde_json::Value;
use tracing::debug;

use crate::claims::{Claims, UserInfo};
use crate::config::JwtConfig;
use crate::error::{AuthError, AuthResult};
use crate::jwks::JwksCache;

/// Verifies bearer tokens against the cached JWKS key set.
#[derive(Clone)]
pub struct TokenVerifier {
    config: JwtConfig,
    jwks: Arc<JwksCache>,
}

impl TokenVerifier {
    pub fn new(config: JwtConfig, jwks: Arc<JwksCache>) -> Self {
        Self { config, jwks }
    }

    pub fn config(&self) -> &JwtConfig {
        &self.config
    }

    pub fn jwks(&self) -> &Arc<JwksCache> {
        &self.jwks
    }

    pub async fn verify(&self, token: &str) -> AuthResult<Claims> {
        let token = token.strip_prefix("Bearer ").unwrap_or(token).trim();
        if token.is_empty() {
            return Err(AuthError::Malformed("empty token".into()));
        }

        let header =
            decode_header(token).map_err(|err| AuthError::Malformed(err.to_string()))?;
        if !self.config.allowed_algorithms.contains(&header.alg) {
            return Err(AuthError::DisallowedAlgorithm(format!("{:?}", header.alg)));
        }
        let kid = header.kid.ok_or(AuthError::MissingKeyId)?;
        let key = self.jwks.key_for(&kid).await?;

        let mut validation = Validation::new(header.alg);
        validation.leeway = self.config.leeway_seconds.into();
        match &self.config.issuer {
            Some(issuer) => validation.set_issuer(&[issuer.clone()]),
            None => {
                validation.iss = None;
            }
        }
        match &self.config.audience {
            Some(audience) => validation.set_audience(&[audience.clone()]),
            None => {
                validation.validate_aud = false;
            }
        }

        let token_data = decode::<Value>(token, &key, &validation)?;
        let claims = Claims::try_from(token_data.claims)?;
        debug!(kid, subject = %claims.subject, "verified bearer token");
        Ok(claims)
    }

    /// Verify and project into the per-request auth context.
    pub async fn user_info_from_token(&self, token: &str) -> AuthResult<UserInfo> {
        let claims = self.verify(token).await?;
        Ok(UserInfo::from(&claims))
    }
}
