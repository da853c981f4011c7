use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{AuthError, AuthResult};
use crate::verifier::TokenVerifier;

/// Subject directory consumed by the refresh path. One table, loaded from
/// configuration.
#[derive(Debug, Clone, Default)]
pub struct UserTable {
    users: HashMap<String, UserRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    pub email: String,
    pub tenant_id: String,
    pub roles: Vec<String>,
}

impl UserTable {
    pub fn from_json(raw: &str) -> AuthResult<Self> {
        let users: HashMap<String, UserRecord> = serde_json::from_str(raw)
            .map_err(|err| AuthError::InvalidClaim("users", err.to_string()))?;
        Ok(Self { users })
    }

    pub fn get(&self, user_id: &str) -> Option<&UserRecord> {
        self.users.get(user_id)
    }

    pub fn insert(&mut self, user_id: impl Into<String>, record: UserRecord) {
        self.users.insert(user_id.into(), record);
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub refresh_expires_in: i64,
    pub token_type: &'static str,
}

#[derive(Serialize)]
struct MintedClaims<'a> {
    sub: &'a str,
    tenant_id: &'a str,
    roles: &'a [String],
    email: &'a str,
    preferred_username: &'a str,
    typ: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    iss: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    aud: Option<&'a str>,
    exp: i64,
    iat: i64,
    jti: String,
}

/// Mints RS256 access/refresh token pairs and drives the refresh workflow.
pub struct TokenIssuer {
    kid: String,
    encoding_key: EncodingKey,
    issuer: Option<String>,
    audience: Option<String>,
    access_ttl_seconds: i64,
    refresh_ttl_seconds: i64,
    users: UserTable,
}

impl TokenIssuer {
    pub fn new(
        kid: impl Into<String>,
        private_pem: &[u8],
        issuer: Option<String>,
        audience: Option<String>,
        users: UserTable,
    ) -> AuthResult<Self> {
        let encoding_key = EncodingKey::from_rsa_pem(private_pem)
            .map_err(|err| AuthError::SigningKey(err.to_string()))?;
        Ok(Self {
            kid: kid.into(),
            encoding_key,
            issuer,
            audience,
            access_ttl_seconds: 3600,
            refresh_ttl_seconds: 86_400,
            users,
        })
    }

    pub fn with_ttls(mut self, access_seconds: i64, refresh_seconds: i64) -> Self {
        self.access_ttl_seconds = access_seconds;
        self.refresh_ttl_seconds = refresh_seconds;
        self
    }

    pub fn users(&self) -> &UserTable {
        &self.users
    }

    /// Mint an access+refresh pair for a subject known to the user table.
    pub fn issue_for(&self, user_id: &str) -> AuthResult<IssuedTokens> {
        let record = self
            .users
            .get(user_id)
            .ok_or_else(|| AuthError::UnknownSubject(user_id.to_string()))?;
        self.issue(user_id, record, Utc::now())
    }

    fn issue(
        &self,
        user_id: &str,
        record: &UserRecord,
        now: DateTime<Utc>,
    ) -> AuthResult<IssuedTokens> {
        let access_token = self.mint(
            user_id,
            record,
            "Bearer",
            now,
            now + Duration::seconds(self.access_ttl_seconds),
        )?;
        let refresh_token = self.mint(
            user_id,
            record,
            "Refresh",
            now,
            now + Duration::seconds(self.refresh_ttl_seconds),
        )?;

        Ok(IssuedTokens {
            access_token,
            refresh_token,
            expires_in: self.access_ttl_seconds,
            refresh_expires_in: self.refresh_ttl_seconds,
            token_type: "Bearer",
        })
    }

    fn mint(
        &self,
        user_id: &str,
        record: &UserRecord,
        typ: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> AuthResult<String> {
        let claims = MintedClaims {
            sub: user_id,
            tenant_id: &record.tenant_id,
            roles: &record.roles,
            email: &record.email,
            preferred_username: &record.username,
            typ,
            iss: self.issuer.as_deref(),
            aud: self.audience.as_deref(),
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.kid.clone());
        encode(&header, &claims, &self.encoding_key)
            .map_err(|err| AuthError::Signing(err.to_string()))
    }

    /// Verify a refresh token and re-mint a pair for the same subject.
    pub async fn refresh(
        &self,
        verifier: &TokenVerifier,
        refresh_token: &str,
    ) -> AuthResult<IssuedTokens> {
        let claims = verifier.verify(refresh_token).await?;
        if !claims.is_refresh() {
            return Err(AuthError::NotRefreshToken);
        }
        let record = self
            .users
            .get(&claims.subject)
            .ok_or_else(|| AuthError::UnknownSubject(claims.subject.clone()))?;
        self.issue(&claims.subject, record, Utc::now())
    }

    /// Best-effort revocation: the provider owns token lifetimes, so this
    /// records the intent and succeeds.
    pub async fn revoke(&self, verifier: &TokenVerifier, token: &str) -> AuthResult<()> {
        let claims = verifier.verify(token).await?;
        info!(subject = %claims.subject, tenant_id = %claims.tenant_id, "token revoked");
        Ok(())
    }
}
