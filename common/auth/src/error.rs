use common_http_errors::ApiError;
use thiserror::Error;

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token missing kid header")]
    MissingKeyId,
    #[error("no verification key published for kid '{0}'")]
    UnknownKeyId(String),
    #[error("token signature invalid")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("token not yet valid")]
    NotYetValid,
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("token alg '{0}' is not in the configured allow-list")]
    DisallowedAlgorithm(String),
    #[error("invalid claim '{0}': {1}")]
    InvalidClaim(&'static str, String),
    #[error("token is not a refresh token")]
    NotRefreshToken,
    #[error("unknown subject '{0}'")]
    UnknownSubject(String),
    #[error("authorization header missing")]
    MissingAuthorization,
    #[error("authorization header malformed")]
    InvalidAuthorization,
    #[error("invalid API key")]
    InvalidApiKey,
    #[error("failed to fetch JWKS: {0}")]
    JwksFetch(String),
    #[error("failed to parse JWKS response: {0}")]
    JwksDecode(String),
    #[error("JWKS key '{kid}' unusable: {reason}")]
    JwksBadKey { kid: String, reason: String },
    #[error("verification keys unavailable and no cached set exists")]
    JwksUnavailable,
    #[error("failed to load signing key: {0}")]
    SigningKey(String),
    #[error("failed to sign token: {0}")]
    Signing(String),
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(value: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match value.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::ImmatureSignature => Self::NotYetValid,
            ErrorKind::InvalidSignature => Self::BadSignature,
            ErrorKind::InvalidIssuer => Self::InvalidClaim("iss", "issuer mismatch".into()),
            ErrorKind::InvalidAudience => Self::InvalidClaim("aud", "audience mismatch".into()),
            _ => Self::Malformed(value.to_string()),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(value: AuthError) -> Self {
        match &value {
            AuthError::JwksUnavailable => ApiError::JwksUnavailable {
                message: value.to_string(),
                trace_id: None,
            },
            AuthError::JwksFetch(_)
            | AuthError::JwksDecode(_)
            | AuthError::JwksBadKey { .. }
            | AuthError::SigningKey(_)
            | AuthError::Signing(_) => ApiError::internal(value),
            _ => ApiError::authentication(value.to_string()),
        }
    }
}
