pub mod api_keys;
pub mod claims;
pub mod config;
pub mod error;
pub mod issuer;
pub mod jwks;
pub mod verifier;

pub use api_keys::ApiKeyTable;
pub use claims::{Claims, UserInfo};
pub use config::JwtConfig;
pub use error::{AuthError, AuthResult};
pub use issuer::{IssuedTokens, TokenIssuer, UserRecord, UserTable};
pub use jwks::{JwksCache, JwksFetcher};
pub use verifier::TokenVerifier;

pub const AUTH_METHOD_BEARER: &str = "bearer";
pub const AUTH_METHOD_API_KEY: &str = "api_key";
