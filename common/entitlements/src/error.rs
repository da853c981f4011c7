use common_http_errors::ApiError;
use thiserror::Error;

pub type EntitlementResult<T> = Result<T, EntitlementError>;

#[derive(Debug, Error)]
pub enum EntitlementError {
    #[error("rule store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("rule '{0}' not found")]
    RuleNotFound(String),
    #[error("invalid rule: {0}")]
    InvalidRule(String),
}

impl From<EntitlementError> for ApiError {
    fn from(value: EntitlementError) -> Self {
        match value {
            // Store outages must read as 503, never as a deny the caller
            // could mistake for a policy decision.
            EntitlementError::StoreUnavailable(message) => {
                ApiError::external("rule-store", message, true)
            }
            EntitlementError::RuleNotFound(id) => {
                ApiError::not_found(format!("rule '{id}' not found"))
            }
            EntitlementError::InvalidRule(message) => ApiError::validation(message),
        }
    }
}
