use std::collections::HashMap;

use serde::Deserialize;

use crate::claims::UserInfo;
use crate::error::{AuthError, AuthResult};

#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeyEntry {
    pub tenant_id: String,
    pub roles: Vec<String>,
}

/// Opaque API keys accepted as a bearer-token fallback. Loaded from
/// configuration; never hard-coded at call sites.
#[derive(Debug, Clone, Default)]
pub struct ApiKeyTable {
    keys: HashMap<String, ApiKeyEntry>,
}

impl ApiKeyTable {
    pub fn from_json(raw: &str) -> AuthResult<Self> {
        let keys: HashMap<String, ApiKeyEntry> = serde_json::from_str(raw)
            .map_err(|err| AuthError::InvalidClaim("api_keys", err.to_string()))?;
        Ok(Self { keys })
    }

    /// The development table the platform ships with; overridden in any real
    /// deployment via configuration.
    pub fn dev_defaults() -> Self {
        let mut keys = HashMap::new();
        keys.insert(
            "dev-key-123".to_string(),
            ApiKeyEntry {
                tenant_id: "tenant-1".to_string(),
                roles: vec!["user".to_string()],
            },
        );
        keys.insert(
            "admin-key-456".to_string(),
            ApiKeyEntry {
                tenant_id: "tenant-1".to_string(),
                roles: vec!["admin".to_string()],
            },
        );
        keys.insert(
            "service-key-789".to_string(),
            ApiKeyEntry {
                tenant_id: "*".to_string(),
                roles: vec!["service".to_string()],
            },
        );
        Self { keys }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn authenticate(&self, api_key: &str) -> AuthResult<UserInfo> {
        let entry = self.keys.get(api_key).ok_or(AuthError::InvalidApiKey)?;
        Ok(UserInfo {
            user_id: format!("api-key-{api_key}"),
            tenant_id: entry.tenant_id.clone(),
            roles: entry.roles.clone(),
            email: None,
            username: None,
            auth_method: crate::AUTH_METHOD_API_KEY.to_string(),
        })
    }
}
