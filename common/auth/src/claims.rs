use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AuthError, AuthResult};

/// Application-focused projection of a verified token's claim set.
#[derive(Debug, Clone, Serialize)]
pub struct Claims {
    pub subject: String,
    pub tenant_id: String,
    pub roles: Vec<String>,
    pub email: Option<String>,
    pub username: Option<String>,
    pub token_type: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub issued_at: Option<DateTime<Utc>>,
    pub raw: Value,
}

impl Claims {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|value| value == role)
    }

    pub fn is_refresh(&self) -> bool {
        matches!(self.token_type.as_deref(), Some("Refresh") | Some("refresh"))
    }
}

/// The per-request auth context handed to the pipeline and streaming fabric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    pub user_id: String,
    pub tenant_id: String,
    pub roles: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub auth_method: String,
}

impl From<&Claims> for UserInfo {
    fn from(claims: &Claims) -> Self {
        Self {
            user_id: claims.subject.clone(),
            tenant_id: claims.tenant_id.clone(),
            roles: claims.roles.clone(),
            email: claims.email.clone(),
            username: claims.username.clone(),
            auth_method: crate::AUTH_METHOD_BEARER.to_string(),
        }
    }
}

impl TryFrom<Value> for Claims {
    type Error = AuthError;

    fn try_from(value: Value) -> AuthResult<Self> {
        let subject = value
            .get("sub")
            .and_then(Value::as_str)
            .ok_or_else(|| AuthError::InvalidClaim("sub", "missing".into()))?
            .to_string();
        let tenant_id = value
            .get("tenant_id")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let exp = value
            .get("exp")
            .and_then(Value::as_i64)
            .ok_or_else(|| AuthError::InvalidClaim("exp", "missing".into()))?;
        let expires_at = Utc
            .timestamp_opt(exp, 0)
            .single()
            .ok_or_else(|| AuthError::InvalidClaim("exp", exp.to_string()))?;
        let issued_at = value
            .get("iat")
            .and_then(Value::as_i64)
            .and_then(|iat| Utc.timestamp_opt(iat, 0).single());

        Ok(Self {
            subject,
            tenant_id,
            roles: roles_from(&value),
            email: value
                .get("email")
                .and_then(Value::as_str)
                .map(str::to_string),
            username: value
                .get("preferred_username")
                .and_then(Value::as_str)
                .map(str::to_string),
            token_type: value.get("typ").and_then(Value::as_str).map(str::to_string),
            expires_at,
            issued_at,
            raw: value,
        })
    }
}

/// Union of realm roles and every client's resource-access roles.
fn roles_from(claims: &Value) -> Vec<String> {
    let mut roles = Vec::new();

    if let Some(realm_roles) = claims
        .get("realm_access")
        .and_then(|access| access.get("roles"))
        .and_then(Value::as_array)
    {
        for role in realm_roles.iter().filter_map(Value::as_str) {
            roles.push(role.to_string());
        }
    }

    if let Some(clients) = claims.get("resource_access").and_then(Value::as_object) {
        for client in clients.values() {
            if let Some(client_roles) = client.get("roles").and_then(Value::as_array) {
                for role in client_roles.iter().filter_map(Value::as_str) {
                    if !roles.iter().any(|existing| existing == role) {
                        roles.push(role.to_string());
                    }
                }
            }
        }
    }

    // Flat `roles` claim used by internally minted tokens.
    if let Some(flat) = claims.get("roles").and_then(Value::as_array) {
        for role in flat.iter().filter_map(Value::as_str) {
            if !roles.iter().any(|existing| existing == role) {
                roles.push(role.to_string());
            }
        }
    }

    roles
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unions_realm_and_resource_roles() {
        let value = json!({
            "sub": "u1",
            "tenant_id": "t1",
            "exp": 4102444800i64,
            "realm_access": {"roles": ["user"]},
            "resource_access": {
                "gateway": {"roles": ["analyst", "user"]},
                "reports": {"roles": ["viewer"]}
            }
        });
        let claims = Claims::try_from(value).unwrap();
        assert_eq!(claims.subject, "u1");
        assert_eq!(claims.tenant_id, "t1");
        assert!(claims.has_role("user"));
        assert!(claims.has_role("analyst"));
        assert!(claims.has_role("viewer"));
        assert_eq!(claims.roles.iter().filter(|r| *r == "user").count(), 1);
    }

    #[test]
    fn missing_sub_is_rejected() {
        let value = json!({"tenant_id": "t1", "exp": 4102444800i64});
        assert!(matches!(
            Claims::try_from(value),
            Err(AuthError::InvalidClaim("sub", _))
        ));
    }

    #[test]
    fn refresh_typ_detected() {
        let value = json!({
            "sub": "u1",
            "tenant_id": "t1",
            "exp": 4102444800i64,
            "typ": "Refresh"
        });
        assert!(Claims::try_from(value).unwrap().is_refresh());
    }
}
