use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Analyst,
    Viewer,
}

/// Identity of the caller, resolved from its API key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContext {
    pub tenant_id: String,
    pub role: Role,
    pub api_key_id: String,
}

impl TenantContext {
    pub fn new(tenant_id: impl Into<String>, role: Role, api_key_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            role,
            api_key_id: api_key_id.into(),
        }
    }

    /// Only administrators skip row-level security.
    pub fn bypasses_rls(&self) -> bool {
        self.role == Role::Admin
    }
}
