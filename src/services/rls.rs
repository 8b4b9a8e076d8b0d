use crate::error::SecurityError;
use crate::models::{Dataset, TenantContext};
use crate::services::sql::{ColumnRef, CompiledQuery, Expr, RlsState};

/// Row-level security enforcement.
///
/// Wraps the query's WHERE clause with a tenant guard, records that the
/// caller bypassed it, or refuses the query when the dataset is not
/// configured for tenancy. Enforcing twice for the same tenant is a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct RlsEnforcer;

impl RlsEnforcer {
    pub fn new() -> Self {
        Self
    }

    pub fn enforce(
        &self,
        mut query: CompiledQuery,
        tenant: &TenantContext,
        dataset: &Dataset,
    ) -> Result<CompiledQuery, SecurityError> {
        if let Some(guarded_for) = query.tenant_guard() {
            if guarded_for == tenant.tenant_id {
                return Ok(query);
            }
            tracing::error!(
                dataset = %dataset.id,
                tenant = %tenant.tenant_id,
                "Refusing to re-scope a query guarded for another tenant"
            );
            return Err(SecurityError::TenantMismatch);
        }

        if tenant.bypasses_rls() {
            tracing::warn!(
                dataset = %dataset.id,
                tenant = %tenant.tenant_id,
                api_key = %tenant.api_key_id,
                "Row-level security bypassed by admin"
            );
            query.rls = RlsState::Bypassed {
                tenant_id: tenant.tenant_id.clone(),
            };
            return Ok(query);
        }

        match &dataset.tenant_column {
            Some(column) => {
                let guard = Expr::TenantGuard {
                    column: ColumnRef::new(Some(&dataset.alias), column.clone()),
                    tenant_id: tenant.tenant_id.clone(),
                };
                query.selection = Some(match query.selection.take() {
                    Some(existing) => Expr::And(vec![guard, existing]),
                    None => guard,
                });
                query.rls = RlsState::Enforced {
                    tenant_id: tenant.tenant_id.clone(),
                };
                Ok(query)
            }
            None if dataset.rls_required => {
                tracing::error!(
                    dataset = %dataset.id,
                    "Dataset requires row-level security but has no tenant column; refusing query"
                );
                Err(SecurityError::MissingRlsConfiguration {
                    dataset: dataset.id.clone(),
                })
            }
            None => {
                query.rls = RlsState::Unscoped {
                    tenant_id: tenant.tenant_id.clone(),
                };
                Ok(query)
            }
        }
    }
}
