//! Tenant accounting profile lookup.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use keel_core::{CurrencyCode, EngineError, EngineResult, TenantId};

/// Resolves the tenant's accounting configuration (owned by onboarding,
/// consumed read-only here).
pub trait TenantDirectory: Send + Sync {
    /// The currency every ledger entry for this tenant is booked in.
    fn base_currency(&self, tenant_id: TenantId) -> EngineResult<CurrencyCode>;
}

impl<S> TenantDirectory for Arc<S>
where
    S: TenantDirectory + ?Sized,
{
    fn base_currency(&self, tenant_id: TenantId) -> EngineResult<CurrencyCode> {
        (**self).base_currency(tenant_id)
    }
}

/// In-memory directory for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryTenantDirectory {
    currencies: RwLock<HashMap<TenantId, CurrencyCode>>,
}

impl InMemoryTenantDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tenant_id: TenantId, base_currency: CurrencyCode) {
        if let Ok(mut currencies) = self.currencies.write() {
            currencies.insert(tenant_id, base_currency);
        }
    }
}

impl TenantDirectory for InMemoryTenantDirectory {
    fn base_currency(&self, tenant_id: TenantId) -> EngineResult<CurrencyCode> {
        let currencies = self
            .currencies
            .read()
            .map_err(|_| EngineError::infrastructure("tenant directory lock poisoned"))?;
        currencies
            .get(&tenant_id)
            .cloned()
            .ok_or_else(|| EngineError::validation(format!("unknown tenant {tenant_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_tenants_resolve_their_base_currency() {
        let dir = InMemoryTenantDirectory::new();
        let tenant = TenantId::new();
        dir.register(tenant, CurrencyCode::new("GBP").unwrap());

        assert_eq!(dir.base_currency(tenant).unwrap().as_str(), "GBP");
        assert!(dir.base_currency(TenantId::new()).is_err());
    }
}
