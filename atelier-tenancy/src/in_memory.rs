use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::CreateTenantRequest;
use crate::TenancyError;
use crate::TenancyResult;
use crate::TenancyService;
use crate::Tenant;
use crate::TenantId;
use crate::TenantStatus;

#[derive(Default)]
struct TenancyState {
    tenants: HashMap<TenantId, Tenant>,
    slugs: HashMap<String, TenantId>,
}

pub struct InMemoryTenancyService {
    state: RwLock<TenancyState>,
}

impl Default for InMemoryTenancyService {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTenancyService {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(TenancyState::default()),
        }
    }

    #[must_use]
    pub fn from_tenants(tenants: Vec<Tenant>) -> Self {
        let mut state = TenancyState::default();
        for tenant in tenants {
            state.slugs.insert(tenant.slug.clone(), tenant.id);
            state.tenants.insert(tenant.id, tenant);
        }
        Self {
            state: RwLock::new(state),
        }
    }

    pub async fn export_tenants(&self) -> Vec<Tenant> {
        let guard = self.state.read().await;
        let mut tenants: Vec<Tenant> = guard.tenants.values().cloned().collect();
        tenants.sort_by(|a, b| a.slug.cmp(&b.slug));
        tenants
    }
}

#[async_trait]
impl TenancyService for InMemoryTenancyService {
    async fn create_tenant(&self, request: CreateTenantRequest) -> TenancyResult<Tenant> {
        let request = request.normalize()?;
        let mut guard = self.state.write().await;
        if guard.slugs.contains_key(&request.slug) {
            return Err(TenancyError::Conflict(format!(
                "tenant slug {} already exists",
                request.slug
            )));
        }

        let tenant = Tenant {
            id: Uuid::new_v4(),
            slug: request.slug,
            name: request.name,
            status: TenantStatus::Active,
            base_currency: request.base_currency,
            created_at: Utc::now(),
        };
        guard.slugs.insert(tenant.slug.clone(), tenant.id);
        guard.tenants.insert(tenant.id, tenant.clone());
        Ok(tenant)
    }

    async fn get_tenant(&self, tenant_id: TenantId) -> TenancyResult<Tenant> {
        let guard = self.state.read().await;
        guard
            .tenants
            .get(&tenant_id)
            .cloned()
            .ok_or_else(|| TenancyError::NotFound(format!("tenant {tenant_id}")))
    }

    async fn get_by_slug(&self, slug: &str) -> TenancyResult<Tenant> {
        let guard = self.state.read().await;
        guard
            .slugs
            .get(slug)
            .and_then(|id| guard.tenants.get(id))
            .cloned()
            .ok_or_else(|| TenancyError::NotFound(format!("tenant slug {slug}")))
    }

    async fn list_tenants(&self) -> TenancyResult<Vec<Tenant>> {
        let guard = self.state.read().await;
        let mut tenants: Vec<Tenant> = guard.tenants.values().cloned().collect();
        tenants.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(tenants)
    }

    async fn set_status(&self, tenant_id: TenantId, status: TenantStatus) -> TenancyResult<Tenant> {
        let mut guard = self.state.write().await;
        let tenant = guard
            .tenants
            .get_mut(&tenant_id)
            .ok_or_else(|| TenancyError::NotFound(format!("tenant {tenant_id}")))?;
        tenant.status = status;
        Ok(tenant.clone())
    }

    async fn active_tenant_ids(&self) -> TenancyResult<Vec<TenantId>> {
        let guard = self.state.read().await;
        let mut ids: Vec<TenantId> = guard
            .tenants
            .values()
            .filter(|tenant| tenant.status.is_active())
            .map(|tenant| tenant.id)
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn request(slug: &str) -> CreateTenantRequest {
        CreateTenantRequest {
            slug: slug.into(),
            name: format!("{slug} studio"),
            base_currency: "USD".into(),
        }
    }

    #[tokio::test]
    async fn creates_and_resolves_by_slug() {
        let service = InMemoryTenancyService::new();
        let created = service
            .create_tenant(request("harbor"))
            .await
            .expect("create tenant");

        let by_slug = service.get_by_slug("harbor").await.expect("lookup by slug");
        assert_eq!(by_slug, created);
        assert_eq!(created.status, TenantStatus::Active);
    }

    #[tokio::test]
    async fn duplicate_slug_is_a_conflict() {
        let service = InMemoryTenancyService::new();
        service
            .create_tenant(request("harbor"))
            .await
            .expect("first create");

        let err = service.create_tenant(request("harbor")).await.unwrap_err();
        assert!(matches!(err, TenancyError::Conflict(_)));
    }

    #[tokio::test]
    async fn suspended_tenants_leave_the_schedule() {
        let service = InMemoryTenancyService::new();
        let a = service.create_tenant(request("aa")).await.expect("a");
        let b = service.create_tenant(request("bb")).await.expect("b");

        service
            .set_status(b.id, TenantStatus::Suspended)
            .await
            .expect("suspend");

        let ids = service.active_tenant_ids().await.expect("active ids");
        assert_eq!(ids, vec![a.id]);
    }
}
