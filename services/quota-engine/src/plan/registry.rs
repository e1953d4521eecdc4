use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use tracing::{debug, info};

use crate::audit::{self, AuditFact, AuditSink};
use crate::engine::QuotaError;
use crate::storage::{DeleteOutcome, QuotaDatabase};

use super::model::{NewQuotaPlan, PlanBinding, QuotaPlan, QuotaPlanUpdate};
use super::PlanResolver;

#[derive(Clone)]
struct CachedPlan {
    plan: QuotaPlan,
    fetched_at: Instant,
}

/// Plan definitions and customer bindings, with a short-lived read cache.
///
/// Plans change rarely and in-flight checks do not need to observe an edit
/// instantly, so reads may be up to `cache_ttl` stale. Writes through the
/// registry invalidate the cached copy immediately.
pub struct PlanRegistry {
    database: Arc<QuotaDatabase>,
    cache: DashMap<String, CachedPlan>,
    cache_ttl: Duration,
    audit: Arc<dyn AuditSink>,
}

impl PlanRegistry {
    pub fn new(
        database: Arc<QuotaDatabase>,
        cache_ttl: Duration,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            database,
            cache: DashMap::new(),
            cache_ttl,
            audit,
        }
    }

    pub fn create_plan(&self, new_plan: NewQuotaPlan) -> Result<QuotaPlan, QuotaError> {
        let plan = new_plan.into_plan();
        plan.validate()?;
        self.database.insert_plan(&plan)?;

        info!(
            plan_id = %plan.id,
            tenant_id = %plan.tenant_id,
            cadence = %plan.reset_cadence,
            "created quota plan"
        );
        audit::emit(
            self.audit.as_ref(),
            AuditFact::new(&plan.tenant_id, audit::CREATE_QUOTA_PLAN, "quota_plan", &plan.id)
                .with_payload(serde_json::to_value(&plan).unwrap_or_default()),
        );
        Ok(plan)
    }

    pub fn get_plan(&self, plan_id: &str) -> Result<QuotaPlan, QuotaError> {
        if let Some(cached) = self.cache.get(plan_id) {
            if cached.fetched_at.elapsed() < self.cache_ttl {
                return Ok(cached.plan.clone());
            }
        }

        let plan = self
            .database
            .get_plan(plan_id)?
            .ok_or_else(|| QuotaError::PlanNotFound(plan_id.to_string()))?;

        if !self.cache_ttl.is_zero() {
            self.cache.insert(
                plan_id.to_string(),
                CachedPlan {
                    plan: plan.clone(),
                    fetched_at: Instant::now(),
                },
            );
        }
        Ok(plan)
    }

    pub fn update_plan(
        &self,
        plan_id: &str,
        update: QuotaPlanUpdate,
    ) -> Result<QuotaPlan, QuotaError> {
        let mut plan = self
            .database
            .get_plan(plan_id)?
            .ok_or_else(|| QuotaError::PlanNotFound(plan_id.to_string()))?;
        update.apply_to(&mut plan);
        plan.validate()?;

        if !self.database.update_plan(&plan)? {
            return Err(QuotaError::PlanNotFound(plan_id.to_string()));
        }
        self.invalidate(plan_id);

        info!(plan_id, "updated quota plan");
        audit::emit(
            self.audit.as_ref(),
            AuditFact::new(&plan.tenant_id, audit::UPDATE_QUOTA_PLAN, "quota_plan", plan_id)
                .with_payload(serde_json::to_value(&plan).unwrap_or_default()),
        );
        Ok(plan)
    }

    pub fn list_plans(
        &self,
        tenant_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<QuotaPlan>, QuotaError> {
        Ok(self.database.list_plans(tenant_id, limit, offset)?)
    }

    /// Refuses while any customer is still bound to the plan.
    pub fn delete_plan(&self, plan_id: &str) -> Result<(), QuotaError> {
        match self.database.delete_plan(plan_id)? {
            DeleteOutcome::Deleted => {
                self.invalidate(plan_id);
                info!(plan_id, "deleted quota plan");
                audit::emit(
                    self.audit.as_ref(),
                    AuditFact::new("system", audit::DELETE_QUOTA_PLAN, "quota_plan", plan_id),
                );
                Ok(())
            }
            DeleteOutcome::NotFound => Err(QuotaError::PlanNotFound(plan_id.to_string())),
            DeleteOutcome::InUse { bindings } => Err(QuotaError::PlanInUse {
                plan_id: plan_id.to_string(),
                bindings,
            }),
        }
    }

    /// Makes `plan_id` the active plan for the customer, replacing any
    /// previous binding.
    pub fn bind_customer(
        &self,
        tenant_id: &str,
        customer_id: &str,
        plan_id: &str,
    ) -> Result<PlanBinding, QuotaError> {
        let plan = self.get_plan(plan_id)?;
        if plan.tenant_id != tenant_id {
            return Err(QuotaError::PlanNotFound(format!(
                "{plan_id} does not belong to tenant {tenant_id}"
            )));
        }

        let binding = PlanBinding {
            tenant_id: tenant_id.to_string(),
            customer_id: customer_id.to_string(),
            plan_id: plan_id.to_string(),
            bound_at: Utc::now(),
        };
        self.database.upsert_binding(&binding)?;

        debug!(tenant_id, customer_id, plan_id, "bound customer to quota plan");
        audit::emit(
            self.audit.as_ref(),
            AuditFact::new(tenant_id, audit::BIND_QUOTA_PLAN, "customer", customer_id)
                .with_payload(json!({ "plan_id": plan_id })),
        );
        Ok(binding)
    }

    pub fn unbind_customer(&self, tenant_id: &str, customer_id: &str) -> Result<bool, QuotaError> {
        Ok(self.database.remove_binding(tenant_id, customer_id)?)
    }

    pub fn list_bindings(&self) -> Result<Vec<PlanBinding>, QuotaError> {
        Ok(self.database.list_bindings()?)
    }

    pub fn invalidate(&self, plan_id: &str) {
        self.cache.remove(plan_id);
    }
}

impl PlanResolver for PlanRegistry {
    fn resolve_plan(&self, tenant_id: &str, customer_id: &str) -> Result<QuotaPlan, QuotaError> {
        let binding = self
            .database
            .get_binding(tenant_id, customer_id)?
            .ok_or_else(|| {
                QuotaError::PlanNotFound(format!(
                    "no quota plan bound to customer {customer_id} of tenant {tenant_id}"
                ))
            })?;
        self.get_plan(&binding.plan_id)
    }
}
