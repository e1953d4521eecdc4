pub mod model;
pub mod registry;

pub use model::{NewQuotaPlan, PlanBinding, QuotaPlan, QuotaPlanUpdate};
pub use registry::PlanRegistry;

use crate::engine::QuotaError;

/// Supplies the plan currently bound to a customer. The engine itself never
/// decides which plan applies.
pub trait PlanResolver: Send + Sync {
    fn resolve_plan(&self, tenant_id: &str, customer_id: &str) -> Result<QuotaPlan, QuotaError>;
}
