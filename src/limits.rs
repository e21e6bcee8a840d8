//! Preflight daily spend-limit checks.
//!
//! The check is advisory: it compares today's already-recorded spend plus
//! the projected cost of the incoming request (usually zero, since there is
//! no reliable pre-estimate) against the tenant's daily cap. Costs recorded
//! after the response are not reserved up front, so concurrent requests can
//! collectively overshoot; the next request is then rejected.

use std::sync::Arc;

use crate::config::Tenant;
use crate::error::ProxyError;
use crate::pricing::Pricer;
use crate::usage::store::UsageStore;
use crate::usage::TokenUsage;

pub struct LimitGuard {
    store: Arc<UsageStore>,
    pricer: Pricer,
}

impl LimitGuard {
    pub fn new(store: Arc<UsageStore>, pricer: Pricer) -> Self {
        Self { store, pricer }
    }

    /// Reject when today's spend plus the projected cost would pass the cap.
    ///
    /// Tenants without a configured cap are unlimited.
    pub async fn check(
        &self,
        tenant: &Tenant,
        model: &str,
        projected: &TokenUsage,
    ) -> Result<(), ProxyError> {
        let Some(max_usd) = tenant.daily_max_usd() else {
            return Ok(());
        };

        let spend = self.store.today_spend(&tenant.id).await;
        let projected_cost = self.pricer.cost(model, projected).total_cost;
        let new_total = spend + projected_cost;

        if new_total > max_usd {
            tracing::warn!(
                tenant_id = %tenant.id,
                spend,
                projected_cost,
                max_usd,
                "Daily spend limit reached"
            );
            return Err(ProxyError::LimitExceeded(format!(
                "daily limit of ${max_usd:.2} reached: ${spend:.6} spent today, \
                 projected request cost ${projected_cost:.6}"
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
