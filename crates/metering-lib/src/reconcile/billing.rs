//! Billing engine
//!
//! Closes a metering record's period once its interval has elapsed. Closing
//! is one atomic status write: the accumulator is cleared, the hourly
//! history rotated, totals and sequence advanced, and the owed amount parked
//! as a pending deduction. The ledger deduction is created afterwards under
//! a name derived from `(owner, sequence)`, and the pending marker cleared.
//! A pass that finds a pending marker delivers it before anything else.

use super::{Action, Context, Reconciler};
use crate::error::{InvariantViolation, Result};
use crate::health::components;
use crate::models::{ClosedPeriod, LedgerDeduction, Metering, PendingDeduction, Resource};
use crate::store::ObjectKey;
use async_trait::async_trait;
use tracing::{debug, info};

pub struct BillingReconciler {
    ctx: Context,
}

impl BillingReconciler {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Create the ledger deduction for a closed period and clear the marker.
    ///
    /// An existing deduction under the same name is accepted only when it is
    /// this period's own earlier delivery.
    async fn deliver(&self, key: &ObjectKey, owner: &str, pending: &PendingDeduction) -> Result<()> {
        let deduction = LedgerDeduction::for_period(
            &self.ctx.config.system_namespace,
            owner,
            &key.name,
            pending,
        );
        let name = deduction.metadata.name.clone();
        let api = self.ctx.api::<LedgerDeduction>();

        let resumed = match api.create(&deduction).await {
            Ok(_) => {
                self.ctx.metrics.inc_ledger_deductions();
                false
            }
            Err(e) if e.is_already_exists() => {
                let existing = api.get(&deduction.key()).await?;
                if !existing.is_delivery_of(owner, &key.name, pending) {
                    return Err(InvariantViolation::DuplicateLedgerEntry { name }.into());
                }
                true
            }
            Err(e) => return Err(e),
        };

        self.ctx
            .api::<Metering>()
            .modify_status(key, &self.ctx.config.retry, |metering| {
                let matches = metering
                    .status
                    .pending_deduction
                    .as_ref()
                    .is_some_and(|p| p.sequence_id == pending.sequence_id);
                if !matches {
                    return Ok(None);
                }
                metering.status.pending_deduction = None;
                Ok(Some(()))
            })
            .await?;

        self.ctx
            .logger
            .log_deduction_emitted(&name, owner, pending.amount, resumed);
        Ok(())
    }

    /// Close the current period if it is still due and nothing is pending.
    ///
    /// Returns `None` when a concurrent pass closed it first.
    async fn close_period(&self, key: &ObjectKey, now: i64) -> Result<Option<(Metering, ClosedPeriod)>> {
        self.ctx
            .api::<Metering>()
            .modify_status(key, &self.ctx.config.retry, |metering| {
                if metering.status.pending_deduction.is_some()
                    || metering.time_until_due(now).is_some()
                {
                    return Ok(None);
                }

                let amount = metering.status.accumulated_cost();
                if amount < 0 {
                    return Err(InvariantViolation::NegativeCost {
                        metering: metering.metadata.name.clone(),
                        amount,
                    }
                    .into());
                }

                Ok(Some(metering.status.close_period(now)))
            })
            .await
    }
}

#[async_trait]
impl Reconciler for BillingReconciler {
    fn kind(&self) -> &'static str {
        Metering::KIND
    }

    fn component(&self) -> &'static str {
        components::BILLING
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(metering) = self.ctx.api::<Metering>().get_opt(key).await? else {
            return Ok(Action::AwaitChange);
        };
        if metering.metadata.is_deleting() {
            return Ok(Action::AwaitChange);
        }
        let owner = metering.spec.owner.clone();

        // Owed from a pass that stopped after committing the period
        if let Some(pending) = &metering.status.pending_deduction {
            info!(metering = %key, sequence_id = pending.sequence_id, "Delivering pending deduction");
            self.deliver(key, &owner, pending).await?;
        }

        let now = self.ctx.now();
        if let Some(remaining) = metering.time_until_due(now) {
            debug!(metering = %key, remaining_secs = remaining.as_secs(), "Billing period still open");
            return Ok(Action::Requeue(remaining));
        }

        let closed = self.close_period(key, now).await?;
        if let Some((updated, period)) = closed {
            self.ctx.metrics.add_billed_amount(period.amount);
            self.ctx.logger.log_period_closed(
                &updated.metadata.name,
                &owner,
                period.sequence_id,
                period.amount,
                period.rolled_to_daily,
            );
            if let Some(pending) = &updated.status.pending_deduction {
                self.deliver(key, &owner, pending).await?;
            }
        }

        Ok(Action::Requeue(metering.interval()))
    }
}
