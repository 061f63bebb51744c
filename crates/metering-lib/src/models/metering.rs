//! Metering records, usage records and ledger deductions

use super::{deduction_name, impl_resource, ObjectMeta, Quantity, ResourceName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Hourly entries folded into one daily entry
pub const HOURS_PER_DAY: usize = 24;

/// Usage and cost of one resource kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    pub used: Quantity,
    /// Cost in minor currency units
    pub cost: i64,
    /// Unix seconds of the latest contribution
    pub timestamp: i64,
    /// Tenant namespace the usage belongs to
    #[serde(default)]
    pub namespace: String,
}

impl ResourceInfo {
    pub fn new(used: Quantity, cost: i64, timestamp: i64, namespace: impl Into<String>) -> Self {
        Self {
            used,
            cost,
            timestamp,
            namespace: namespace.into(),
        }
    }

    /// Fold another contribution of the same kind into this one.
    ///
    /// Quantities and costs add up; the timestamp is last-write-wins.
    pub fn merge(&mut self, incoming: &ResourceInfo) {
        self.used += incoming.used;
        self.cost = self.cost.saturating_add(incoming.cost);
        self.timestamp = incoming.timestamp;
    }

    pub fn is_negative(&self) -> bool {
        self.cost < 0 || self.used.is_negative()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    Hour,
    Day,
}

/// One row of the billing history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingEntry {
    pub timestamp: i64,
    pub interval: BillingInterval,
    pub amount: i64,
    pub settled: bool,
}

impl BillingEntry {
    pub fn new(interval: BillingInterval, amount: i64, timestamp: i64) -> Self {
        Self {
            timestamp,
            interval,
            amount,
            settled: false,
        }
    }
}

/// Per-resource line of a ledger deduction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceBreakdown {
    pub resource_name: ResourceName,
    pub used: Quantity,
    pub cost: i64,
}

/// A closed period whose ledger deduction has not been confirmed yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingDeduction {
    pub sequence_id: u64,
    pub amount: i64,
    pub timestamp: i64,
    pub resources: Vec<ResourceBreakdown>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeteringSpec {
    pub owner: String,
    pub namespace: String,
    pub interval_minutes: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MeteringStatus {
    /// In-period usage not billed yet
    pub accumulator: BTreeMap<ResourceName, ResourceInfo>,
    /// Usage record keys folded recently, with the sequence they were folded in
    pub folded_records: BTreeMap<String, u64>,
    pub billing_hourly: Vec<BillingEntry>,
    pub billing_daily: Vec<BillingEntry>,
    pub total_amount: i64,
    pub last_billing_timestamp: i64,
    pub sequence_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_deduction: Option<PendingDeduction>,
}

/// Outcome of closing one billing period
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedPeriod {
    pub sequence_id: u64,
    pub amount: i64,
    pub rolled_to_daily: Option<i64>,
}

impl MeteringStatus {
    /// Sum of accumulated costs
    pub fn accumulated_cost(&self) -> i64 {
        self.accumulator
            .values()
            .fold(0i64, |acc, info| acc.saturating_add(info.cost))
    }

    /// Fold a usage record's entries unless `token` was folded already.
    ///
    /// Returns false when the token is known and nothing changed.
    pub fn fold<'a>(
        &mut self,
        token: &str,
        entries: impl IntoIterator<Item = (&'a ResourceName, &'a ResourceInfo)>,
    ) -> bool {
        if self.folded_records.contains_key(token) {
            return false;
        }
        for (name, incoming) in entries {
            match self.accumulator.get_mut(name) {
                Some(existing) => existing.merge(incoming),
                None => {
                    self.accumulator.insert(name.clone(), incoming.clone());
                }
            }
        }
        self.folded_records
            .insert(token.to_string(), self.sequence_id);
        true
    }

    /// Append an hourly entry, rolling the oldest full day into the daily list.
    ///
    /// Returns the daily amount when a rollover happened.
    pub fn append_hourly(&mut self, amount: i64, timestamp: i64) -> Option<i64> {
        self.billing_hourly
            .push(BillingEntry::new(BillingInterval::Hour, amount, timestamp));

        if self.billing_hourly.len() < HOURS_PER_DAY {
            return None;
        }

        let day_total = self
            .billing_hourly
            .drain(..HOURS_PER_DAY)
            .fold(0i64, |acc, entry| acc.saturating_add(entry.amount));
        self.billing_daily
            .push(BillingEntry::new(BillingInterval::Day, day_total, timestamp));
        Some(day_total)
    }

    /// Close the current period in place.
    ///
    /// Clears the accumulator, rotates history, advances totals and the
    /// sequence, and records a pending deduction for non-zero amounts.
    /// Callers must reject negative totals beforehand.
    pub fn close_period(&mut self, now: i64) -> ClosedPeriod {
        let amount = self.accumulated_cost();
        let sequence_id = self.sequence_id;

        let resources = self
            .accumulator
            .iter()
            .map(|(name, info)| ResourceBreakdown {
                resource_name: name.clone(),
                used: info.used,
                cost: info.cost,
            })
            .collect();
        self.accumulator.clear();

        // Tokens from the current and previous period guard late re-deliveries
        let keep_from = sequence_id.saturating_sub(1);
        self.folded_records.retain(|_, seq| *seq >= keep_from);

        let rolled_to_daily = self.append_hourly(amount, now);
        self.total_amount = self.total_amount.saturating_add(amount);
        self.last_billing_timestamp = now;
        self.sequence_id += 1;

        if amount > 0 {
            self.pending_deduction = Some(PendingDeduction {
                sequence_id,
                amount,
                timestamp: now,
                resources,
            });
        }

        ClosedPeriod {
            sequence_id,
            amount,
            rolled_to_daily,
        }
    }
}

/// Durable per-tenant accumulator and billing history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metering {
    pub metadata: ObjectMeta,
    pub spec: MeteringSpec,
    #[serde(default)]
    pub status: MeteringStatus,
}

impl_resource!(Metering, "Metering");

impl Metering {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.spec.interval_minutes.max(1)) * 60)
    }

    /// Time left before the current period may be closed; `None` when due
    pub fn time_until_due(&self, now: i64) -> Option<Duration> {
        let elapsed = now.saturating_sub(self.status.last_billing_timestamp);
        let interval = self.interval().as_secs() as i64;
        if elapsed >= interval {
            None
        } else {
            Some(Duration::from_secs((interval - elapsed) as u64))
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UsagePhase {
    #[default]
    Pending,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsageSpec {
    pub target_namespace: String,
    pub resources: BTreeMap<ResourceName, ResourceInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceUsageStatus {
    pub phase: UsagePhase,
}

/// Sampled consumption handed from a sampler to ingestion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub metadata: ObjectMeta,
    pub spec: ResourceUsageSpec,
    #[serde(default)]
    pub status: ResourceUsageStatus,
}

impl_resource!(ResourceUsage, "ResourceUsage");

impl ResourceUsage {
    pub fn is_complete(&self) -> bool {
        self.status.phase == UsagePhase::Complete
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerDeductionSpec {
    pub owner: String,
    /// Name of the metering record whose period this settles
    pub metering: String,
    pub amount: i64,
    pub timestamp: i64,
    pub sequence_id: u64,
    pub resources: Vec<ResourceBreakdown>,
}

/// Immutable request for the ledger service to debit a tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerDeduction {
    pub metadata: ObjectMeta,
    pub spec: LedgerDeductionSpec,
}

impl_resource!(LedgerDeduction, "LedgerDeduction");

impl LedgerDeduction {
    pub fn for_period(
        system_namespace: &str,
        owner: &str,
        metering: &str,
        pending: &PendingDeduction,
    ) -> Self {
        Self {
            metadata: ObjectMeta::namespaced(
                system_namespace,
                deduction_name(owner, pending.sequence_id),
            ),
            spec: LedgerDeductionSpec {
                owner: owner.to_string(),
                metering: metering.to_string(),
                amount: pending.amount,
                timestamp: pending.timestamp,
                sequence_id: pending.sequence_id,
                resources: pending.resources.clone(),
            },
        }
    }

    /// Whether this object is the delivery of exactly this pending period
    /// of the given metering record
    pub fn is_delivery_of(&self, owner: &str, metering: &str, pending: &PendingDeduction) -> bool {
        self.spec.owner == owner
            && self.spec.metering == metering
            && self.spec.sequence_id == pending.sequence_id
            && self.spec.amount == pending.amount
            && self.spec.timestamp == pending.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(cost: i64, used_milli: i64, ts: i64) -> ResourceInfo {
        ResourceInfo::new(Quantity::from_milli(used_milli), cost, ts, "team-a")
    }

    #[test]
    fn test_fold_sums_cost_and_quantity() {
        let mut status = MeteringStatus::default();
        let cpu = "cpu".to_string();

        let first = BTreeMap::from([(cpu.clone(), info(10, 500, 100))]);
        let second = BTreeMap::from([(cpu.clone(), info(15, 250, 200))]);

        assert!(status.fold("r1", &first));
        assert!(status.fold("r2", &second));

        let folded = &status.accumulator["cpu"];
        assert_eq!(folded.cost, 25);
        assert_eq!(folded.used, Quantity::from_milli(750));
        assert_eq!(folded.timestamp, 200);
    }

    #[test]
    fn test_fold_is_order_independent_for_cost() {
        let cpu = "cpu".to_string();
        let a = BTreeMap::from([(cpu.clone(), info(10, 1, 1))]);
        let b = BTreeMap::from([(cpu.clone(), info(15, 1, 2))]);

        let mut forward = MeteringStatus::default();
        forward.fold("a", &a);
        forward.fold("b", &b);

        let mut backward = MeteringStatus::default();
        backward.fold("b", &b);
        backward.fold("a", &a);

        assert_eq!(forward.accumulator["cpu"].cost, 25);
        assert_eq!(backward.accumulator["cpu"].cost, 25);
    }

    #[test]
    fn test_fold_skips_known_token() {
        let mut status = MeteringStatus::default();
        let entries = BTreeMap::from([("memory".to_string(), info(7, 1000, 1))]);

        assert!(status.fold("r1", &entries));
        assert!(!status.fold("r1", &entries));
        assert_eq!(status.accumulator["memory"].cost, 7);
    }

    #[test]
    fn test_hourly_rotation_into_daily() {
        let mut status = MeteringStatus::default();
        for hour in 0..23 {
            assert_eq!(status.append_hourly(5, hour), None);
        }
        assert_eq!(status.append_hourly(5, 23), Some(120));

        assert!(status.billing_hourly.is_empty());
        assert_eq!(status.billing_daily.len(), 1);
        assert_eq!(status.billing_daily[0].amount, 120);
        assert_eq!(status.billing_daily[0].interval, BillingInterval::Day);

        // 25th append starts a fresh window
        assert_eq!(status.append_hourly(5, 24), None);
        assert_eq!(status.billing_hourly.len(), 1);
        assert_eq!(status.billing_daily.len(), 1);
    }

    #[test]
    fn test_rotation_evicts_only_first_day() {
        let mut status = MeteringStatus::default();
        // Oversized history left behind by an older writer
        for hour in 0..30 {
            status
                .billing_hourly
                .push(BillingEntry::new(BillingInterval::Hour, 1, hour));
        }
        assert_eq!(status.append_hourly(2, 30), Some(24));
        assert_eq!(status.billing_hourly.len(), 7);
        assert_eq!(status.billing_hourly.last().unwrap().amount, 2);
    }

    #[test]
    fn test_close_period_records_pending_deduction() {
        let mut status = MeteringStatus::default();
        status.sequence_id = 4;
        status.accumulator.insert("cpu".into(), info(30, 2000, 10));
        status.accumulator.insert("memory".into(), info(12, 4000, 10));

        let closed = status.close_period(1_000);

        assert_eq!(closed.sequence_id, 4);
        assert_eq!(closed.amount, 42);
        assert!(status.accumulator.is_empty());
        assert_eq!(status.sequence_id, 5);
        assert_eq!(status.total_amount, 42);
        assert_eq!(status.last_billing_timestamp, 1_000);

        let pending = status.pending_deduction.as_ref().unwrap();
        assert_eq!(pending.sequence_id, 4);
        assert_eq!(pending.amount, 42);
        assert_eq!(pending.resources.len(), 2);
    }

    #[test]
    fn test_close_period_zero_amount_has_no_pending() {
        let mut status = MeteringStatus::default();
        let closed = status.close_period(50);

        assert_eq!(closed.amount, 0);
        assert!(status.pending_deduction.is_none());
        assert_eq!(status.billing_hourly.len(), 1);
        assert_eq!(status.billing_hourly[0].amount, 0);
        assert_eq!(status.sequence_id, 1);
    }

    #[test]
    fn test_close_period_prunes_old_tokens() {
        let mut status = MeteringStatus::default();
        status.sequence_id = 5;
        status.folded_records.insert("old".into(), 2);
        status.folded_records.insert("previous".into(), 4);
        status.folded_records.insert("current".into(), 5);

        status.close_period(10);

        assert!(!status.folded_records.contains_key("old"));
        assert!(status.folded_records.contains_key("previous"));
        assert!(status.folded_records.contains_key("current"));
    }

    #[test]
    fn test_time_until_due() {
        let metering = Metering {
            metadata: ObjectMeta::namespaced("metering-system", "metering-team-a"),
            spec: MeteringSpec {
                owner: "alice".into(),
                namespace: "team-a".into(),
                interval_minutes: 60,
            },
            status: MeteringStatus {
                last_billing_timestamp: 1_000,
                ..Default::default()
            },
        };

        assert_eq!(
            metering.time_until_due(1_000 + 600),
            Some(Duration::from_secs(3000))
        );
        assert_eq!(metering.time_until_due(1_000 + 3600), None);
    }

    #[test]
    fn test_ledger_delivery_match() {
        let pending = PendingDeduction {
            sequence_id: 3,
            amount: 90,
            timestamp: 1,
            resources: vec![],
        };
        let deduction =
            LedgerDeduction::for_period("metering-system", "alice", "metering-team-a", &pending);
        assert_eq!(deduction.metadata.name, "deduction-alice-3");
        assert!(deduction.is_delivery_of("alice", "metering-team-a", &pending));

        let other = PendingDeduction {
            amount: 91,
            ..pending.clone()
        };
        assert!(!deduction.is_delivery_of("alice", "metering-team-a", &other));

        // Same owner, sequence and amount from another tenant's record
        assert!(!deduction.is_delivery_of("alice", "metering-team-b", &pending));

        // A record re-created under the same name closes at a different time
        let later = PendingDeduction {
            timestamp: 7_201,
            ..pending.clone()
        };
        assert!(!deduction.is_delivery_of("alice", "metering-team-a", &later));
    }
}
