//! Two-phase cost accounting against daily and monthly budgets.
//!
//! Admission reserves the projected cost; the reservation is then either
//! committed with the actual cost or released. Dropping a reservation
//! releases it, so a cancelled request never leaves a phantom hold.
//!
//! All amounts are [`Usd`] integer thousandths of a dollar.

use crate::error::GatewayError;
use chrono::{DateTime, Datelike, NaiveTime, Utc};
use parking_lot::Mutex;
use prism_core::{BudgetConfig, Usd};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Source of the current time, injectable for tests.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Budget period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriod {
    /// Calendar day (UTC)
    Daily,
    /// Calendar month (UTC)
    Monthly,
}

impl fmt::Display for BudgetPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Daily => f.write_str("daily"),
            Self::Monthly => f.write_str("monthly"),
        }
    }
}

/// Why a reservation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetDenial {
    /// Period whose limit would be crossed
    pub period: BudgetPeriod,
    /// Amount requested
    pub requested: Usd,
    /// Budget left, net of outstanding reservations
    pub remaining: Usd,
    /// Configured limit
    pub limit: Usd,
}

impl From<BudgetDenial> for GatewayError {
    fn from(denial: BudgetDenial) -> Self {
        Self::BudgetExceeded {
            period: denial.period,
            requested: denial.requested,
            remaining: denial.remaining,
            limit: denial.limit,
        }
    }
}

/// Event broadcast by the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BudgetEvent {
    /// Spend crossed the warning ratio of a limit. Fires once per period.
    Warning {
        /// Period concerned
        period: BudgetPeriod,
        /// Spend at the time of the warning
        spent: Usd,
        /// Configured limit
        limit: Usd,
        /// Time until the limit is reached at the period's burn rate
        projected_exhaustion: Option<Duration>,
    },
}

/// Point-in-time ledger figures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerUsage {
    /// Spend charged today
    pub daily_spent: Usd,
    /// Spend charged this month
    pub monthly_spent: Usd,
    /// Outstanding holds against today's budget
    pub daily_reserved: Usd,
    /// Outstanding holds against this month's budget
    pub monthly_reserved: Usd,
    /// Daily limit
    pub daily_limit: Usd,
    /// Monthly limit
    pub monthly_limit: Usd,
}

/// Persistable ledger state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    /// Day the daily figures belong to (`YYYY-MM-DD`)
    pub day_key: String,
    /// Month the monthly figures belong to (`YYYY-MM`)
    pub month_key: String,
    /// Daily spend
    pub daily_spent: Usd,
    /// Monthly spend
    pub monthly_spent: Usd,
    /// Whether the daily warning already fired
    pub daily_warned: bool,
    /// Whether the monthly warning already fired
    pub monthly_warned: bool,
}

#[derive(Debug)]
struct Bucket {
    period: BudgetPeriod,
    key: String,
    started_at: DateTime<Utc>,
    limit: Usd,
    spent: Usd,
    reserved: Usd,
    warned: bool,
}

impl Bucket {
    fn new(period: BudgetPeriod, limit: Usd, now: DateTime<Utc>) -> Self {
        Self {
            period,
            key: period_key(period, now),
            started_at: period_start(period, now),
            limit,
            spent: Usd::ZERO,
            reserved: Usd::ZERO,
            warned: false,
        }
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        let key = period_key(self.period, now);
        if key != self.key {
            tracing::info!(period = %self.period, from = %self.key, to = %key, "Budget period rolled over");
            self.key = key;
            self.started_at = period_start(self.period, now);
            self.spent = Usd::ZERO;
            self.reserved = Usd::ZERO;
            self.warned = false;
        }
    }

    fn remaining(&self) -> Usd {
        self.limit.saturating_sub(self.spent + self.reserved)
    }

    fn release(&mut self, key: &str, amount: Usd) {
        if self.key == key {
            self.reserved = self.reserved.saturating_sub(amount);
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn check_warning(&mut self, ratio: f64, now: DateTime<Utc>) -> Option<BudgetEvent> {
        if self.warned || self.limit.is_zero() {
            return None;
        }
        let threshold = self.limit.mills() as f64 * ratio;
        if (self.spent.mills() as f64) < threshold {
            return None;
        }
        self.warned = true;

        let elapsed = (now - self.started_at).num_milliseconds();
        let projected_exhaustion = if self.spent >= self.limit {
            Some(Duration::ZERO)
        } else if elapsed > 0 && self.spent > Usd::ZERO {
            // left / (spent / elapsed), kept in integers
            let left = i128::from((self.limit - self.spent).mills());
            let millis = left * i128::from(elapsed) / i128::from(self.spent.mills());
            Some(Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX)))
        } else {
            None
        };

        Some(BudgetEvent::Warning {
            period: self.period,
            spent: self.spent,
            limit: self.limit,
            projected_exhaustion,
        })
    }
}

fn period_key(period: BudgetPeriod, now: DateTime<Utc>) -> String {
    match period {
        BudgetPeriod::Daily => now.format("%Y-%m-%d").to_string(),
        BudgetPeriod::Monthly => now.format("%Y-%m").to_string(),
    }
}

fn period_start(period: BudgetPeriod, now: DateTime<Utc>) -> DateTime<Utc> {
    let date = now.date_naive();
    let first = match period {
        BudgetPeriod::Daily => date,
        BudgetPeriod::Monthly => date.with_day(1).unwrap_or(date),
    };
    first.and_time(NaiveTime::MIN).and_utc()
}

#[derive(Debug)]
struct LedgerState {
    daily: Bucket,
    monthly: Bucket,
}

impl LedgerState {
    fn roll(&mut self, now: DateTime<Utc>) {
        self.daily.roll(now);
        self.monthly.roll(now);
    }
}

/// Daily and monthly spend tracker used for admission control.
pub struct CostLedger {
    state: Mutex<LedgerState>,
    warning_ratio: f64,
    clock: Clock,
    events: broadcast::Sender<BudgetEvent>,
}

impl fmt::Debug for CostLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CostLedger")
            .field("state", &*self.state.lock())
            .field("warning_ratio", &self.warning_ratio)
            .finish_non_exhaustive()
    }
}

impl CostLedger {
    /// Create a ledger using the system clock.
    #[must_use]
    pub fn new(config: &BudgetConfig) -> Self {
        Self::with_clock(config, Arc::new(Utc::now))
    }

    /// Create a ledger reading time from `clock`.
    #[must_use]
    pub fn with_clock(config: &BudgetConfig, clock: Clock) -> Self {
        let now = clock();
        let (events, _) = broadcast::channel(16);
        Self {
            state: Mutex::new(LedgerState {
                daily: Bucket::new(BudgetPeriod::Daily, Usd::from_dollars(config.daily_limit_usd), now),
                monthly: Bucket::new(
                    BudgetPeriod::Monthly,
                    Usd::from_dollars(config.monthly_limit_usd),
                    now,
                ),
            }),
            warning_ratio: config.warning_ratio,
            clock,
            events,
        }
    }

    /// Hold `cost` against both budgets if it fits in what remains.
    ///
    /// A cost equal to the remaining budget is admitted.
    ///
    /// # Errors
    /// Returns the first period whose remaining budget is below `cost`.
    pub fn reserve(&self, cost: Usd) -> Result<Reservation<'_>, BudgetDenial> {
        let now = (self.clock)();
        let mut state = self.state.lock();
        state.roll(now);

        for bucket in [&state.daily, &state.monthly] {
            let remaining = bucket.remaining();
            if cost > remaining {
                tracing::debug!(
                    period = %bucket.period,
                    requested = %cost,
                    remaining = %remaining,
                    "Budget reservation denied"
                );
                return Err(BudgetDenial {
                    period: bucket.period,
                    requested: cost,
                    remaining,
                    limit: bucket.limit,
                });
            }
        }

        state.daily.reserved += cost;
        state.monthly.reserved += cost;

        Ok(Reservation {
            ledger: self,
            amount: cost,
            day_key: state.daily.key.clone(),
            month_key: state.monthly.key.clone(),
            settled: false,
        })
    }

    /// Current spend, holds and limits.
    #[must_use]
    pub fn usage(&self) -> LedgerUsage {
        let now = (self.clock)();
        let mut state = self.state.lock();
        state.roll(now);
        LedgerUsage {
            daily_spent: state.daily.spent,
            monthly_spent: state.monthly.spent,
            daily_reserved: state.daily.reserved,
            monthly_reserved: state.monthly.reserved,
            daily_limit: state.daily.limit,
            monthly_limit: state.monthly.limit,
        }
    }

    /// Subscribe to budget events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BudgetEvent> {
        self.events.subscribe()
    }

    /// Persistable state. Outstanding reservations are not included.
    #[must_use]
    pub fn snapshot(&self) -> LedgerSnapshot {
        let now = (self.clock)();
        let mut state = self.state.lock();
        state.roll(now);
        LedgerSnapshot {
            day_key: state.daily.key.clone(),
            month_key: state.monthly.key.clone(),
            daily_spent: state.daily.spent,
            monthly_spent: state.monthly.spent,
            daily_warned: state.daily.warned,
            monthly_warned: state.monthly.warned,
        }
    }

    /// Load persisted spend. Figures from a period that has ended are ignored.
    pub fn restore(&self, snapshot: &LedgerSnapshot) {
        let now = (self.clock)();
        let mut state = self.state.lock();
        state.roll(now);

        if state.daily.key == snapshot.day_key {
            state.daily.spent = snapshot.daily_spent;
            state.daily.warned = snapshot.daily_warned;
        }
        if state.monthly.key == snapshot.month_key {
            state.monthly.spent = snapshot.monthly_spent;
            state.monthly.warned = snapshot.monthly_warned;
        }
        tracing::debug!(
            daily = %state.daily.spent,
            monthly = %state.monthly.spent,
            "Restored ledger state"
        );
    }

    fn settle(&self, reservation: &Reservation<'_>, actual: Option<Usd>) -> Usd {
        let now = (self.clock)();
        let mut events = Vec::new();
        let mut charged = Usd::ZERO;
        {
            let mut state = self.state.lock();
            state.roll(now);
            state.daily.release(&reservation.day_key, reservation.amount);
            state.monthly.release(&reservation.month_key, reservation.amount);

            if let Some(actual) = actual {
                // Never charge past a limit, whatever the backend reported.
                let headroom = state.daily.remaining().min(state.monthly.remaining());
                charged = actual.min(headroom);
                if charged < actual {
                    tracing::warn!(
                        reserved = %reservation.amount,
                        actual = %actual,
                        charged = %charged,
                        uncharged = %(actual - charged),
                        "Actual cost exceeds remaining budget, charge capped at limit"
                    );
                }
                state.daily.spent += charged;
                state.monthly.spent += charged;
                let ratio = self.warning_ratio;
                events.extend(state.daily.check_warning(ratio, now));
                events.extend(state.monthly.check_warning(ratio, now));
            }
        }

        for event in events {
            let BudgetEvent::Warning {
                period,
                spent,
                limit,
                projected_exhaustion,
            } = &event;
            tracing::warn!(
                period = %period,
                spent = %spent,
                limit = %limit,
                projected_exhaustion_secs = projected_exhaustion.map(|d| d.as_secs()),
                "Budget warning threshold crossed"
            );
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
        charged
    }
}

/// Outstanding budget hold.
///
/// Consumed by [`commit`](Self::commit) or [`release`](Self::release);
/// released automatically when dropped unsettled.
#[derive(Debug)]
#[must_use = "a reservation is released as soon as it is dropped"]
pub struct Reservation<'a> {
    ledger: &'a CostLedger,
    amount: Usd,
    day_key: String,
    month_key: String,
    settled: bool,
}

impl Reservation<'_> {
    /// Amount held.
    #[must_use]
    pub fn amount(&self) -> Usd {
        self.amount
    }

    /// Replace the hold with a charge of `actual` and return the amount
    /// charged.
    ///
    /// The charge is capped at what both budgets can still absorb, so an
    /// actual cost above the projection never carries spend past a limit.
    pub fn commit(mut self, actual: Usd) -> Usd {
        self.settled = true;
        self.ledger.settle(&self, Some(actual))
    }

    /// Drop the hold without charging.
    pub fn release(mut self) {
        self.settled = true;
        self.ledger.settle(&self, None);
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.ledger.settle(self, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_clock(start: DateTime<Utc>) -> (Clock, Arc<Mutex<DateTime<Utc>>>) {
        let now = Arc::new(Mutex::new(start));
        let handle = Arc::clone(&now);
        (Arc::new(move || *handle.lock()), now)
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).single().expect("valid date")
    }

    #[test]
    fn test_default_limits() {
        let ledger = CostLedger::new(&BudgetConfig::default());
        let usage = ledger.usage();
        assert_eq!(usage.daily_limit, Usd::from_mills(10_000));
        assert_eq!(usage.monthly_limit, Usd::from_mills(200_000));
        assert_eq!(usage.daily_spent, Usd::ZERO);
    }

    #[test]
    fn test_spend_is_exact_sum_of_charges() {
        let ledger = CostLedger::new(&BudgetConfig::default());
        let mut expected = Usd::ZERO;
        for i in 0..500 {
            let cost = Usd::from_mills(i % 7 + 1);
            ledger.reserve(cost).expect("within budget").commit(cost);
            expected += cost;
        }
        assert_eq!(ledger.usage().daily_spent, expected);
        assert_eq!(ledger.usage().monthly_spent, expected);
        assert_eq!(ledger.usage().daily_reserved, Usd::ZERO);
    }

    #[test]
    fn test_rejects_without_partial_charge() {
        let ledger = CostLedger::new(&BudgetConfig::default());
        let first = Usd::from_dollars(9.95);
        ledger.reserve(first).expect("within budget").commit(first);

        let denial = ledger
            .reserve(Usd::from_dollars(0.10))
            .expect_err("over daily budget");
        assert_eq!(denial.period, BudgetPeriod::Daily);
        assert_eq!(denial.remaining, Usd::from_dollars(0.05));
        assert_eq!(ledger.usage().daily_spent, Usd::from_dollars(9.95));
        assert_eq!(ledger.usage().daily_reserved, Usd::ZERO);

        // Exactly the remainder still fits.
        let rest = ledger.reserve(Usd::from_dollars(0.05)).expect("exact fit");
        rest.release();
    }

    #[test]
    fn test_reservations_count_against_remaining() {
        let ledger = CostLedger::new(&BudgetConfig::default());
        let held = ledger.reserve(Usd::from_dollars(6.0)).expect("first hold");
        assert!(ledger.reserve(Usd::from_dollars(5.0)).is_err());
        held.release();
        assert!(ledger.reserve(Usd::from_dollars(5.0)).is_ok());
    }

    #[test]
    fn test_drop_releases_hold() {
        let ledger = CostLedger::new(&BudgetConfig::default());
        {
            let _held = ledger.reserve(Usd::from_dollars(3.0)).expect("hold");
            assert_eq!(ledger.usage().daily_reserved, Usd::from_dollars(3.0));
        }
        assert_eq!(ledger.usage().daily_reserved, Usd::ZERO);
        assert_eq!(ledger.usage().daily_spent, Usd::ZERO);
    }

    #[test]
    fn test_commit_charges_actual_not_projected() {
        let ledger = CostLedger::new(&BudgetConfig::default());
        let held = ledger.reserve(Usd::from_mills(500)).expect("hold");
        held.commit(Usd::from_mills(120));
        let usage = ledger.usage();
        assert_eq!(usage.daily_spent, Usd::from_mills(120));
        assert_eq!(usage.daily_reserved, Usd::ZERO);
    }

    #[test]
    fn test_commit_above_projection_is_capped_at_limit() {
        let ledger = CostLedger::new(&BudgetConfig::default());
        let seed = Usd::from_mills(9_950);
        ledger.reserve(seed).expect("seed").commit(seed);

        let held = ledger.reserve(Usd::from_mills(50)).expect("exact remainder");
        let charged = held.commit(Usd::from_mills(100));
        assert_eq!(charged, Usd::from_mills(50));

        let usage = ledger.usage();
        assert_eq!(usage.daily_spent, usage.daily_limit);
        assert_eq!(usage.daily_reserved, Usd::ZERO);
    }

    #[test]
    fn test_cap_leaves_room_for_other_holds() {
        let ledger = CostLedger::new(&BudgetConfig::default());
        let other = ledger.reserve(Usd::from_dollars(4.0)).expect("other hold");
        let held = ledger.reserve(Usd::from_dollars(5.0)).expect("hold");

        // Worth $7, but only $6 is not spoken for.
        assert_eq!(held.commit(Usd::from_dollars(7.0)), Usd::from_dollars(6.0));
        assert_eq!(other.commit(Usd::from_dollars(4.0)), Usd::from_dollars(4.0));
        assert_eq!(ledger.usage().daily_spent, Usd::from_dollars(10.0));
    }

    #[test]
    fn test_concurrent_reserve_and_commit_stay_within_limit() {
        let ledger = Arc::new(CostLedger::new(&BudgetConfig::default()));
        let admitted = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                let admitted = Arc::clone(&admitted);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        if let Ok(held) = ledger.reserve(Usd::from_mills(30)) {
                            admitted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                            // Backends report more than was projected.
                            let _ = held.commit(Usd::from_mills(45));
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker thread");
        }

        let usage = ledger.usage();
        assert!(usage.daily_spent <= usage.daily_limit);
        assert_eq!(usage.daily_reserved, Usd::ZERO);
        // Admission only stopped once less than one hold was left.
        assert!(usage.daily_spent > Usd::from_mills(9_970));
        assert!(admitted.load(std::sync::atomic::Ordering::SeqCst) >= 10_000 / 45);
    }

    #[test]
    fn test_daily_rollover() {
        let (clock, now) = fixed_clock(noon());
        let ledger = CostLedger::with_clock(&BudgetConfig::default(), clock);
        let cost = Usd::from_dollars(9.0);
        ledger.reserve(cost).expect("hold").commit(cost);
        assert!(ledger.reserve(Usd::from_dollars(2.0)).is_err());

        *now.lock() = noon() + chrono::Duration::days(1);
        let usage = ledger.usage();
        assert_eq!(usage.daily_spent, Usd::ZERO);
        assert_eq!(usage.monthly_spent, Usd::from_dollars(9.0));
        assert!(ledger.reserve(Usd::from_dollars(2.0)).is_ok());
    }

    #[test]
    fn test_stale_reservation_does_not_touch_new_period() {
        let (clock, now) = fixed_clock(noon());
        let ledger = CostLedger::with_clock(&BudgetConfig::default(), clock);
        let held = ledger.reserve(Usd::from_dollars(1.0)).expect("hold");

        *now.lock() = noon() + chrono::Duration::days(1);
        let fresh = ledger.reserve(Usd::from_dollars(2.0)).expect("new period hold");
        held.release();
        assert_eq!(ledger.usage().daily_reserved, Usd::from_dollars(2.0));
        fresh.release();
    }

    #[test]
    fn test_warning_fires_once() {
        let (clock, _now) = fixed_clock(noon());
        let ledger = CostLedger::with_clock(&BudgetConfig::default(), clock);
        let mut events = ledger.subscribe();

        let cost = Usd::from_dollars(8.0);
        ledger.reserve(cost).expect("hold").commit(cost);
        let event = events.try_recv().expect("warning event");
        match event {
            BudgetEvent::Warning {
                period,
                spent,
                projected_exhaustion,
                ..
            } => {
                assert_eq!(period, BudgetPeriod::Daily);
                assert_eq!(spent, Usd::from_dollars(8.0));
                // $8 in 12h leaves $2, i.e. 3 more hours at that rate.
                assert_eq!(projected_exhaustion, Some(Duration::from_secs(3 * 3600)));
            }
        }

        let more = Usd::from_dollars(0.5);
        ledger.reserve(more).expect("hold").commit(more);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_snapshot_restore() {
        let (clock, now) = fixed_clock(noon());
        let ledger = CostLedger::with_clock(&BudgetConfig::default(), Arc::clone(&clock));
        let cost = Usd::from_mills(4_321);
        ledger.reserve(cost).expect("hold").commit(cost);
        let snapshot = ledger.snapshot();
        assert_eq!(snapshot.day_key, "2026-03-14");
        assert_eq!(snapshot.month_key, "2026-03");

        let restored = CostLedger::with_clock(&BudgetConfig::default(), Arc::clone(&clock));
        restored.restore(&snapshot);
        assert_eq!(restored.usage().daily_spent, cost);

        *now.lock() = noon() + chrono::Duration::days(1);
        let next_day = CostLedger::with_clock(&BudgetConfig::default(), clock);
        next_day.restore(&snapshot);
        assert_eq!(next_day.usage().daily_spent, Usd::ZERO);
        assert_eq!(next_day.usage().monthly_spent, cost);
    }
}
