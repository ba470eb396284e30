//! Budget Ledger
//!
//! Append-only usage accounting over the durable store. Two independent caps
//! are enforced from here: the per-execution cap carried by the agent policy,
//! and the account-wide daily/monthly caps from the user's budget settings.
//! The scheduler composes both before every external call.

use chrono::{Datelike, Days, Months, NaiveTime, TimeZone, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;
use vigil_core::{
    AgentExecution, AgentPolicy, BudgetScope, BudgetUsageRecord, ExecutionError, ExecutionId,
    StepNumber, Timestamp, Usd, UserId, VigilResult,
};
use vigil_storage::{ExecutionStore, UsageQuery};

// ============================================================================
// TYPES
// ============================================================================

/// What a usage total is aggregated over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageScope {
    /// Every record of one execution.
    Execution(ExecutionId),
    /// Records in `[since, until)`.
    Window { since: Timestamp, until: Timestamp },
    /// The UTC calendar day containing the instant.
    Day(Timestamp),
    /// The UTC calendar month containing the instant.
    Month(Timestamp),
}

/// Aggregated usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct UsageTotals {
    pub tokens: u64,
    pub cost: Usd,
    pub records: usize,
}

impl UsageTotals {
    fn add(&mut self, record: &BudgetUsageRecord) {
        self.tokens = self.tokens.saturating_add(record.tokens_used);
        self.cost = self.cost.saturating_add(record.cost);
        self.records += 1;
    }
}

/// One usage to append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUsage {
    pub user_id: UserId,
    pub execution_id: Option<ExecutionId>,
    pub step_number: Option<StepNumber>,
    pub tokens_used: u64,
    pub cost: Usd,
    pub model: String,
    pub operation: String,
}

impl NewUsage {
    pub fn new(
        user_id: UserId,
        tokens_used: u64,
        cost: Usd,
        model: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            execution_id: None,
            step_number: None,
            tokens_used,
            cost,
            model: model.into(),
            operation: operation.into(),
        }
    }

    pub fn for_step(mut self, execution_id: ExecutionId, step_number: StepNumber) -> Self {
        self.execution_id = Some(execution_id);
        self.step_number = Some(step_number);
        self
    }
}

/// A cap that would be exceeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetBreach {
    pub scope: BudgetScope,
    pub spent: String,
    pub limit: String,
}

impl BudgetBreach {
    fn usd(scope: BudgetScope, spent: Usd, limit: Usd) -> Self {
        Self {
            scope,
            spent: format!("${}", spent),
            limit: format!("${}", limit),
        }
    }

    fn tokens(scope: BudgetScope, spent: u64, limit: u64) -> Self {
        Self {
            scope,
            spent: format!("{} tokens", spent),
            limit: format!("{} tokens", limit),
        }
    }

    /// The refusal the scheduler halts with.
    pub fn into_error(self) -> ExecutionError {
        ExecutionError::BudgetExceeded {
            scope: self.scope,
            spent: self.spent,
            limit: self.limit,
        }
    }
}

impl fmt::Display for BudgetBreach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} budget exhausted: spent {} of {}",
            self.scope, self.spent, self.limit
        )
    }
}

/// Spent is at the limit, or the estimate would push it past.
fn over_limit<T: PartialOrd + Copy>(spent: T, estimate: T, limit: T, add: fn(T, T) -> T) -> bool {
    spent >= limit || add(spent, estimate) > limit
}

// ============================================================================
// WINDOWS
// ============================================================================

/// `[start of day, start of next day)` in UTC.
pub fn day_window(at: Timestamp) -> (Timestamp, Timestamp) {
    let date = at.date_naive();
    let since = Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN));
    let until = date
        .checked_add_days(Days::new(1))
        .map(|d| Utc.from_utc_datetime(&d.and_time(NaiveTime::MIN)))
        .unwrap_or(Timestamp::MAX_UTC);
    (since, until)
}

/// `[first of month, first of next month)` in UTC.
pub fn month_window(at: Timestamp) -> (Timestamp, Timestamp) {
    let date = at.date_naive();
    let first = date
        .checked_sub_days(Days::new(date.day0() as u64))
        .unwrap_or(date);
    let since = Utc.from_utc_datetime(&first.and_time(NaiveTime::MIN));
    let until = first
        .checked_add_months(Months::new(1))
        .map(|d| Utc.from_utc_datetime(&d.and_time(NaiveTime::MIN)))
        .unwrap_or(Timestamp::MAX_UTC);
    (since, until)
}

// ============================================================================
// LEDGER
// ============================================================================

#[derive(Clone)]
pub struct BudgetLedger {
    store: Arc<dyn ExecutionStore>,
}

impl BudgetLedger {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self { store }
    }

    /// Append one immutable usage record.
    pub async fn record_usage(&self, usage: NewUsage) -> VigilResult<BudgetUsageRecord> {
        let record = BudgetUsageRecord {
            record_id: Uuid::now_v7(),
            user_id: usage.user_id,
            execution_id: usage.execution_id,
            step_number: usage.step_number,
            tokens_used: usage.tokens_used,
            cost: usage.cost,
            model: usage.model,
            operation: usage.operation,
            recorded_at: Utc::now(),
        };
        self.store.usage_append(&record).await?;
        tracing::debug!(
            user_id = %record.user_id,
            execution_id = ?record.execution_id,
            step_number = ?record.step_number,
            tokens = record.tokens_used,
            cost = %record.cost,
            "usage recorded"
        );
        Ok(record)
    }

    /// Sum a user's usage over a scope.
    pub async fn total_usage(&self, user_id: UserId, scope: UsageScope) -> VigilResult<UsageTotals> {
        let query = match scope {
            UsageScope::Execution(execution_id) => UsageQuery {
                user_id: Some(user_id),
                execution_id: Some(execution_id),
                ..Default::default()
            },
            UsageScope::Window { since, until } => UsageQuery::for_user(user_id).between(since, until),
            UsageScope::Day(at) => {
                let (since, until) = day_window(at);
                UsageQuery::for_user(user_id).between(since, until)
            }
            UsageScope::Month(at) => {
                let (since, until) = month_window(at);
                UsageQuery::for_user(user_id).between(since, until)
            }
        };

        let mut totals = UsageTotals::default();
        for record in self.store.usage_query(&query).await? {
            totals.add(&record);
        }
        Ok(totals)
    }

    /// Per-execution cap from the agent policy. USD and tokens are checked
    /// independently; USD first.
    pub async fn check_execution_cap(
        &self,
        execution: &AgentExecution,
        policy: &AgentPolicy,
        estimated_cost: Usd,
        estimated_tokens: u64,
    ) -> VigilResult<Option<BudgetBreach>> {
        if policy.budget_limit_usd.is_none() && policy.budget_limit_tokens.is_none() {
            return Ok(None);
        }
        let spent = self
            .total_usage(execution.user_id, UsageScope::Execution(execution.execution_id))
            .await?;

        if let Some(limit) = policy.budget_limit_usd {
            if over_limit(spent.cost, estimated_cost, limit, Usd::saturating_add) {
                return Ok(Some(BudgetBreach::usd(BudgetScope::ExecutionUsd, spent.cost, limit)));
            }
        }
        if let Some(limit) = policy.budget_limit_tokens {
            if over_limit(spent.tokens, estimated_tokens, limit, u64::saturating_add) {
                return Ok(Some(BudgetBreach::tokens(
                    BudgetScope::ExecutionTokens,
                    spent.tokens,
                    limit,
                )));
            }
        }
        Ok(None)
    }

    /// Account-wide caps from the user's settings, evaluated at `now`. No
    /// settings means no account cap.
    pub async fn check_account_cap(
        &self,
        user_id: UserId,
        estimated_cost: Usd,
        estimated_tokens: u64,
        now: Timestamp,
    ) -> VigilResult<Option<BudgetBreach>> {
        let Some(settings) = self.store.budget_settings_get(user_id).await? else {
            return Ok(None);
        };

        let windows = [
            (
                BudgetScope::AccountDaily,
                UsageScope::Day(now),
                settings.daily_limit_usd,
                settings.daily_limit_tokens,
            ),
            (
                BudgetScope::AccountMonthly,
                UsageScope::Month(now),
                settings.monthly_limit_usd,
                settings.monthly_limit_tokens,
            ),
        ];

        for (scope, window, usd_limit, token_limit) in windows {
            if usd_limit.is_none() && token_limit.is_none() {
                continue;
            }
            let spent = self.total_usage(user_id, window).await?;
            if let Some(limit) = usd_limit {
                if over_limit(spent.cost, estimated_cost, limit, Usd::saturating_add) {
                    return Ok(Some(BudgetBreach::usd(scope, spent.cost, limit)));
                }
            }
            if let Some(limit) = token_limit {
                if over_limit(spent.tokens, estimated_tokens, limit, u64::saturating_add) {
                    return Ok(Some(BudgetBreach::tokens(scope, spent.tokens, limit)));
                }
            }
        }
        Ok(None)
    }
}

impl fmt::Debug for BudgetLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BudgetLedger").finish_non_exhaustive()
    }
}

// ============================================================================
// TESTS
// ============================================================================
