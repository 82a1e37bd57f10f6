//! Reminder planning — when the next reminder for an evaluation should fire,
//! and which reminder policy (per-evaluation or consolidated) is in force.

use chrono::{DateTime, Duration, Utc};
use evalflow_core::settings::{self, SettingsProvider};
use evalflow_core::types::{Evaluation, ReminderSchedule};

/// Minimum lead time for a planned reminder, so processing lag cannot make it fire instantly.
pub fn min_lead() -> Duration {
    Duration::minutes(3)
}

/// Cadence of the test-only reminder schedule.
pub fn fast_test_interval() -> Duration {
    Duration::minutes(5)
}

/// Compute the next reminder instant for `eval`, or `None` when no reminder should be planned.
pub fn next_reminder_at(eval: &Evaluation, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match eval.reminder_schedule() {
        ReminderSchedule::Disabled => None,
        ReminderSchedule::EveryDays(days) => {
            let interval = Duration::days(i64::from(days));
            if eval.safe_due_date(now) - now <= interval {
                // not enough runway left for another reminder
                return None;
            }
            let start = eval.start_date?;
            let earliest = now + min_lead();
            let mut candidate = start + interval;
            if candidate < earliest {
                let gap = (earliest - candidate).num_milliseconds();
                let step = interval.num_milliseconds();
                let steps = (gap + step - 1) / step;
                candidate += Duration::milliseconds(steps * step);
            }
            Some(candidate)
        }
        ReminderSchedule::DayBeforeDue => {
            let at = eval.due_date? - Duration::hours(24);
            if at > now { Some(at) } else { None }
        }
        ReminderSchedule::FastTest => Some(now + fast_test_interval()),
    }
}

// ─── Reminder policies ──────────────────────────────────────

/// Mutually exclusive notification policies, chosen once per coordinator call.
pub trait ReminderPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the per-evaluation "available" notification goes out when an evaluation opens.
    fn sends_available(&self, settings: &dyn SettingsProvider) -> bool;

    /// Whether per-evaluation reminder jobs are planned.
    fn plans_reminders(&self) -> bool;
}

/// Every evaluation mails its own participants.
#[derive(Debug, Clone, Copy)]
pub struct PerEvaluationPolicy;

impl ReminderPolicy for PerEvaluationPolicy {
    fn name(&self) -> &'static str {
        "per-evaluation"
    }

    fn sends_available(&self, _settings: &dyn SettingsProvider) -> bool {
        true
    }

    fn plans_reminders(&self) -> bool {
        true
    }
}

/// The batch runner sends digests; per-evaluation mail is suppressed.
#[derive(Debug, Clone, Copy)]
pub struct ConsolidatedPolicy;

impl ReminderPolicy for ConsolidatedPolicy {
    fn name(&self) -> &'static str {
        "consolidated"
    }

    fn sends_available(&self, settings: &dyn SettingsProvider) -> bool {
        settings.get_bool(settings::CONSOLIDATED_FORCE_AVAILABLE)
    }

    fn plans_reminders(&self) -> bool {
        false
    }
}

/// Pick the policy the current settings call for.
pub fn select_policy(settings: &dyn SettingsProvider) -> &'static dyn ReminderPolicy {
    if settings.get_bool(settings::CONSOLIDATED_ENABLED) {
        &ConsolidatedPolicy
    } else {
        &PerEvaluationPolicy
    }
}
