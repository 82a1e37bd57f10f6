//! Derives an evaluation's lifecycle state from its dates.
//!
//! Pure functions of `(evaluation, now)`. The persisted state is consulted only
//! for the two states dates cannot express: `PARTIAL` and `DELETED`.

use chrono::{DateTime, Utc};
use evalflow_core::error::{EvalFlowError, Result};
use evalflow_core::types::{EvalState, Evaluation};

/// Resolve the current state.
///
/// With `allow_special`, an unsaved or partial evaluation stays `PARTIAL` and a
/// deleted one stays `DELETED`. A missing start date yields `UNKNOWN`.
pub fn resolve(eval: &Evaluation, allow_special: bool, now: DateTime<Utc>) -> EvalState {
    if allow_special {
        if eval.id.is_none() || eval.state == EvalState::Partial {
            return EvalState::Partial;
        }
        if eval.state == EvalState::Deleted {
            return EvalState::Deleted;
        }
    }

    let Some(start) = eval.start_date else {
        tracing::warn!("⚠️ Evaluation {:?} has no start date, state unknown", eval.id);
        return EvalState::Unknown;
    };

    if now < start {
        return EvalState::InQueue;
    }
    match eval.due_date {
        None => return EvalState::Active,
        Some(due) if now < due => return EvalState::Active,
        Some(_) => {}
    }
    if let Some(stop) = eval.stop_date {
        if now < stop {
            return EvalState::GracePeriod;
        }
    }
    match eval.view_date {
        Some(view) if now < view => EvalState::Closed,
        _ => EvalState::Viewable,
    }
}

/// Resolve (special states allowed) and write the result back into `eval`.
/// Returns the state and whether the stored copy was stale. `UNKNOWN` is never written.
pub fn repair(eval: &mut Evaluation, now: DateTime<Utc>) -> (EvalState, bool) {
    let state = resolve(eval, true, now);
    if state == EvalState::Unknown || state == eval.state {
        return (state, false);
    }
    tracing::debug!(
        "🔧 Evaluation {:?} state {} → {}",
        eval.id,
        eval.state,
        state
    );
    eval.state = state;
    (state, true)
}

fn index(state: EvalState) -> Result<usize> {
    state
        .order_index()
        .ok_or(EvalFlowError::IncomparableState(state))
}

/// `a` comes after `b` in the lifecycle (or equals it when `inclusive`).
pub fn is_after(a: EvalState, b: EvalState, inclusive: bool) -> Result<bool> {
    let (a, b) = (index(a)?, index(b)?);
    Ok(if inclusive { a >= b } else { a > b })
}

/// `a` comes before `b` in the lifecycle (or equals it when `inclusive`).
pub fn is_before(a: EvalState, b: EvalState, inclusive: bool) -> Result<bool> {
    let (a, b) = (index(a)?, index(b)?);
    Ok(if inclusive { a <= b } else { a < b })
}
