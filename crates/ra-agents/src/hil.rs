//! Human-in-the-loop gate.
//!
//! A pure function of the context, asked at the end of a cycle (and right
//! after the engine reports its cost). It never waits on a human; it only
//! tells the loop whether to persist-and-return instead of continuing.

use ra_core::types::{AgentContext, AgentState};

use crate::state_machine::LifecycleEvent;

#[derive(Debug, Clone, PartialEq)]
pub enum ThresholdReason {
    /// Spend in the current HIL window reached `hil_budget`.
    Budget { spent: f64, budget: f64 },
    /// Cycles in the current HIL window reached `hil_count`.
    Iterations { count: u32, ceiling: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum HilDecision {
    Continue,
    Threshold(ThresholdReason),
    UserRequested,
}

impl HilDecision {
    /// The event the loop applies for this decision, if any.
    pub fn event(&self) -> Option<LifecycleEvent> {
        match self {
            HilDecision::Continue => None,
            HilDecision::Threshold(_) => Some(LifecycleEvent::ThresholdReached),
            HilDecision::UserRequested => Some(LifecycleEvent::UserPause),
        }
    }

    pub fn target_state(&self) -> Option<AgentState> {
        match self {
            HilDecision::Continue => None,
            HilDecision::Threshold(_) => Some(AgentState::HitlThreshold),
            HilDecision::UserRequested => Some(AgentState::HitlUser),
        }
    }
}

/// Spend and iteration ceilings first, then the explicit pause flag. A zero
/// ceiling disables that check.
pub fn evaluate(ctx: &AgentContext) -> HilDecision {
    if let Some(reason) = threshold(ctx) {
        return HilDecision::Threshold(reason);
    }
    if ctx.hil_requested {
        return HilDecision::UserRequested;
    }
    HilDecision::Continue
}

/// Only the spend ceiling. Used mid-cycle, before any planned call runs.
pub fn budget_exhausted(ctx: &AgentContext) -> Option<ThresholdReason> {
    if ctx.hil_budget > 0.0 && ctx.budget_remaining <= 0.0 {
        return Some(ThresholdReason::Budget {
            spent: ctx.hil_budget - ctx.budget_remaining,
            budget: ctx.hil_budget,
        });
    }
    None
}

fn threshold(ctx: &AgentContext) -> Option<ThresholdReason> {
    if let Some(reason) = budget_exhausted(ctx) {
        return Some(reason);
    }
    if ctx.hil_count > 0 && ctx.iterations_since_hil >= ctx.hil_count {
        return Some(ThresholdReason::Iterations {
            count: ctx.iterations_since_hil,
            ceiling: ctx.hil_count,
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use ra_core::types::AgentConfig;

    fn ctx(budget: f64, count: u32) -> AgentContext {
        AgentContext::from_config(&AgentConfig::new("a", "u", "p").with_hil(budget, count))
    }

    #[test]
    fn fresh_context_continues() {
        assert_eq!(evaluate(&ctx(1.0, 3)), HilDecision::Continue);
    }

    #[test]
    fn budget_overrun_hits_threshold() {
        let mut c = ctx(1.0, 0);
        c.add_cost(1.2);
        match evaluate(&c) {
            HilDecision::Threshold(ThresholdReason::Budget { spent, budget }) => {
                assert!((spent - 1.2).abs() < 1e-9);
                assert!((budget - 1.0).abs() < 1e-9);
            }
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn exact_budget_counts_as_reached() {
        let mut c = ctx(1.0, 0);
        c.add_cost(1.0);
        assert!(budget_exhausted(&c).is_some());
    }

    #[test]
    fn iteration_ceiling() {
        let mut c = ctx(0.0, 2);
        c.iterations_since_hil = 1;
        assert_eq!(evaluate(&c), HilDecision::Continue);
        c.iterations_since_hil = 2;
        assert_eq!(
            evaluate(&c).target_state(),
            Some(AgentState::HitlThreshold)
        );
    }

    #[test]
    fn zero_ceilings_disable_gate() {
        let mut c = ctx(0.0, 0);
        c.add_cost(100.0);
        c.iterations_since_hil = 1000;
        assert_eq!(evaluate(&c), HilDecision::Continue);
    }

    #[test]
    fn user_request_after_thresholds() {
        let mut c = ctx(1.0, 0);
        c.hil_requested = true;
        assert_eq!(evaluate(&c), HilDecision::UserRequested);
        c.add_cost(5.0);
        assert_eq!(evaluate(&c).event(), Some(LifecycleEvent::ThresholdReached));
    }
}
