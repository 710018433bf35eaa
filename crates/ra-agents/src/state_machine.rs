use ra_core::types::AgentState;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// LifecycleEvent
// ---------------------------------------------------------------------------

/// Everything that can move an agent between states. The first group is
/// driven by operators through the orchestrator, the second by the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    ResumeAfterError,
    ResumeHil,
    ResumeCompleted,
    ResumeWithUpdatedRequest,
    ProvideFeedback,
    Cancel,

    Complete,
    RequestFeedback,
    ReviewRequired,
    ThresholdReached,
    UserPause,
    Fail,
}

impl LifecycleEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleEvent::ResumeAfterError => "resume_after_error",
            LifecycleEvent::ResumeHil => "resume_hil",
            LifecycleEvent::ResumeCompleted => "resume_completed",
            LifecycleEvent::ResumeWithUpdatedRequest => "resume_with_updated_request",
            LifecycleEvent::ProvideFeedback => "provide_feedback",
            LifecycleEvent::Cancel => "cancel",
            LifecycleEvent::Complete => "complete",
            LifecycleEvent::RequestFeedback => "request_feedback",
            LifecycleEvent::ReviewRequired => "review_required",
            LifecycleEvent::ThresholdReached => "threshold_reached",
            LifecycleEvent::UserPause => "user_pause",
            LifecycleEvent::Fail => "fail",
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    #[error("invalid transition: cannot apply {event} in state {state}")]
    InvalidTransition {
        state: AgentState,
        event: LifecycleEvent,
    },
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

/// The state `event` leads to from `state`.
///
/// - Error                                 + ResumeAfterError         -> Agent
/// - HitlUser / HitlThreshold / HitlTool   + ResumeHil                -> Agent
/// - Completed                             + ResumeCompleted          -> Agent
/// - Completed                             + ResumeWithUpdatedRequest -> Agent
/// - HitlFeedback                          + ProvideFeedback          -> Agent
/// - Agent / any hitl_*                    + Cancel                   -> Completed
/// - Agent + Complete         -> Completed
/// - Agent + RequestFeedback  -> HitlFeedback
/// - Agent + ReviewRequired   -> HitlTool
/// - Agent + ThresholdReached -> HitlThreshold
/// - Agent + UserPause        -> HitlUser
/// - Agent + Fail             -> Error
pub fn transition(state: AgentState, event: LifecycleEvent) -> Result<AgentState, StateMachineError> {
    use AgentState::*;
    use LifecycleEvent::*;

    let next = match (state, event) {
        (Error, ResumeAfterError) => Agent,
        (HitlUser | HitlThreshold | HitlTool, ResumeHil) => Agent,
        (Completed, ResumeCompleted | ResumeWithUpdatedRequest) => Agent,
        (HitlFeedback, ProvideFeedback) => Agent,
        (s, Cancel) if !s.is_terminal() => Completed,
        (Agent, Complete) => Completed,
        (Agent, RequestFeedback) => HitlFeedback,
        (Agent, ReviewRequired) => HitlTool,
        (Agent, ThresholdReached) => HitlThreshold,
        (Agent, UserPause) => HitlUser,
        (Agent, LifecycleEvent::Fail) => AgentState::Error,
        _ => return Err(StateMachineError::InvalidTransition { state, event }),
    };

    debug_assert!(state.can_transition_to(next));
    tracing::debug!(from = %state, event = %event, to = %next, "agent state transition");
    Ok(next)
}

/// Returns `true` if `event` is valid in `state`.
pub fn can_apply(state: AgentState, event: LifecycleEvent) -> bool {
    use AgentState::*;
    use LifecycleEvent::*;

    matches!(
        (state, event),
        (AgentState::Error, ResumeAfterError)
            | (HitlUser | HitlThreshold | HitlTool, ResumeHil)
            | (Completed, ResumeCompleted | ResumeWithUpdatedRequest)
            | (HitlFeedback, ProvideFeedback)
            | (Agent | HitlUser | HitlThreshold | HitlTool | HitlFeedback, Cancel)
            | (
                Agent,
                Complete | RequestFeedback | ReviewRequired | ThresholdReached | UserPause | Fail
            )
    )
}
