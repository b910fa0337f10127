use tern_types::{DisplayStatus, SessionStatus, TaskPlan};

use crate::model::StatusSnapshot;

/// Collapses the session hierarchy into one user-facing status.
///
/// Priority, first match wins:
/// 1. manager running or errored: the manager speaks for the hierarchy
/// 2. no planner yet: the manager
/// 3. planner running or paused: the planner (human input beats children)
/// 4. planner errored: the planner
/// 5. no programmer yet: the planner
/// 6. otherwise: the programmer
pub fn resolve_status(
    manager: StatusSnapshot,
    planner: Option<StatusSnapshot>,
    programmer: Option<StatusSnapshot>,
) -> StatusSnapshot {
    if matches!(
        manager.status,
        DisplayStatus::Running | DisplayStatus::Error
    ) {
        return manager;
    }
    let Some(planner) = planner else {
        return manager;
    };
    if matches!(
        planner.status,
        DisplayStatus::Running | DisplayStatus::Paused | DisplayStatus::Error
    ) {
        return planner;
    }
    let Some(programmer) = programmer else {
        return planner;
    };
    programmer
}

/// Programmer-specific display mapping: a successfully finished thread
/// whose ACTIVE plan items are all done reads as `Completed`; without a
/// finished plan it stays `Idle`.
pub fn programmer_display_status(
    thread_status: SessionStatus,
    run_succeeded: bool,
    task_plan: Option<&TaskPlan>,
) -> DisplayStatus {
    let mapped = DisplayStatus::from_session_status(thread_status);
    if mapped == DisplayStatus::Idle
        && run_succeeded
        && task_plan.map(|p| p.active_items_completed()).unwrap_or(false)
    {
        return DisplayStatus::Completed;
    }
    mapped
}
