use crate::classify::LifecycleState;
use crate::CoreError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpFlags {
    pub recreate: bool,
    pub rebuild: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpAction {
    AlreadyRunning,
    /// Start the existing containers; identity is preserved.
    Start,
    Create { force_recreate: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAction {
    Start,
    NoOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopAction {
    Stop,
    NoOp,
}

pub fn plan_up(state: LifecycleState, flags: UpFlags) -> UpAction {
    let forced = flags.recreate || flags.rebuild;
    match state {
        LifecycleState::Running if !forced => UpAction::AlreadyRunning,
        LifecycleState::Created if !forced => UpAction::Start,
        LifecycleState::Stale => UpAction::Create {
            force_recreate: true,
        },
        _ => UpAction::Create {
            force_recreate: flags.recreate,
        },
    }
}

/// A stale environment still starts; `up` is what reconciles it.
pub fn plan_start(state: LifecycleState) -> Result<StartAction, CoreError> {
    match state {
        LifecycleState::Absent => Err(CoreError::NotCreated),
        LifecycleState::Running => Ok(StartAction::NoOp),
        LifecycleState::Created | LifecycleState::Stale => Ok(StartAction::Start),
    }
}

pub fn plan_stop(state: LifecycleState) -> StopAction {
    match state {
        LifecycleState::Absent => StopAction::NoOp,
        _ => StopAction::Stop,
    }
}
