use clap::ValueEnum;

use tsuki_ops::{AutostartStrategy, UnitAction, UnitScope};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliUnitScope {
    System,
    User,
}

impl From<CliUnitScope> for UnitScope {
    fn from(value: CliUnitScope) -> Self {
        match value {
            CliUnitScope::System => UnitScope::System,
            CliUnitScope::User => UnitScope::User,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliAutostartStrategy {
    InitHook,
    ServiceHook,
}

impl From<CliAutostartStrategy> for AutostartStrategy {
    fn from(value: CliAutostartStrategy) -> Self {
        match value {
            CliAutostartStrategy::InitHook => AutostartStrategy::InitHook,
            CliAutostartStrategy::ServiceHook => AutostartStrategy::ServiceHook,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliAppControl {
    Start,
    Stop,
    Restart,
    Status,
}

impl From<CliAppControl> for UnitAction {
    fn from(value: CliAppControl) -> Self {
        match value {
            CliAppControl::Start => UnitAction::Start,
            CliAppControl::Stop => UnitAction::Stop,
            CliAppControl::Restart => UnitAction::Restart,
            CliAppControl::Status => UnitAction::Status,
        }
    }
}
