//! Sandbox lifecycle: state machine, instance tracking and history.

mod history;
mod manager;

pub use history::{CommandOutcome, CommandRecord, HistoryEvent, HistoryRecord};
pub use manager::{LifecycleManager, ManagerSettings, SweepReport};
