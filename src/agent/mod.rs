//! Agent - the autonomous perceive/decide/act loop and its collaborators

pub mod autonomous;
pub mod memory;
pub mod provider;
pub mod safety;

pub use autonomous::{AgentStatus, AutonomousAgent, Notification, TickReport, adapt_threshold};
pub use memory::{MemoryRecord, PerceivedEvent, PerceivedKind, WorkingMemory};
pub use provider::{
    Action, Decision, DecisionContext, DecisionProvider, Goal, HttpReasoningProvider, RuleBasedProvider,
    build_prompt, parse_decision,
};
pub use safety::{SafetyError, SafetyGate, SafetyLimits};
