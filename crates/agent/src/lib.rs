//! The Clinscribe agent runtime.
//!
//! A turn follows a **Dispatch → Stream → Decide → Execute → Iterate** cycle:
//!
//! 1. **Admit** the request against the user's concurrency slots
//! 2. **Build context** (persona prompt + recent transcript + user message)
//! 3. **Stream** a completion, forwarding text deltas as they arrive
//! 4. **If tool calls**: repair arguments, execute, append results, loop back to 3
//! 5. **If text only**: persist the exchange and finish
//!
//! The loop stops at the first text-only answer or when the iteration
//! budget runs out. Exploration reuses the same driver with a read-only
//! tool set and a token budget.

pub mod admission;
pub mod driver;
pub mod exploration;
pub mod loop_runner;
pub mod orchestrator;
pub mod repair;
pub mod stream_event;
pub mod tool_buffer;

#[cfg(test)]
mod test_helpers;

pub use admission::{AdmissionController, AdmissionError, AdmissionPermit};
pub use driver::{CompletionSettings, DriveOutcome, IterationBudget, ToolDispatch, TurnDriver};
pub use exploration::{BudgetUsage, Decision, ExplorationContext, ExplorationReport, ExplorationTool, Explorer, StopReason};
pub use loop_runner::{AgentLoop, TurnOutcome};
pub use orchestrator::{Orchestrator, TurnRequest};
pub use repair::{ArgumentRepair, RepairReport, learn_from_result};
pub use stream_event::{AgentStreamEvent, EventSink};
pub use tool_buffer::{AssembledCall, ToolCallBuffer};
