//! # Clinscribe Core
//!
//! Domain types, traits, and error definitions for the Clinscribe agent
//! runtime. This crate has **no framework dependencies**: it defines the
//! domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator (completion service, tool executors, session
//! store) is a trait here. Implementations live in their respective crates,
//! and tests swap in scripted stand-ins.

pub mod completion;
pub mod corpus;
pub mod error;
pub mod event;
pub mod message;
pub mod session;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use completion::{CompletionClient, CompletionEvent, CompletionRequest, CompletionStream, ToolDefinition, Usage};
pub use corpus::CorpusSource;
pub use error::{BudgetExceeded, Error, ProviderError, ResolutionError, Result, SessionError, ToolError, TurnError};
pub use event::{DomainEvent, EventBus};
pub use message::{Conversation, ConversationId, Message, MessageToolCall, Role};
pub use session::{ResolutionCache, SessionState, SessionStore, is_resolved_identifier};
pub use tool::{PageContext, ToolCatalog, ToolContext, ToolExecutor, ToolInvocation, ToolKind, ToolResult};
