//! # genesis-core
//!
//! Isolated op execution for Genesis agents: a planner hands over a typed
//! [`OpSpec`], the executor runs it through a stateless reasoning loop with
//! only the tools the `OpSpec` names, and returns a typed [`OpResult`].
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         OpExecutor                           │
//! │  ┌─────────────┐  ┌─────────────┐  ┌──────────────────────┐  │
//! │  │  Reasoning  │  │  Isolated   │  │   ProviderRouter     │  │
//! │  │    Loop     │──│  Registry   │──│  (failover chain)    │  │
//! │  └─────────────┘  └─────────────┘  └──────────────────────┘  │
//! │         │                                                    │
//! │         └── transcript ──► ResultParser ──► OpResult         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! `ConversationManager` and `VectorMemory` are the persistent stores the
//! surrounding agent uses between ops.

pub mod contract;
pub mod conversation;
pub mod error;
pub mod executor;
pub mod memory;
pub mod message;
pub mod protocol;
pub mod provider;
pub mod reasoning;
pub mod router;
pub mod tool;

pub use contract::{OpResult, OpSpec, OpSpecBuilder, ToolOutput};
pub use conversation::{Conversation, ConversationManager, ConversationSummary};
pub use error::{AgentError, Result};
pub use executor::OpExecutor;
pub use memory::{Embedder, MemoryHit, ProviderEmbedder, VectorMemory};
pub use message::{Message, Role};
pub use protocol::{ResultParser, SentinelParser};
pub use provider::{Completion, GenerationOptions, LlmProvider, StubProvider};
pub use reasoning::{ReactLoop, ReasoningLoop, StepEvent};
pub use router::ProviderRouter;
pub use tool::{Tool, ToolCall, ToolRegistry};
