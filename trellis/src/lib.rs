//! # Trellis
//!
//! Core of the trellis gateway: a multi-provider LLM chat gateway with
//! agentic tool execution. The HTTP surface lives in the `serve` crate;
//! this crate owns everything between a parsed request and the upstream
//! providers.
//!
//! ## Main modules
//!
//! - [`message`]: canonical conversation model ([`ChatMessage`],
//!   [`ContentBlock`], [`Role`]) shared by the pipeline and adapters.
//! - [`provider`]: the [`ProviderAdapter`] contract, the three wire
//!   adapters (Anthropic Messages, OpenAI Responses, Ollama chat), the
//!   bounded tool-use loop ([`drive_chat`]), and [`EventSink`].
//! - [`tools`]: [`Tool`] trait, per-request [`ToolRegistry`], the
//!   [`ToolExecutor`] (status events, timing, recording), and the builtin
//!   tools (web, research, image, memory, recall, sandbox).
//! - [`sandbox`]: per-conversation Docker containers ([`ContainerManager`])
//!   with idle reaping, orphan recovery, and streamed exec.
//! - [`recall`]: multi-tenant document indexes ([`RecallService`]) with
//!   SHA-256 content dedup over an upstream vector-store API.
//! - [`store`]: the embedded relational store ([`Store`]) for metrics,
//!   messages, tool calls, settings, memories, summaries, recall rows.
//! - [`pipeline`]: the request pipeline ([`ChatPipeline`]): image
//!   normalization, length guard, system-prompt assembly, compaction
//!   ([`Compactor`]), hard trim, dispatch.
//! - [`cost`]: the settings-backed cost engine ([`CostEngine`]).
//! - [`config`]: env knobs ([`GatewayConfig`]) and per-request
//!   configuration ([`ChatRequest`], [`ChatConfig`], [`InstanceAllowList`]).

pub mod config;
pub mod cost;
pub mod error;
pub mod estimate;
pub mod message;
pub mod pipeline;
pub mod provider;
pub mod recall;
pub mod sandbox;
pub mod store;
pub mod tools;

pub use config::{ChatConfig, ChatRequest, GatewayConfig, InstanceAllowList};
pub use cost::{CostEngine, PricingTable, ProviderFamily};
pub use error::{GatewayError, StoreError, ToolError};
pub use message::{ChatMessage, ContentBlock, ImageSource, Role};
pub use pipeline::{ChatPipeline, Compactor, ImageNormalizer, ProxyGuard};
pub use provider::{
    drive_chat, AnthropicAdapter, ChatOutcome, EventSink, MockAdapter, OllamaAdapter,
    OpenAiAdapter, ProviderAdapter, ScriptedTurn, StopReason, TokenUsage,
    DEFAULT_MAX_ITERATIONS,
};
pub use recall::{RecallService, UploadResult, VectorStoreClient};
pub use sandbox::{ContainerManager, ExecOutcome};
pub use store::{
    MemoryRow, NewRequest, RecallFileRow, RecallInstanceRow, RequestRecord, RequestTotals, Store,
    SummaryRow,
};
pub use tools::{Tool, ToolExecutor, ToolOutcome, ToolRegistry, ToolSpec};
