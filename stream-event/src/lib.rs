//! Wire-level chat events and SSE framing for the trellis gateway.
//!
//! - [`ChatEvent`]: the ordered event stream one chat turn produces (text
//!   deltas, tool-call markers, tool output, citations, status notices).
//! - [`EventsToSse`]: stateful conversion into OpenAI-compatible SSE lines
//!   plus named `status`/`source` events.
//!
//! The core crate emits events; the HTTP layer frames them. Keeping the enum
//! here lets both depend on one small crate without a dependency cycle.

mod event;
mod sse;

pub use event::{ChatEvent, Citation, CitationSource, StatusUpdate};
pub use sse::{
    write_named_event, write_sse_line, ChatCompletionChunk, ChunkChoice, ChunkMeta, ChunkUsage,
    Delta, EventsToSse, SSE_DONE,
};
