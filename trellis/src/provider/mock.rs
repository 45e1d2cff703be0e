//! Scripted adapter for tests: returns canned turns in order, no network.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::GatewayError;
use crate::message::ContentBlock;

use super::{ProviderAdapter, StopReason, TokenUsage, TurnRequest, TurnResponse};

/// One canned model turn.
#[derive(Debug, Clone)]
pub struct ScriptedTurn {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: TokenUsage,
}

impl ScriptedTurn {
    /// A plain text answer.
    pub fn text(text: impl Into<String>, input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            content: vec![ContentBlock::Text { text: text.into() }],
            stop_reason: StopReason::EndTurn,
            usage: TokenUsage {
                input_tokens,
                output_tokens,
                ..Default::default()
            },
        }
    }

    /// A turn requesting one tool call.
    pub fn tool_call(name: &str, input: Value, input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            content: vec![ContentBlock::ToolUse {
                id: format!("call_{name}"),
                name: name.to_string(),
                input,
            }],
            stop_reason: StopReason::ToolUse,
            usage: TokenUsage {
                input_tokens,
                output_tokens,
                ..Default::default()
            },
        }
    }
}

/// Adapter returning scripted turns in order. Repeats the last turn when the
/// script runs out, so overflow tests don't need exact lengths.
pub struct MockAdapter {
    turns: Mutex<Vec<ScriptedTurn>>,
    calls: AtomicUsize,
}

impl MockAdapter {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of model invocations so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn run_once(&self, _req: &TurnRequest<'_>) -> Result<TurnResponse, GatewayError> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        let turns = self
            .turns
            .lock()
            .map_err(|_| GatewayError::provider_fatal("mock adapter poisoned"))?;
        let turn = turns
            .get(index)
            .or_else(|| turns.last())
            .cloned()
            .ok_or_else(|| GatewayError::provider_fatal("mock adapter has no scripted turns"))?;
        Ok(TurnResponse {
            content: turn.content,
            stop_reason: turn.stop_reason,
            usage: turn.usage,
            response_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: the script is consumed in order and the last turn repeats.
    #[tokio::test]
    async fn script_order_and_repeat() {
        let adapter = MockAdapter::new(vec![
            ScriptedTurn::text("one", 1, 1),
            ScriptedTurn::text("two", 1, 1),
        ]);
        let req = TurnRequest {
            model: "mock",
            messages: &[],
            tools: &[],
            iteration: 0,
            chain: None,
            tail: 0,
            max_tokens: 64,
        };
        let a = adapter.run_once(&req).await.unwrap();
        let b = adapter.run_once(&req).await.unwrap();
        let c = adapter.run_once(&req).await.unwrap();
        assert_eq!(a.text(), "one");
        assert_eq!(b.text(), "two");
        assert_eq!(c.text(), "two");
        assert_eq!(adapter.calls(), 3);
    }
}
