//! Rolling conversation compaction.
//!
//! Summaries are a keyed cache in the store (one row per conversation, with
//! a watermark counting the non-system messages already covered). The cheap
//! path splices `[cached summary] + [messages since watermark]` without any
//! LLM call; only when that still exceeds the threshold does the summarizer
//! run again. The last two non-system messages are never summarized away.

use tracing::{debug, warn};

use stream_event::{ChatEvent, StatusUpdate};

use crate::estimate::{text_tokens, transcript_tokens};
use crate::message::{ChatMessage, Role};
use crate::provider::{EventSink, ProviderAdapter, TurnRequest};
use crate::store::Store;

/// Non-system messages always kept verbatim.
pub const KEEP_RECENT: usize = 2;

const SUMMARY_OPEN: &str = "[CONVERSATION SUMMARY]";
const SUMMARY_CLOSE: &str = "[/CONVERSATION SUMMARY]";

/// Wraps a summary as the system-role block spliced into the transcript.
fn summary_message(summary: &str) -> ChatMessage {
    ChatMessage::system(format!("{SUMMARY_OPEN}\n{summary}\n{SUMMARY_CLOSE}"))
}

/// Builds the summarizer prompt from prior summary and messages.
fn summary_prompt(previous: Option<&str>, messages: &[ChatMessage]) -> String {
    let mut parts = vec![
        "Summarize the following conversation so it can replace the original messages."
            .to_string(),
        "Keep: stated facts and decisions, what the user wants, unresolved questions, \
         and anything the assistant promised to do."
            .to_string(),
        String::new(),
    ];
    if let Some(previous) = previous {
        parts.push(format!("Existing summary of earlier messages:\n{previous}\n"));
    }
    for message in messages {
        let role = match message.role {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool",
        };
        parts.push(format!("{role}: {}", message.joined_text()));
    }
    parts.join("\n")
}

/// Conversation compactor bound to the store and token budgets.
pub struct Compactor {
    store: Store,
    /// Estimated-token threshold that triggers compaction.
    threshold: u32,
    /// Output budget for the summarizer call.
    max_summary_tokens: u32,
    /// Input budget applied to the summarizer prompt itself.
    max_input_tokens: u32,
}

impl Compactor {
    pub fn new(
        store: Store,
        threshold: u32,
        max_summary_tokens: u32,
        max_input_tokens: u32,
    ) -> Self {
        Self {
            store,
            threshold,
            max_summary_tokens,
            max_input_tokens,
        }
    }

    async fn summarize(
        &self,
        summarizer: &dyn ProviderAdapter,
        model: &str,
        previous: Option<&str>,
        messages: &[ChatMessage],
    ) -> Option<String> {
        let mut prompt = summary_prompt(previous, messages);
        // The summarizer call itself obeys the overall input budget.
        let budget_chars = (self.max_input_tokens as f64 * crate::estimate::CHARS_PER_TOKEN) as usize;
        if prompt.chars().count() > budget_chars {
            prompt = prompt.chars().take(budget_chars).collect();
        }
        let request_messages = vec![ChatMessage::user(prompt)];
        let req = TurnRequest {
            model,
            messages: &request_messages,
            tools: &[],
            iteration: 0,
            chain: None,
            tail: 0,
            max_tokens: self.max_summary_tokens,
        };
        match summarizer.run_once(&req).await {
            Ok(resp) => {
                let text = resp.text();
                if text.trim().is_empty() {
                    None
                } else {
                    Some(text)
                }
            }
            Err(e) => {
                warn!(error = %e, "compaction summarizer failed; using uncompacted history");
                None
            }
        }
    }

    /// Runs compaction over the transcript. Never fails: on summarizer
    /// errors the original messages come back (possibly trimmed later).
    pub async fn run(
        &self,
        conversation_id: &str,
        messages: Vec<ChatMessage>,
        summarizer: &dyn ProviderAdapter,
        model: &str,
        sink: &EventSink,
    ) -> Vec<ChatMessage> {
        let (system, conversation): (Vec<ChatMessage>, Vec<ChatMessage>) = messages
            .iter()
            .cloned()
            .partition(|m| m.role == Role::System);

        if conversation.len() <= KEEP_RECENT {
            return messages;
        }

        let cached = match self.store.get_summary(conversation_id).await {
            Ok(cached) => cached,
            Err(e) => {
                warn!(error = %e, "summary lookup failed");
                None
            }
        };
        let estimated = transcript_tokens(&messages, 0);

        // No summary yet and under threshold: nothing to do.
        if cached.is_none() && estimated <= self.threshold {
            return messages;
        }

        // Cheap path: splice cached summary + messages past the watermark.
        if let Some(cached) = &cached {
            let watermark = (cached.watermark as usize).min(conversation.len());
            let mut spliced: Vec<ChatMessage> = system.clone();
            spliced.push(summary_message(&cached.summary));
            spliced.extend(conversation[watermark..].iter().cloned());
            if transcript_tokens(&spliced, 0) <= self.threshold {
                debug!(
                    conversation = conversation_id,
                    watermark, "compaction cheap path (cached summary)"
                );
                return spliced;
            }
        }

        // Summarize everything but the last KEEP_RECENT conversation messages.
        sink.emit(ChatEvent::Status {
            status: StatusUpdate::begin("Compacting conversation…"),
        })
        .await;

        let split = conversation.len() - KEEP_RECENT;
        let (previous_summary, to_summarize) = match &cached {
            Some(cached) => {
                let watermark = (cached.watermark as usize).min(split);
                (
                    Some(cached.summary.as_str()),
                    &conversation[watermark..split],
                )
            }
            None => (None, &conversation[..split]),
        };

        let summary = self
            .summarize(summarizer, model, previous_summary, to_summarize)
            .await;
        sink.emit(ChatEvent::Status {
            status: StatusUpdate::finish("Compacting conversation… done"),
        })
        .await;

        let Some(summary) = summary else {
            return messages;
        };

        if let Err(e) = self
            .store
            .upsert_summary(conversation_id, &summary, split as i64)
            .await
        {
            warn!(error = %e, "summary upsert failed");
        }
        debug!(
            conversation = conversation_id,
            watermark = split,
            summary_tokens = text_tokens(&summary),
            "conversation compacted"
        );

        let mut out = system;
        out.push(summary_message(&summary));
        out.extend(conversation[split..].iter().cloned());
        out
    }
}
