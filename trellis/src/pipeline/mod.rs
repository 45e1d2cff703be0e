//! The request pipeline: everything between an authenticated chat request
//! and the provider dispatch.
//!
//! Order per request: image normalization (with proxy lifetime guard),
//! user-message length guard, system-prompt assembly, compaction, hard trim,
//! tool registry construction, then the tool-use loop. The request row is
//! created up front and finalized once with the summed usage and cost.

pub mod compaction;
pub mod images;

pub use compaction::Compactor;
pub use images::{ImageNormalizer, ImageSidecar, ProxyGuard};

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::config::{ChatConfig, ChatRequest, GatewayConfig};
use crate::cost::CostEngine;
use crate::error::GatewayError;
use crate::estimate::{text_tokens, transcript_tokens};
use crate::message::{ChatMessage, Role};
use crate::provider::{
    drive_chat, AnthropicAdapter, ChatOutcome, EventSink, MockAdapter, OllamaAdapter,
    OpenAiAdapter, ProviderAdapter, ScriptedTurn,
};
use crate::recall::RecallService;
use crate::sandbox::{sanitize, volume_path, ContainerManager};
use crate::store::{NewRequest, Store};
use crate::tools::image::{ImageBackend, ImageMode, ImageTool};
use crate::tools::memory::register_memory_tools;
use crate::tools::recall::FileRecallSearchTool;
use crate::tools::research::DeepResearchTool;
use crate::tools::sandbox::register_sandbox_tools;
use crate::tools::search_api::SearchApi;
use crate::tools::web::{WebScrapeTool, WebSearchTool};
use crate::tools::{ToolExecutor, ToolRegistry};

/// Notice substituted for user messages over the length guard.
const TRUNCATION_NOTICE: &str =
    "[This message was removed because it exceeded the maximum message length.]";

/// Replaces any user message whose text exceeds the token guard.
///
/// Applied on every request; history arrives fully re-sent from the caller.
pub fn guard_user_messages(messages: &mut [ChatMessage], max_tokens: u32) {
    for message in messages.iter_mut() {
        if message.role == Role::User && text_tokens(&message.joined_text()) > max_tokens {
            *message = ChatMessage::user(TRUNCATION_NOTICE);
        }
    }
}

/// Trims oldest non-system, non-last messages until the estimate fits.
///
/// System messages and the last message are inviolable.
pub fn trim_to_budget(
    mut messages: Vec<ChatMessage>,
    max_tokens: u32,
    tool_count: usize,
) -> Vec<ChatMessage> {
    while transcript_tokens(&messages, tool_count) > max_tokens {
        let last_index = messages.len().saturating_sub(1);
        let Some(victim) = messages
            .iter()
            .enumerate()
            .position(|(i, m)| m.role != Role::System && i != last_index)
        else {
            break;
        };
        messages.remove(victim);
    }
    messages
}

/// Assembles the system prompt: custom prefix, memories block, sandbox note.
pub fn assemble_system_prompt(
    messages: &mut Vec<ChatMessage>,
    custom_prompt: Option<&str>,
    memories: &[String],
    sandbox_note: Option<&str>,
) {
    let mut addition = String::new();
    if let Some(custom) = custom_prompt {
        if !custom.trim().is_empty() {
            addition.push_str(custom.trim());
        }
    }

    let mut suffix = String::new();
    if !memories.is_empty() {
        suffix.push_str("\n\n[USER_MEMORIES]\n");
        for memory in memories {
            suffix.push_str(&format!("- {memory}\n"));
        }
        suffix.push_str("[/USER_MEMORIES]");
    }
    if let Some(note) = sandbox_note {
        suffix.push_str("\n\n");
        suffix.push_str(note);
    }

    match messages.iter_mut().find(|m| m.role == Role::System) {
        Some(system) => {
            let existing = system.joined_text();
            let mut combined = String::new();
            if !addition.is_empty() {
                combined.push_str(&addition);
                combined.push_str("\n\n");
            }
            combined.push_str(&existing);
            combined.push_str(&suffix);
            *system = ChatMessage::system(combined);
        }
        None => {
            if !addition.is_empty() || !suffix.is_empty() {
                let text = format!("{addition}{suffix}");
                messages.insert(0, ChatMessage::system(text.trim().to_string()));
            }
        }
    }
}

/// Process-wide pipeline state shared across requests.
pub struct ChatPipeline {
    pub config: GatewayConfig,
    pub store: Store,
    pub cost: Arc<CostEngine>,
    pub recall: Arc<RecallService>,
    /// Absent when no container runtime is reachable; sandbox tools are then
    /// simply not registered.
    pub sandbox: Option<Arc<ContainerManager>>,
}

impl ChatPipeline {
    pub fn new(
        config: GatewayConfig,
        store: Store,
        sandbox: Option<Arc<ContainerManager>>,
    ) -> Self {
        let cost = Arc::new(CostEngine::new(Arc::new(store.clone())));
        let recall = Arc::new(RecallService::new(
            store.clone(),
            config.data_root.join("file-recall"),
        ));
        Self {
            config,
            store,
            cost,
            recall,
            sandbox,
        }
    }

    fn adapter_for(&self, provider: &str, cfg: &ChatConfig) -> Result<Box<dyn ProviderAdapter>, GatewayError> {
        match provider {
            "anthropic" => {
                let key = cfg.anthropic_api_key.clone().ok_or_else(|| {
                    GatewayError::Validation("anthropic_api_key is required".to_string())
                })?;
                Ok(Box::new(AnthropicAdapter::new(key)))
            }
            "openai" => {
                let key = cfg.openai_api_key.clone().ok_or_else(|| {
                    GatewayError::Validation("openai_api_key is required".to_string())
                })?;
                Ok(Box::new(OpenAiAdapter::new(key)))
            }
            "ollama" => Ok(Box::new(OllamaAdapter::new(cfg.ollama_base_url.clone()))),
            "mock" => Ok(Box::new(MockAdapter::new(vec![ScriptedTurn::text(
                "mock reply",
                16,
                4,
            )]))),
            other => Err(GatewayError::Validation(format!(
                "unknown provider: {other}"
            ))),
        }
    }

    /// Public URL prefix of a conversation volume.
    fn volume_url(&self, user_id: &str, conversation_id: &str) -> String {
        format!(
            "{}/{}/{}/volume",
            self.config.public_base_url(),
            sanitize(user_id),
            sanitize(conversation_id)
        )
    }

    fn build_registry(
        &self,
        cfg: &ChatConfig,
        user_id: &str,
        conversation_id: &str,
    ) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        if !cfg.use_tools {
            return registry;
        }
        let volume = volume_path(&self.config.data_root, user_id, conversation_id);
        let volume_url = self.volume_url(user_id, conversation_id);

        if let Some(key) = cfg.search_api_key.as_deref().filter(|k| !k.is_empty()) {
            let api = Arc::new(SearchApi::new(key, cfg.search_api_url.clone()));
            if cfg.tool_enabled("web_search") {
                registry.register(Arc::new(WebSearchTool::new(api.clone())));
            }
            if cfg.tool_enabled("web_scrape") {
                registry.register(Arc::new(WebScrapeTool::new(api.clone())));
            }
            if cfg.tool_enabled("deep_research") {
                registry.register(Arc::new(DeepResearchTool::new(
                    api,
                    volume.clone(),
                    volume_url.clone(),
                    self.config.research_pdf_command.clone(),
                )));
            }
        }

        if let Some(url) = cfg.comfyui_url.as_deref().filter(|u| !u.is_empty()) {
            let backend = Arc::new(ImageBackend::new(url));
            for (toggle, mode) in [
                ("image_generation", ImageMode::Generate),
                ("image_edit", ImageMode::Edit),
                ("image_blend", ImageMode::Blend),
            ] {
                if cfg.tool_enabled(toggle) {
                    registry.register(Arc::new(ImageTool::new(
                        backend.clone(),
                        mode,
                        volume.clone(),
                        volume_url.clone(),
                    )));
                }
            }
        }

        if cfg.tool_enabled("memory") && !user_id.is_empty() {
            register_memory_tools(
                &mut registry,
                &self.store,
                user_id,
                self.config.memory_max_chars,
            );
        }

        if cfg.tool_enabled("sandbox_execute") {
            if let Some(manager) = &self.sandbox {
                register_sandbox_tools(
                    &mut registry,
                    manager,
                    conversation_id,
                    user_id,
                    &volume,
                );
            }
        }

        if cfg.tool_enabled("file_recall") {
            if let Some(instance) = cfg
                .file_recall_instance_id
                .as_deref()
                .filter(|i| !i.is_empty())
            {
                registry.register(Arc::new(FileRecallSearchTool::new(
                    self.recall.clone(),
                    instance,
                )));
            }
        }

        registry
    }

    /// Runs one chat request end to end and returns the final outcome.
    pub async fn process(
        &self,
        request: &ChatRequest,
        sink: &EventSink,
    ) -> Result<ChatOutcome, GatewayError> {
        let adapter = self.adapter_for(&request.config.llm_provider, &request.config)?;
        self.process_with_adapter(request, adapter.as_ref(), sink).await
    }

    /// Same as [`process`](Self::process) with an injected adapter (tests,
    /// compaction reuse).
    pub async fn process_with_adapter(
        &self,
        request: &ChatRequest,
        adapter: &dyn ProviderAdapter,
        sink: &EventSink,
    ) -> Result<ChatOutcome, GatewayError> {
        let started = Instant::now();
        let cfg = &request.config;
        let user_id = request.user_email.clone().unwrap_or_default();
        let conversation_id = &request.conversation_id;

        let mut messages = request.canonical_messages();

        // Extracted attachment text joins the last user message.
        for file in &request.files {
            if let Some(content) = file.content() {
                if let Some(last) = messages.iter_mut().rev().find(|m| m.role == Role::User) {
                    last.push_text(format!("\n[Attached file: {}]\n{content}", file.name));
                }
            }
        }

        // Image rewriting; the guard must outlive the provider dispatch.
        let volume = volume_path(&self.config.data_root, &user_id, conversation_id);
        let normalizer = ImageNormalizer::new(volume, self.volume_url(&user_id, conversation_id));
        let _proxy_guard = normalizer.normalize(&mut messages).await?;

        guard_user_messages(&mut messages, self.config.max_user_message_tokens);

        // System prompt assembly.
        let memories = if cfg.tool_enabled("memory") && !user_id.is_empty() {
            self.store
                .list_memories(&user_id)
                .await
                .map(|rows| rows.into_iter().map(|r| r.content).collect())
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        let sandbox_note = if cfg.tool_enabled("sandbox_execute") && self.sandbox.is_some() {
            Some(format!(
                "Files you create under /workspace are downloadable at {}/<path>.",
                self.volume_url(&user_id, conversation_id)
            ))
        } else {
            None
        };
        assemble_system_prompt(
            &mut messages,
            cfg.custom_system_prompt.as_deref(),
            &memories,
            sandbox_note.as_deref(),
        );

        // Compaction, then the hard trim.
        if cfg.enable_compaction {
            let compaction_model = cfg
                .compaction_model
                .clone()
                .unwrap_or_else(|| cfg.llm_model.clone());
            let compaction_provider = cfg
                .compaction_provider
                .clone()
                .unwrap_or_else(|| cfg.llm_provider.clone());
            match self.adapter_for(&compaction_provider, cfg) {
                Ok(summarizer) => {
                    let compactor = Compactor::new(
                        self.store.clone(),
                        self.config.compaction_threshold_tokens,
                        self.config.compaction_max_summary_tokens,
                        self.config.max_input_tokens,
                    );
                    messages = compactor
                        .run(
                            conversation_id,
                            messages,
                            summarizer.as_ref(),
                            &compaction_model,
                            sink,
                        )
                        .await;
                }
                Err(e) => warn!(error = %e, "compaction adapter unavailable"),
            }
        }

        let registry = Arc::new(self.build_registry(cfg, &user_id, conversation_id));
        let specs = registry.specs();
        messages = trim_to_budget(messages, self.config.max_input_tokens, specs.len());

        // Request row up front; finalized below whatever happens.
        let request_id = self
            .store
            .insert_request(NewRequest {
                conversation_id: conversation_id.clone(),
                user_id: user_id.clone(),
                instance_id: request.owui_instance.clone().unwrap_or_default(),
                model: cfg.llm_model.clone(),
                provider: adapter.name().to_string(),
            })
            .await
            .map_err(|e| {
                warn!(error = %e, "request row insert failed");
                e
            })
            .unwrap_or(0);

        let executor = ToolExecutor::new(registry, Some(self.store.clone()), request_id);
        let recorded: Vec<(String, String)> = messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::Tool => "tool",
                };
                (role.to_string(), m.joined_text())
            })
            .collect();

        let result = drive_chat(
            adapter,
            &cfg.llm_model,
            messages,
            &specs,
            &executor,
            sink,
            request.stream,
            self.config.max_tool_iterations,
        )
        .await;

        let latency_ms = started.elapsed().as_millis() as i64;
        match &result {
            Ok(outcome) => {
                let cost = self
                    .cost
                    .cost(&cfg.llm_model, &outcome.usage, Some(adapter.name()))
                    .await
                    .unwrap_or(0.0);
                if request_id != 0 {
                    for (role, content) in &recorded {
                        let _ = self.store.add_message(request_id, role, content).await;
                    }
                    let _ = self
                        .store
                        .add_message(request_id, "assistant", &outcome.content)
                        .await;
                    if let Err(e) = self
                        .store
                        .finish_request(request_id, &outcome.usage, cost, "completed", latency_ms)
                        .await
                    {
                        warn!(error = %e, "request finalize failed");
                    }
                }
                info!(
                    conversation = %conversation_id,
                    model = %cfg.llm_model,
                    provider = adapter.name(),
                    iterations = outcome.iterations,
                    input_tokens = outcome.usage.input_tokens,
                    output_tokens = outcome.usage.output_tokens,
                    cost,
                    latency_ms,
                    "chat request completed"
                );
            }
            Err(e) => {
                if request_id != 0 {
                    let _ = self
                        .store
                        .finish_request(
                            request_id,
                            &Default::default(),
                            0.0,
                            "failed",
                            latency_ms,
                        )
                        .await;
                }
                warn!(error = %e, conversation = %conversation_id, "chat request failed");
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: an over-long user message is replaced by the notice;
    /// short ones survive.
    #[test]
    fn length_guard_replaces_oversized() {
        let mut messages = vec![
            ChatMessage::user("short"),
            ChatMessage::user("y".repeat(40_000)),
            ChatMessage::assistant("z".repeat(40_000)),
        ];
        guard_user_messages(&mut messages, 8192);
        assert_eq!(messages[0].joined_text(), "short");
        assert_eq!(messages[1].joined_text(), TRUNCATION_NOTICE);
        // Assistant messages are untouched by the guard.
        assert_eq!(messages[2].text_len(), 40_000);
    }

    /// **Scenario**: trimming drops the oldest conversation messages but
    /// never the system prompt or the last message.
    #[test]
    fn trim_preserves_system_and_last() {
        let mut messages = vec![ChatMessage::system("sys")];
        for i in 0..10 {
            messages.push(ChatMessage::user(format!("msg {i}: {}", "x".repeat(3200))));
        }
        let trimmed = trim_to_budget(messages, 3000, 0);
        assert_eq!(trimmed[0].joined_text(), "sys");
        assert!(trimmed.last().unwrap().joined_text().starts_with("msg 9"));
        assert!(trimmed.len() < 11);
        // The survivors are the newest ones.
        if trimmed.len() > 2 {
            assert!(trimmed[1].joined_text().contains("msg"));
        }
    }

    /// **Scenario**: trim with only system + last leaves them alone even
    /// over budget.
    #[test]
    fn trim_never_empties() {
        let messages = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("u".repeat(50_000)),
        ];
        let trimmed = trim_to_budget(messages, 10, 0);
        assert_eq!(trimmed.len(), 2);
    }

    /// **Scenario**: system assembly prepends the custom prompt and appends
    /// memories and the sandbox note.
    #[test]
    fn system_prompt_assembly() {
        let mut messages = vec![
            ChatMessage::system("base prompt"),
            ChatMessage::user("hi"),
        ];
        assemble_system_prompt(
            &mut messages,
            Some("custom prefix"),
            &["likes tacos".to_string()],
            Some("sandbox note"),
        );
        let system = messages[0].joined_text();
        assert!(system.starts_with("custom prefix"));
        assert!(system.contains("base prompt"));
        assert!(system.contains("[USER_MEMORIES]"));
        assert!(system.contains("likes tacos"));
        assert!(system.ends_with("sandbox note"));

        // Without an existing system message one is inserted.
        let mut messages = vec![ChatMessage::user("hi")];
        assemble_system_prompt(&mut messages, Some("only custom"), &[], None);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].joined_text(), "only custom");
    }

    /// **Scenario**: no custom prompt, no memories, no note: transcript is
    /// unchanged.
    #[test]
    fn system_prompt_noop() {
        let mut messages = vec![ChatMessage::user("hi")];
        assemble_system_prompt(&mut messages, None, &[], None);
        assert_eq!(messages.len(), 1);
    }

    /// **Scenario**: end-to-end through the pipeline with the mock provider
    /// persists a completed request row with usage.
    #[tokio::test]
    async fn process_records_request() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("DATA_ROOT", dir.path().join("data").display().to_string());
        let mut config = GatewayConfig::from_env();
        std::env::remove_var("DATA_ROOT");
        config.db_path = dir.path().join("t.db");

        let store = Store::open(&config.db_path).unwrap();
        let pipeline = ChatPipeline::new(config, store.clone(), None);

        let request: ChatRequest = serde_json::from_value(serde_json::json!({
            "conversation_id": "conv-e2e",
            "messages": [{"role": "user", "content": "hello"}],
            "config": {"llm_provider": "mock", "llm_model": "mock-model"},
            "user_email": "alice@example.com",
            "stream": false
        }))
        .unwrap();

        let sink = EventSink::discard();
        let outcome = pipeline.process(&request, &sink).await.unwrap();
        assert_eq!(outcome.content, "mock reply");
        assert_eq!(outcome.usage.input_tokens, 16);

        // The persisted row matches the outcome.
        let totals = store.totals_by_user().await.unwrap();
        let alice = totals
            .iter()
            .find(|t| t.key == "alice@example.com")
            .expect("request row persisted");
        assert_eq!(alice.requests, 1);
        assert_eq!(alice.input_tokens, 16);
    }
}
