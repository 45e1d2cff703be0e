//! Gateway configuration: process-level knobs from the environment and
//! per-request configuration carried in the chat body.
//!
//! Environment precedence follows the usual rule: existing process env wins;
//! the binary loads `.env` before constructing [`GatewayConfig`].

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

use ipnetwork::IpNetwork;
use serde::Deserialize;
use serde_json::Value;

use crate::message::{ChatMessage, ContentBlock, ImageSource, Role};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    matches!(
        std::env::var(key).unwrap_or_default().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Process-level configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Shared secret for `Authorization: Bearer`.
    pub bearer_token: String,
    /// Root for volumes, recall storage, and the debug log.
    pub data_root: PathBuf,
    /// Embedded database file.
    pub db_path: PathBuf,
    pub bind_host: String,
    pub bind_port: u16,
    pub allowed_instances: InstanceAllowList,
    pub max_tool_iterations: u32,
    pub max_input_tokens: u32,
    pub max_user_message_tokens: u32,
    pub compaction_threshold_tokens: u32,
    pub compaction_max_summary_tokens: u32,
    pub enable_cors: bool,
    /// Public-facing domain used to build stable file URLs.
    pub public_domain: Option<String>,
    pub debug: bool,
    pub sandbox_image: String,
    pub sandbox_network: String,
    /// Markdown-to-PDF converter for research reports, e.g. `pandoc`.
    pub research_pdf_command: Option<String>,
    /// Content-extraction collaborator for `/process`.
    pub extract_api_url: Option<String>,
    /// Per-user memory character budget.
    pub memory_max_chars: usize,
    /// Purge records older than this many days; 0 keeps forever.
    pub retention_days: u32,
}

impl GatewayConfig {
    /// Builds the configuration from the process environment.
    pub fn from_env() -> Self {
        let data_root = PathBuf::from(env_or("DATA_ROOT", "./data"));
        let db_path = std::env::var("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_root.join("trellis.db"));
        Self {
            bearer_token: env_or("GATEWAY_BEARER_TOKEN", ""),
            data_root,
            db_path,
            bind_host: env_or("BIND_HOST", "0.0.0.0"),
            bind_port: env_parse("BIND_PORT", 8080),
            allowed_instances: InstanceAllowList::parse(&env_or("ALLOWED_INSTANCES", "*")),
            max_tool_iterations: env_parse("MAX_TOOL_ITERATIONS", 5),
            max_input_tokens: env_parse("MAX_INPUT_TOKENS", 100_000),
            max_user_message_tokens: env_parse("MAX_USER_MESSAGE_TOKENS", 8192),
            compaction_threshold_tokens: env_parse("COMPACTION_THRESHOLD_TOKENS", 65_536),
            compaction_max_summary_tokens: env_parse("COMPACTION_MAX_SUMMARY_TOKENS", 1024),
            enable_cors: env_flag("ENABLE_CORS"),
            public_domain: std::env::var("PUBLIC_DOMAIN").ok().filter(|s| !s.is_empty()),
            debug: env_flag("DEBUG"),
            sandbox_image: env_or("SANDBOX_IMAGE", "python:3.12-slim"),
            sandbox_network: env_or("SANDBOX_NETWORK", "trellis-sandbox"),
            research_pdf_command: std::env::var("RESEARCH_PDF_COMMAND")
                .ok()
                .filter(|s| !s.is_empty()),
            extract_api_url: std::env::var("EXTRACT_API_URL").ok().filter(|s| !s.is_empty()),
            memory_max_chars: env_parse("MEMORY_MAX_CHARS", 2000),
            retention_days: env_parse("RETENTION_DAYS", 0),
        }
    }

    /// Base URL for links handed to end users (public domain when configured,
    /// otherwise the bind address).
    pub fn public_base_url(&self) -> String {
        match &self.public_domain {
            Some(domain) => format!("https://{domain}"),
            None => format!("http://{}:{}", self.bind_host, self.bind_port),
        }
    }
}

/// One allow-list rule for source instances.
#[derive(Debug, Clone)]
enum AllowRule {
    All,
    Exact(String),
    Cidr(IpNetwork),
    /// `*`-wildcard pattern, matched segment-wise.
    Wildcard(String),
}

/// Source-instance allow-list: exact strings, CIDRs, and `*`-wildcards.
#[derive(Debug, Clone, Default)]
pub struct InstanceAllowList {
    rules: Vec<AllowRule>,
}

impl InstanceAllowList {
    /// Parses a comma-separated rule list. `*` alone allows everything.
    pub fn parse(spec: &str) -> Self {
        let mut rules = Vec::new();
        for raw in spec.split(',') {
            let entry = raw.trim();
            if entry.is_empty() {
                continue;
            }
            if entry == "*" {
                rules.push(AllowRule::All);
            } else if let Ok(net) = entry.parse::<IpNetwork>() {
                rules.push(AllowRule::Cidr(net));
            } else if entry.contains('*') {
                rules.push(AllowRule::Wildcard(entry.to_string()));
            } else {
                rules.push(AllowRule::Exact(entry.to_string()));
            }
        }
        Self { rules }
    }

    /// True when the identity (instance name, hostname, or IP) is allowed.
    pub fn allows(&self, identity: &str) -> bool {
        let ip: Option<IpAddr> = identity.parse().ok();
        self.rules.iter().any(|rule| match rule {
            AllowRule::All => true,
            AllowRule::Exact(s) => s == identity,
            AllowRule::Cidr(net) => ip.map(|ip| net.contains(ip)).unwrap_or(false),
            AllowRule::Wildcard(pattern) => wildcard_match(pattern, identity),
        })
    }

    /// True when no rule was configured at all.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Matches `pattern` against `input` where `*` spans any run of characters.
fn wildcard_match(pattern: &str, input: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    let mut pos = 0usize;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        match input[pos..].find(part) {
            Some(found) => {
                // A leading literal must anchor at the start.
                if i == 0 && found != 0 {
                    return false;
                }
                pos += found + part.len();
            }
            None => return false,
        }
    }
    // A trailing literal must anchor at the end.
    if let Some(last) = parts.last() {
        if !last.is_empty() && !pattern.ends_with('*') && !input.ends_with(last) {
            return false;
        }
    }
    true
}

/// Per-request configuration from the chat body's `config` object.
///
/// Unknown fields are ignored so frontends can carry extra settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatConfig {
    /// Provider name: "anthropic", "openai", or "ollama".
    #[serde(default)]
    pub llm_provider: String,
    #[serde(default)]
    pub llm_model: String,
    #[serde(default)]
    pub use_tools: bool,
    #[serde(default)]
    pub anthropic_api_key: Option<String>,
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default)]
    pub ollama_base_url: Option<String>,
    /// Web search / extract / research backend.
    #[serde(default)]
    pub search_api_key: Option<String>,
    #[serde(default)]
    pub search_api_url: Option<String>,
    /// Image generation backend base URL.
    #[serde(default)]
    pub comfyui_url: Option<String>,
    /// Feature toggles: `tools.{web_search, memory, sandbox_execute, ...}`.
    #[serde(default)]
    pub tools: HashMap<String, bool>,
    #[serde(default)]
    pub custom_system_prompt: Option<String>,
    #[serde(default)]
    pub enable_compaction: bool,
    #[serde(default)]
    pub compaction_provider: Option<String>,
    #[serde(default)]
    pub compaction_model: Option<String>,
    #[serde(default)]
    pub file_recall_instance_id: Option<String>,
    #[serde(default)]
    pub toolset_api_url: Option<String>,
}

impl ChatConfig {
    /// True when the toggle map enables the named tool.
    pub fn tool_enabled(&self, name: &str) -> bool {
        self.tools.get(name).copied().unwrap_or(false)
    }
}

/// An attached file in the chat body (already-extracted content).
#[derive(Debug, Clone, Deserialize)]
pub struct AttachedFile {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub file: Option<Value>,
}

impl AttachedFile {
    /// Extracted text content at `file.data.content`, when present.
    pub fn content(&self) -> Option<&str> {
        self.file.as_ref()?.get("data")?.get("content")?.as_str()
    }
}

/// The chat request body.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub conversation_id: String,
    pub messages: Vec<IncomingMessage>,
    pub config: ChatConfig,
    #[serde(default)]
    pub user_email: Option<String>,
    #[serde(default)]
    pub owui_instance: Option<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub files: Vec<AttachedFile>,
}

impl ChatRequest {
    /// Converts the lenient wire messages into the canonical transcript.
    pub fn canonical_messages(&self) -> Vec<ChatMessage> {
        self.messages.iter().map(IncomingMessage::to_canonical).collect()
    }
}

/// Message as received on the wire: role string plus string-or-parts content.
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    pub role: String,
    #[serde(default)]
    pub content: IncomingContent,
}

/// Content is either one string or an array of typed parts.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IncomingContent {
    Text(String),
    Parts(Vec<IncomingPart>),
}

impl Default for IncomingContent {
    fn default() -> Self {
        IncomingContent::Text(String::new())
    }
}

/// One typed content part (OpenAI chat style).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IncomingPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrlRef },
}

/// The `image_url` object of an image part.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageUrlRef {
    pub url: String,
}

impl IncomingMessage {
    /// Maps the wire shape onto the canonical message model.
    pub fn to_canonical(&self) -> ChatMessage {
        let role = match self.role.as_str() {
            "system" => Role::System,
            "assistant" => Role::Assistant,
            "tool" => Role::Tool,
            _ => Role::User,
        };
        let content = match &self.content {
            IncomingContent::Text(text) => vec![ContentBlock::Text { text: text.clone() }],
            IncomingContent::Parts(parts) => parts
                .iter()
                .map(|part| match part {
                    IncomingPart::Text { text } => ContentBlock::Text { text: text.clone() },
                    IncomingPart::ImageUrl { image_url } => ContentBlock::Image {
                        source: ImageSource::Url {
                            url: image_url.url.clone(),
                        },
                    },
                })
                .collect(),
        };
        ChatMessage { role, content }
    }
}
