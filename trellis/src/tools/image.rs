//! Image tools: generation, edit, and blend over the image backend.
//!
//! The backend is a single `/generate` endpoint taking a prompt plus
//! optional source images (base64). Outputs are persisted into the
//! conversation volume under `comfyui/` with a JSON side-car describing the
//! asset, and the tool result is a markdown link the frontend renders.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use serde_json::{json, Value};

use crate::error::ToolError;
use crate::provider::EventSink;
use crate::store::now_millis;
use crate::tools::{Tool, ToolOutcome, ToolSpec};

/// Image backend client (ComfyUI-style HTTP wrapper).
pub struct ImageBackend {
    client: reqwest::Client,
    base_url: String,
}

impl ImageBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Runs one generation job; returns the first output image's bytes.
    pub async fn generate(&self, payload: Value) -> Result<Vec<u8>, ToolError> {
        let url = format!("{}/generate", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ToolError::execution(format!("image backend: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(ToolError::execution(format!(
                "image backend returned {status}: {detail}"
            )));
        }
        let value: Value = resp
            .json()
            .await
            .map_err(|e| ToolError::execution(format!("image backend response: {e}")))?;
        let encoded = value["images"]
            .as_array()
            .and_then(|a| a.first())
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::execution("image backend returned no images"))?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| ToolError::execution(format!("decode image: {e}")))
    }
}

/// Which operation this tool instance performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageMode {
    Generate,
    Edit,
    Blend,
}

/// Image generation/edit/blend tool over the shared backend.
pub struct ImageTool {
    backend: Arc<ImageBackend>,
    mode: ImageMode,
    /// Host-side volume root of the conversation.
    volume: PathBuf,
    /// Public URL prefix for the volume.
    volume_url: String,
}

impl ImageTool {
    pub fn new(
        backend: Arc<ImageBackend>,
        mode: ImageMode,
        volume: PathBuf,
        volume_url: String,
    ) -> Self {
        Self {
            backend,
            mode,
            volume,
            volume_url,
        }
    }

    /// Resolves a referenced image to base64: volume-local URLs read from
    /// disk, anything else is fetched.
    async fn fetch_source(&self, url: &str) -> Result<String, ToolError> {
        let bytes = if let Some(rest) = url.strip_prefix(self.volume_url.as_str()) {
            let relative = rest.trim_start_matches('/');
            let path = self.volume.join(relative);
            tokio::fs::read(&path)
                .await
                .map_err(|e| ToolError::execution(format!("read local image {relative}: {e}")))?
        } else {
            let resp = reqwest::get(url)
                .await
                .map_err(|e| ToolError::execution(format!("fetch image: {e}")))?;
            resp.bytes()
                .await
                .map_err(|e| ToolError::execution(format!("read image: {e}")))?
                .to_vec()
        };
        Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    /// Persists output bytes and a side-car descriptor; returns the public URL.
    async fn persist_output(&self, bytes: &[u8], source: &str) -> Result<String, ToolError> {
        let dir = self.volume.join("comfyui");
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ToolError::execution(format!("create image dir: {e}")))?;
        let id = uuid::Uuid::new_v4().to_string();
        let filename = format!("{id}.png");
        tokio::fs::write(dir.join(&filename), bytes)
            .await
            .map_err(|e| ToolError::execution(format!("write image: {e}")))?;

        let url = format!("{}/comfyui/{filename}", self.volume_url);
        let sidecar = json!({
            "id": id,
            "filename": filename,
            "mime": "image/png",
            "extension": "png",
            "size": bytes.len(),
            "md5": format!("{:x}", md5::compute(bytes)),
            "source": source,
            "url": url,
            "created_at": now_millis(),
            "role": "assistant",
        });
        tokio::fs::write(
            dir.join(format!("{id}.json")),
            serde_json::to_vec_pretty(&sidecar)
                .map_err(|e| ToolError::execution(format!("encode side-car: {e}")))?,
        )
        .await
        .map_err(|e| ToolError::execution(format!("write side-car: {e}")))?;
        Ok(url)
    }

    fn parse_size(args: &Value) -> (u32, u32) {
        let raw = args["size"].as_str().unwrap_or("1024x1024");
        let mut parts = raw.splitn(2, 'x');
        let width = parts.next().and_then(|p| p.parse().ok()).unwrap_or(1024);
        let height = parts.next().and_then(|p| p.parse().ok()).unwrap_or(1024);
        (width, height)
    }
}

#[async_trait]
impl Tool for ImageTool {
    fn name(&self) -> &str {
        match self.mode {
            ImageMode::Generate => "image_generation",
            ImageMode::Edit => "image_edit",
            ImageMode::Blend => "image_blend",
        }
    }

    fn spec(&self) -> ToolSpec {
        let (description, sources) = match self.mode {
            ImageMode::Generate => (
                "Generate an image from a text prompt.",
                json!({}),
            ),
            ImageMode::Edit => (
                "Edit an existing image according to a text prompt.",
                json!({ "source_image": { "type": "string", "description": "URL of the image to edit" } }),
            ),
            ImageMode::Blend => (
                "Blend multiple images together guided by a text prompt.",
                json!({ "source_images": {
                    "type": "array", "items": { "type": "string" },
                    "description": "URLs of the images to blend"
                } }),
            ),
        };
        let mut properties = json!({
            "prompt": { "type": "string", "description": "What to create" },
            "negative_prompt": { "type": "string" },
            "steps": { "type": "integer" },
            "size": { "type": "string", "description": "WIDTHxHEIGHT, default 1024x1024" }
        });
        if let (Some(props), Some(extra)) = (properties.as_object_mut(), sources.as_object()) {
            for (k, v) in extra {
                props.insert(k.clone(), v.clone());
            }
        }
        ToolSpec {
            name: self.name().to_string(),
            description: description.to_string(),
            input_schema: json!({
                "type": "object",
                "properties": properties,
                "required": ["prompt"]
            }),
        }
    }

    fn describe_start(&self, _args: &Value) -> String {
        match self.mode {
            ImageMode::Generate => "Generating image…".to_string(),
            ImageMode::Edit => "Editing image…".to_string(),
            ImageMode::Blend => "Blending images…".to_string(),
        }
    }

    async fn call(&self, args: Value, _sink: &EventSink) -> Result<ToolOutcome, ToolError> {
        let prompt = args["prompt"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidInput("missing prompt".to_string()))?;
        let (width, height) = Self::parse_size(&args);

        let mut source_images: Vec<String> = Vec::new();
        if self.mode == ImageMode::Edit {
            let url = args["source_image"]
                .as_str()
                .ok_or_else(|| ToolError::InvalidInput("missing source_image".to_string()))?;
            source_images.push(self.fetch_source(url).await?);
        }
        if self.mode == ImageMode::Blend {
            let urls = args["source_images"]
                .as_array()
                .ok_or_else(|| ToolError::InvalidInput("missing source_images".to_string()))?;
            for url in urls.iter().filter_map(Value::as_str) {
                source_images.push(self.fetch_source(url).await?);
            }
            if source_images.len() < 2 {
                return Err(ToolError::InvalidInput(
                    "blend needs at least two source images".to_string(),
                ));
            }
        }

        let mut payload = json!({
            "prompt": prompt,
            "width": width,
            "height": height,
        });
        if let Some(negative) = args["negative_prompt"].as_str() {
            payload["negative_prompt"] = json!(negative);
        }
        if let Some(steps) = args["steps"].as_u64() {
            payload["steps"] = json!(steps);
        }
        if !source_images.is_empty() {
            payload["images"] = json!(source_images);
        }

        let bytes = self.backend.generate(payload).await?;
        let url = self.persist_output(&bytes, self.name()).await?;
        Ok(ToolOutcome::ok(format!("![generated image]({url})"))
            .with_status_done("Image ready"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: size strings parse as WIDTHxHEIGHT with a 1024 default.
    #[test]
    fn size_parsing() {
        assert_eq!(ImageTool::parse_size(&json!({"size": "512x768"})), (512, 768));
        assert_eq!(ImageTool::parse_size(&json!({})), (1024, 1024));
        assert_eq!(ImageTool::parse_size(&json!({"size": "junk"})), (1024, 1024));
    }

    /// **Scenario**: each mode exposes its own name and source parameters.
    #[test]
    fn mode_specs() {
        let backend = Arc::new(ImageBackend::new("http://localhost:8188"));
        let generate = ImageTool::new(
            backend.clone(),
            ImageMode::Generate,
            PathBuf::from("/tmp/v"),
            "http://x/u/c/volume".to_string(),
        );
        assert_eq!(generate.name(), "image_generation");
        assert!(generate.spec().input_schema["properties"]
            .get("source_image")
            .is_none());

        let edit = ImageTool::new(
            backend,
            ImageMode::Edit,
            PathBuf::from("/tmp/v"),
            "http://x/u/c/volume".to_string(),
        );
        assert_eq!(edit.name(), "image_edit");
        assert!(edit.spec().input_schema["properties"]
            .get("source_image")
            .is_some());
    }
}
