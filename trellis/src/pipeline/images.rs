//! Image normalization for the request pipeline.
//!
//! Invariants this step preserves: the model never sees image bytes older
//! than the current turn, the text context references every stored image by
//! stable URL, and temp proxies disappear on success and error paths alike
//! (the guard removes them on drop).
//!
//! For every non-local image reference in the last message: decode or fetch
//! the bytes, re-identify known content by MD5 against the side-cars in the
//! conversation volume, persist the full-quality original plus a JSON
//! side-car under `uploaded/`, and write a downscaled JPEG proxy (longest
//! edge 1414 px ≈ 2 MP) under `temp/` for the model request only.

use std::io::Cursor;
use std::path::PathBuf;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::message::{parse_data_url, ChatMessage, ContentBlock, ImageSource, Role};
use crate::store::now_millis;

/// Longest edge of a model-facing proxy image.
pub const PROXY_MAX_EDGE: u32 = 1414;

/// Side-car descriptor persisted next to each uploaded image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSidecar {
    pub id: String,
    pub filename: String,
    pub mime: String,
    pub extension: String,
    pub size: u64,
    pub md5: String,
    /// Where the image came from (data URL, remote URL).
    pub source: String,
    /// Stable public URL of the original.
    pub url: String,
    pub created_at: i64,
    pub role: String,
}

/// Deletes proxy files when the turn ends, however it ends.
#[derive(Debug, Default)]
pub struct ProxyGuard {
    paths: Vec<PathBuf>,
}

impl ProxyGuard {
    pub fn track(&mut self, path: PathBuf) {
        self.paths.push(path);
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl Drop for ProxyGuard {
    fn drop(&mut self) {
        for path in &self.paths {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "proxy cleanup failed");
                }
            }
        }
    }
}

fn extension_for(mime: &str) -> &'static str {
    match mime {
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        _ => "jpg",
    }
}

/// Downscales to the proxy cap and re-encodes as JPEG.
fn make_proxy_bytes(bytes: &[u8]) -> Result<Vec<u8>, GatewayError> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| GatewayError::Validation(format!("unreadable image: {e}")))?;
    let img = if img.width().max(img.height()) > PROXY_MAX_EDGE {
        img.resize(
            PROXY_MAX_EDGE,
            PROXY_MAX_EDGE,
            image::imageops::FilterType::Lanczos3,
        )
    } else {
        img
    };
    // JPEG has no alpha channel.
    let rgb = image::DynamicImage::ImageRgb8(img.to_rgb8());
    let mut out = Vec::new();
    rgb.write_to(&mut Cursor::new(&mut out), image::ImageFormat::Jpeg)
        .map_err(|e| GatewayError::Validation(format!("proxy encode: {e}")))?;
    Ok(out)
}

/// Normalizes images for one request.
pub struct ImageNormalizer {
    client: reqwest::Client,
    /// Host-side volume root for the conversation.
    volume: PathBuf,
    /// Public URL prefix for the volume.
    volume_url: String,
}

impl ImageNormalizer {
    pub fn new(volume: PathBuf, volume_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            volume,
            volume_url,
        }
    }

    fn uploaded_dir(&self) -> PathBuf {
        self.volume.join("uploaded")
    }

    fn temp_dir(&self) -> PathBuf {
        self.volume.join("temp")
    }

    /// True for references that already point into this volume.
    fn is_local(&self, url: &str) -> bool {
        url.starts_with(&self.volume_url)
    }

    async fn load_reference(&self, source: &ImageSource) -> Result<(Vec<u8>, String, String), GatewayError> {
        match source {
            ImageSource::Inline { media_type, data } => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(data.trim())
                    .map_err(|e| GatewayError::Validation(format!("bad inline image: {e}")))?;
                Ok((bytes, media_type.clone(), "inline".to_string()))
            }
            ImageSource::Url { url } if url.starts_with("data:") => {
                let (media_type, bytes) = parse_data_url(url)
                    .ok_or_else(|| GatewayError::Validation("bad data URL".to_string()))?;
                Ok((bytes, media_type, "data-url".to_string()))
            }
            ImageSource::Url { url } => {
                let resp = self
                    .client
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| GatewayError::Validation(format!("fetch image {url}: {e}")))?;
                let media_type = resp
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("image/jpeg")
                    .to_string();
                let bytes = resp
                    .bytes()
                    .await
                    .map_err(|e| GatewayError::Validation(format!("read image {url}: {e}")))?
                    .to_vec();
                Ok((bytes, media_type, url.clone()))
            }
        }
    }

    /// Reads every side-car in `uploaded/`, oldest first.
    pub async fn known_images(&self) -> Vec<ImageSidecar> {
        let mut sidecars = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(self.uploaded_dir()).await else {
            return sidecars;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(raw) = tokio::fs::read(&path).await {
                if let Ok(sidecar) = serde_json::from_slice::<ImageSidecar>(&raw) {
                    sidecars.push(sidecar);
                }
            }
        }
        sidecars.sort_by_key(|s| s.created_at);
        sidecars
    }

    async fn persist_original(
        &self,
        bytes: &[u8],
        media_type: &str,
        source: &str,
        known: &[ImageSidecar],
    ) -> Result<ImageSidecar, GatewayError> {
        let md5 = format!("{:x}", md5::compute(bytes));
        if let Some(existing) = known.iter().find(|s| s.md5 == md5) {
            debug!(md5 = %md5, "image already known; reusing stored original");
            return Ok(existing.clone());
        }

        let id = uuid::Uuid::new_v4().to_string();
        let extension = extension_for(media_type);
        let filename = format!("{id}.{extension}");
        let dir = self.uploaded_dir();
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(&filename), bytes).await?;

        let sidecar = ImageSidecar {
            id: id.clone(),
            filename: filename.clone(),
            mime: media_type.to_string(),
            extension: extension.to_string(),
            size: bytes.len() as u64,
            md5,
            source: source.to_string(),
            url: format!("{}/uploaded/{filename}", self.volume_url),
            created_at: now_millis(),
            role: "user".to_string(),
        };
        tokio::fs::write(
            dir.join(format!("{id}.json")),
            serde_json::to_vec_pretty(&json!(sidecar)).map_err(crate::error::StoreError::from)?,
        )
        .await?;
        Ok(sidecar)
    }

    async fn write_proxy(
        &self,
        bytes: Vec<u8>,
        sidecar: &ImageSidecar,
        guard: &mut ProxyGuard,
    ) -> Result<String, GatewayError> {
        let proxy =
            tokio::task::spawn_blocking(move || make_proxy_bytes(&bytes))
                .await
                .map_err(|e| GatewayError::Validation(format!("proxy task: {e}")))??;
        let dir = self.temp_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let name = format!("proxy-{}.jpg", sidecar.id);
        let path = dir.join(&name);
        tokio::fs::write(&path, proxy).await?;
        guard.track(path);
        Ok(format!("{}/temp/{name}", self.volume_url))
    }

    /// Runs the whole normalization step over the transcript in place.
    ///
    /// Returns the proxy guard; keep it alive until the turn completes.
    pub async fn normalize(
        &self,
        messages: &mut [ChatMessage],
    ) -> Result<ProxyGuard, GatewayError> {
        let mut guard = ProxyGuard::default();
        let Some(last_index) = messages.len().checked_sub(1) else {
            return Ok(guard);
        };

        // Earlier messages lose their image blocks entirely.
        for message in messages.iter_mut().take(last_index) {
            message.strip_images();
        }

        let mut known = self.known_images().await;
        let mut proxy_urls: Vec<String> = Vec::new();

        let last = &mut messages[last_index];
        let image_blocks: Vec<ImageSource> = last
            .content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Image { source } => Some(source.clone()),
                _ => None,
            })
            .collect();
        last.strip_images();

        for source in &image_blocks {
            if let ImageSource::Url { url } = source {
                if self.is_local(url) {
                    // Already stored this conversation; just proxy it for the turn.
                    if let Some(sidecar) = known
                        .iter()
                        .find(|s| url.ends_with(&s.filename))
                        .cloned()
                    {
                        let original = self.uploaded_dir().join(&sidecar.filename);
                        if let Ok(bytes) = tokio::fs::read(&original).await {
                            if let Ok(proxy_url) =
                                self.write_proxy(bytes, &sidecar, &mut guard).await
                            {
                                proxy_urls.push(proxy_url);
                            }
                        }
                    }
                    continue;
                }
            }
            let (bytes, media_type, origin) = match self.load_reference(source).await {
                Ok(loaded) => loaded,
                Err(e) => {
                    warn!(error = %e, "skipping unloadable image reference");
                    continue;
                }
            };
            let sidecar = self
                .persist_original(&bytes, &media_type, &origin, &known)
                .await?;
            if !known.iter().any(|s| s.md5 == sidecar.md5) {
                known.push(sidecar.clone());
            }
            match self.write_proxy(bytes, &sidecar, &mut guard).await {
                Ok(proxy_url) => proxy_urls.push(proxy_url),
                Err(e) => warn!(error = %e, "proxy generation failed"),
            }
        }

        // Text inventory of everything stored, then the turn's proxies.
        if !known.is_empty() {
            let mut inventory =
                String::from("Images available in this conversation (referenced by stable URL):\n");
            for sidecar in &known {
                inventory.push_str(&format!(
                    "- {}: {} (uploaded at {})\n",
                    sidecar.filename, sidecar.url, sidecar.created_at
                ));
            }
            let last = &mut messages[last_index];
            last.push_text(inventory);
            if last.role == Role::User {
                for url in &proxy_urls {
                    last.content.push(ContentBlock::Image {
                        source: ImageSource::Url { url: url.clone() },
                    });
                }
            }
        }

        Ok(guard)
    }
}
